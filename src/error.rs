//! Crate-wide error types, one `thiserror` enum per fallible subsystem.
//!
//! `main` composes these with `anyhow::Context` at the point where an error
//! becomes user-facing (startup, `-t` validation). Per-connection errors are
//! never surfaced here; they're always recovered locally in the
//! connection state machine's own fallback path.

use thiserror::Error;

/// Failures while locating, reading, or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config file is neither valid YAML nor valid JSON (yaml: {yaml_err}; json: {json_err})")]
    Parse { yaml_err: String, json_err: String },

    #[error("listener {listener} binds neither IPv4 nor IPv6 (both disabled)")]
    NoBindFamily { listener: String },

    #[error("route in listener {listener} has action {action:?} but is missing {field}")]
    MissingField {
        listener: String,
        action: &'static str,
        field: &'static str,
    },

    #[error("invalid target {target:?} in listener {listener}: {source}")]
    InvalidTarget {
        listener: String,
        target: String,
        #[source]
        source: TargetParseError,
    },

    #[error("invalid sni pattern {pattern:?} in listener {listener}: wildcard must be a whole leading label, e.g. \"*.example.com\"")]
    InvalidPattern { listener: String, pattern: String },

    #[error("unknown route action {0:?}")]
    UnknownAction(String),

    #[error("unknown tls_alert subtype {0:?}")]
    UnknownAlertSubtype(String),
}

/// Failures parsing a `host[:port]` target string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetParseError {
    #[error("empty host")]
    EmptyHost,

    #[error("empty port after ':'")]
    EmptyPort,

    #[error("port contains non-digit characters")]
    NonDigitPort,

    #[error("port does not fit in 16 bits")]
    PortOverflow,
}

/// Bind-time failures, surfaced to the operator and fatal at startup
/// (exit code 2); during reload they are logged and the previous
/// snapshot's listener is left running.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Failures resolving a `Proxy` action's `dest_hostname` during the
/// Connecting phase. Always recovered locally by falling through to the
/// listener's `proxy_connect_failure_route`; never propagated to `main`.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no addresses found for {hostname}")]
    NoAddresses { hostname: String },

    #[error("failed to resolve {hostname}: {source}")]
    Lookup {
        hostname: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
