//! Validated, immutable configuration data model.
//!
//! Everything here is owned data: no interior pointers into the source
//! file, no borrowed strings. A [`ConfigData`] is wrapped in an `Arc` by
//! [`crate::config::snapshot::ConfigSnapshot`] and shared by every
//! connection that was accepted while it was current.

use std::net::IpAddr;

/// One of the five distinguished fallback categories, plus the ordinary
/// SNI-matched routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Hangup,
    SendText(String),
    SendFile(String),
    TlsAlert(AlertSubtype),
    Proxy {
        dest_hostname: String,
        dest_port: u16,
    },
}

/// TLS fatal alert subtype, with its own wire-format `AlertDescription` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSubtype {
    CloseNotify,
    HandshakeFailure,
    ProtocolVersion,
    DecodeError,
    InternalError,
    UnrecognizedName,
}

impl AlertSubtype {
    /// The `AlertDescription` wire value.
    pub fn wire_value(self) -> u8 {
        match self {
            AlertSubtype::CloseNotify => 0,
            AlertSubtype::HandshakeFailure => 40,
            AlertSubtype::ProtocolVersion => 70,
            AlertSubtype::DecodeError => 50,
            AlertSubtype::InternalError => 80,
            AlertSubtype::UnrecognizedName => 112,
        }
    }
}

/// An immutable routing rule.
///
/// `sni_pattern` of `None` marks one of the five slot routes; ordinary
/// routes in a listener's `routes` list always carry `Some(pattern)`.
#[derive(Debug, Clone)]
pub struct Route {
    pub action: Action,
    pub sni_pattern: Option<SniPattern>,
}

impl Route {
    pub fn hangup() -> Self {
        Route {
            action: Action::Hangup,
            sni_pattern: None,
        }
    }
}

/// A parsed SNI match pattern: either an exact hostname, or a left-wildcard
/// `*.suffix` capturing everything before the final `.suffix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniPattern {
    Exact(String),
    Wildcard { suffix: String },
}

impl SniPattern {
    /// Parses a configured pattern string. `*.example.com` becomes a
    /// wildcard over `example.com`; anything else is an exact pattern.
    /// Patterns are lowercased at parse time since matching is
    /// case-insensitive and candidates arrive already-lowercased from the
    /// ClientHello parser.
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        if let Some(suffix) = lower.strip_prefix("*.") {
            if suffix.is_empty() {
                return None;
            }
            Some(SniPattern::Wildcard {
                suffix: suffix.to_string(),
            })
        } else if lower.contains('*') {
            None
        } else {
            Some(SniPattern::Exact(lower))
        }
    }
}

/// The five distinguished fallback routes, any of which may be absent
/// (meaning "use the default behavior (hangup)" once global/listener
/// inheritance has been resolved, or "fall through to global" at the
/// listener level).
#[derive(Debug, Clone, Default)]
pub struct SlotRoutes {
    pub default_route: Option<Route>,
    pub no_sni_route: Option<Route>,
    pub tls_error_route: Option<Route>,
    pub http_fallback_route: Option<Route>,
    pub proxy_connect_failure_route: Option<Route>,
}

/// One listener's configuration: bind address(es)/port, ordered route
/// table, and slot routes that override the global defaults.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_v4: Option<IpAddr>,
    pub bind_v6: Option<IpAddr>,
    pub bind_port: u16,
    pub routes: Vec<Route>,
    pub slots: SlotRoutes,
    pub hello_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl ListenerConfig {
    /// Two listeners are socket-equivalent iff they share bind family
    /// enablement, bind address, and bind port.
    pub fn is_socket_equivalent(&self, other: &ListenerConfig) -> bool {
        self.bind_v4 == other.bind_v4 && self.bind_v6 == other.bind_v6 && self.bind_port == other.bind_port
    }
}

/// Top-level, fully validated, immutable configuration snapshot payload.
/// Wrapped by `Arc` in [`crate::config::snapshot::ConfigSnapshot`].
#[derive(Debug, Clone)]
pub struct ConfigData {
    pub listeners: Vec<ListenerConfig>,
    pub global_slots: SlotRoutes,
    pub user: Option<String>,
    pub group: Option<String>,
    pub disable_ipv4: bool,
    pub disable_ipv6: bool,
}

impl ConfigData {
    /// Resolves one of the five slot routes for `listener`: the listener's
    /// own override first, then the global default, then a synthetic
    /// `Hangup` if neither is set. Shared by the route matcher (no-SNI,
    /// default) and the connection state machine (tls-error,
    /// http-fallback, proxy-connect-failure) so both fall back identically.
    pub fn resolve_slot(
        &self,
        listener: &ListenerConfig,
        pick: impl Fn(&SlotRoutes) -> &Option<Route>,
    ) -> Route {
        pick(&listener.slots)
            .clone()
            .or_else(|| pick(&self.global_slots).clone())
            .unwrap_or_else(Route::hangup)
    }
}
