//! Loads and validates a configuration file.
//!
//! The logical schema is otherwise treated as a black box by the rest of
//! this crate; since the proxy has to actually start from a file, this
//! module is the concrete loader: try YAML, fall back to JSON, then
//! validate everything that serde derives alone can't express (target
//! syntax, pattern shape, action/field consistency).

use std::net::IpAddr;
use std::path::Path;

use crate::config::model::{
    Action, AlertSubtype, ConfigData, ListenerConfig, Route, SlotRoutes, SniPattern,
};
use crate::config::raw::{RawConfig, RawRoute, RawSlots};
use crate::config::target::parse_target;
use crate::error::ConfigError;

const DEFAULT_HELLO_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Reads `path` and returns a validated [`ConfigData`].
pub fn load_from_path(path: &Path) -> Result<ConfigData, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    load_from_str(&text)
}

/// Parses `text` as YAML, falling back to JSON, then validates it.
pub fn load_from_str(text: &str) -> Result<ConfigData, ConfigError> {
    let raw: RawConfig = match serde_yaml::from_str(text) {
        Ok(raw) => raw,
        Err(yaml_err) => serde_json::from_str(text).map_err(|json_err| ConfigError::Parse {
            yaml_err: yaml_err.to_string(),
            json_err: json_err.to_string(),
        })?,
    };
    validate(raw)
}

fn validate(raw: RawConfig) -> Result<ConfigData, ConfigError> {
    let global_slots = convert_slots(&raw.defaults, "<defaults>")?;

    let mut listeners = Vec::with_capacity(raw.listeners.len());
    for raw_listener in &raw.listeners {
        listeners.push(convert_listener(raw_listener, raw.disable_ipv4, raw.disable_ipv6)?);
    }

    if let Some(user) = &raw.user {
        if user.trim().is_empty() {
            log::warn!("config `user` is set but empty; ignoring");
        }
    }
    log::warn!(
        "privilege dropping (user/group) is not implemented by this build; \
         `user`/`group` config fields are parsed but otherwise inert"
    );

    Ok(ConfigData {
        listeners,
        global_slots,
        user: raw.user,
        group: raw.group,
        disable_ipv4: raw.disable_ipv4,
        disable_ipv6: raw.disable_ipv6,
    })
}

fn convert_listener(
    raw: &crate::config::raw::RawListener,
    global_disable_v4: bool,
    global_disable_v6: bool,
) -> Result<ListenerConfig, ConfigError> {
    let addr: std::net::SocketAddr = raw.bind.parse().map_err(|_| ConfigError::InvalidTarget {
        listener: raw.bind.clone(),
        target: raw.bind.clone(),
        source: crate::error::TargetParseError::EmptyHost,
    })?;

    let (bind_v4, bind_v6) = match addr.ip() {
        IpAddr::V4(v4) => {
            if global_disable_v4 {
                (None, None)
            } else {
                (Some(IpAddr::V4(v4)), None)
            }
        }
        IpAddr::V6(v6) => {
            if global_disable_v6 {
                (None, None)
            } else {
                (None, Some(IpAddr::V6(v6)))
            }
        }
    };

    if bind_v4.is_none() && bind_v6.is_none() {
        return Err(ConfigError::NoBindFamily {
            listener: raw.bind.clone(),
        });
    }

    let mut routes = Vec::with_capacity(raw.routes.len());
    for raw_route in &raw.routes {
        routes.push(convert_route(raw_route, &raw.bind)?);
    }

    let slots = SlotRoutes {
        default_route: convert_optional_route(&raw.default_route, &raw.bind)?,
        no_sni_route: convert_optional_route(&raw.no_sni_route, &raw.bind)?,
        tls_error_route: convert_optional_route(&raw.tls_error_route, &raw.bind)?,
        http_fallback_route: convert_optional_route(&raw.http_fallback_route, &raw.bind)?,
        proxy_connect_failure_route: convert_optional_route(&raw.proxy_connect_failure_route, &raw.bind)?,
    };

    Ok(ListenerConfig {
        bind_v4,
        bind_v6,
        bind_port: addr.port(),
        routes,
        slots,
        hello_timeout_secs: raw.hello_timeout_secs.unwrap_or(DEFAULT_HELLO_TIMEOUT_SECS),
        connect_timeout_secs: raw.connect_timeout_secs.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        idle_timeout_secs: raw.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
    })
}

fn convert_slots(raw: &RawSlots, listener: &str) -> Result<SlotRoutes, ConfigError> {
    Ok(SlotRoutes {
        default_route: convert_optional_route(&raw.default_route, listener)?,
        no_sni_route: convert_optional_route(&raw.no_sni_route, listener)?,
        tls_error_route: convert_optional_route(&raw.tls_error_route, listener)?,
        http_fallback_route: convert_optional_route(&raw.http_fallback_route, listener)?,
        proxy_connect_failure_route: convert_optional_route(&raw.proxy_connect_failure_route, listener)?,
    })
}

fn convert_optional_route(raw: &Option<RawRoute>, listener: &str) -> Result<Option<Route>, ConfigError> {
    raw.as_ref().map(|r| convert_route(r, listener)).transpose()
}

fn convert_route(raw: &RawRoute, listener: &str) -> Result<Route, ConfigError> {
    let sni_pattern = match &raw.sni {
        None => None,
        Some(s) => Some(SniPattern::parse(s).ok_or_else(|| ConfigError::InvalidPattern {
            listener: listener.to_string(),
            pattern: s.clone(),
        })?),
    };

    let action = match raw.action.as_str() {
        "hangup" => Action::Hangup,
        "send_text" => {
            let text = raw.text.clone().ok_or(ConfigError::MissingField {
                listener: listener.to_string(),
                action: "send_text",
                field: "text",
            })?;
            Action::SendText(text)
        }
        "send_file" => {
            let file = raw.file.clone().ok_or(ConfigError::MissingField {
                listener: listener.to_string(),
                action: "send_file",
                field: "file",
            })?;
            Action::SendFile(file)
        }
        "tls_alert" => {
            let subtype_str = raw.subtype.as_deref().unwrap_or("handshake_failure");
            let subtype = parse_alert_subtype(subtype_str)?;
            Action::TlsAlert(subtype)
        }
        "proxy" => {
            let target = raw.target.clone().ok_or(ConfigError::MissingField {
                listener: listener.to_string(),
                action: "proxy",
                field: "target",
            })?;
            let (dest_hostname, dest_port) =
                parse_target(&target).map_err(|source| ConfigError::InvalidTarget {
                    listener: listener.to_string(),
                    target: target.clone(),
                    source,
                })?;
            Action::Proxy {
                dest_hostname,
                dest_port,
            }
        }
        other => return Err(ConfigError::UnknownAction(other.to_string())),
    };

    Ok(Route { action, sni_pattern })
}

fn parse_alert_subtype(s: &str) -> Result<AlertSubtype, ConfigError> {
    match s {
        "close_notify" => Ok(AlertSubtype::CloseNotify),
        "handshake_failure" => Ok(AlertSubtype::HandshakeFailure),
        "protocol_version" => Ok(AlertSubtype::ProtocolVersion),
        "decode_error" => Ok(AlertSubtype::DecodeError),
        "internal_error" => Ok(AlertSubtype::InternalError),
        "unrecognized_name" => Ok(AlertSubtype::UnrecognizedName),
        other => Err(ConfigError::UnknownAlertSubtype(other.to_string())),
    }
}
