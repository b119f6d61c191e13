//! Serde-deserializable mirror of the logical config file schema.
//!
//! Kept deliberately separate from [`super::model`]: these types accept
//! whatever the YAML/JSON author wrote, including gaps that inheritance and
//! defaulting need to fill in; [`super::loader`] turns a `RawConfig` into a
//! validated [`super::model::ConfigData`].

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    pub listeners: Vec<RawListener>,
    #[serde(default)]
    pub defaults: RawSlots,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub disable_ipv4: bool,
    #[serde(default)]
    pub disable_ipv6: bool,
}

#[derive(Debug, Deserialize)]
pub struct RawListener {
    pub bind: String,
    #[serde(default)]
    pub routes: Vec<RawRoute>,
    #[serde(default)]
    pub default_route: Option<RawRoute>,
    #[serde(default)]
    pub no_sni_route: Option<RawRoute>,
    #[serde(default)]
    pub tls_error_route: Option<RawRoute>,
    #[serde(default)]
    pub http_fallback_route: Option<RawRoute>,
    #[serde(default)]
    pub proxy_connect_failure_route: Option<RawRoute>,
    #[serde(default)]
    pub hello_timeout_secs: Option<u64>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawSlots {
    #[serde(default)]
    pub default_route: Option<RawRoute>,
    #[serde(default)]
    pub no_sni_route: Option<RawRoute>,
    #[serde(default)]
    pub tls_error_route: Option<RawRoute>,
    #[serde(default)]
    pub http_fallback_route: Option<RawRoute>,
    #[serde(default)]
    pub proxy_connect_failure_route: Option<RawRoute>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawRoute {
    #[serde(default)]
    pub sni: Option<String>,
    pub action: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
}
