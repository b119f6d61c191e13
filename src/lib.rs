//! SNI gateway library: the per-connection state machine, route matcher,
//! config snapshot/reload machinery, and listener runtime. Split into a
//! library so the `sni-gateway` server binary and the
//! `sni-gateway-hostnamecheck` utility binary can share it.

pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod resolver;
pub mod splice;
pub mod supervisor;
pub mod tls;
