//! DNS resolution for `Proxy` routes.
//!
//! Resolution is abstracted behind a trait so the connection state machine
//! and its tests never depend on a live resolver or the network; the
//! production implementation is backed by `hickory-resolver`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

use crate::error::ResolveError;

/// Resolves a hostname to the addresses a `Proxy` action should try, in
/// the order the Connecting phase should attempt them.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Production resolver: the host's configured DNS servers via
/// `hickory-resolver`, with its own internal caching.
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    /// Builds a resolver from the system's `/etc/resolv.conf` (or platform
    /// equivalent), falling back to `ResolverConfig::default()` (the public
    /// resolvers hickory ships with) if the system config can't be read.
    pub fn new() -> Self {
        let inner = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        SystemResolver { inner }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let lookup = self
            .inner
            .lookup_ip(hostname)
            .await
            .map_err(|source| ResolveError::Lookup {
                hostname: hostname.to_string(),
                source: Box::new(source),
            })?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return Err(ResolveError::NoAddresses {
                hostname: hostname.to_string(),
            });
        }
        Ok(addrs)
    }
}

/// Deterministic in-memory resolver for tests: a fixed hostname -> addrs
/// table, with no network access at all.
#[derive(Default)]
pub struct MockResolver {
    entries: Mutex<HashMap<String, Vec<IpAddr>>>,
}

impl MockResolver {
    pub fn new() -> Self {
        MockResolver {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, hostname: impl Into<String>, addrs: Vec<IpAddr>) {
        self.entries.lock().unwrap().insert(hostname.into(), addrs);
    }
}

#[async_trait]
impl Resolver for MockResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolveError> {
        match self.entries.lock().unwrap().get(hostname) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs.clone()),
            _ => Err(ResolveError::NoAddresses {
                hostname: hostname.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_resolver_returns_configured_addrs() {
        let resolver = MockResolver::new();
        resolver.insert("example.com", vec!["127.0.0.1".parse().unwrap()]);
        let addrs = resolver.resolve("example.com").await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn mock_resolver_errors_on_unknown_host() {
        let resolver = MockResolver::new();
        let err = resolver.resolve("nowhere.invalid").await.unwrap_err();
        assert!(matches!(err, ResolveError::NoAddresses { .. }));
    }
}
