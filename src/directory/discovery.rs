//! Pluggable endpoint discovery.
//!
//! The directory refreshes its server list through a provider: a fixed
//! bootstrap list, DNS resolution of a well-known name, or anything an
//! embedder supplies.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CmError, Result};
use crate::transport::{Endpoint, TransportKind};

/// Source of front-end endpoints.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    async fn discover(&self) -> Result<Vec<Endpoint>>;
}

/// Fixed endpoint list.
pub struct StaticDiscovery {
    endpoints: Vec<Endpoint>,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl DiscoveryProvider for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<Endpoint>> {
        Ok(self.endpoints.clone())
    }
}

/// DNS-based discovery: resolves a well-known host name to endpoints.
pub struct DnsDiscovery {
    /// Name to resolve, including port (e.g. "cm.example.net:27017")
    host: String,
    kind: TransportKind,
}

impl DnsDiscovery {
    pub fn new(host: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            host: host.into(),
            kind,
        }
    }
}

#[async_trait]
impl DiscoveryProvider for DnsDiscovery {
    async fn discover(&self) -> Result<Vec<Endpoint>> {
        let addrs = tokio::net::lookup_host(&self.host)
            .await
            .map_err(|e| CmError::Discovery(format!("lookup of {} failed: {e}", self.host)))?;

        let endpoints: Vec<Endpoint> = addrs
            .map(|addr| Endpoint::new(addr, self.kind))
            .collect();

        debug!(host = %self.host, found = endpoints.len(), "resolved endpoints");

        if endpoints.is_empty() {
            return Err(CmError::Discovery(format!(
                "lookup of {} returned no addresses",
                self.host
            )));
        }
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_discovery_returns_seed() {
        let seed = vec![Endpoint::stream(([10, 0, 0, 1], 27017).into())];
        let provider = StaticDiscovery::new(seed.clone());
        assert_eq!(provider.discover().await.unwrap(), seed);
    }

    #[tokio::test]
    async fn dns_discovery_resolves_loopback() {
        let provider = DnsDiscovery::new("localhost:27017", TransportKind::Stream);
        let endpoints = provider.discover().await.unwrap();
        assert!(!endpoints.is_empty());
        assert!(endpoints.iter().all(|e| e.kind == TransportKind::Stream));
    }
}
