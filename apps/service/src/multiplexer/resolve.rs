//! Turning a test's destination into an address, through the DNS cache.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::LocalBoxFuture;
use hickory_resolver::TokioResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use tracing::{debug, warn};

use crate::catalogue::TestSpec;
use crate::config::DnsStrategy;
use crate::store::{AddressFamily, Store};

/// What to do before connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Ready(IpAddr),
    /// Ask the resolver for this name.
    Lookup(String),
    Failed,
}

pub struct AddressResolver {
    strategy: DnsStrategy,
    resolver: TokioResolver,
    store: Arc<dyn Store>,
}

impl AddressResolver {
    pub fn new(strategy: DnsStrategy, timeout: Duration, store: Arc<dyn Store>) -> Self {
        let mut options = ResolverOpts::default();
        options.timeout = timeout;
        options.attempts = 2;

        let builder = match TokioResolver::builder(TokioConnectionProvider::default()) {
            Ok(builder) => builder,
            Err(err) => {
                warn!("system resolver configuration unavailable ({err}), using public defaults");
                TokioResolver::builder_with_config(ResolverConfig::default(), TokioConnectionProvider::default())
            }
        };

        Self { strategy, resolver: builder.with_options(options).build(), store }
    }

    /// Decide from the destination literal, the catalogue and the cache,
    /// without touching the network.
    pub async fn prepare(&self, spec: &TestSpec, now: i64) -> Result<Resolution> {
        let name = spec.id.destination.as_str();
        if let Ok(address) = name.parse::<IpAddr>() {
            return Ok(Resolution::Ready(address));
        }

        if self.strategy == DnsStrategy::Ip {
            return Ok(spec.configured_ip.map_or(Resolution::Failed, Resolution::Ready));
        }

        let v4 = self.store.dns_lookup(name, AddressFamily::V4).await?.filter(|cached| cached.is_fresh(now));
        let v6 = self.store.dns_lookup(name, AddressFamily::V6).await?.filter(|cached| cached.is_fresh(now));

        if let Some(address) = v4.and_then(|cached| cached.address).or(v6.and_then(|cached| cached.address)) {
            return Ok(Resolution::Ready(address));
        }
        if v4.is_some() {
            debug!(name, "cached lookup failure");
            return Ok(self.fallback(spec).map_or(Resolution::Failed, Resolution::Ready));
        }
        Ok(Resolution::Lookup(name.to_string()))
    }

    /// Resolve `name`; IPv4 answers win over IPv6.
    pub fn lookup(&self, name: String) -> LocalBoxFuture<'static, Option<IpAddr>> {
        let resolver = self.resolver.clone();
        Box::pin(async move {
            match resolver.lookup_ip(name.as_str()).await {
                Ok(lookup) => {
                    let addresses: Vec<IpAddr> = lookup.iter().collect();
                    addresses.iter().find(|address| address.is_ipv4()).or(addresses.first()).copied()
                }
                Err(err) => {
                    debug!(%name, "lookup failed: {err}");
                    None
                }
            }
        })
    }

    /// Cache a lookup result and return the address to use, falling back
    /// to the catalogue IP when the strategy allows it.
    pub async fn record(&self, spec: &TestSpec, name: &str, address: Option<IpAddr>, now: i64) -> Result<Option<IpAddr>> {
        match address {
            Some(address) => {
                self.store.dns_update(name, AddressFamily::of(address), Some(address), now).await?;
                if address.is_ipv6() {
                    self.store.dns_update(name, AddressFamily::V4, None, now).await?;
                }
                Ok(Some(address))
            }
            None => {
                self.store.dns_update(name, AddressFamily::V4, None, now).await?;
                self.store.dns_update(name, AddressFamily::V6, None, now).await?;
                Ok(self.fallback(spec))
            }
        }
    }

    fn fallback(&self, spec: &TestSpec) -> Option<IpAddr> {
        match self.strategy {
            DnsStrategy::Standard | DnsStrategy::Ip => spec.configured_ip,
            DnsStrategy::Only => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibsqlStore;
    use crate::testing::{spec, spec_for};
    use tempfile::tempdir;

    async fn resolver(strategy: DnsStrategy) -> Result<(AddressResolver, Arc<dyn Store>, tempfile::TempDir)> {
        let dir = tempdir()?;
        let store: Arc<dyn Store> = Arc::new(LibsqlStore::open(&dir.path().join("dns.db")).await?);
        Ok((AddressResolver::new(strategy, Duration::from_secs(1), store.clone()), store, dir))
    }

    #[tokio::test]
    async fn literal_destinations_need_no_lookup() -> Result<()> {
        let (resolver, _store, _dir) = resolver(DnsStrategy::Only).await?;
        let spec = spec_for("192.0.2.44", "ssh");
        assert_eq!(resolver.prepare(&spec, 0).await?, Resolution::Ready("192.0.2.44".parse()?));
        Ok(())
    }

    #[tokio::test]
    async fn ip_strategy_uses_catalogue() -> Result<()> {
        let (resolver, _store, _dir) = resolver(DnsStrategy::Ip).await?;
        assert_eq!(resolver.prepare(&spec("ssh"), 0).await?, Resolution::Ready("192.0.2.80".parse()?));
        let foreign = spec("http://elsewhere.example.org/");
        assert_eq!(resolver.prepare(&foreign, 0).await?, Resolution::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn cache_hits_and_negative_entries() -> Result<()> {
        let (resolver, store, _dir) = resolver(DnsStrategy::Standard).await?;
        let spec = spec("ssh");

        assert_eq!(resolver.prepare(&spec, 1_000).await?, Resolution::Lookup("probe.example.net".into()));

        store.dns_update("probe.example.net", AddressFamily::V6, Some("2001:db8::80".parse()?), 1_000).await?;
        assert_eq!(resolver.prepare(&spec, 1_001).await?, Resolution::Ready("2001:db8::80".parse()?));

        store.dns_update("probe.example.net", AddressFamily::V4, Some("198.51.100.80".parse()?), 1_000).await?;
        assert_eq!(resolver.prepare(&spec, 1_001).await?, Resolution::Ready("198.51.100.80".parse()?));

        assert_eq!(resolver.prepare(&spec, 1_000 + 3_600).await?, Resolution::Lookup("probe.example.net".into()));
        Ok(())
    }

    #[tokio::test]
    async fn failed_lookup_falls_back_per_strategy() -> Result<()> {
        let (standard, _store, _dir) = resolver(DnsStrategy::Standard).await?;
        let spec = spec("ssh");
        assert_eq!(standard.record(&spec, "probe.example.net", None, 50).await?, Some("192.0.2.80".parse()?));
        assert_eq!(standard.prepare(&spec, 60).await?, Resolution::Ready("192.0.2.80".parse()?));

        let (only, _store, _dir) = resolver(DnsStrategy::Only).await?;
        assert_eq!(only.record(&spec, "probe.example.net", None, 50).await?, None);
        assert_eq!(only.prepare(&spec, 60).await?, Resolution::Failed);
        Ok(())
    }
}
