//! Client-wide hostname overrides.
//!
//! A request's `resolve` option pins hostnames to fixed addresses for as long
//! as the client keeps them. Overrides are owned by the client state and
//! consulted before any resolver query is issued.

use super::{Name, QueryType, Resolve};
use crate::base::neterror::NetError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Answer of the override cache for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsAnswer {
    /// Synthesized records; the resolver is not queried.
    Records(Vec<IpAddr>),
    /// No override can answer this query type; ask the resolver.
    Delegate,
}

/// A single hostname override.
///
/// An IPv4 override only answers `A` queries and an IPv6 override only
/// `AAAA` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostOverride {
    ip: IpAddr,
}

impl HostOverride {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn answer(&self, query: QueryType) -> DnsAnswer {
        if query.matches(&self.ip) {
            DnsAnswer::Records(vec![self.ip])
        } else {
            DnsAnswer::Delegate
        }
    }
}

/// Per-client DNS override cache.
///
/// `remove` and `evict_all` both drop overrides; they differ only in which
/// counter records it. Counters survive [`DnsCache::reset`].
#[derive(Debug, Default)]
pub struct DnsCache {
    hostnames: HashMap<String, HostOverride>,
    /// Hosts whose override was dropped since the last `take_pending_removals`.
    pending_removals: Vec<String>,
    removals: u64,
    evictions: u64,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces the override for `hostname`.
    pub fn insert(&mut self, hostname: &str, ip: IpAddr) {
        let key = hostname.to_ascii_lowercase();
        tracing::debug!(host = %key, %ip, "installing DNS override");
        self.hostnames.insert(key, HostOverride::new(ip));
    }

    pub fn get(&self, hostname: &str) -> Option<HostOverride> {
        self.hostnames.get(&hostname.to_ascii_lowercase()).copied()
    }

    /// Answers `query` for `hostname` from the overrides.
    pub fn resolve(&self, hostname: &str, query: QueryType) -> DnsAnswer {
        match self.get(hostname) {
            Some(entry) => {
                let answer = entry.answer(query);
                tracing::debug!(host = %hostname, %query, ?answer, "DNS override hit");
                answer
            }
            None => DnsAnswer::Delegate,
        }
    }

    /// Drops the override for `hostname`, counting a removal.
    pub fn remove(&mut self, hostname: &str) -> bool {
        let key = hostname.to_ascii_lowercase();
        if self.hostnames.remove(&key).is_none() {
            return false;
        }
        tracing::debug!(host = %key, "removing DNS override");
        self.removals += 1;
        self.pending_removals.push(key);
        true
    }

    /// Drops every override, counting one eviction per entry.
    ///
    /// Runs when the client has no open handle left.
    pub fn evict_all(&mut self) -> usize {
        let count = self.hostnames.len();
        if count == 0 {
            return 0;
        }
        tracing::debug!(count, "evicting DNS overrides");
        self.evictions += count as u64;
        for (host, _) in self.hostnames.drain() {
            self.pending_removals.push(host);
        }
        count
    }

    /// Hosts dropped since the previous call; connections established
    /// through their old override must not be reused.
    pub fn take_pending_removals(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_removals)
    }

    /// Clears overrides and returns every host dropped since the last
    /// `take_pending_removals`, this reset included. Counters are kept.
    pub fn reset(&mut self) -> Vec<String> {
        let mut dropped = std::mem::take(&mut self.pending_removals);
        dropped.extend(self.hostnames.drain().map(|(host, _)| host));
        dropped
    }

    pub fn len(&self) -> usize {
        self.hostnames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hostnames.is_empty()
    }

    pub fn removals(&self) -> u64 {
        self.removals
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

/// Resolves `host` for a connection attempt.
///
/// Each query type is answered by `entry` when it can represent it and by
/// `resolver` otherwise. A delegated query that fails is ignored as long as
/// the other family produced addresses.
pub async fn resolve_host(
    host: &str,
    entry: Option<HostOverride>,
    resolver: Arc<dyn Resolve>,
) -> Result<Vec<IpAddr>, NetError> {
    let mut ips = Vec::new();
    let mut last_err = None;

    for query in [QueryType::A, QueryType::Aaaa] {
        let answer = entry.map_or(DnsAnswer::Delegate, |e| e.answer(query));
        match answer {
            DnsAnswer::Records(records) => ips.extend(records),
            DnsAnswer::Delegate => match resolver.resolve_query(Name::new(host), query).await {
                Ok(addrs) => ips.extend(addrs.map(|a| a.ip())),
                Err(e) => {
                    tracing::debug!(host = %host, %query, error = %e, "query failed");
                    last_err = Some(e);
                }
            },
        }
    }

    if ips.is_empty() {
        return Err(last_err.unwrap_or_else(|| NetError::dns_failed(host, "no addresses")));
    }
    ips.dedup();
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{Addrs, Resolving};
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const V4: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
    const V6: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);

    #[derive(Default)]
    struct CountingResolver {
        a: AtomicUsize,
        aaaa: AtomicUsize,
    }

    impl Resolve for CountingResolver {
        fn resolve(&self, _name: Name) -> Resolving {
            Box::pin(async { Err(NetError::NameNotResolved) })
        }

        fn resolve_query(&self, _name: Name, query: QueryType) -> Resolving {
            let ip = match query {
                QueryType::A => {
                    self.a.fetch_add(1, Ordering::SeqCst);
                    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
                }
                QueryType::Aaaa => {
                    self.aaaa.fetch_add(1, Ordering::SeqCst);
                    IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1))
                }
            };
            Box::pin(async move {
                Ok(Box::new(std::iter::once(SocketAddr::new(ip, 0))) as Addrs)
            })
        }
    }

    #[test]
    fn test_v4_override_answers_only_a() {
        let mut cache = DnsCache::new();
        cache.insert("api.test", V4);

        assert_eq!(cache.resolve("api.test", QueryType::A), DnsAnswer::Records(vec![V4]));
        assert_eq!(cache.resolve("api.test", QueryType::Aaaa), DnsAnswer::Delegate);
        assert_eq!(cache.resolve("API.test", QueryType::A), DnsAnswer::Records(vec![V4]));
        assert_eq!(cache.resolve("other.test", QueryType::A), DnsAnswer::Delegate);
    }

    #[test]
    fn test_v6_override_answers_only_aaaa() {
        let entry = HostOverride::new(V6);
        assert_eq!(entry.answer(QueryType::Aaaa), DnsAnswer::Records(vec![V6]));
        assert_eq!(entry.answer(QueryType::A), DnsAnswer::Delegate);
    }

    #[test]
    fn test_remove_and_evict_counters() {
        let mut cache = DnsCache::new();
        cache.insert("a.test", V4);
        cache.insert("b.test", V4);
        cache.insert("c.test", V6);

        assert!(cache.remove("a.test"));
        assert!(!cache.remove("a.test"));
        assert_eq!(cache.removals(), 1);

        assert_eq!(cache.evict_all(), 2);
        assert_eq!(cache.evictions(), 2);
        assert!(cache.is_empty());

        let mut pending = cache.take_pending_removals();
        pending.sort();
        assert_eq!(pending, vec!["a.test", "b.test", "c.test"]);
        assert!(cache.take_pending_removals().is_empty());
    }

    #[test]
    fn test_reset_keeps_counters() {
        let mut cache = DnsCache::new();
        cache.insert("a.test", V4);
        cache.remove("a.test");
        cache.insert("b.test", V4);
        let mut dropped = cache.reset();
        dropped.sort();

        assert_eq!(dropped, vec!["a.test", "b.test"]);
        assert!(cache.is_empty());
        assert!(cache.take_pending_removals().is_empty());
        assert_eq!(cache.removals(), 1);
        assert_eq!(cache.evictions(), 0);
    }

    #[tokio::test]
    async fn test_resolve_host_delegates_unrepresentable_query() {
        let resolver = Arc::new(CountingResolver::default());
        let ips = resolve_host("api.test", Some(HostOverride::new(V4)), resolver.clone())
            .await
            .unwrap();

        assert_eq!(ips[0], V4);
        assert_eq!(resolver.a.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.aaaa.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_host_without_override() {
        let resolver = Arc::new(CountingResolver::default());
        let ips = resolve_host("api.test", None, resolver.clone()).await.unwrap();

        assert_eq!(ips.len(), 2);
        assert_eq!(resolver.a.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.aaaa.load(Ordering::SeqCst), 1);
    }
}
