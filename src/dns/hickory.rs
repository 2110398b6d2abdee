//! Async DNS resolver using hickory-dns.
//!
//! This resolver provides fully async DNS resolution with support for:
//! - DNS-over-HTTPS (DoH)
//! - DNS-over-TLS (DoT)
//! - System DNS configuration auto-detection
//! - Typed A / AAAA queries
//!
//! Unlike `GaiResolver`, this resolver is fully async and doesn't require
//! spawning blocking tasks.

use super::{Addrs, Name, QueryType, Resolve, Resolving};
use crate::base::neterror::NetError;
use hickory_resolver::{
    config::{LookupIpStrategy, ResolverConfig},
    name_server::TokioConnectionProvider,
    TokioResolver,
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::LazyLock,
};

/// Async DNS resolver backed by hickory-dns.
///
/// This resolver is lazily initialized on first use and shared across
/// all instances via a static `LazyLock`. It automatically configures
/// itself based on the system's DNS settings.
///
/// # Example
///
/// ```rust,ignore
/// use muxnet::dns::{HickoryResolver, Name, QueryType, Resolve};
///
/// let resolver = HickoryResolver::new();
/// let v6 = resolver.resolve_query(Name::new("example.com"), QueryType::Aaaa).await?;
/// ```
#[derive(Debug, Clone)]
pub struct HickoryResolver {
    resolver: &'static LazyLock<TokioResolver>,
}

impl HickoryResolver {
    /// Creates a new `HickoryResolver`.
    ///
    /// The underlying resolver is lazily initialized on first DNS query.
    /// It will attempt to read system DNS configuration; if that fails,
    /// it falls back to sensible defaults.
    pub fn new() -> Self {
        static RESOLVER: LazyLock<TokioResolver> = LazyLock::new(|| {
            let mut builder = match TokioResolver::builder_tokio() {
                Ok(builder) => {
                    tracing::debug!("Using system DNS configuration");
                    builder
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Failed to read system DNS config, using defaults"
                    );
                    TokioResolver::builder_with_config(
                        ResolverConfig::default(),
                        TokioConnectionProvider::default(),
                    )
                }
            };

            builder.options_mut().ip_strategy = LookupIpStrategy::Ipv4AndIpv6;

            builder.build()
        });

        Self {
            resolver: &RESOLVER,
        }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn into_addrs(domain: &str, ips: Vec<IpAddr>) -> Result<Addrs, NetError> {
    if ips.is_empty() {
        return Err(NetError::dns_failed(domain, "no addresses returned"));
    }
    tracing::debug!(domain = %domain, count = ips.len(), "hickory-dns resolution complete");
    let addrs: Vec<SocketAddr> = ips.into_iter().map(|ip| SocketAddr::new(ip, 0)).collect();
    Ok(Box::new(addrs.into_iter()) as Addrs)
}

impl Resolve for HickoryResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.clone();
        Box::pin(async move {
            let domain = name.as_str();
            tracing::debug!(domain = %domain, "resolving via hickory-dns");

            let lookup = resolver.resolver.lookup_ip(domain).await.map_err(|e| {
                tracing::debug!(domain = %domain, error = %e, "hickory-dns lookup failed");
                NetError::dns_failed(domain, e)
            })?;

            into_addrs(domain, lookup.iter().collect())
        })
    }

    fn resolve_query(&self, name: Name, query: QueryType) -> Resolving {
        let resolver = self.clone();
        Box::pin(async move {
            let domain = name.as_str();
            tracing::debug!(domain = %domain, query = %query, "typed hickory-dns query");

            let ips: Vec<IpAddr> = match query {
                QueryType::A => resolver
                    .resolver
                    .ipv4_lookup(domain)
                    .await
                    .map_err(|e| NetError::dns_failed(domain, e))?
                    .iter()
                    .map(|a| IpAddr::V4(a.0))
                    .collect(),
                QueryType::Aaaa => resolver
                    .resolver
                    .ipv6_lookup(domain)
                    .await
                    .map_err(|e| NetError::dns_failed(domain, e))?
                    .iter()
                    .map(|aaaa| IpAddr::V6(aaaa.0))
                    .collect(),
            };

            into_addrs(domain, ips)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hickory_resolver_invalid_domain() {
        let resolver = HickoryResolver::new();
        let result = resolver
            .resolve(Name::new("this-domain-definitely-does-not-exist.invalid"))
            .await;

        assert!(result.is_err());
        let err = result.err().expect("Should have error");
        match err {
            NetError::NameNotResolvedFor { domain, .. } => {
                assert_eq!(domain, "this-domain-definitely-does-not-exist.invalid");
            }
            _ => panic!("Unexpected error type"),
        }
    }

    #[test]
    fn test_hickory_resolver_is_clone() {
        let r1 = HickoryResolver::new();
        let r2 = r1.clone();
        // Both should point to the same static resolver
        assert!(std::ptr::eq(r1.resolver, r2.resolver));
    }

    #[test]
    fn test_into_addrs_empty_is_error() {
        assert!(into_addrs("empty.test", Vec::new()).is_err());
    }
}
