//! `no_proxy` bypass rules.
//!
//! Provides domain and IP matching for proxy bypass rules.

use std::net::IpAddr;
use url::Url;

/// Proxy bypass matcher.
///
/// Follows curl's NO_PROXY behavior:
/// - Entries are comma-separated
/// - IP addresses and CIDR ranges supported
/// - Domain matching with optional leading dot
/// - Wildcard `*` matches all hosts
///
/// Two matchers compare equal when they were built from the same rule text;
/// a pushed response or pooled connection is only reused under an identical
/// `no_proxy` value.
#[derive(Debug, Clone, Default)]
pub struct ProxyMatcher {
    raw: String,
    rules: Vec<Rule>,
}

#[derive(Debug, Clone)]
enum Rule {
    Any,
    Domain(String),
    Address(IpAddr),
    Cidr(IpAddr, u8),
}

impl PartialEq for ProxyMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for ProxyMatcher {}

impl std::hash::Hash for ProxyMatcher {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl ProxyMatcher {
    /// Create from environment variables.
    ///
    /// Checks `NO_PROXY` then `no_proxy`.
    pub fn from_env() -> Self {
        let raw = std::env::var("NO_PROXY")
            .or_else(|_| std::env::var("no_proxy"))
            .unwrap_or_default();
        Self::from_string(&raw)
    }

    /// Create from a NO_PROXY string.
    ///
    /// Format: comma-separated list of:
    /// - Domain names (with optional leading dot): `.example.com`, `example.com`
    /// - IP addresses: `192.168.1.1`
    /// - CIDR ranges: `192.168.1.0/24`
    /// - Wildcard: `*` matches everything
    pub fn from_string(no_proxy: &str) -> Self {
        let rules = no_proxy
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Rule::parse)
            .collect();

        Self {
            raw: no_proxy.trim().to_string(),
            rules,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check if a host should bypass the proxy.
    pub fn should_bypass(&self, host: &str) -> bool {
        // Strip brackets from IPv6
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let ip = host.parse::<IpAddr>().ok();
        let host_lower = host.to_ascii_lowercase();

        self.rules.iter().any(|rule| match (rule, ip) {
            (Rule::Any, _) => true,
            (Rule::Address(addr), Some(ip)) => *addr == ip,
            (Rule::Cidr(network, prefix), Some(ip)) => cidr_contains(*network, *prefix, ip),
            (Rule::Domain(domain), None) => domain_matches(domain, &host_lower),
            _ => false,
        })
    }

    /// Check if URL should bypass proxy.
    pub fn should_bypass_url(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|h| self.should_bypass(h))
    }
}

impl Rule {
    fn parse(part: &str) -> Rule {
        if part == "*" {
            return Rule::Any;
        }
        if let Some((ip_str, prefix_str)) = part.split_once('/') {
            if let (Ok(ip), Ok(prefix)) = (ip_str.parse::<IpAddr>(), prefix_str.parse::<u8>()) {
                return Rule::Cidr(ip, prefix);
            }
        }
        if let Ok(ip) = part.parse::<IpAddr>() {
            return Rule::Address(ip);
        }
        let domain = part.to_ascii_lowercase();
        Rule::Domain(domain.strip_prefix('.').map(str::to_string).unwrap_or(domain))
    }
}

/// Exact match, or `host` is a subdomain of `domain` ("notexample.com" does
/// not match "example.com").
fn domain_matches(domain: &str, host: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Check if IP is within CIDR range.
fn cidr_contains(network: IpAddr, prefix: u8, addr: IpAddr) -> bool {
    match (network, addr) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            if prefix > 32 {
                return false;
            }
            let mask = if prefix == 0 {
                0u32
            } else {
                !0u32 << (32 - prefix)
            };
            (u32::from(net) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            if prefix > 128 {
                return false;
            }
            let mask = if prefix == 0 {
                0u128
            } else {
                !0u128 << (128 - prefix)
            };
            (u128::from(net) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}
