//! DNS Resolution Module
//!
//! Provides pluggable DNS resolution with support for:
//! - System resolver (getaddrinfo via thread pool)
//! - Async hickory-dns resolver (DoH/DoT capable)
//! - Client-wide hostname overrides that only answer the record types they
//!   can represent
//!
//! # Architecture
//!
//! The `Resolve` trait is the core abstraction that allows different resolver
//! implementations to be used interchangeably. The [`DnsCache`] sits in front
//! of it and is owned by the client state.
//!
//! # Example
//!
//! ```rust,ignore
//! use muxnet::dns::{DnsAnswer, DnsCache, QueryType};
//!
//! let mut cache = DnsCache::new();
//! cache.insert("api.local", "127.0.0.1".parse()?);
//! assert!(matches!(cache.resolve("api.local", QueryType::Aaaa), DnsAnswer::Delegate));
//! ```

mod cache;
mod gai;
mod hickory;
mod resolve;

pub use cache::{resolve_host, DnsAnswer, DnsCache, HostOverride};
pub use gai::{parse_ip_literal, with_port, GaiResolver};
pub use hickory::HickoryResolver;
pub use resolve::{Addrs, Name, QueryType, Resolve, Resolving};
