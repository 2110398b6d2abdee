//! Socket and connection management.
//!
//! Provides connection pooling and socket handling mirroring Chromium's `net/socket/`:
//! - [`pool`]: per-authority connection pool with FIFO waiters
//! - [`connectjob`]: DNS → TCP → proxy tunnel → TLS connection flow
//! - [`proxy`]: HTTP proxy settings
//! - [`matcher`]: `no_proxy` bypass rules
//! - [`tls`]: TLS configuration with BoringSSL

pub mod client;
pub mod connectjob;
pub mod matcher;
pub mod pool;
pub mod proxy;
pub mod tls;
