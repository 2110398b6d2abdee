//! Established connections as the pool stores them.

use crate::socket::client::SocketType;
use crate::socket::pool::{ConnectionIdentity, Poolable};
use bytes::Bytes;
use http_body_util::Full;
use hyper::client::conn::http2;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What is known about a connection once its transport is ready.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub id: u64,
    pub identity: ConnectionIdentity,
    /// Host the socket was connected to (the proxy's when tunnelling).
    pub connect_host: String,
    pub peer: Option<SocketAddr>,
    /// DER certificates presented by the server, leaf first.
    pub peer_chain: Arc<Vec<Vec<u8>>>,
    /// Address of the DNS override `connect_host` was resolved through.
    pub dns_override: Option<IpAddr>,
}

impl ConnectionMeta {
    pub fn new(
        identity: ConnectionIdentity,
        connect_host: &str,
        peer: Option<SocketAddr>,
        peer_chain: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            connect_host: connect_host.to_ascii_lowercase(),
            peer,
            peer_chain: Arc::new(peer_chain),
            dns_override: None,
        }
    }

    pub fn with_dns_override(mut self, ip: Option<IpAddr>) -> Self {
        self.dns_override = ip;
        self
    }
}

/// An idle HTTP/1.1 keep-alive connection.
#[derive(Debug)]
pub struct Http1Connection {
    pub socket: SocketType,
    pub meta: ConnectionMeta,
}

impl Poolable for Http1Connection {
    fn identity(&self) -> &ConnectionIdentity {
        &self.meta.identity
    }

    fn connect_host(&self) -> &str {
        &self.meta.connect_host
    }

    fn is_reusable(&self) -> bool {
        self.socket.is_connected_and_idle()
    }
}

/// Aborts the task driving an HTTP/2 connection once the last user is gone.
#[derive(Debug)]
struct DriverGuard(AbortHandle);

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A multiplexed HTTP/2 connection; clones share the same connection.
#[derive(Clone)]
pub struct Http2Connection {
    pub sender: http2::SendRequest<Full<Bytes>>,
    pub meta: ConnectionMeta,
    _driver: Arc<DriverGuard>,
}

impl Http2Connection {
    pub fn new(
        sender: http2::SendRequest<Full<Bytes>>,
        meta: ConnectionMeta,
        driver: AbortHandle,
    ) -> Self {
        Self {
            sender,
            meta,
            _driver: Arc::new(DriverGuard(driver)),
        }
    }
}

impl std::fmt::Debug for Http2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Connection")
            .field("meta", &self.meta)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl Poolable for Http2Connection {
    fn identity(&self) -> &ConnectionIdentity {
        &self.meta.identity
    }

    fn connect_host(&self) -> &str {
        &self.meta.connect_host
    }

    fn is_reusable(&self) -> bool {
        !self.sender.is_closed()
    }
}
