//! Transfer backends.
//!
//! A backend owns an async runtime and the futures of in-flight transfers.
//! The client registers a transfer with [`Backend::start`] and drives every
//! transfer at once through bounded [`Backend::tick`] calls; each tick returns
//! the lifecycle events produced meanwhile.
//!
//! Two implementations share this contract:
//! - [`multi::MultiBackend`]: a hand-rolled multiplexer that polls exactly the
//!   transfers whose wakers fired, in one shared perform step.
//! - [`reactor::ReactorBackend`]: transfers are local tasks of an event loop
//!   that runs until an event arrives or the tick budget is spent.

pub mod event;
pub mod multi;
pub mod reactor;

use crate::base::neterror::NetError;
use event::{EventSink, TransferEvent};
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Upper bound on how long dropping a backend waits for its runtime to stop.
pub const ABANDONED_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Boxed transfer future. Backends are single-threaded, so it needs no `Send`.
pub type LocalTransfer = Pin<Box<dyn Future<Output = ()>>>;

/// Identifies one request for its whole lifetime inside a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which backend a client runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Multi,
    Reactor,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Multi => "multi",
            BackendKind::Reactor => "reactor",
        }
    }

    /// Builds the backend. Fails when its runtime cannot be created; there is
    /// no fallback to the other kind.
    pub fn build(self) -> Result<Box<dyn Backend>, NetError> {
        Ok(match self {
            BackendKind::Multi => Box::new(multi::MultiBackend::new()?),
            BackendKind::Reactor => Box::new(reactor::ReactorBackend::new()?),
        })
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The contract every backend fulfils.
pub trait Backend {
    fn kind(&self) -> BackendKind;

    /// Event sink the transfer of `id` reports through.
    fn sink(&self, id: HandleId) -> EventSink;

    /// Registers a transfer. Never blocks; the future first runs on the next tick.
    fn start(&mut self, id: HandleId, transfer: LocalTransfer);

    /// Drives all transfers until at least one event is available or
    /// `timeout` elapses, and returns every queued event.
    fn tick(&mut self, timeout: Duration) -> Vec<(HandleId, TransferEvent)>;

    /// Drops the transfer immediately, closing its connection.
    /// Returns `false` when `id` is unknown or already finished.
    fn cancel(&mut self, id: HandleId) -> bool;

    /// Number of transfers still registered.
    fn active_count(&self) -> usize;
}

fn build_runtime(kind: BackendKind) -> Result<tokio::runtime::Runtime, NetError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| NetError::BackendUnavailable {
            backend: kind.as_str(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_from_config() {
        let kind: BackendKind = serde_json::from_str("\"reactor\"").unwrap();
        assert_eq!(kind, BackendKind::Reactor);
        assert_eq!(BackendKind::default(), BackendKind::Multi);
        assert!(serde_json::from_str::<BackendKind>("\"curl\"").is_err());
    }

    #[test]
    fn test_handle_id_display() {
        assert_eq!(HandleId::from_raw(7).to_string(), "#7");
    }
}
