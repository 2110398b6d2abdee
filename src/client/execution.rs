//! Per-request execution state.

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::engine::event::TransferEvent;
use crate::engine::HandleId;
use crate::http::request::Progress;
use crate::http::response::ResponseHead;
use bytes::{Bytes, BytesMut};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Elapsed times since the request started, curl style.
///
/// Each field is set once. A field whose state was skipped takes the value
/// of the first later state that was reached, so the sequence never
/// decreases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    pub name_lookup: Option<Duration>,
    pub connect: Option<Duration>,
    pub tls_handshake: Option<Duration>,
    pub pretransfer: Option<Duration>,
    pub start_transfer: Option<Duration>,
    pub total: Option<Duration>,
}

impl Timings {
    fn slots(&mut self) -> [&mut Option<Duration>; 6] {
        [
            &mut self.name_lookup,
            &mut self.connect,
            &mut self.tls_handshake,
            &mut self.pretransfer,
            &mut self.start_transfer,
            &mut self.total,
        ]
    }

    /// Sets every unset field up to `upto` (index into the field order).
    fn mark(&mut self, upto: usize, elapsed: Duration) {
        for slot in self.slots().into_iter().take(upto + 1) {
            if slot.is_none() {
                *slot = Some(elapsed);
            }
        }
    }

    /// Fields in order; handy for monotonicity checks.
    pub fn as_array(&self) -> [Option<Duration>; 6] {
        [
            self.name_lookup,
            self.connect,
            self.tls_handshake,
            self.pretransfer,
            self.start_transfer,
            self.total,
        ]
    }
}

/// Read-only diagnostics of a request.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub id: HandleId,
    pub method: String,
    pub url: String,
    pub state: LoadState,
    /// States entered, in order.
    pub history: Vec<LoadState>,
    pub http_code: Option<u16>,
    pub timings: Timings,
    pub primary_ip: Option<IpAddr>,
    pub primary_port: Option<u16>,
    pub connection_id: Option<u64>,
    /// DER certificates, leaf first, when `capture_peer_cert_chain` is set.
    pub peer_cert_chain: Option<Vec<Vec<u8>>>,
    pub debug: Vec<String>,
    pub size_upload: u64,
    pub size_download: u64,
    pub download_content_length: Option<u64>,
    pub error: Option<String>,
}

/// Everything known about one request, fed by its transfer's events.
#[derive(Debug)]
pub struct RequestExecutionContext {
    id: HandleId,
    method: String,
    url: String,
    capture_chain: bool,
    started: Instant,
    last_activity: Instant,
    state: LoadState,
    history: Vec<LoadState>,
    timings: Timings,
    primary_ip: Option<IpAddr>,
    primary_port: Option<u16>,
    connection_id: Option<u64>,
    peer_cert_chain: Option<Vec<Vec<u8>>>,
    debug: Vec<String>,
    size_upload: u64,
    head: Option<ResponseHead>,
    body: BytesMut,
    error: Option<NetError>,
}

impl RequestExecutionContext {
    pub fn new(id: HandleId, method: &str, url: &str, capture_chain: bool) -> Self {
        let now = Instant::now();
        Self {
            id,
            method: method.to_string(),
            url: url.to_string(),
            capture_chain,
            started: now,
            last_activity: now,
            state: LoadState::Created,
            history: vec![LoadState::Created],
            timings: Timings::default(),
            primary_ip: None,
            primary_port: None,
            connection_id: None,
            peer_cert_chain: None,
            debug: Vec::new(),
            size_upload: 0,
            head: None,
            body: BytesMut::new(),
            error: None,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn head(&self) -> Option<&ResponseHead> {
        self.head.as_ref()
    }

    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.body)
    }

    pub fn error(&self) -> Option<&NetError> {
        self.error.as_ref()
    }

    pub fn debug_line(&mut self, line: impl Into<String>) {
        if !self.is_terminal() {
            self.debug.push(line.into());
        }
    }

    /// Moves to `next`, recording timings. Rejects transitions that go
    /// backwards or leave a terminal state.
    fn advance(&mut self, next: LoadState) -> bool {
        if next == self.state && !next.is_terminal() {
            return true;
        }
        if !self.state.can_advance_to(next) {
            tracing::warn!(
                id = %self.id,
                from = %self.state,
                to = %next,
                "out-of-order lifecycle event ignored"
            );
            return false;
        }

        let elapsed = self.started.elapsed();
        match next {
            LoadState::Connecting => self.timings.mark(0, elapsed),
            LoadState::TlsHandshaking => self.timings.mark(1, elapsed),
            LoadState::SendingHeaders => self.timings.mark(3, elapsed),
            LoadState::ReceivingBody => self.timings.mark(4, elapsed),
            LoadState::Completed => self.timings.mark(5, elapsed),
            LoadState::Failed | LoadState::Canceled => {
                self.timings.total.get_or_insert(elapsed);
            }
            _ => {}
        }
        self.state = next;
        self.history.push(next);
        true
    }

    /// Applies one transfer event. Returns `false` when it was rejected.
    pub fn apply(&mut self, event: &TransferEvent) -> bool {
        if self.is_terminal() {
            return false;
        }
        if let Some(next) = event.load_state() {
            if !self.advance(next) {
                return false;
            }
        }
        self.last_activity = Instant::now();

        match event {
            TransferEvent::Connecting { addr: Some(addr) } => {
                self.primary_ip = Some(addr.ip());
                self.primary_port = Some(addr.port());
            }
            TransferEvent::Connected { meta, .. } => {
                if let Some(peer) = meta.peer {
                    self.primary_ip = Some(peer.ip());
                    self.primary_port = Some(peer.port());
                }
                self.connection_id = Some(meta.id);
                if self.capture_chain && !meta.peer_chain.is_empty() {
                    self.peer_cert_chain = Some(meta.peer_chain.as_ref().clone());
                }
            }
            TransferEvent::SendingBody { bytes } => self.size_upload += bytes,
            TransferEvent::ResponseHeaders(head) => {
                self.debug.push(format!("< {}", head.status_line()));
                for (name, value) in &head.headers {
                    self.debug
                        .push(format!("< {}: {}", name, value.to_str().unwrap_or("<binary>")));
                }
                self.head = Some(head.clone());
            }
            TransferEvent::Data(chunk) => self.body.extend_from_slice(chunk),
            TransferEvent::Failed(e) => {
                self.debug.push(format!("* {}", e));
                self.error = Some(e.clone());
            }
            TransferEvent::Debug(line) => self.debug.push(line.clone()),
            _ => {}
        }
        true
    }

    /// Terminates the request with `error` unless it already finished.
    pub fn fail(&mut self, error: NetError) -> bool {
        self.apply(&TransferEvent::Failed(error))
    }

    /// Marks the request canceled. A no-op once terminal.
    pub fn cancel(&mut self) -> bool {
        if !self.advance(LoadState::Canceled) {
            return false;
        }
        self.error = Some(NetError::Canceled);
        true
    }

    /// The error every inspection of a failed or canceled request returns.
    pub fn terminal_error(&self) -> Option<NetError> {
        match self.state {
            LoadState::Canceled => Some(NetError::Canceled),
            LoadState::Failed => Some(self.error.clone().unwrap_or(NetError::Failed)),
            _ => None,
        }
    }

    pub fn progress(&self) -> Progress {
        Progress {
            url: self.url.clone(),
            state: self.state,
            uploaded: self.size_upload,
            downloaded: self.body.len() as u64,
            download_total: self.head.as_ref().and_then(ResponseHead::content_length),
        }
    }

    pub fn info(&self) -> TransferInfo {
        TransferInfo {
            id: self.id,
            method: self.method.clone(),
            url: self.url.clone(),
            state: self.state,
            history: self.history.clone(),
            http_code: self.head.as_ref().map(|h| h.status.as_u16()),
            timings: self.timings,
            primary_ip: self.primary_ip,
            primary_port: self.primary_port,
            connection_id: self.connection_id,
            peer_cert_chain: self.peer_cert_chain.clone(),
            debug: self.debug.clone(),
            size_upload: self.size_upload,
            size_download: self.body.len() as u64,
            download_content_length: self.head.as_ref().and_then(ResponseHead::content_length),
            error: self.error.as_ref().map(ToString::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, StatusCode, Version};

    fn ctx() -> RequestExecutionContext {
        RequestExecutionContext::new(HandleId::from_raw(1), "GET", "http://a.test/", false)
    }

    fn head() -> ResponseHead {
        ResponseHead {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let mut c = ctx();
        for event in [
            TransferEvent::Resolving,
            TransferEvent::Connecting {
                addr: Some("127.0.0.1:80".parse().unwrap()),
            },
            TransferEvent::SendingHeaders,
            TransferEvent::AwaitingResponseHeaders,
            TransferEvent::ResponseHeaders(head()),
            TransferEvent::Data(Bytes::from_static(b"ab")),
            TransferEvent::Data(Bytes::from_static(b"c")),
            TransferEvent::Completed { connection: None },
        ] {
            assert!(c.apply(&event));
        }

        let info = c.info();
        assert_eq!(info.state, LoadState::Completed);
        assert_eq!(info.http_code, Some(200));
        assert_eq!(info.size_download, 3);
        assert_eq!(info.primary_port, Some(80));
        assert!(info.debug.contains(&"< HTTP/1.1 200 OK".to_string()));

        let times = info.timings.as_array();
        assert!(times.iter().all(Option::is_some));
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut c = ctx();
        assert!(c.apply(&TransferEvent::SendingHeaders));
        assert!(!c.apply(&TransferEvent::Resolving));
        assert_eq!(c.state(), LoadState::SendingHeaders);
    }

    #[test]
    fn test_terminal_is_immutable() {
        let mut c = ctx();
        assert!(c.fail(NetError::ConnectionRefused));
        assert!(!c.apply(&TransferEvent::Data(Bytes::from_static(b"x"))));
        assert!(!c.cancel());
        assert!(!c.fail(NetError::TimedOut));
        assert_eq!(c.terminal_error(), Some(NetError::ConnectionRefused));
        assert_eq!(c.terminal_error(), c.terminal_error());
    }

    #[test]
    fn test_cancel_marker() {
        let mut c = ctx();
        assert!(c.cancel());
        assert!(!c.cancel());
        assert!(c.terminal_error().unwrap().is_canceled());
        assert!(c.info().timings.total.is_some());
    }

    #[test]
    fn test_skipped_states_backfill_timings() {
        let mut c = ctx();
        c.apply(&TransferEvent::ResponseHeaders(head()));
        c.apply(&TransferEvent::Completed { connection: None });
        let t = c.info().timings;
        assert_eq!(t.name_lookup, t.start_transfer);
        assert!(t.start_transfer <= t.total);
    }
}
