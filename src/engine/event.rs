//! Lifecycle events emitted by transfers.

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::engine::HandleId;
use crate::http::conn::{ConnectionMeta, Http1Connection, Http2Connection};
use crate::http::response::ResponseHead;
use bytes::Bytes;
use tokio::sync::mpsc;

/// One step of a transfer, reported by whichever backend drives it.
///
/// Events of one handle arrive in the order the transfer produced them.
#[derive(Debug)]
pub enum TransferEvent {
    Resolving,
    /// A TCP connect attempt. `None` for unix sockets.
    Connecting { addr: Option<std::net::SocketAddr> },
    TlsHandshaking,
    /// The transport is ready (pins verified). Carries a shared HTTP/2
    /// connection the client may hand to further requests.
    Connected {
        meta: ConnectionMeta,
        shared: Option<Http2Connection>,
    },
    SendingHeaders,
    SendingBody { bytes: u64 },
    AwaitingResponseHeaders,
    ResponseHeaders(ResponseHead),
    Data(Bytes),
    /// Terminal success. A reusable HTTP/1.1 connection is handed back.
    Completed { connection: Option<Http1Connection> },
    /// Terminal failure.
    Failed(NetError),
    /// A diagnostic trace line.
    Debug(String),
}

impl TransferEvent {
    /// Lifecycle state this event moves the transfer into, if any.
    pub fn load_state(&self) -> Option<LoadState> {
        match self {
            TransferEvent::Resolving => Some(LoadState::Resolving),
            TransferEvent::Connecting { .. } => Some(LoadState::Connecting),
            TransferEvent::TlsHandshaking => Some(LoadState::TlsHandshaking),
            TransferEvent::SendingHeaders => Some(LoadState::SendingHeaders),
            TransferEvent::SendingBody { .. } => Some(LoadState::SendingBody),
            TransferEvent::AwaitingResponseHeaders => Some(LoadState::AwaitingResponseHeaders),
            TransferEvent::ResponseHeaders(_) | TransferEvent::Data(_) => {
                Some(LoadState::ReceivingBody)
            }
            TransferEvent::Completed { .. } => Some(LoadState::Completed),
            TransferEvent::Failed(_) => Some(LoadState::Failed),
            TransferEvent::Connected { .. } | TransferEvent::Debug(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Completed { .. } | TransferEvent::Failed(_)
        )
    }
}

/// Sending half handed to each transfer.
#[derive(Debug, Clone)]
pub struct EventSink {
    id: HandleId,
    tx: mpsc::UnboundedSender<(HandleId, TransferEvent)>,
}

impl EventSink {
    pub fn new(id: HandleId, tx: mpsc::UnboundedSender<(HandleId, TransferEvent)>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn emit(&self, event: TransferEvent) {
        // A closed channel means the backend is gone; nobody is listening.
        let _ = self.tx.send((self.id, event));
    }

    pub fn debug(&self, line: impl Into<String>) {
        self.emit(TransferEvent::Debug(line.into()));
    }
}

/// Receiving half owned by a backend.
pub type EventQueue = mpsc::UnboundedReceiver<(HandleId, TransferEvent)>;

/// Creates a connected sink factory and queue.
pub fn channel() -> (mpsc::UnboundedSender<(HandleId, TransferEvent)>, EventQueue) {
    mpsc::unbounded_channel()
}

/// Drains every event currently queued without waiting.
pub fn drain(queue: &mut EventQueue, out: &mut Vec<(HandleId, TransferEvent)>) {
    while let Ok(item) = queue.try_recv() {
        out.push(item);
    }
}
