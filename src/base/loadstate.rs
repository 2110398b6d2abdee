/// The lifecycle state of one in-flight request.
///
/// States advance in declaration order. A transfer may skip states (a reused
/// connection never resolves or connects) but never moves backwards, and
/// `Failed`/`Canceled` are reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LoadState {
    /// Registered, waiting for a connection slot.
    #[default]
    Created,

    /// Resolving the host (override cache or resolver).
    Resolving,

    /// Connecting to the host (TCP handshake, proxy tunnel).
    Connecting,

    /// Establishing a TLS session.
    TlsHandshaking,

    /// Writing the request line and headers.
    SendingHeaders,

    /// Uploading the request body.
    SendingBody,

    /// Waiting for the server response (TTFB).
    AwaitingResponseHeaders,

    /// Reading the response body.
    ReceivingBody,

    Completed,

    Failed,

    Canceled,
}

impl LoadState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoadState::Completed | LoadState::Failed | LoadState::Canceled
        )
    }

    /// Whether a transfer in `self` may legally move to `next`.
    pub fn can_advance_to(self, next: LoadState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            LoadState::Failed | LoadState::Canceled => true,
            _ => next > self,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoadState::Created => "created",
            LoadState::Resolving => "resolving",
            LoadState::Connecting => "connecting",
            LoadState::TlsHandshaking => "tls-handshaking",
            LoadState::SendingHeaders => "sending-headers",
            LoadState::SendingBody => "sending-body",
            LoadState::AwaitingResponseHeaders => "awaiting-response-headers",
            LoadState::ReceivingBody => "receiving-body",
            LoadState::Completed => "completed",
            LoadState::Failed => "failed",
            LoadState::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
