use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`NetError`].
///
/// Every failure attached to a request's terminal state falls into exactly one
/// of these buckets. Push rejections never surface here; they are logged and
/// answered with a deny verdict instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Host could not be resolved, neither by override nor by the resolver.
    Resolution,
    /// Refused, reset or otherwise failed TCP/unix connection, proxy tunnel.
    Connection,
    /// Handshake failure, untrusted chain or pinned key mismatch.
    Tls,
    /// Malformed or prematurely closed HTTP exchange.
    Protocol,
    /// Idle timeout or maximum duration exceeded.
    Timeout,
    /// Request was canceled by its owner or aborted by its progress callback.
    Canceled,
    /// Structurally invalid request options or client misuse.
    InvalidArgument,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum NetError {
    // Generic
    #[error("Generic failure")]
    Failed,
    #[error("Request canceled")]
    Canceled,
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Operation timed out")]
    TimedOut,

    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("Address invalid")]
    AddressInvalid,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Tunnel connection failed")]
    TunnelConnectionFailed,
    #[error("Bad SSL client auth cert")]
    BadSslClientAuthCert,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("ALPN negotiation failed")]
    AlpnNegotiationFailed,
    #[error("Proxy connection failed")]
    ProxyConnectionFailed,
    #[error("Address in use")]
    AddressInUse,
    #[error("SSL pinned key not in cert chain")]
    SslPinnedKeyNotInCertChain,

    // Certificate Errors
    #[error("Certificate common name invalid")]
    CertCommonNameInvalid,
    #[error("Certificate authority invalid")]
    CertAuthorityInvalid,
    #[error("Certificate invalid")]
    CertInvalid,

    // HTTP Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Disallowed URL scheme")]
    DisallowedUrlScheme,
    #[error("Unknown URL scheme")]
    UnknownUrlScheme,
    #[error("Invalid response")]
    InvalidResponse,
    #[error("Method not supported")]
    MethodNotSupported,
    #[error("Empty response")]
    EmptyResponse,
    #[error("HTTP/2 protocol error")]
    Http2ProtocolError,
    #[error("Content-Length mismatch")]
    ContentLengthMismatch,
    #[error("Invalid HTTP response")]
    InvalidHttpResponse,
    #[error("HTTP/2 pushed stream not available")]
    Http2PushedStreamNotAvailable,
    #[error("HTTP/2 stream closed")]
    Http2StreamClosed,
    #[error("HTTP/2 pushed response does not match")]
    Http2PushedResponseDoesNotMatch,

    // Context-rich variants
    #[error("Connection to {host}:{port} failed: {reason}")]
    ConnectionFailedTo {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("Could not resolve host \"{domain}\": {reason}")]
    NameNotResolvedFor { domain: String, reason: String },
    #[error("Proxy {proxy} failed: {reason}")]
    ProxyFailed { proxy: String, reason: String },
    #[error("TLS handshake with {host} failed: {reason}")]
    TlsHandshakeFailed { host: String, reason: String },
    #[error("SSL public key does not match pinned public key for \"{url}\"")]
    PinMismatch { url: String },
    #[error("Invalid \"{option}\" option: {reason}")]
    InvalidOption { option: String, reason: String },
    #[error("{phase} timeout reached after {elapsed:?} for \"{url}\"")]
    Timeout {
        url: String,
        phase: &'static str,
        elapsed: Duration,
    },
    #[error("Transfer for \"{url}\" failed: {reason}")]
    Transfer { url: String, reason: String },
    #[error("Transfer for \"{url}\" aborted by progress callback: {reason}")]
    AbortedByCallback { url: String, reason: String },
    #[error("Client cannot be used while it is processing streams")]
    ReentrantUse,
    #[error("{backend} backend unavailable: {reason}")]
    BackendUnavailable {
        backend: &'static str,
        reason: String,
    },

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    /// Build a [`NetError::ConnectionFailedTo`] from any displayable cause.
    pub fn connection_failed_to(host: &str, port: u16, cause: impl std::fmt::Display) -> Self {
        NetError::ConnectionFailedTo {
            host: host.to_string(),
            port,
            reason: cause.to_string(),
        }
    }

    /// Build a [`NetError::NameNotResolvedFor`] from any displayable cause.
    pub fn dns_failed(domain: &str, cause: impl std::fmt::Display) -> Self {
        NetError::NameNotResolvedFor {
            domain: domain.to_string(),
            reason: cause.to_string(),
        }
    }

    pub fn invalid_option(option: &str, reason: impl Into<String>) -> Self {
        NetError::InvalidOption {
            option: option.to_string(),
            reason: reason.into(),
        }
    }

    pub fn transfer(url: &str, cause: impl std::fmt::Display) -> Self {
        NetError::Transfer {
            url: url.to_string(),
            reason: cause.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::NameNotResolved | NetError::NameNotResolvedFor { .. } => {
                ErrorKind::Resolution
            }

            NetError::SslProtocolError
            | NetError::BadSslClientAuthCert
            | NetError::AlpnNegotiationFailed
            | NetError::SslPinnedKeyNotInCertChain
            | NetError::CertCommonNameInvalid
            | NetError::CertAuthorityInvalid
            | NetError::CertInvalid
            | NetError::TlsHandshakeFailed { .. }
            | NetError::PinMismatch { .. } => ErrorKind::Tls,

            NetError::InvalidResponse
            | NetError::EmptyResponse
            | NetError::Http2ProtocolError
            | NetError::ContentLengthMismatch
            | NetError::InvalidHttpResponse
            | NetError::Http2PushedStreamNotAvailable
            | NetError::Http2StreamClosed
            | NetError::Http2PushedResponseDoesNotMatch
            | NetError::Transfer { .. } => ErrorKind::Protocol,

            NetError::TimedOut | NetError::ConnectionTimedOut | NetError::Timeout { .. } => {
                ErrorKind::Timeout
            }

            NetError::Canceled | NetError::AbortedByCallback { .. } => ErrorKind::Canceled,

            NetError::InvalidArgument
            | NetError::InvalidUrl
            | NetError::DisallowedUrlScheme
            | NetError::UnknownUrlScheme
            | NetError::MethodNotSupported
            | NetError::InvalidOption { .. }
            | NetError::ReentrantUse
            | NetError::BackendUnavailable { .. } => ErrorKind::InvalidArgument,

            NetError::Failed
            | NetError::ConnectionClosed
            | NetError::ConnectionReset
            | NetError::ConnectionRefused
            | NetError::ConnectionAborted
            | NetError::ConnectionFailed
            | NetError::AddressInvalid
            | NetError::AddressUnreachable
            | NetError::TunnelConnectionFailed
            | NetError::ProxyConnectionFailed
            | NetError::AddressInUse
            | NetError::ConnectionFailedTo { .. }
            | NetError::ProxyFailed { .. }
            | NetError::Unknown(_) => ErrorKind::Connection,
        }
    }

    /// True for the dedicated cancellation marker, not for other failures.
    pub fn is_canceled(&self) -> bool {
        matches!(self, NetError::Canceled)
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Failed => -2,
            NetError::Canceled => -3,
            NetError::InvalidArgument => -4,
            NetError::TimedOut => -7,

            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::NameNotResolved => -105,
            NetError::SslProtocolError => -107,
            NetError::AddressInvalid => -108,
            NetError::AddressUnreachable => -109,
            NetError::TunnelConnectionFailed => -111,
            NetError::BadSslClientAuthCert => -117,
            NetError::ConnectionTimedOut => -118,
            NetError::AlpnNegotiationFailed => -122,
            NetError::ProxyConnectionFailed => -130,
            NetError::AddressInUse => -147,
            NetError::SslPinnedKeyNotInCertChain => -150,

            NetError::CertCommonNameInvalid => -200,
            NetError::CertAuthorityInvalid => -202,
            NetError::CertInvalid => -207,

            NetError::InvalidUrl => -300,
            NetError::DisallowedUrlScheme => -301,
            NetError::UnknownUrlScheme => -302,
            NetError::InvalidResponse => -320,
            NetError::MethodNotSupported => -322,
            NetError::EmptyResponse => -324,
            NetError::Http2ProtocolError => -337,
            NetError::ContentLengthMismatch => -354,
            NetError::InvalidHttpResponse => -370,
            NetError::Http2PushedStreamNotAvailable => -373,
            NetError::Http2StreamClosed => -376,
            NetError::Http2PushedResponseDoesNotMatch => -378,

            NetError::ConnectionFailedTo { .. } => -104,
            NetError::NameNotResolvedFor { .. } => -105,
            NetError::ProxyFailed { .. } => -130,
            NetError::TlsHandshakeFailed { .. } => -107,
            NetError::PinMismatch { .. } => -150,
            NetError::InvalidOption { .. } => -4,
            NetError::Timeout { .. } => -7,
            NetError::Transfer { .. } => -320,
            NetError::AbortedByCallback { .. } => -3,

            // Custom codes, outside Chromium's assigned ranges.
            NetError::ReentrantUse => -10001,
            NetError::BackendUnavailable { .. } => -10002,

            NetError::Unknown(code) => *code,
        }
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -2 => NetError::Failed,
            -3 => NetError::Canceled,
            -4 => NetError::InvalidArgument,
            -7 => NetError::TimedOut,

            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -107 => NetError::SslProtocolError,
            -108 => NetError::AddressInvalid,
            -109 => NetError::AddressUnreachable,
            -111 => NetError::TunnelConnectionFailed,
            -117 => NetError::BadSslClientAuthCert,
            -118 => NetError::ConnectionTimedOut,
            -122 => NetError::AlpnNegotiationFailed,
            -130 => NetError::ProxyConnectionFailed,
            -147 => NetError::AddressInUse,
            -150 => NetError::SslPinnedKeyNotInCertChain,

            -200 => NetError::CertCommonNameInvalid,
            -202 => NetError::CertAuthorityInvalid,
            -207 => NetError::CertInvalid,

            -300 => NetError::InvalidUrl,
            -301 => NetError::DisallowedUrlScheme,
            -302 => NetError::UnknownUrlScheme,
            -320 => NetError::InvalidResponse,
            -322 => NetError::MethodNotSupported,
            -324 => NetError::EmptyResponse,
            -337 => NetError::Http2ProtocolError,
            -354 => NetError::ContentLengthMismatch,
            -370 => NetError::InvalidHttpResponse,
            -373 => NetError::Http2PushedStreamNotAvailable,
            -376 => NetError::Http2StreamClosed,
            -378 => NetError::Http2PushedResponseDoesNotMatch,

            -10001 => NetError::ReentrantUse,
            _ => NetError::Unknown(code),
        }
    }
}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::ConnectionRefused => NetError::ConnectionRefused,
            Io::ConnectionReset => NetError::ConnectionReset,
            Io::ConnectionAborted => NetError::ConnectionAborted,
            Io::AddrInUse => NetError::AddressInUse,
            Io::AddrNotAvailable => NetError::AddressInvalid,
            Io::TimedOut => NetError::ConnectionTimedOut,
            Io::UnexpectedEof => NetError::ConnectionClosed,
            _ => NetError::ConnectionFailed,
        }
    }
}
