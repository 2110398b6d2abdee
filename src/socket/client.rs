use std::io::ErrorKind;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Represents a connected socket (TCP, unix or TLS over either).
/// Mimics net::StreamSocket.
#[derive(Debug)]
pub enum SocketType {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    Ssl(Box<tokio_boring::SslStream<SocketType>>),
}

impl SocketType {
    /// Non-blocking liveness probe of an idle socket.
    ///
    /// A keep-alive socket with unread data is not reusable either: the bytes
    /// belong to no request.
    fn probe(peer_ok: bool, read: std::io::Result<usize>) -> bool {
        if !peer_ok {
            return false;
        }
        match read {
            Ok(_) => false, // EOF or unexpected data
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    /// Returns true if the socket is still connected and has no pending data.
    /// Matches Chromium's IsConnectedAndIdle().
    pub fn is_connected_and_idle(&self) -> bool {
        let mut buf = [0u8; 1];
        match self {
            SocketType::Tcp(s) => Self::probe(s.peer_addr().is_ok(), s.try_read(&mut buf)),
            #[cfg(unix)]
            SocketType::Unix(s) => Self::probe(s.peer_addr().is_ok(), s.try_read(&mut buf)),
            // Buffered TLS records would be invisible to the raw probe.
            SocketType::Ssl(s) => s.ssl().pending() == 0 && s.get_ref().is_connected_and_idle(),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            SocketType::Tcp(s) => s.peer_addr().ok(),
            #[cfg(unix)]
            SocketType::Unix(_) => None,
            SocketType::Ssl(s) => s.get_ref().peer_addr(),
        }
    }

    /// ALPN protocol negotiated during the TLS handshake, if any.
    pub fn negotiated_alpn(&self) -> Option<Vec<u8>> {
        match self {
            SocketType::Ssl(s) => s.ssl().selected_alpn_protocol().map(<[u8]>::to_vec),
            _ => None,
        }
    }

    /// DER-encoded peer certificates, leaf first. Empty for plain sockets.
    pub fn peer_chain(&self) -> Vec<Vec<u8>> {
        let SocketType::Ssl(s) = self else {
            return Vec::new();
        };
        let ssl = s.ssl();
        let mut chain = Vec::new();
        let leaf = ssl.peer_certificate().and_then(|c| c.to_der().ok());
        if let Some(leaf) = leaf {
            chain.push(leaf);
        }
        if let Some(stack) = ssl.peer_cert_chain() {
            for cert in stack {
                if let Ok(der) = cert.to_der() {
                    if chain.first() != Some(&der) {
                        chain.push(der);
                    }
                }
            }
        }
        chain
    }
}

impl AsyncRead for SocketType {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            SocketType::Unix(s) => Pin::new(s).poll_read(cx, buf),
            SocketType::Ssl(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketType {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            SocketType::Unix(s) => Pin::new(s).poll_write(cx, buf),
            SocketType::Ssl(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            SocketType::Unix(s) => Pin::new(s).poll_flush(cx),
            SocketType::Ssl(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            SocketType::Unix(s) => Pin::new(s).poll_shutdown(cx),
            SocketType::Ssl(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
