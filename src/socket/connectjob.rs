use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::dns::{parse_ip_literal, resolve_host, with_port, HostOverride, Resolve};
use crate::engine::event::{EventSink, TransferEvent};
use crate::http::conn::ConnectionMeta;
use crate::socket::client::SocketType;
use crate::socket::pool::{BindTarget, ConnectionIdentity};
use crate::socket::proxy::{parse_connect_status, ProxySettings};
use crate::socket::tls::TlsSettings;
use crate::tls::PinSet;
use boring::ssl::SslConnector;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use url::Url;

/// Largest proxy reply head accepted for CONNECT.
const MAX_CONNECT_REPLY: usize = 8192;

/// A transport ready for HTTP.
#[derive(Debug)]
pub struct Connected {
    pub socket: SocketType,
    pub meta: ConnectionMeta,
    /// ALPN selected `h2`.
    pub h2: bool,
}

/// Opens a connection for one request: DNS -> TCP -> proxy tunnel -> TLS.
/// Roughly equivalent to net::ConnectJob.
///
/// Progress is reported through the request's event sink as it happens.
pub struct ConnectJob {
    pub url: Url,
    pub identity: ConnectionIdentity,
    /// Override snapshot for the host being connected to.
    pub dns_override: Option<HostOverride>,
    pub resolver: Arc<dyn Resolve>,
    /// Connector matching `identity.tls`, shared through the client's cache.
    pub connector: Option<SslConnector>,
    pub pins: Option<PinSet>,
}

impl ConnectJob {
    fn target(&self) -> Result<(&str, u16), NetError> {
        let host = self.url.host_str().ok_or(NetError::InvalidUrl)?;
        let port = self.url.port_or_known_default().ok_or(NetError::InvalidUrl)?;
        Ok((host, port))
    }

    /// Host and port the socket is opened to.
    fn next_hop(&self) -> Result<(&str, u16), NetError> {
        match &self.identity.proxy {
            Some(proxy) => proxy.host_port().ok_or(NetError::InvalidUrl),
            None => self.target(),
        }
    }

    pub async fn connect(self, sink: &EventSink) -> Result<Connected, NetError> {
        let (host, port) = self.next_hop()?;
        let connect_host = host.to_string();

        let (stream, peer) = match &self.identity.bindto {
            #[cfg(unix)]
            Some(BindTarget::Unix(path)) => {
                sink.emit(TransferEvent::Connecting { addr: None });
                sink.debug(format!("* Trying {}...", path.display()));
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .connection_context(&connect_host, port)?;
                (SocketType::Unix(stream), None)
            }
            bind => {
                let local = match bind {
                    Some(BindTarget::Addr(addr)) => Some(*addr),
                    _ => None,
                };
                let addrs = self.resolve(sink, &connect_host, port).await?;
                let stream = Self::connect_any(sink, &connect_host, port, &addrs, local).await?;
                let peer = stream.peer_addr().ok();
                (SocketType::Tcp(stream), peer)
            }
        };

        let mut socket = stream;
        let (target_host, target_port) = self.target()?;
        if let Some(proxy) = &self.identity.proxy {
            if self.url.scheme() == "https" {
                socket = Self::tunnel(sink, proxy, socket, target_host, target_port).await?;
            }
        }

        let socket = match (&self.identity.tls, &self.connector) {
            (Some(settings), Some(connector)) => {
                sink.emit(TransferEvent::TlsHandshaking);
                Self::handshake(connector, settings, socket, target_host).await?
            }
            (Some(_), None) => return Err(NetError::SslProtocolError),
            (None, _) => socket,
        };

        let chain = socket.peer_chain();
        if let Some(pins) = self.pins.as_ref().filter(|p| !p.is_empty()) {
            let leaf = chain.first().ok_or(NetError::SslPinnedKeyNotInCertChain)?;
            pins.verify_leaf(leaf, self.url.as_str())?;
        }

        let h2 = socket.negotiated_alpn().as_deref() == Some(b"h2".as_slice());
        if let Some(settings) = &self.identity.tls {
            sink.debug(format!(
                "* ALPN: server accepted {}",
                if h2 { "h2" } else { "http/1.1" }
            ));
            if settings.alpn == crate::socket::tls::AlpnPolicy::Http2Only && !h2 {
                return Err(NetError::AlpnNegotiationFailed);
            }
        }

        // Unix sockets have no peer address and never consult DNS.
        let via_override = peer.and(self.dns_override.map(|entry| entry.ip()));
        let meta = ConnectionMeta::new(self.identity.clone(), &connect_host, peer, chain)
            .with_dns_override(via_override);
        Ok(Connected { socket, meta, h2 })
    }

    async fn resolve(
        &self,
        sink: &EventSink,
        host: &str,
        port: u16,
    ) -> Result<Vec<SocketAddr>, NetError> {
        if let Some(ip) = parse_ip_literal(host) {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        sink.emit(TransferEvent::Resolving);
        if let Some(entry) = &self.dns_override {
            sink.debug(format!("* Added {}:{}:{} to DNS cache", host, port, entry.ip()));
        }
        let ips = resolve_host(host, self.dns_override, self.resolver.clone()).await?;
        Ok(with_port(ips, port))
    }

    async fn connect_any(
        sink: &EventSink,
        host: &str,
        port: u16,
        addrs: &[SocketAddr],
        local: Option<SocketAddr>,
    ) -> Result<TcpStream, NetError> {
        let mut last_err = None;
        for addr in addrs {
            sink.emit(TransferEvent::Connecting { addr: Some(*addr) });
            sink.debug(format!("* Trying {}...", addr));
            match Self::connect_one(*addr, local).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    sink.debug(format!("* Connected to {} ({}) port {}", host, addr.ip(), port));
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                    sink.debug(format!("* connect to {} failed: {}", addr, e));
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => NetError::connection_failed_to(host, port, e),
            None => NetError::dns_failed(host, "no addresses"),
        })
    }

    async fn connect_one(addr: SocketAddr, local: Option<SocketAddr>) -> std::io::Result<TcpStream> {
        let Some(local) = local else {
            return TcpStream::connect(addr).await;
        };
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(local)?;
        socket.connect(addr).await
    }

    /// Opens a CONNECT tunnel through `proxy`.
    async fn tunnel(
        sink: &EventSink,
        proxy: &ProxySettings,
        mut socket: SocketType,
        host: &str,
        port: u16,
    ) -> Result<SocketType, NetError> {
        let proxy_name = proxy.url.as_str().to_string();
        sink.debug(format!("* Establish HTTP proxy tunnel to {}:{}", host, port));
        socket
            .write_all(proxy.connect_request(host, port).as_bytes())
            .await
            .proxy_context(&proxy_name)?;

        // Read byte by byte so nothing past the reply head is consumed.
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = socket.read(&mut byte).await.proxy_context(&proxy_name)?;
            if n == 0 || head.len() >= MAX_CONNECT_REPLY {
                return Err(NetError::ProxyFailed {
                    proxy: proxy_name,
                    reason: "incomplete reply to CONNECT".into(),
                });
            }
            head.push(byte[0]);
        }

        match parse_connect_status(&head) {
            Some(200) => {
                sink.debug("* CONNECT tunnel established, response 200");
                Ok(socket)
            }
            Some(status) => Err(NetError::ProxyFailed {
                proxy: proxy_name,
                reason: format!("CONNECT answered with status {status}"),
            }),
            None => Err(NetError::TunnelConnectionFailed),
        }
    }

    async fn handshake(
        connector: &SslConnector,
        settings: &TlsSettings,
        socket: SocketType,
        host: &str,
    ) -> Result<SocketType, NetError> {
        let mut config = connector.configure().map_err(|_| NetError::SslProtocolError)?;
        config.set_verify_hostname(settings.verify_host);
        config.set_use_server_name_indication(TlsSettings::should_set_sni(host));

        let stream = tokio_boring::connect(config, host, socket)
            .await
            .map_err(|e| NetError::TlsHandshakeFailed {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        Ok(SocketType::Ssl(Box::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::GaiResolver;
    use crate::engine::event::{self, TransferEvent};
    use crate::engine::HandleId;
    use tokio::net::TcpListener;

    fn job(url: &str, identity: ConnectionIdentity) -> ConnectJob {
        ConnectJob {
            url: Url::parse(url).unwrap(),
            identity,
            dns_override: None,
            resolver: Arc::new(GaiResolver::new()),
            connector: None,
            pins: None,
        }
    }

    #[tokio::test]
    async fn test_ip_literal_skips_resolving() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = event::channel();
        let sink = EventSink::new(HandleId::from_raw(1), tx);

        let connected = job(&format!("http://127.0.0.1:{port}/"), ConnectionIdentity::default())
            .connect(&sink)
            .await
            .unwrap();
        assert!(!connected.h2);
        assert_eq!(connected.meta.connect_host, "127.0.0.1");
        assert_eq!(connected.meta.peer.unwrap().port(), port);

        let mut events = Vec::new();
        event::drain(&mut rx, &mut events);
        assert!(!events.iter().any(|(_, e)| matches!(e, TransferEvent::Resolving)));
        assert!(matches!(events[0].1, TransferEvent::Connecting { addr: Some(_) }));
    }

    #[tokio::test]
    async fn test_override_answers_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, _rx) = event::channel();
        let sink = EventSink::new(HandleId::from_raw(1), tx);

        let mut job = job(&format!("http://pinned.invalid:{port}/"), ConnectionIdentity::default());
        job.dns_override = Some(HostOverride::new("127.0.0.1".parse().unwrap()));
        let connected = job.connect(&sink).await.unwrap();
        assert_eq!(connected.meta.connect_host, "pinned.invalid");
    }

    #[tokio::test]
    async fn test_refused_names_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let (tx, _rx) = event::channel();
        let sink = EventSink::new(HandleId::from_raw(1), tx);

        let err = job(&format!("http://127.0.0.1:{port}/"), ConnectionIdentity::default())
            .connect(&sink)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::ConnectionFailedTo { port: p, .. } if p == port));
    }

    #[tokio::test]
    async fn test_connect_tunnel_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = s.read(&mut buf).await;
            s.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });
        let (tx, _rx) = event::channel();
        let sink = EventSink::new(HandleId::from_raw(1), tx);

        let identity = ConnectionIdentity {
            proxy: Some(ProxySettings::parse(&format!("http://{addr}")).unwrap()),
            ..ConnectionIdentity::default()
        };
        let err = job("https://example.com/", identity).connect(&sink).await.unwrap_err();
        assert!(err.to_string().contains("407"));
    }
}
