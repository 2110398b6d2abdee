//! Transfer futures.
//!
//! A transfer carries one request from connection setup to its terminal
//! event. It reports every step through its [`EventSink`] and never touches
//! client state directly, so any backend can drive it.

use crate::base::neterror::NetError;
use crate::engine::event::{EventSink, TransferEvent};
use crate::engine::LocalTransfer;
use crate::http::conn::{ConnectionMeta, Http1Connection, Http2Connection};
use crate::http::push::PushBuffer;
use crate::http::request::PreparedRequest;
use crate::http::response::ResponseHead;
use crate::socket::client::SocketType;
use crate::socket::connectjob::ConnectJob;
use bytes::Bytes;
use http::header::{HeaderValue, HOST, PROXY_AUTHORIZATION};
use http::{Request, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};

/// How the transfer gets its connection.
#[derive(Debug)]
pub enum Lease {
    /// Open a new one.
    Fresh(ConnectJobSlot),
    /// Reuse an idle HTTP/1.1 connection.
    Idle(Http1Connection),
    /// Multiplex on a shared HTTP/2 connection.
    Shared(Http2Connection),
}

/// Wrapper so a lease can be printed without the resolver and connector.
pub struct ConnectJobSlot(pub ConnectJob);

impl std::fmt::Debug for ConnectJobSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectJob").field("url", &self.0.url.as_str()).finish()
    }
}

/// Builds the future of a network transfer.
pub fn network(request: PreparedRequest, lease: Lease, sink: EventSink) -> LocalTransfer {
    Box::pin(async move {
        let url = request.url.to_string();
        match run(request, lease, &sink).await {
            Ok(connection) => sink.emit(TransferEvent::Completed { connection }),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "transfer failed");
                sink.emit(TransferEvent::Failed(e));
            }
        }
    })
}

/// Builds the future replaying a consumed push. Connection states are skipped.
pub fn pushed(buffer: PushBuffer, sink: EventSink) -> LocalTransfer {
    Box::pin(async move {
        let mut head_sent = false;
        loop {
            let (head, chunks, outcome) = buffer.with(|p| {
                let head = if head_sent { None } else { p.head.clone() };
                let chunks: Vec<Bytes> = if head_sent || head.is_some() {
                    p.chunks.drain(..).collect()
                } else {
                    Vec::new()
                };
                (head, chunks, p.outcome.clone())
            });

            if let Some(head) = head {
                sink.emit(TransferEvent::ResponseHeaders(head));
                head_sent = true;
            }
            for chunk in chunks {
                sink.emit(TransferEvent::Data(chunk));
            }
            match outcome {
                Some(Ok(())) if head_sent => {
                    sink.emit(TransferEvent::Completed { connection: None });
                    return;
                }
                Some(Ok(())) => {
                    sink.emit(TransferEvent::Failed(NetError::EmptyResponse));
                    return;
                }
                Some(Err(e)) => {
                    sink.emit(TransferEvent::Failed(e));
                    return;
                }
                None => buffer.changed().await,
            }
        }
    })
}

async fn run(
    request: PreparedRequest,
    lease: Lease,
    sink: &EventSink,
) -> Result<Option<Http1Connection>, NetError> {
    match lease {
        Lease::Fresh(ConnectJobSlot(job)) => {
            let connected = job.connect(sink).await?;
            if connected.h2 {
                let conn = start_h2(connected.socket, connected.meta, &request).await?;
                sink.emit(TransferEvent::Connected {
                    meta: conn.meta.clone(),
                    shared: Some(conn.clone()),
                });
                exchange_h2(&request, conn, sink).await?;
                Ok(None)
            } else {
                sink.emit(TransferEvent::Connected {
                    meta: connected.meta.clone(),
                    shared: None,
                });
                exchange_h1(&request, connected.socket, connected.meta, sink).await
            }
        }
        Lease::Idle(conn) => {
            verify_reused(&request, &conn.meta)?;
            sink.debug(format!("* Re-using existing connection #{}", conn.meta.id));
            sink.emit(TransferEvent::Connected {
                meta: conn.meta.clone(),
                shared: None,
            });
            exchange_h1(&request, conn.socket, conn.meta, sink).await
        }
        Lease::Shared(conn) => {
            verify_reused(&request, &conn.meta)?;
            sink.debug(format!("* Multiplexed on connection #{}", conn.meta.id));
            sink.emit(TransferEvent::Connected {
                meta: conn.meta.clone(),
                shared: None,
            });
            exchange_h2(&request, conn, sink).await?;
            Ok(None)
        }
    }
}

/// Pins also apply to a connection opened for another request.
fn verify_reused(request: &PreparedRequest, meta: &ConnectionMeta) -> Result<(), NetError> {
    let Some(pins) = request.pins.as_ref().filter(|p| !p.is_empty()) else {
        return Ok(());
    };
    let leaf = meta
        .peer_chain
        .first()
        .ok_or(NetError::SslPinnedKeyNotInCertChain)?;
    pins.verify_leaf(leaf, request.url.as_str())
}

async fn start_h2(
    socket: SocketType,
    meta: ConnectionMeta,
    request: &PreparedRequest,
) -> Result<Http2Connection, NetError> {
    let (sender, connection) = http2::handshake(TokioExecutor::new(), TokioIo::new(socket))
        .await
        .map_err(|e| NetError::transfer(request.url.as_str(), e))?;
    let connection_id = meta.id;
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(connection = connection_id, error = %e, "h2 connection closed");
        }
    });
    Ok(Http2Connection::new(sender, meta, driver.abort_handle()))
}

fn build_request(request: &PreparedRequest, h2: bool) -> Result<Request<Full<Bytes>>, NetError> {
    let absolute = h2 || (request.identity.proxy.is_some() && !request.is_https());
    let target = if absolute {
        request.url.as_str().to_string()
    } else {
        let mut target = request.url.path().to_string();
        if let Some(query) = request.url.query() {
            target.push('?');
            target.push_str(query);
        }
        target
    };

    let mut builder = Request::builder()
        .method(request.method.clone())
        .uri(target)
        .version(if h2 { Version::HTTP_2 } else { Version::HTTP_11 });

    let headers = builder.headers_mut().ok_or(NetError::InvalidUrl)?;
    headers.extend(request.headers.clone());
    if !h2 && !headers.contains_key(HOST) {
        let host = match request.url.port() {
            Some(port) => format!("{}:{}", request.host(), port),
            None => request.host().to_string(),
        };
        let value = HeaderValue::from_str(&host).map_err(|_| NetError::InvalidUrl)?;
        headers.insert(HOST, value);
    }
    if h2 {
        headers.remove(HOST);
    }
    if absolute && !h2 {
        if let Some(auth) = request.identity.proxy.as_ref().and_then(|p| p.get_auth_header()) {
            if let Ok(value) = HeaderValue::from_str(&auth) {
                headers.insert(PROXY_AUTHORIZATION, value);
            }
        }
    }

    builder
        .body(Full::new(request.body.clone()))
        .map_err(|e| NetError::transfer(request.url.as_str(), e))
}

fn trace_request(sink: &EventSink, req: &Request<Full<Bytes>>, body_len: usize) {
    let version = if req.version() == Version::HTTP_2 { "HTTP/2" } else { "HTTP/1.1" };
    let target = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    sink.emit(TransferEvent::SendingHeaders);
    sink.debug(format!("> {} {} {}", req.method(), target, version));
    for (name, value) in req.headers() {
        if name == PROXY_AUTHORIZATION {
            continue;
        }
        sink.debug(format!("> {}: {}", name, value.to_str().unwrap_or("<binary>")));
    }
    if body_len > 0 {
        sink.emit(TransferEvent::SendingBody {
            bytes: body_len as u64,
        });
    }
    sink.emit(TransferEvent::AwaitingResponseHeaders);
}

/// Streams the response body into events.
async fn receive(
    request: &PreparedRequest,
    response: http::Response<Incoming>,
    sink: &EventSink,
) -> Result<(), NetError> {
    let (parts, mut body) = response.into_parts();
    sink.emit(TransferEvent::ResponseHeaders(ResponseHead::from_parts(&parts)));

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| NetError::transfer(request.url.as_str(), e))?;
        if let Ok(data) = frame.into_data() {
            if !data.is_empty() {
                sink.emit(TransferEvent::Data(data));
            }
        }
    }
    Ok(())
}

async fn exchange_h2(
    request: &PreparedRequest,
    conn: Http2Connection,
    sink: &EventSink,
) -> Result<(), NetError> {
    let mut sender = conn.sender.clone();
    let req = build_request(request, true)?;
    trace_request(sink, &req, request.body.len());

    sender
        .ready()
        .await
        .map_err(|e| NetError::transfer(request.url.as_str(), e))?;
    let response = sender
        .send_request(req)
        .await
        .map_err(|e| NetError::transfer(request.url.as_str(), e))?;
    receive(request, response, sink).await
}

/// Runs one HTTP/1.1 exchange. Hands the socket back when it can carry
/// another request.
async fn exchange_h1(
    request: &PreparedRequest,
    socket: SocketType,
    meta: ConnectionMeta,
    sink: &EventSink,
) -> Result<Option<Http1Connection>, NetError> {
    let (mut sender, connection) = http1::handshake(TokioIo::new(socket))
        .await
        .map_err(|e| NetError::transfer(request.url.as_str(), e))?;
    let req = build_request(request, false)?;
    trace_request(sink, &req, request.body.len());

    let exchange = async move {
        let response = sender
            .send_request(req)
            .await
            .map_err(|e| NetError::transfer(request.url.as_str(), e))?;
        let keep_alive = !response
            .headers()
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("close"));
        receive(request, response, sink).await?;
        // Dropping the sender lets the connection future hand the IO back.
        drop(sender);
        Ok::<bool, NetError>(keep_alive)
    };

    let (outcome, parts) = futures::future::join(exchange, connection.without_shutdown()).await;
    let keep_alive = outcome?;

    let reusable = match parts {
        Ok(parts) if keep_alive && parts.read_buf.is_empty() => Some(Http1Connection {
            socket: parts.io.into_inner(),
            meta,
        }),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(connection = meta.id, error = %e, "connection not reusable");
            None
        }
    };
    Ok(reusable)
}
