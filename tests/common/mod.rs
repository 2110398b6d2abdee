//! In-process servers for integration tests.
#![allow(dead_code)]

use boring::asn1::Asn1Time;
use boring::bn::BigNum;
use boring::ec::{EcGroup, EcKey};
use boring::hash::MessageDigest;
use boring::nid::Nid;
use boring::pkey::{PKey, Private};
use boring::ssl::{SslAcceptor, SslMethod};
use boring::x509::{X509NameBuilder, X509};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use muxnet::engine::BackendKind;
use std::time::Duration;

/// Every backend a client can run on; callers see the same behavior.
pub const BACKENDS: [BackendKind; 2] = [BackendKind::Multi, BackendKind::Reactor];

/// What a server saw.
#[derive(Default)]
pub struct Stats {
    pub connections: AtomicUsize,
    pub requests: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub request_lines: Mutex<Vec<String>>,
}

impl Stats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn request_lines(&self) -> Vec<String> {
        self.request_lines.lock().unwrap().clone()
    }
}

#[derive(Clone, Copy)]
enum Mode {
    /// Answer `200 OK` with the request path as body, after `delay`.
    Respond { delay: Duration },
    /// Read requests, never answer.
    Silent,
}

/// HTTP/1.1 keep-alive server on a random local port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub stats: Arc<Stats>,
}

impl TestServer {
    pub fn start() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self::spawn(Mode::Respond { delay }, None)
    }

    pub fn silent() -> Self {
        Self::spawn(Mode::Silent, None)
    }

    fn spawn(mode: Mode, tls: Option<SslAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::default());
        let acceptor = tls.map(Arc::new);

        let server_stats = stats.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                server_stats.connections.fetch_add(1, Ordering::SeqCst);
                let stats = server_stats.clone();
                let acceptor = acceptor.clone();
                thread::spawn(move || match acceptor {
                    Some(acceptor) => {
                        if let Ok(tls) = acceptor.accept(stream) {
                            serve(tls, &stats, mode);
                        }
                    }
                    None => serve(stream, &stats, mode),
                });
            }
        });

        Self { addr, stats }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Pool key of `url(..)` requests.
    pub fn authority(&self) -> String {
        format!("http://127.0.0.1:{}", self.addr.port())
    }
}

/// Reads one request head and body. `None` on EOF or error.
fn read_request<S: Read>(stream: &mut S) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => return None,
        }
    }
    let head = String::from_utf8_lossy(&head).to_string();
    let length = head
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).ok()?;
    Some(head)
}

fn serve<S: Read + Write>(mut stream: S, stats: &Stats, mode: Mode) {
    while let Some(head) = read_request(&mut stream) {
        let line = head.lines().next().unwrap_or_default().to_string();
        stats.requests.fetch_add(1, Ordering::SeqCst);
        stats.request_lines.lock().unwrap().push(line.clone());

        let delay = match mode {
            Mode::Silent => {
                // Hold the connection until the client gives up.
                let mut sink = [0u8; 64];
                while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
                return;
            }
            Mode::Respond { delay } => delay,
        };

        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        thread::sleep(delay);
        stats.in_flight.fetch_sub(1, Ordering::SeqCst);

        let path = line.split(' ').nth(1).unwrap_or("/").to_string();
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
            path.len(),
            path
        );
        if stream.write_all(response.as_bytes()).is_err() || stream.flush().is_err() {
            return;
        }
    }
}

/// TLS variant of [`TestServer`] with a fresh self-signed certificate.
pub struct TlsServer {
    pub server: TestServer,
    pub cert_der: Vec<u8>,
}

impl TlsServer {
    pub fn start() -> Self {
        let (key, cert) = self_signed();
        let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls()).unwrap();
        acceptor.set_private_key(&key).unwrap();
        acceptor.set_certificate(&cert).unwrap();
        acceptor.check_private_key().unwrap();

        let server = TestServer::spawn(
            Mode::Respond {
                delay: Duration::ZERO,
            },
            Some(acceptor.build()),
        );
        Self {
            server,
            cert_der: cert.to_der().unwrap(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("https://{}{}", self.server.addr, path)
    }

    pub fn authority(&self) -> String {
        format!("https://127.0.0.1:{}", self.server.port())
    }

    /// `pin-sha256` value of the server's key.
    pub fn pin(&self) -> String {
        muxnet::tls::encode_pin(&muxnet::tls::spki_hash(&self.cert_der).unwrap())
    }
}

fn self_signed() -> (PKey<Private>, X509) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "localhost").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (key, builder.build())
}

/// A local port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

