//! Request options and their validated form.

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::dns::parse_ip_literal;
use crate::socket::matcher::ProxyMatcher;
use crate::socket::pool::{BindTarget, ConnectionIdentity};
use crate::socket::proxy::{self, ProxySettings};
use crate::socket::tls::{AlpnPolicy, TlsSettings};
use crate::tls::PinSet;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, RANGE};
use http::{HeaderMap, Method};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use url::Url;

/// Request headers that must match before a pushed response is handed out.
pub const PUSH_SENSITIVE_HEADERS: [HeaderName; 4] = [AUTHORIZATION, COOKIE, RANGE, PROXY_AUTHORIZATION];

/// Snapshot passed to a request's progress callback.
#[derive(Debug, Clone)]
pub struct Progress {
    pub url: String,
    pub state: LoadState,
    pub uploaded: u64,
    pub downloaded: u64,
    /// `Content-Length` of the response, once known.
    pub download_total: Option<u64>,
}

/// Called after every batch of events of one request. Returning `Err`
/// aborts the transfer with the given reason.
pub type ProgressCallback = Rc<dyn Fn(&Progress) -> Result<(), String>>;

/// Per-request options. Unset fields fall back to the client's defaults.
#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestOptions {
    /// Extra request headers, in order.
    pub headers: Vec<(String, String)>,
    #[serde(skip)]
    pub body: Bytes,
    /// `http://[user:pass@]host[:port]`; an empty string disables the
    /// environment proxy.
    pub proxy: Option<String>,
    /// Comma-separated bypass list, see [`ProxyMatcher`].
    pub no_proxy: Option<String>,
    /// Host to IP overrides; `None` removes a previous override.
    pub resolve: BTreeMap<String, Option<String>>,
    /// Algorithm to base64 SPKI hashes; only `pin-sha256` is supported.
    pub peer_fingerprint: Option<BTreeMap<String, Vec<String>>>,
    pub capture_peer_cert_chain: Option<bool>,
    /// `IP`, `IP:port`, `[IPv6]:port`, or the path of a unix socket.
    pub bindto: Option<String>,
    pub local_cert: Option<PathBuf>,
    pub local_pk: Option<PathBuf>,
    pub cafile: Option<PathBuf>,
    pub verify_peer: Option<bool>,
    pub verify_host: Option<bool>,
    /// `"1.1"` or `"2"`/`"2.0"`; negotiated when unset.
    pub http_version: Option<String>,
    /// Idle timeout in seconds.
    pub timeout: Option<f64>,
    /// Whole-transfer limit in seconds; `0` means none.
    pub max_duration: Option<f64>,
    #[serde(skip)]
    pub on_progress: Option<ProgressCallback>,
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("proxy", &self.proxy.as_ref().map(|_| "<set>"))
            .field("no_proxy", &self.no_proxy)
            .field("resolve", &self.resolve)
            .field("peer_fingerprint", &self.peer_fingerprint)
            .field("bindto", &self.bindto)
            .field("http_version", &self.http_version)
            .field("timeout", &self.timeout)
            .field("max_duration", &self.max_duration)
            .field("on_progress", &self.on_progress.is_some())
            .finish_non_exhaustive()
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn proxy(mut self, proxy: &str) -> Self {
        self.proxy = Some(proxy.to_string());
        self
    }

    pub fn no_proxy(mut self, rules: &str) -> Self {
        self.no_proxy = Some(rules.to_string());
        self
    }

    pub fn resolve(mut self, host: &str, ip: Option<&str>) -> Self {
        self.resolve.insert(host.to_string(), ip.map(str::to_string));
        self
    }

    pub fn pin_sha256(mut self, pin: &str) -> Self {
        self.peer_fingerprint
            .get_or_insert_with(BTreeMap::new)
            .entry(crate::tls::PIN_SHA256.to_string())
            .or_default()
            .push(pin.to_string());
        self
    }

    pub fn capture_peer_cert_chain(mut self, capture: bool) -> Self {
        self.capture_peer_cert_chain = Some(capture);
        self
    }

    pub fn bindto(mut self, bindto: &str) -> Self {
        self.bindto = Some(bindto.to_string());
        self
    }

    pub fn local_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_cert = Some(path.into());
        self
    }

    pub fn local_pk(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_pk = Some(path.into());
        self
    }

    pub fn cafile(mut self, path: impl Into<PathBuf>) -> Self {
        self.cafile = Some(path.into());
        self
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = Some(verify);
        self
    }

    pub fn verify_host(mut self, verify: bool) -> Self {
        self.verify_host = Some(verify);
        self
    }

    pub fn http_version(mut self, version: &str) -> Self {
        self.http_version = Some(version.to_string());
        self
    }

    pub fn timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn max_duration(mut self, seconds: f64) -> Self {
        self.max_duration = Some(seconds);
        self
    }

    pub fn on_progress(
        mut self,
        callback: impl Fn(&Progress) -> Result<(), String> + 'static,
    ) -> Self {
        self.on_progress = Some(Rc::new(callback));
        self
    }

    /// Fills every unset field from `defaults`.
    ///
    /// Default headers are kept unless the request sets the same name;
    /// `resolve` entries of the request win over default ones.
    pub fn merged_with(mut self, defaults: &RequestOptions) -> RequestOptions {
        let own: Vec<String> = self
            .headers
            .iter()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect();
        let mut headers: Vec<(String, String)> = defaults
            .headers
            .iter()
            .filter(|(name, _)| !own.contains(&name.to_ascii_lowercase()))
            .cloned()
            .collect();
        headers.append(&mut self.headers);
        self.headers = headers;

        if self.body.is_empty() {
            self.body = defaults.body.clone();
        }
        for (host, ip) in &defaults.resolve {
            self.resolve.entry(host.clone()).or_insert_with(|| ip.clone());
        }

        macro_rules! inherit {
            ($($field:ident),*) => {
                $(if self.$field.is_none() {
                    self.$field = defaults.$field.clone();
                })*
            };
        }
        inherit!(
            proxy,
            no_proxy,
            peer_fingerprint,
            capture_peer_cert_chain,
            bindto,
            local_cert,
            local_pk,
            cafile,
            verify_peer,
            verify_host,
            http_version,
            timeout,
            max_duration,
            on_progress
        );
        self
    }
}

/// HTTP version constraint derived from `http_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionPref {
    #[default]
    Any,
    Http1,
    Http2,
}

impl VersionPref {
    fn parse(raw: Option<&str>) -> Result<Self, NetError> {
        match raw {
            None => Ok(VersionPref::Any),
            Some("1.0") | Some("1.1") => Ok(VersionPref::Http1),
            Some("2") | Some("2.0") => Ok(VersionPref::Http2),
            Some(other) => Err(NetError::invalid_option(
                "http_version",
                format!("unsupported version \"{other}\""),
            )),
        }
    }

    fn alpn(self) -> AlpnPolicy {
        match self {
            VersionPref::Any => AlpnPolicy::Negotiate,
            VersionPref::Http1 => AlpnPolicy::Http1Only,
            VersionPref::Http2 => AlpnPolicy::Http2Only,
        }
    }
}

impl BindTarget {
    /// Parses a `bindto` value. An existing filesystem path selects a unix
    /// socket; anything else must be an IP address with optional port.
    pub fn parse(raw: &str) -> Result<Self, NetError> {
        if Path::new(raw).exists() {
            return Ok(BindTarget::Unix(PathBuf::from(raw)));
        }
        if let Ok(addr) = raw.parse::<SocketAddr>() {
            return Ok(BindTarget::Addr(addr));
        }
        if let Some(ip) = parse_ip_literal(raw) {
            return Ok(BindTarget::Addr(SocketAddr::new(ip, 0)));
        }
        Err(NetError::invalid_option(
            "bindto",
            format!("\"{raw}\" is neither an IP address nor an existing unix socket"),
        ))
    }
}

/// Settings a pushed response is checked against before it is consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushProfile {
    pub proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub bindto: Option<String>,
    pub local_cert: Option<PathBuf>,
    pub local_pk: Option<PathBuf>,
}

/// A request whose options passed validation.
#[derive(Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    /// `scheme://host:port`, the pool partition key.
    pub authority: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub identity: ConnectionIdentity,
    pub version: VersionPref,
    pub pins: Option<PinSet>,
    pub capture_peer_cert_chain: bool,
    /// Overrides to apply to the client's DNS cache.
    pub resolve: Vec<(String, Option<IpAddr>)>,
    pub timeout: Duration,
    pub max_duration: Option<Duration>,
    pub push_profile: PushProfile,
    pub on_progress: Option<ProgressCallback>,
}

impl fmt::Debug for PreparedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("authority", &self.authority)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

fn seconds(option: &str, value: Option<f64>) -> Result<Option<Duration>, NetError> {
    value
        .map(|v| {
            Duration::try_from_secs_f64(v)
                .map_err(|_| NetError::invalid_option(option, format!("{v} is not a valid duration")))
        })
        .transpose()
}

/// `scheme://host:port` of `url`, with the scheme's default port filled in.
pub fn authority_of(url: &Url) -> Option<String> {
    Some(format!(
        "{}://{}:{}",
        url.scheme(),
        url.host_str()?.to_ascii_lowercase(),
        url.port_or_known_default()?
    ))
}

impl PreparedRequest {
    /// Validates `options` for `method url`.
    ///
    /// Only structurally invalid input fails here; everything that needs the
    /// network fails later through the request's terminal state.
    pub fn prepare(
        method: &str,
        url: &str,
        options: RequestOptions,
        default_timeout: Duration,
    ) -> Result<Self, NetError> {
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| NetError::MethodNotSupported)?;

        let url = Url::parse(url).map_err(|_| NetError::InvalidUrl)?;
        match url.scheme() {
            "http" | "https" => {}
            _ => return Err(NetError::UnknownUrlScheme),
        }
        let authority = authority_of(&url).ok_or(NetError::InvalidUrl)?;

        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| NetError::invalid_option("headers", format!("\"{name}\": {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| NetError::invalid_option("headers", format!("\"{name}\": {e}")))?;
            headers.append(name, value);
        }

        let proxy = match options.proxy.as_deref() {
            Some("") => None,
            Some(raw) => Some(ProxySettings::parse(raw)?),
            None => ProxySettings::from_env(url.scheme()),
        };
        let bypass = match options.no_proxy.as_deref() {
            Some(rules) => ProxyMatcher::from_string(rules),
            None => ProxyMatcher::from_env(),
        };
        let proxy = proxy::route(proxy.as_ref(), &bypass, &url).cloned();

        let bindto = options.bindto.as_deref().map(BindTarget::parse).transpose()?;

        if options.local_pk.is_some() && options.local_cert.is_none() {
            return Err(NetError::invalid_option("local_pk", "requires \"local_cert\""));
        }
        let version = VersionPref::parse(options.http_version.as_deref())?;
        let tls = (url.scheme() == "https").then(|| TlsSettings {
            verify_peer: options.verify_peer.unwrap_or(true),
            verify_host: options.verify_host.unwrap_or(true),
            cafile: options.cafile.clone(),
            local_cert: options.local_cert.clone(),
            local_pk: options.local_pk.clone(),
            alpn: version.alpn(),
        });

        let pins = options
            .peer_fingerprint
            .as_ref()
            .map(PinSet::from_fingerprint)
            .transpose()?;

        let mut resolve = Vec::with_capacity(options.resolve.len());
        for (host, ip) in &options.resolve {
            let ip = match ip.as_deref() {
                None => None,
                Some(raw) => Some(parse_ip_literal(raw).ok_or_else(|| {
                    NetError::invalid_option("resolve", format!("\"{raw}\" is not an IP address"))
                })?),
            };
            resolve.push((host.to_ascii_lowercase(), ip));
        }

        let timeout = seconds("timeout", options.timeout)?.unwrap_or(default_timeout);
        let max_duration = seconds("max_duration", options.max_duration)?.filter(|d| !d.is_zero());

        let push_profile = PushProfile {
            proxy: options.proxy.clone(),
            no_proxy: options.no_proxy.clone(),
            bindto: options.bindto.clone(),
            local_cert: options.local_cert.clone(),
            local_pk: options.local_pk.clone(),
        };

        Ok(Self {
            method,
            url,
            authority,
            headers,
            body: options.body,
            identity: ConnectionIdentity {
                proxy,
                bindto,
                tls,
            },
            version,
            pins,
            capture_peer_cert_chain: options.capture_peer_cert_chain.unwrap_or(false),
            resolve,
            timeout,
            max_duration,
            push_profile,
            on_progress: options.on_progress,
        })
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Host the socket connects to: the proxy's when one is in use.
    pub fn connect_host(&self) -> &str {
        match &self.identity.proxy {
            Some(p) => p.host_port().map_or("", |(h, _)| h),
            None => self.host(),
        }
    }
}
