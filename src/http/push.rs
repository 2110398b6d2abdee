//! Server-pushed responses.
//!
//! A push is offered with the raw `name:value` request headers of its
//! PUSH_PROMISE. It is validated against the request that received it,
//! buffered in the background and kept until a matching request consumes it.
//! Each authority keeps at most `max_pending_pushes` entries; the oldest is
//! evicted first.

use crate::base::neterror::NetError;
use crate::http::request::{authority_of, PreparedRequest, PushProfile, PUSH_SENSITIVE_HEADERS};
use crate::http::response::ResponseHead;
use bytes::Bytes;
use futures::future::LocalBoxFuture;
use futures::stream::{LocalBoxStream, StreamExt};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use tokio::sync::Notify;
use url::Url;

/// Request headers of a push, keyed by lowercase name.
pub type PushHeaders = BTreeMap<String, Vec<String>>;

/// Splits raw `name:value` lines. The search for `:` starts at the second
/// byte so pseudo-headers keep their leading colon.
pub fn parse_push_headers<S: AsRef<str>>(raw: &[S]) -> PushHeaders {
    let mut headers = PushHeaders::new();
    for line in raw {
        let line = line.as_ref();
        let Some(i) = line.get(1..).and_then(|rest| rest.find(':')).map(|i| i + 1) else {
            continue;
        };
        headers
            .entry(line[..i].to_ascii_lowercase())
            .or_default()
            .push(line[i + 1..].trim_start().to_string());
    }
    headers
}

/// Why a push was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushRejection {
    /// A required pseudo-header is missing.
    InvalidHeaders { origin: String },
    /// The pushed authority differs from the parent's origin.
    NotAuthoritative { origin: String, claimed: String },
    /// Pushes are disabled on this client.
    Disabled,
}

impl fmt::Display for PushRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushRejection::InvalidHeaders { origin } => write!(
                f,
                "Rejecting pushed response from \"{origin}\": pushed headers are invalid"
            ),
            PushRejection::NotAuthoritative { origin, claimed } => write!(
                f,
                "Rejecting pushed response from \"{origin}\": server is not authoritative for \"{claimed}\""
            ),
            PushRejection::Disabled => f.write_str("Rejecting pushed response: pushes are disabled"),
        }
    }
}

/// A push that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromise {
    pub method: String,
    /// Full pushed URL, normalized the way request URLs are.
    pub url: String,
    /// `scheme://host:port` bucket key.
    pub authority: String,
    pub headers: PushHeaders,
}

fn first<'a>(headers: &'a PushHeaders, name: &str) -> Option<&'a str> {
    headers.get(name)?.first().map(String::as_str)
}

/// Checks the pseudo-headers of a push received on the request to `parent`.
pub fn validate_push<S: AsRef<str>>(parent: &Url, raw: &[S]) -> Result<PushPromise, PushRejection> {
    let headers = parse_push_headers(raw);
    let origin = parent.as_str().to_string();

    let (Some(method), Some(scheme), Some(authority), Some(path)) = (
        first(&headers, ":method"),
        first(&headers, ":scheme"),
        first(&headers, ":authority"),
        first(&headers, ":path"),
    ) else {
        return Err(PushRejection::InvalidHeaders { origin });
    };

    let claimed = format!("{scheme}://{authority}");
    let not_authoritative = || PushRejection::NotAuthoritative {
        origin: origin.clone(),
        claimed: claimed.clone(),
    };
    let claimed_root = Url::parse(&format!("{claimed}/")).map_err(|_| not_authoritative())?;
    if !origin.starts_with(claimed_root.as_str()) || !path.starts_with('/') {
        return Err(not_authoritative());
    }

    let url = Url::parse(&format!("{claimed}{path}")).map_err(|_| not_authoritative())?;
    let authority = authority_of(&url).ok_or_else(not_authoritative)?;

    Ok(PushPromise {
        method: method.to_string(),
        url: url.into(),
        authority,
        headers,
    })
}

/// A stored push together with what it was promised for.
#[derive(Debug)]
pub struct PushedResponse<R> {
    pub promise: PushPromise,
    /// Options of the parent request that matter for connection identity.
    pub parent: PushProfile,
    pub response: R,
}

impl<R> PushedResponse<R> {
    /// Whether `request` may be answered by this push.
    pub fn accepts(&self, request: &PreparedRequest) -> bool {
        if !request.body.is_empty() || request.method.as_str() != self.promise.method {
            return false;
        }
        if request.push_profile != self.parent {
            return false;
        }
        PUSH_SENSITIVE_HEADERS.iter().all(|name| {
            let ours: Vec<&str> = request
                .headers
                .get_all(name)
                .iter()
                .map(|v| v.to_str().unwrap_or_default())
                .collect();
            let theirs: Vec<&str> = self
                .promise
                .headers
                .get(name.as_str())
                .map(|values| values.iter().map(String::as_str).collect())
                .unwrap_or_default();
            ours == theirs
        })
    }
}

/// Pending pushes, one insertion-ordered bucket per authority.
#[derive(Debug)]
pub struct PushCache<R> {
    max_pending: usize,
    buckets: HashMap<String, IndexMap<String, PushedResponse<R>>>,
}

impl<R> PushCache<R> {
    /// `max_pending == 0` disables pushes.
    pub fn new(max_pending: usize) -> Self {
        Self {
            max_pending,
            buckets: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_pending > 0
    }

    /// Stores a push, returning the entries it displaced: the oldest one of
    /// a full bucket and any earlier push of the same URL.
    pub fn insert(&mut self, pushed: PushedResponse<R>) -> Vec<PushedResponse<R>> {
        let mut displaced = Vec::new();
        if !self.is_enabled() {
            displaced.push(pushed);
            return displaced;
        }
        let bucket = self.buckets.entry(pushed.promise.authority.clone()).or_default();

        if let Some(previous) = bucket.shift_remove(&pushed.promise.url) {
            displaced.push(previous);
        }
        while bucket.len() >= self.max_pending {
            let Some((url, oldest)) = bucket.shift_remove_index(0) else {
                break;
            };
            tracing::debug!("Evicting oldest pushed response: \"{}\"", url);
            displaced.push(oldest);
        }

        tracing::debug!("Queueing pushed response: \"{}\"", pushed.promise.url);
        bucket.insert(pushed.promise.url.clone(), pushed);
        displaced
    }

    /// Hands out the push stored for `request`'s URL when it is compatible.
    /// An incompatible entry stays cached.
    pub fn try_consume(&mut self, request: &PreparedRequest) -> Option<PushedResponse<R>> {
        let url = request.url.as_str();
        let bucket = self.buckets.get_mut(&request.authority)?;
        let pushed = bucket.get(url)?;

        if !pushed.accepts(request) {
            tracing::debug!("Rejecting pushed response: \"{}\".", url);
            return None;
        }
        tracing::debug!("Accepting pushed response: \"{} {}\"", request.method, url);
        let pushed = bucket.shift_remove(url);
        if bucket.is_empty() {
            self.buckets.remove(&request.authority);
        }
        pushed
    }

    pub fn contains(&self, url: &str) -> bool {
        self.buckets.values().any(|b| b.contains_key(url))
    }

    /// Pending URLs of `authority`, oldest first.
    pub fn urls(&self, authority: &str) -> Vec<String> {
        self.buckets
            .get(authority)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Removes every entry, logging each as unused.
    pub fn drain(&mut self) -> Vec<PushedResponse<R>> {
        let mut drained = Vec::new();
        for (_, bucket) in self.buckets.drain() {
            for (url, pushed) in bucket {
                tracing::debug!("Unused pushed response: \"{}\"", url);
                drained.push(pushed);
            }
        }
        drained
    }
}

/// The response side of a push as delivered by the connection.
pub struct PushedStream {
    head: LocalBoxFuture<'static, Result<ResponseHead, NetError>>,
    body: LocalBoxStream<'static, Result<Bytes, NetError>>,
}

impl PushedStream {
    pub fn new(
        head: impl std::future::Future<Output = Result<ResponseHead, NetError>> + 'static,
        body: impl futures::Stream<Item = Result<Bytes, NetError>> + 'static,
    ) -> Self {
        Self {
            head: Box::pin(head),
            body: Box::pin(body),
        }
    }

    /// A push whose response is already complete.
    pub fn from_response(head: ResponseHead, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let chunks = if body.is_empty() { vec![] } else { vec![Ok(body)] };
        Self::new(async move { Ok(head) }, futures::stream::iter(chunks))
    }
}

impl fmt::Debug for PushedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushedStream").finish_non_exhaustive()
    }
}

/// What has arrived of a push so far.
#[derive(Debug, Default)]
pub struct PushProgress {
    pub head: Option<ResponseHead>,
    pub chunks: VecDeque<Bytes>,
    /// `Some` once the push is complete.
    pub outcome: Option<Result<(), NetError>>,
}

/// Receives a push in the background; shared with whoever consumes it.
#[derive(Debug, Clone, Default)]
pub struct PushBuffer {
    progress: Rc<RefCell<PushProgress>>,
    notify: Rc<Notify>,
}

impl PushBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Future reading `stream` into the buffer.
    pub fn fill(&self, stream: PushedStream) -> LocalBoxFuture<'static, ()> {
        let buffer = self.clone();
        Box::pin(async move {
            let PushedStream { head, mut body } = stream;
            let outcome = match head.await {
                Ok(head) => {
                    buffer.progress.borrow_mut().head = Some(head);
                    buffer.notify.notify_one();
                    loop {
                        match body.next().await {
                            Some(Ok(chunk)) => {
                                buffer.progress.borrow_mut().chunks.push_back(chunk);
                                buffer.notify.notify_one();
                            }
                            Some(Err(e)) => break Err(e),
                            None => break Ok(()),
                        }
                    }
                }
                Err(e) => Err(e),
            };
            buffer.progress.borrow_mut().outcome = Some(outcome);
            buffer.notify.notify_one();
        })
    }

    /// Runs `f` on the current progress.
    pub fn with<T>(&self, f: impl FnOnce(&mut PushProgress) -> T) -> T {
        f(&mut self.progress.borrow_mut())
    }

    /// Waits for the next change. A change that happened since the last wait
    /// completes immediately.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::RequestOptions;
    use std::time::Duration;

    fn push_lines(path: &str) -> Vec<String> {
        vec![
            ":method:GET".into(),
            ":scheme:https".into(),
            ":authority:example.com".into(),
            format!(":path:{path}"),
        ]
    }

    fn parent() -> Url {
        Url::parse("https://example.com/index.html").unwrap()
    }

    fn request(path: &str, options: RequestOptions) -> PreparedRequest {
        PreparedRequest::prepare(
            "GET",
            &format!("https://example.com{path}"),
            options.proxy(""),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    fn profile() -> PushProfile {
        request("/", RequestOptions::new()).push_profile
    }

    fn pushed(path: &str) -> PushedResponse<&'static str> {
        PushedResponse {
            promise: validate_push(&parent(), &push_lines(path)).unwrap(),
            parent: profile(),
            response: "body",
        }
    }

    #[test]
    fn test_parse_keeps_pseudo_header_colon() {
        let headers = parse_push_headers(&[":path:/a:b", "cookie: x=1", "garbage"]);
        assert_eq!(headers[":path"], vec!["/a:b".to_string()]);
        assert_eq!(headers["cookie"], vec!["x=1".to_string()]);
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_missing_pseudo_header_rejected() {
        let mut lines = push_lines("/a.css");
        lines.retain(|l| !l.starts_with(":path"));
        let err = validate_push(&parent(), &lines).unwrap_err();
        assert!(matches!(err, PushRejection::InvalidHeaders { .. }));
        assert!(err.to_string().contains("pushed headers are invalid"));
    }

    #[test]
    fn test_foreign_authority_rejected() {
        let lines = vec![
            ":method:GET".to_string(),
            ":scheme:https".to_string(),
            ":authority:evil.test".to_string(),
            ":path:/x".to_string(),
        ];
        let err = validate_push(&parent(), &lines).unwrap_err();
        assert!(err.to_string().contains("server is not authoritative for \"https://evil.test\""));

        // A suffix of the real host is no prefix match either.
        let lines: Vec<String> = lines
            .into_iter()
            .map(|l| l.replace("evil.test", "example.com.evil.test"))
            .collect();
        assert!(validate_push(&parent(), &lines).is_err());
    }

    #[test]
    fn test_default_port_normalized() {
        let lines = vec![":method:GET", ":scheme:https", ":authority:EXAMPLE.com:443", ":path:/a"];
        let promise = validate_push(&parent(), &lines).unwrap();
        assert_eq!(promise.url, "https://example.com/a");
        assert_eq!(promise.authority, "https://example.com:443");
    }

    #[test]
    fn test_fifo_eviction() {
        let mut cache = PushCache::new(2);
        assert!(cache.insert(pushed("/a")).is_empty());
        assert!(cache.insert(pushed("/b")).is_empty());
        let evicted = cache.insert(pushed("/c"));

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].promise.url, "https://example.com/a");
        assert_eq!(
            cache.urls("https://example.com:443"),
            vec!["https://example.com/b", "https://example.com/c"]
        );
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let mut cache = PushCache::new(0);
        assert!(!cache.is_enabled());
        assert_eq!(cache.insert(pushed("/a")).len(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_consume_removes_entry() {
        let mut cache = PushCache::new(4);
        cache.insert(pushed("/a"));
        let got = cache.try_consume(&request("/a", RequestOptions::new())).unwrap();
        assert_eq!(got.response, "body");
        assert!(!cache.contains("https://example.com/a"));
        assert!(cache.try_consume(&request("/a", RequestOptions::new())).is_none());
    }

    #[test]
    fn test_incompatible_request_leaves_entry() {
        let mut cache = PushCache::new(4);
        cache.insert(pushed("/a"));

        let with_cookie = request("/a", RequestOptions::new().header("Cookie", "sid=1"));
        assert!(cache.try_consume(&with_cookie).is_none());
        let bound = request("/a", RequestOptions::new().bindto("127.0.0.1"));
        assert!(cache.try_consume(&bound).is_none());
        let post = PreparedRequest::prepare(
            "POST",
            "https://example.com/a",
            RequestOptions::new().proxy(""),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(cache.try_consume(&post).is_none());

        assert!(cache.contains("https://example.com/a"));
    }

    #[test]
    fn test_sensitive_headers_must_match_promise() {
        let mut lines = push_lines("/a");
        lines.push("authorization:Bearer t".into());
        let mut cache = PushCache::new(4);
        cache.insert(PushedResponse {
            promise: validate_push(&parent(), &lines).unwrap(),
            parent: profile(),
            response: "body",
        });

        assert!(cache.try_consume(&request("/a", RequestOptions::new())).is_none());
        let authorized = request("/a", RequestOptions::new().header("Authorization", "Bearer t"));
        assert!(cache.try_consume(&authorized).is_some());
    }

    #[test]
    fn test_drain_empties_all_buckets() {
        let mut cache = PushCache::new(4);
        cache.insert(pushed("/a"));
        cache.insert(pushed("/b"));
        assert_eq!(cache.drain().len(), 2);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_buffer_collects_stream() {
        let buffer = PushBuffer::new();
        let head = ResponseHead {
            status: http::StatusCode::OK,
            version: http::Version::HTTP_2,
            headers: http::HeaderMap::new(),
        };
        buffer.fill(PushedStream::from_response(head, "hello")).await;

        buffer.with(|p| {
            assert_eq!(p.head.as_ref().unwrap().status, http::StatusCode::OK);
            assert_eq!(p.chunks.pop_front().unwrap(), Bytes::from("hello"));
            assert_eq!(p.outcome, Some(Ok(())));
        });
    }
}
