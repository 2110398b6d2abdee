//! Client facade.
//!
//! A [`Client`] starts requests without blocking and drives them through
//! [`Client::pump`] or the blocking inspection methods of
//! [`ResponseHandle`].
//!
//! # Example
//!
//! ```rust,ignore
//! use muxnet::{Client, RequestOptions};
//!
//! let client = Client::builder().max_host_connections(2).build()?;
//! let a = client.get("https://example.com/a")?;
//! let b = client.request("GET", "https://example.com/b", RequestOptions::new().timeout(5.0))?;
//! // Both transfers progress while waiting on either one.
//! println!("{} {}", a.status()?, b.content()?.len());
//! ```

pub mod execution;
pub mod handle;
pub mod state;

pub use execution::{RequestExecutionContext, Timings, TransferInfo};
pub use handle::{PushVerdict, Readiness, ResponseHandle};
pub use state::{ClientState, Pumped};

use crate::base::neterror::NetError;
use crate::dns::{GaiResolver, HickoryResolver, Resolve};
use crate::engine::{BackendKind, HandleId};
use crate::http::push::PushedStream;
use crate::http::request::RequestOptions;
use serde::{Deserialize, Deserializer};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// Resolver used for hosts without an override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    /// `getaddrinfo` on the blocking pool.
    #[default]
    System,
    Hickory,
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

/// Client-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub backend: BackendKind,
    pub resolver: ResolverKind,
    /// Connections per authority; 0 means unbounded.
    pub max_host_connections: usize,
    /// Pending pushes per authority; 0 disables pushes.
    pub max_pending_pushes: usize,
    /// Idle timeout of requests that set none, in seconds.
    #[serde(deserialize_with = "seconds")]
    pub default_timeout: Duration,
    /// Merged under the options of every request.
    pub default_options: RequestOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            resolver: ResolverKind::default(),
            max_host_connections: 6,
            max_pending_pushes: 50,
            default_timeout: Duration::from_secs(60),
            default_options: RequestOptions::default(),
        }
    }
}

impl ClientConfig {
    #[cfg(feature = "json")]
    pub fn from_json(json: &str) -> Result<Self, NetError> {
        serde_json::from_str(json).map_err(|e| NetError::invalid_option("config", e.to_string()))
    }
}

/// HTTP client over one backend.
///
/// Clones share the same state. The state, and every request still open
/// in it, goes away with the last clone.
#[derive(Clone)]
pub struct Client {
    state: Rc<ClientState>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("backend", &self.state.config().backend)
            .field("open", &self.state.open_count())
            .finish()
    }
}

impl Client {
    /// Client with default settings.
    pub fn new() -> Result<Self, NetError> {
        Self::builder().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn from_config(config: ClientConfig) -> Result<Self, NetError> {
        ClientBuilder {
            config,
            resolver: None,
        }
        .build()
    }

    /// Starts a request. Never blocks.
    pub fn request(
        &self,
        method: &str,
        url: &str,
        options: RequestOptions,
    ) -> Result<ResponseHandle, NetError> {
        self.state.start_request(method, url, options)
    }

    pub fn get(&self, url: &str) -> Result<ResponseHandle, NetError> {
        self.request("GET", url, RequestOptions::default())
    }

    /// Drives every open request once. See [`ClientState::pump`].
    pub fn pump(&self, handles: &[&ResponseHandle], timeout: Option<Duration>) -> Pumped {
        let ids: Vec<HandleId> = handles.iter().map(|h| h.id()).collect();
        self.state.pump(&ids, timeout)
    }

    pub fn cancel(&self, handle: &ResponseHandle) {
        self.state.cancel(handle.id());
    }

    pub fn reset(&self) {
        self.state.reset();
    }

    /// Offers a push received on `parent`'s connection.
    pub fn offer_push<S: AsRef<str>>(
        &self,
        parent: &ResponseHandle,
        raw_headers: &[S],
        stream: PushedStream,
    ) -> PushVerdict {
        self.state.offer_push(parent, raw_headers, stream)
    }

    /// Hub counters and cache sizes.
    pub fn state(&self) -> &ClientState {
        &self.state
    }
}

/// Builder for a [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    resolver: Option<Arc<dyn Resolve>>,
}

impl ClientBuilder {
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn max_host_connections(mut self, max: usize) -> Self {
        self.config.max_host_connections = max;
        self
    }

    pub fn max_pending_pushes(mut self, max: usize) -> Self {
        self.config.max_pending_pushes = max;
        self
    }

    /// Idle timeout for requests that set none.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn default_options(mut self, options: RequestOptions) -> Self {
        self.config.default_options = options;
        self
    }

    /// Use the async hickory resolver instead of the system one.
    pub fn hickory_dns(mut self) -> Self {
        self.config.resolver = ResolverKind::Hickory;
        self
    }

    /// Custom resolver; takes precedence over the configured kind.
    pub fn resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> Result<Client, NetError> {
        let resolver = self.resolver.unwrap_or_else(|| match self.config.resolver {
            ResolverKind::System => Arc::new(GaiResolver::new()),
            ResolverKind::Hickory => Arc::new(HickoryResolver::new()),
        });
        Ok(Client {
            state: ClientState::new(self.config, resolver)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_host_connections, 6);
        assert_eq!(config.max_pending_pushes, 50);
        assert_eq!(config.default_timeout, Duration::from_secs(60));
        assert_eq!(config.backend, BackendKind::Multi);
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_config_from_json() {
        let config = ClientConfig::from_json(
            r#"{"backend": "reactor", "max_pending_pushes": 0, "default_timeout": 2.5,
                "default_options": {"headers": [["user-agent", "muxnet"]]}}"#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Reactor);
        assert_eq!(config.max_pending_pushes, 0);
        assert_eq!(config.max_host_connections, 6);
        assert_eq!(config.default_timeout, Duration::from_millis(2500));
        assert_eq!(config.default_options.headers.len(), 1);

        assert!(ClientConfig::from_json(r#"{"max_host_connections": -1}"#).is_err());
        assert!(ClientConfig::from_json(r#"{"default_timeout": -1}"#).is_err());
    }

    #[test]
    fn test_structural_errors_are_synchronous() {
        let client = Client::new().unwrap();
        assert_eq!(client.get("nope").unwrap_err(), NetError::InvalidUrl);
        assert_eq!(client.state().open_count(), 0);
    }

    #[test]
    fn test_both_backends_build() {
        for backend in [BackendKind::Multi, BackendKind::Reactor] {
            let client = Client::builder().backend(backend).build().unwrap();
            assert_eq!(client.state().config().backend, backend);
        }
    }
}
