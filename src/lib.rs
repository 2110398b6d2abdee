//! # muxnet
//!
//! A multiplexed, push-aware HTTP transport engine.
//!
//! `muxnet` drives many concurrent outbound requests over a bounded set of
//! pooled connections from a single thread. Requests start without
//! blocking; the caller drives them all at once through [`Client::pump`],
//! or implicitly by inspecting a [`ResponseHandle`].
//!
//! ## Features
//!
//! - **Connection Pooling**: per-authority limit (6 by default), HTTP/1.1
//!   keep-alive reuse and shared HTTP/2 connections
//! - **Server Push**: validated pushes are buffered and handed to matching
//!   requests without a network round trip
//! - **DNS Overrides**: `resolve` pins hostnames to fixed addresses for the
//!   record type they can represent
//! - **TLS Security**: BoringSSL, `pin-sha256` public-key pinning, client
//!   certificates
//! - **Proxy Support**: HTTP proxies with CONNECT tunnelling and `no_proxy`
//! - **Two Backends**: a hand-rolled multiplexer and an event-loop reactor
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use muxnet::{Client, RequestOptions};
//!
//! let client = Client::new()?;
//! let response = client.request(
//!     "GET",
//!     "https://example.com/",
//!     RequestOptions::new().pin_sha256("sha256//AAAA..."),
//! )?;
//! println!("Status: {}", response.status()?);
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error definitions and lifecycle states
//! - [`client`] - Client facade, hub state and per-request records
//! - [`dns`] - Resolvers and the override cache
//! - [`engine`] - Transfer backends and their events
//! - [`http`] - Request options, transfers and server push
//! - [`socket`] - Connection pooling, proxy and TLS sockets
//! - [`tls`] - Certificate pinning

pub mod base;
pub mod client;
pub mod dns;
pub mod engine;
pub mod http;
pub mod socket;
pub mod tls;

pub use base::loadstate::LoadState;
pub use base::neterror::{ErrorKind, NetError};
pub use client::{
    Client, ClientBuilder, ClientConfig, PushVerdict, Readiness, ResolverKind, ResponseHandle,
    TransferInfo,
};
pub use engine::BackendKind;
pub use crate::http::push::PushedStream;
pub use crate::http::request::{Progress, RequestOptions};
pub use crate::http::response::ResponseHead;
