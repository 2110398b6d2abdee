//! Base types and error handling.
//!
//! Provides foundational types shared by every layer:
//! - [`NetError`](neterror::NetError): network error codes with Chromium-compatible numbering
//! - [`ErrorKind`](neterror::ErrorKind): the coarse failure taxonomy
//! - [`LoadState`](loadstate::LoadState): lifecycle states of a request

pub mod context;
pub mod loadstate;
pub mod neterror;
