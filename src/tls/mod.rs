//! TLS peer verification by public-key pinning.

pub mod pinning;

pub use pinning::{encode_pin, spki_hash, PinSet, SpkiHash, PIN_SHA256};
