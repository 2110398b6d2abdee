//! Public-key pinning of TLS peers.
//!
//! A request's `peer_fingerprint` option lists base64 SHA-256 hashes of the
//! Subject Public Key Info the server's leaf certificate must carry. The
//! check runs right after the handshake, before any request byte is written.

use crate::base::neterror::NetError;
use base64::Engine;
use std::collections::BTreeMap;

/// SHA-256 hash of a certificate's SPKI (Subject Public Key Info).
pub type SpkiHash = [u8; 32];

/// The only fingerprint algorithm understood by [`PinSet::from_fingerprint`].
pub const PIN_SHA256: &str = "pin-sha256";

/// Allowed SPKI hashes for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinSet {
    pins: Vec<SpkiHash>,
}

impl PinSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a pin set from a `peer_fingerprint` option value.
    ///
    /// Keys name the algorithm; only `pin-sha256` is supported.
    pub fn from_fingerprint(fingerprint: &BTreeMap<String, Vec<String>>) -> Result<Self, NetError> {
        let mut set = PinSet::new();
        for (algorithm, pins) in fingerprint {
            if algorithm != PIN_SHA256 {
                return Err(NetError::invalid_option(
                    "peer_fingerprint",
                    format!("only \"{PIN_SHA256}\" fingerprints are supported, got \"{algorithm}\""),
                ));
            }
            for pin in pins {
                set.add_pin_base64(pin)?;
            }
        }
        if set.is_empty() {
            return Err(NetError::invalid_option(
                "peer_fingerprint",
                format!("no \"{PIN_SHA256}\" pins given"),
            ));
        }
        Ok(set)
    }

    /// Add a pin (base64-encoded SHA-256 hash, optionally `sha256//`-prefixed).
    pub fn add_pin_base64(&mut self, pin_base64: &str) -> Result<(), NetError> {
        let raw = pin_base64.trim();
        let raw = raw.strip_prefix("sha256//").unwrap_or(raw);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|e| NetError::invalid_option("peer_fingerprint", e.to_string()))?;

        if decoded.len() != 32 {
            return Err(NetError::invalid_option(
                "peer_fingerprint",
                format!("pin \"{raw}\" is not a SHA-256 digest"),
            ));
        }

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&decoded);
        self.pins.push(hash);
        Ok(())
    }

    /// Add a pin from raw bytes.
    pub fn add_pin(&mut self, hash: SpkiHash) {
        self.pins.push(hash);
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn matches(&self, hash: &SpkiHash) -> bool {
        self.pins.contains(hash)
    }

    /// Verifies the DER-encoded leaf certificate presented for `url`.
    pub fn verify_leaf(&self, leaf_der: &[u8], url: &str) -> Result<(), NetError> {
        let hash = spki_hash(leaf_der)?;
        if self.matches(&hash) {
            tracing::debug!(url = %url, "pinned public key matched");
            Ok(())
        } else {
            tracing::debug!(url = %url, got = %encode_pin(&hash), "pinned public key mismatch");
            Err(NetError::PinMismatch {
                url: url.to_string(),
            })
        }
    }
}

/// Compute SPKI hash from a DER-encoded certificate.
/// Returns SHA-256 hash of the Subject Public Key Info.
pub fn spki_hash(cert_der: &[u8]) -> Result<SpkiHash, NetError> {
    use boring::hash::{hash, MessageDigest};
    use boring::x509::X509;

    let cert = X509::from_der(cert_der).map_err(|_| NetError::CertInvalid)?;

    // Get the public key in DER format (this is the SPKI)
    let pubkey = cert.public_key().map_err(|_| NetError::CertInvalid)?;
    let spki_der = pubkey
        .public_key_to_der()
        .map_err(|_| NetError::CertInvalid)?;

    let digest = hash(MessageDigest::sha256(), &spki_der).map_err(|_| NetError::CertInvalid)?;

    let mut result = [0u8; 32];
    result.copy_from_slice(&digest);
    Ok(result)
}

/// Base64 form of a hash, as written in a `pin-sha256` list.
pub fn encode_pin(hash: &SpkiHash) -> String {
    base64::engine::general_purpose::STANDARD.encode(hash)
}
