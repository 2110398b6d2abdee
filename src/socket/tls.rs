use crate::base::neterror::NetError;
use boring::ssl::{
    SslConnector, SslConnectorBuilder, SslFiletype, SslMethod, SslSessionCacheMode, SslVerifyMode,
    SslVersion,
};
use std::collections::HashMap;
use std::path::PathBuf;

/// Which application protocols are offered through ALPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AlpnPolicy {
    /// Offer `h2` and `http/1.1`, let the server pick.
    #[default]
    Negotiate,
    Http1Only,
    Http2Only,
}

impl AlpnPolicy {
    pub fn protocols(self) -> &'static [&'static str] {
        match self {
            AlpnPolicy::Negotiate => &["h2", "http/1.1"],
            AlpnPolicy::Http1Only => &["http/1.1"],
            AlpnPolicy::Http2Only => &["h2"],
        }
    }

    /// Wire encoding for `set_alpn_protos` (length-prefixed names).
    fn wire(self) -> Result<Vec<u8>, NetError> {
        let mut alpn_wire = Vec::new();
        for proto in self.protocols() {
            if proto.len() > 255 {
                return Err(NetError::SslProtocolError);
            }
            alpn_wire.push(proto.len() as u8);
            alpn_wire.extend_from_slice(proto.as_bytes());
        }
        Ok(alpn_wire)
    }
}

/// Per-request TLS settings.
///
/// They are part of a connection's identity: a pooled connection is only
/// reused by requests carrying equal settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TlsSettings {
    pub verify_peer: bool,
    pub verify_host: bool,
    pub cafile: Option<PathBuf>,
    pub local_cert: Option<PathBuf>,
    pub local_pk: Option<PathBuf>,
    pub alpn: AlpnPolicy,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            verify_peer: true,
            verify_host: true,
            cafile: None,
            local_cert: None,
            local_pk: None,
            alpn: AlpnPolicy::Negotiate,
        }
    }
}

impl TlsSettings {
    /// Build a connector for these settings.
    pub fn build_connector(&self) -> Result<SslConnector, NetError> {
        let mut builder =
            SslConnector::builder(SslMethod::tls()).map_err(|_| NetError::SslProtocolError)?;
        self.apply_to_builder(&mut builder)?;
        Ok(builder.build())
    }

    /// Apply this configuration to an SSL connector builder.
    pub fn apply_to_builder(&self, builder: &mut SslConnectorBuilder) -> Result<(), NetError> {
        builder
            .set_min_proto_version(Some(SslVersion::TLS1_2))
            .map_err(|_| NetError::SslProtocolError)?;

        builder
            .set_alpn_protos(&self.alpn.wire()?)
            .map_err(|_| NetError::SslProtocolError)?;

        // Client-side session cache, shared by every connection of this connector.
        builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);

        if self.verify_peer {
            builder.set_verify(SslVerifyMode::PEER);
        } else {
            builder.set_verify(SslVerifyMode::NONE);
        }

        if let Some(cafile) = &self.cafile {
            builder.set_ca_file(cafile).map_err(|e| {
                NetError::invalid_option("cafile", format!("{}: {}", cafile.display(), e))
            })?;
        }

        if let Some(cert) = &self.local_cert {
            builder.set_certificate_chain_file(cert).map_err(|e| {
                NetError::invalid_option("local_cert", format!("{}: {}", cert.display(), e))
            })?;
            // Without `local_pk` the key is expected next to the certificate.
            let key = self.local_pk.as_ref().unwrap_or(cert);
            builder
                .set_private_key_file(key, SslFiletype::PEM)
                .map_err(|e| {
                    NetError::invalid_option("local_pk", format!("{}: {}", key.display(), e))
                })?;
            builder
                .check_private_key()
                .map_err(|_| NetError::BadSslClientAuthCert)?;
        } else if self.local_pk.is_some() {
            return Err(NetError::invalid_option("local_pk", "requires \"local_cert\""));
        }

        Ok(())
    }

    /// Check if SNI (Server Name Indication) should be set for this host.
    /// Per RFC 6066, SNI MUST NOT be set for raw IP addresses.
    pub fn should_set_sni(host: &str) -> bool {
        crate::dns::parse_ip_literal(host).is_none()
    }
}

/// Connectors keyed by settings.
///
/// Connections built from one connector share its session cache; `clear`
/// drops every connector so the next handshake starts without resumption.
#[derive(Default)]
pub struct TlsConnectorCache {
    connectors: HashMap<TlsSettings, SslConnector>,
}

impl TlsConnectorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, settings: &TlsSettings) -> Result<SslConnector, NetError> {
        if let Some(connector) = self.connectors.get(settings) {
            return Ok(connector.clone());
        }
        let connector = settings.build_connector()?;
        self.connectors.insert(settings.clone(), connector.clone());
        Ok(connector)
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn clear(&mut self) {
        self.connectors.clear();
    }
}

impl std::fmt::Debug for TlsConnectorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnectorCache")
            .field("connectors", &self.connectors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpn_wire() {
        assert_eq!(AlpnPolicy::Negotiate.wire().unwrap(), b"\x02h2\x08http/1.1");
        assert_eq!(AlpnPolicy::Http1Only.wire().unwrap(), b"\x08http/1.1");
    }

    #[test]
    fn test_should_set_sni() {
        assert!(TlsSettings::should_set_sni("example.com"));
        assert!(!TlsSettings::should_set_sni("127.0.0.1"));
        assert!(!TlsSettings::should_set_sni("[::1]"));
    }

    #[test]
    fn test_private_key_without_certificate() {
        let settings = TlsSettings {
            local_pk: Some(PathBuf::from("/nonexistent/key.pem")),
            ..TlsSettings::default()
        };
        assert!(matches!(
            settings.build_connector(),
            Err(NetError::InvalidOption { .. })
        ));
    }

    #[test]
    fn test_missing_cafile_is_invalid_option() {
        let settings = TlsSettings {
            cafile: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..TlsSettings::default()
        };
        let err = settings.build_connector().unwrap_err();
        assert!(err.to_string().contains("cafile"));
    }

    #[test]
    fn test_connector_cache_reuses_and_clears() {
        let mut cache = TlsConnectorCache::new();
        let strict = TlsSettings::default();
        let lax = TlsSettings {
            verify_peer: false,
            ..TlsSettings::default()
        };

        cache.get(&strict).unwrap();
        cache.get(&strict).unwrap();
        cache.get(&lax).unwrap();
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }
}
