//! Probe results: everything learned about a target before moving bytes.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;

/// TLS details gathered by the deep-inspection handshake.
#[derive(Debug, Clone, Serialize)]
pub struct TlsSummary {
    pub version: String,
    pub cipher: String,
    pub issuer: Option<String>,
    pub not_after: Option<String>,
    pub subject_alt_names: Vec<String>,
    /// Lowercase hex SHA-256 of the leaf certificate in DER form.
    pub sha256_fingerprint: String,
}

/// Resume validators supplied by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    /// Resume is refused when the server offers no validator at all.
    pub fn usable(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// Everything a protocol handler learns during the metadata probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    /// Negotiated protocol label, e.g. "http/2", "ftp", "sftp".
    pub protocol: String,
    pub peer_addr: Option<SocketAddr>,
    pub server: Option<String>,
    pub latency: Duration,
    pub tls: Option<TlsSummary>,
    /// Total object size; None when the server does not report one.
    pub content_length: Option<u64>,
    pub supports_range: bool,
    pub content_type: Option<String>,
    pub validators: Validators,
    /// Server advertised HTTP/3 via Alt-Svc or equivalent.
    pub alt_svc_h3: bool,
}

impl ProbeResult {
    pub fn new(protocol: impl Into<String>, latency: Duration) -> Self {
        Self {
            protocol: protocol.into(),
            peer_addr: None,
            server: None,
            latency,
            tls: None,
            content_length: None,
            supports_range: false,
            content_type: None,
            validators: Validators::default(),
            alt_svc_h3: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validators_usable() {
        assert!(!Validators::default().usable());
        assert!(Validators { etag: Some("\"v1\"".into()), last_modified: None }.usable());
        assert!(Validators { etag: None, last_modified: Some("date".into()) }.usable());
    }
}
