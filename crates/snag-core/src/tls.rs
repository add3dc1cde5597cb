//! Deep TLS inspection. Runs a raw handshake on a secondary socket so the
//! probe can report version, cipher, certificate details and the leaf
//! fingerprint, independent of the HTTP client's own connection pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use x509_parser::prelude::*;

use crate::error::FetchError;
use crate::probe::TlsSummary;

/// Accepts any server certificate. Installed only when the caller turned
/// verification off; the fingerprint pin is still enforced afterwards.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn client_config(verify: bool) -> Result<ClientConfig, FetchError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| FetchError::TlsFailure(e.to_string()))?;
    let mut config = if verify {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        let mut config = builder
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyCert(provider)));
        config
    };
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Handshake with `host:port` and summarize the session. A handshake
/// timeout is transient; any other failure is fatal TLS trouble.
pub async fn inspect(
    host: &str,
    port: u16,
    verify: bool,
    timeout: Duration,
) -> Result<TlsSummary, FetchError> {
    let config = client_config(verify)?;
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| FetchError::TlsFailure(format!("invalid server name {host}: {e}")))?;

    let handshake = async {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| FetchError::TransientNetwork(e.to_string()))?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| FetchError::TlsFailure(e.to_string()))
    };
    let tls = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| FetchError::TransientNetwork(format!("TLS handshake timeout to {host}:{port}")))??;

    let (_, conn) = tls.get_ref();
    let version = conn
        .protocol_version()
        .map(|v| format!("{v:?}"))
        .unwrap_or_else(|| "unknown".into());
    let cipher = conn
        .negotiated_cipher_suite()
        .map(|s| format!("{:?}", s.suite()))
        .unwrap_or_else(|| "unknown".into());

    let leaf = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| FetchError::TlsFailure("server sent no certificate".into()))?;
    let fingerprint = hex::encode(Sha256::digest(leaf.as_ref()));

    let mut summary = TlsSummary {
        version,
        cipher,
        issuer: None,
        not_after: None,
        subject_alt_names: Vec::new(),
        sha256_fingerprint: fingerprint,
    };

    // Certificate details are best-effort; a parse failure leaves the
    // summary fields empty rather than failing the probe.
    if let Ok((_, cert)) = X509Certificate::from_der(leaf.as_ref()) {
        summary.issuer = Some(cert.issuer().to_string());
        summary.not_after = Some(cert.validity().not_after.to_string());
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(d) => summary.subject_alt_names.push(d.to_string()),
                    GeneralName::IPAddress(ip) => {
                        summary.subject_alt_names.push(format_ip(ip));
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(summary)
}

fn format_ip(raw: &[u8]) -> String {
    match raw.len() {
        4 => format!("{}.{}.{}.{}", raw[0], raw[1], raw[2], raw[3]),
        _ => hex::encode(raw),
    }
}

/// Enforce a configured pin against the observed leaf fingerprint.
pub fn check_pin(
    pins: &HashMap<String, String>,
    host: &str,
    fingerprint: &str,
) -> Result<(), FetchError> {
    if let Some(expected) = pins.get(host) {
        if !expected.eq_ignore_ascii_case(fingerprint) {
            return Err(FetchError::PinMismatch {
                host: host.to_string(),
                expected: expected.to_ascii_lowercase(),
                actual: fingerprint.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_match_is_case_insensitive() {
        let mut pins = HashMap::new();
        pins.insert("example.com".to_string(), "ABCDEF".to_string());
        assert!(check_pin(&pins, "example.com", "abcdef").is_ok());
    }

    #[test]
    fn test_pin_mismatch_is_fatal() {
        let mut pins = HashMap::new();
        pins.insert("example.com".to_string(), "abcdef".to_string());
        let err = check_pin(&pins, "example.com", "123456").unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, FetchError::PinMismatch { .. }));
    }

    #[test]
    fn test_unpinned_host_passes() {
        assert!(check_pin(&HashMap::new(), "example.com", "whatever").is_ok());
    }
}
