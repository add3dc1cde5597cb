//! The protocol handler contract. Built-in HTTP, FTP and SSH handlers
//! and third-party plugins all speak the same probe/open/read interface;
//! the engine never branches on the scheme outside this module.

mod ftp;
mod http;
mod ssh;

pub use ftp::FtpHandler;
pub use http::HttpHandler;
pub use ssh::SshHandler;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

use crate::error::FetchError;
use crate::probe::ProbeResult;
use crate::target::Target;

/// Bytes flowing out of a session read.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

/// Capabilities a handler advertises for a given target. A handler
/// claiming several schemes may answer differently per scheme.
#[derive(Debug, Clone, Copy)]
pub struct HandlerCaps {
    pub supports_range: bool,
    pub supports_resume: bool,
    /// Scheduler clamps the connection target to this for the fetch.
    pub max_concurrent_streams: Option<usize>,
}

impl Default for HandlerCaps {
    fn default() -> Self {
        Self {
            supports_range: true,
            supports_resume: true,
            max_concurrent_streams: None,
        }
    }
}

/// Options shared by every handler, resolved from the fetch request.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub timeout: Duration,
    pub proxy: Option<String>,
    pub verify_tls: bool,
    /// Pinned leaf-certificate SHA-256 per host, lowercase hex.
    pub pins: HashMap<String, String>,
    pub headers: Vec<(String, String)>,
    pub cookie: Option<String>,
    pub http3: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            timeout: crate::request::DEFAULT_TIMEOUT,
            proxy: None,
            verify_tls: true,
            pins: HashMap::new(),
            headers: Vec::new(),
            cookie: None,
            http3: false,
        }
    }
}

/// One protocol family. A handler claims a set of URL schemes and
/// produces sessions for them.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// URL schemes this handler claims.
    fn schemes(&self) -> &'static [&'static str];

    fn capabilities(&self, _target: &Target) -> HandlerCaps {
        HandlerCaps::default()
    }

    /// Metadata-only request: protocol, size, range support, validators,
    /// TLS details. Must not transfer the body.
    async fn probe(&self, target: &Target) -> Result<ProbeResult, FetchError>;

    /// Open a connection-like session. May be cheap for stateless
    /// protocols; the scheduler opens one per connection.
    async fn open(&self, target: &Target) -> Result<Box<dyn Session>, FetchError>;
}

/// An open connection to the target.
#[async_trait]
pub trait Session: Send {
    /// Stream exactly `length` bytes starting at `offset`. A short stream
    /// ends in EOF; the scheduler treats the shortfall as degradation.
    async fn read_range(&mut self, offset: u64, length: u64) -> Result<ByteStream, FetchError>;

    /// Stream the whole object to EOF.
    async fn read_all(&mut self) -> Result<ByteStream, FetchError>;

    async fn close(&mut self) {}
}

/// Scheme-to-handler table, injected into the fetch controller at
/// construction. Later registrations win, so plugins may override the
/// built-ins.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn ProtocolHandler>>,
}

impl HandlerRegistry {
    /// Registry with the built-in HTTP, FTP and SSH handlers.
    pub fn builtin(config: &HandlerConfig) -> Result<Self, FetchError> {
        let mut registry = Self { handlers: Vec::new() };
        registry.register(Arc::new(HttpHandler::new(config)?));
        registry.register(Arc::new(FtpHandler::new(config)));
        registry.register(Arc::new(SshHandler::new(config)));
        Ok(registry)
    }

    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.push(handler);
    }

    pub fn for_scheme(&self, scheme: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers
            .iter()
            .rev()
            .find(|h| h.schemes().contains(&scheme))
            .cloned()
    }

    pub fn for_target(&self, target: &Target) -> Result<Arc<dyn ProtocolHandler>, FetchError> {
        self.for_scheme(target.scheme())
            .ok_or_else(|| FetchError::UnsupportedScheme(target.scheme().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeHandler(&'static [&'static str]);

    #[async_trait]
    impl ProtocolHandler for FakeHandler {
        fn schemes(&self) -> &'static [&'static str] {
            self.0
        }

        async fn probe(&self, _target: &Target) -> Result<ProbeResult, FetchError> {
            unimplemented!()
        }

        async fn open(&self, _target: &Target) -> Result<Box<dyn Session>, FetchError> {
            unimplemented!()
        }
    }

    #[test]
    fn test_builtin_registry_claims_all_schemes() {
        let registry = HandlerRegistry::builtin(&HandlerConfig::default()).unwrap();
        for scheme in crate::target::BUILTIN_SCHEMES {
            assert!(registry.for_scheme(scheme).is_some(), "no handler for {scheme}");
        }
        assert!(registry.for_scheme("gopher").is_none());
    }

    #[test]
    fn test_later_registration_wins() {
        let mut registry = HandlerRegistry::builtin(&HandlerConfig::default()).unwrap();
        let plugin = Arc::new(FakeHandler(&["http", "dat"]));
        registry.register(plugin.clone());
        let resolved = registry.for_scheme("http").unwrap();
        assert_eq!(resolved.schemes(), plugin.schemes());
        assert!(registry.for_scheme("dat").is_some());
    }

    #[test]
    fn test_unknown_scheme_is_typed_error() {
        let registry = HandlerRegistry::builtin(&HandlerConfig::default()).unwrap();
        let target = Target::parse("gopher://example.com/x").unwrap();
        match registry.for_target(&target) {
            Err(FetchError::UnsupportedScheme(s)) => assert_eq!(s, "gopher"),
            Err(e) => panic!("unexpected error: {e:?}"),
            Ok(_) => panic!("expected an error, got Ok"),
        }
    }
}
