//! The fetch request record handed to the controller, and the terminal
//! outcome record handed back.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::chunker::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::error::FetchErrorKind;
use crate::optimizer::MAX_CONNECTIONS;

/// Default per-chunk read timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the fetched bytes go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Assemble on disk at this path (atomically renamed at finalize).
    File(PathBuf),
    /// Stream to standard output; no assembly file, no resume.
    Stdout,
}

/// A fetch request. One URL for a plain fetch; several for MIRROR mode.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub urls: Vec<String>,
    pub output: OutputTarget,
    pub max_connections: usize,
    pub min_chunk: u64,
    pub max_chunk: u64,
    pub timeout: Duration,
    pub proxy: Option<String>,
    pub verify_tls: bool,
    /// Pinned leaf-certificate SHA-256 per host, lowercase hex.
    pub pins: HashMap<String, String>,
    pub expected_sha256: Option<String>,
    pub resume: bool,
    /// Pre-resolved request headers, applied verbatim.
    pub headers: Vec<(String, String)>,
    pub cookie: Option<String>,
    /// Attempt HTTP/3 when the server advertises it.
    pub http3: bool,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, output: OutputTarget) -> Self {
        Self {
            urls: vec![url.into()],
            output,
            max_connections: MAX_CONNECTIONS,
            min_chunk: MIN_CHUNK_SIZE,
            max_chunk: MAX_CHUNK_SIZE,
            timeout: DEFAULT_TIMEOUT,
            proxy: None,
            verify_tls: true,
            pins: HashMap::new(),
            expected_sha256: None,
            resume: false,
            headers: Vec::new(),
            cookie: None,
            http3: false,
        }
    }

    pub fn mirror(urls: Vec<String>, output: OutputTarget) -> Self {
        let mut req = Self::new(String::new(), output);
        req.urls = urls;
        req
    }
}

/// Successful terminal record.
#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub bytes: u64,
    #[serde(with = "secs_f64")]
    pub duration: Duration,
    /// Bytes per second over the whole transfer.
    pub avg_throughput: f64,
    pub sha256: String,
    pub protocol_used: String,
    pub connections_used: usize,
}

/// Failed terminal record.
#[derive(Debug, Serialize)]
pub struct FetchFailure {
    pub kind: FetchErrorKind,
    pub message: String,
    pub partial_bytes: u64,
    /// True iff the partial file is consistent and validators are known.
    pub can_resume: bool,
}

/// Terminal result of one fetch.
#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FetchOutcome {
    Success(FetchSummary),
    Failure(FetchFailure),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }
}

mod secs_f64 {
    use super::Duration;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let req = FetchRequest::new("https://example.com/x", OutputTarget::Stdout);
        assert_eq!(req.max_connections, MAX_CONNECTIONS);
        assert!(req.verify_tls);
        assert!(!req.resume);
        assert_eq!(req.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_outcome_json_shape() {
        let outcome = FetchOutcome::Failure(FetchFailure {
            kind: FetchErrorKind::IntegrityMismatch,
            message: "digest differs".into(),
            partial_bytes: 0,
            can_resume: false,
        });
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"result\":\"failure\""));
        assert!(json.contains("\"integrity_mismatch\""));
    }
}
