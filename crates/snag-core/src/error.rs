//! Error types surfaced by the transfer engine.
//! Chunk-level transient errors never reach the caller; only errors that
//! terminate a fetch are propagated, tagged with partial-byte state.

use std::time::Duration;

use serde::Serialize;

/// Every way a fetch can fail, as seen by the caller.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// DNS, connect, or read timeout. Retried per chunk before surfacing.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// 429 or 503; carries the server's Retry-After when present.
    #[error("server asked to back off (HTTP {status})")]
    ServerBackoff {
        status: u16,
        retry_after: Option<Duration>,
    },

    /// Range request refused or truncated; the controller re-plans SINGLE.
    #[error("range transfer degraded: {0}")]
    ProtocolDegraded(String),

    /// Hard HTTP-level refusal (4xx outside the backoff/timeout set).
    /// Fails the fetch immediately, with no single-stream replan; reported
    /// to the caller under the protocol-degraded kind.
    #[error("server rejected the request (HTTP {status})")]
    RequestRejected { status: u16 },

    /// TLS handshake failed for a reason other than a timeout.
    #[error("TLS failure: {0}")]
    TlsFailure(String),

    /// A pin is configured for this host and the fingerprint differs.
    #[error("certificate pin mismatch for {host}: expected {expected}, got {actual}")]
    PinMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    /// Computed digest differs from the expected digest.
    #[error("integrity mismatch: expected sha256 {expected}, computed {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    /// Disk full, permission denied, rename failed.
    #[error("local I/O error: {0}")]
    LocalIo(#[from] std::io::Error),

    /// Caller-initiated cancellation.
    #[error("cancelled")]
    Cancelled,

    /// No protocol handler claims this URL scheme.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

/// Stable machine-readable label for each error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    TransientNetwork,
    ServerBackoff,
    ProtocolDegraded,
    TlsFailure,
    PinMismatch,
    IntegrityMismatch,
    LocalIo,
    Cancelled,
    UnsupportedScheme,
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::TransientNetwork(_) => FetchErrorKind::TransientNetwork,
            FetchError::ServerBackoff { .. } => FetchErrorKind::ServerBackoff,
            FetchError::ProtocolDegraded(_) => FetchErrorKind::ProtocolDegraded,
            FetchError::RequestRejected { .. } => FetchErrorKind::ProtocolDegraded,
            FetchError::TlsFailure(_) => FetchErrorKind::TlsFailure,
            FetchError::PinMismatch { .. } => FetchErrorKind::PinMismatch,
            FetchError::IntegrityMismatch { .. } => FetchErrorKind::IntegrityMismatch,
            FetchError::LocalIo(_) => FetchErrorKind::LocalIo,
            FetchError::Cancelled => FetchErrorKind::Cancelled,
            FetchError::UnsupportedScheme(_) => FetchErrorKind::UnsupportedScheme,
        }
    }

    /// True when no amount of retrying at any level can recover.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FetchError::RequestRejected { .. }
                | FetchError::TlsFailure(_)
                | FetchError::PinMismatch { .. }
                | FetchError::IntegrityMismatch { .. }
                | FetchError::LocalIo(_)
                | FetchError::UnsupportedScheme(_)
        )
    }

    /// Map a reqwest transport error onto the engine's categories.
    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return FetchError::TransientNetwork(err.to_string());
        }
        if let Some(status) = err.status() {
            return match status.as_u16() {
                429 | 503 => FetchError::ServerBackoff {
                    status: status.as_u16(),
                    retry_after: None,
                },
                _ => FetchError::TransientNetwork(err.to_string()),
            };
        }
        let text = err.to_string();
        if text.contains("certificate") || text.contains("tls") || text.contains("handshake") {
            FetchError::TlsFailure(text)
        } else {
            FetchError::TransientNetwork(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(FetchError::UnsupportedScheme("gopher".into()).is_fatal());
        assert!(FetchError::RequestRejected { status: 404 }.is_fatal());
        assert!(FetchError::PinMismatch {
            host: "h".into(),
            expected: "a".into(),
            actual: "b".into(),
        }
        .is_fatal());
        assert!(!FetchError::TransientNetwork("reset".into()).is_fatal());
        assert!(!FetchError::ServerBackoff { status: 429, retry_after: None }.is_fatal());
        // Range degradation recovers at plan level, not chunk level.
        assert!(!FetchError::ProtocolDegraded("short read".into()).is_fatal());
        assert!(!FetchError::Cancelled.is_fatal());
    }

    #[test]
    fn test_kind_labels_serialize_snake_case() {
        let kind = FetchError::ProtocolDegraded("short read".into()).kind();
        assert_eq!(
            serde_json::to_string(&kind).unwrap(),
            "\"protocol_degraded\""
        );
    }

    #[test]
    fn test_request_rejected_collapses_to_degraded_kind() {
        // Internal routing differs (no replan), the surfaced kind does not.
        let kind = FetchError::RequestRejected { status: 403 }.kind();
        assert_eq!(kind, FetchErrorKind::ProtocolDegraded);
    }
}
