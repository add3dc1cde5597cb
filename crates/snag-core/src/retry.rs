//! Maps transport errors to retry decisions. Transient failures back off
//! exponentially with full jitter; server backoff additionally emits a
//! throttle signal consumed by the connection optimizer.

use std::time::Duration;

use rand::Rng;

use crate::error::FetchError;

/// Attempts per chunk before the error is surfaced.
pub const MAX_ATTEMPTS: u32 = 5;

/// First-attempt backoff base.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Ceiling on any computed backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Retry-After values above this are ignored as insane.
const RETRY_AFTER_MAX: Duration = Duration::from_secs(120);

/// What the scheduler should do with a failed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryNow,
    RetryAfter(Duration),
    Fail,
}

/// Category tag carried for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    TransientNetwork,
    ServerBackoff,
    RangeDegraded,
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::TransientNetwork => "transient_network",
            ErrorCategory::ServerBackoff => "server_backoff",
            ErrorCategory::RangeDegraded => "range_degraded",
            ErrorCategory::Fatal => "fatal",
        }
    }
}

/// A classified error: the decision, its category, and whether the
/// optimizer must halve concurrency right away.
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub decision: RetryDecision,
    pub category: ErrorCategory,
    pub throttle: bool,
}

/// Per-fetch classifier. Stateless apart from its configured base; the
/// attempt counter lives on the chunk.
#[derive(Debug)]
pub struct RetryClassifier {
    base: Duration,
}

impl RetryClassifier {
    pub fn new() -> Self {
        Self { base: BACKOFF_BASE }
    }

    #[cfg(test)]
    fn with_base(base: Duration) -> Self {
        Self { base }
    }

    /// Classify `err` on attempt number `attempt` (1-based).
    pub fn classify(&self, err: &FetchError, attempt: u32) -> Classification {
        match err {
            FetchError::TransientNetwork(_) => {
                if attempt >= MAX_ATTEMPTS {
                    return Classification {
                        decision: RetryDecision::Fail,
                        category: ErrorCategory::TransientNetwork,
                        throttle: false,
                    };
                }
                Classification {
                    decision: RetryDecision::RetryAfter(self.backoff(attempt)),
                    category: ErrorCategory::TransientNetwork,
                    throttle: false,
                }
            }
            FetchError::ServerBackoff { retry_after, .. } => {
                if attempt >= MAX_ATTEMPTS {
                    return Classification {
                        decision: RetryDecision::Fail,
                        category: ErrorCategory::ServerBackoff,
                        throttle: true,
                    };
                }
                let delay = match retry_after {
                    Some(d) if *d <= RETRY_AFTER_MAX => *d,
                    _ => self.backoff(attempt),
                };
                Classification {
                    decision: RetryDecision::RetryAfter(delay),
                    category: ErrorCategory::ServerBackoff,
                    throttle: true,
                }
            }
            // Not retryable at chunk level; the controller may fall back
            // from PARALLEL to SINGLE.
            FetchError::ProtocolDegraded(_) => Classification {
                decision: RetryDecision::Fail,
                category: ErrorCategory::RangeDegraded,
                throttle: false,
            },
            // Everything else, hard request rejections included, fails
            // the fetch outright.
            _ => Classification {
                decision: RetryDecision::Fail,
                category: ErrorCategory::Fatal,
                throttle: false,
            },
        }
    }

    /// Exponential schedule with full jitter: uniform in [0, base * 2^(n-1)],
    /// capped at 30 s.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16));
        let capped = exp.min(BACKOFF_CAP);
        let jittered = rand::thread_rng().gen_range(0.0..=1.0) * capped.as_secs_f64();
        Duration::from_secs_f64(jittered)
    }
}

impl Default for RetryClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> FetchError {
        FetchError::TransientNetwork("connection reset".into())
    }

    #[test]
    fn test_transient_retries_until_cap() {
        let c = RetryClassifier::new();
        for attempt in 1..MAX_ATTEMPTS {
            let cls = c.classify(&transient(), attempt);
            assert!(matches!(cls.decision, RetryDecision::RetryAfter(_)));
            assert!(!cls.throttle);
        }
        let cls = c.classify(&transient(), MAX_ATTEMPTS);
        assert_eq!(cls.decision, RetryDecision::Fail);
    }

    #[test]
    fn test_backoff_jitter_within_exponential_envelope() {
        let c = RetryClassifier::with_base(Duration::from_millis(500));
        for _ in 0..100 {
            match c.classify(&transient(), 3).decision {
                RetryDecision::RetryAfter(d) => {
                    // base * 2^2 = 2 s
                    assert!(d <= Duration::from_secs(2));
                }
                other => panic!("unexpected decision {other:?}"),
            }
        }
    }

    #[test]
    fn test_backoff_capped_at_thirty_seconds() {
        let c = RetryClassifier::with_base(Duration::from_secs(20));
        for _ in 0..50 {
            if let RetryDecision::RetryAfter(d) = c.classify(&transient(), 4).decision {
                assert!(d <= Duration::from_secs(30));
            }
        }
    }

    #[test]
    fn test_server_backoff_honors_sane_retry_after() {
        let c = RetryClassifier::new();
        let err = FetchError::ServerBackoff {
            status: 429,
            retry_after: Some(Duration::from_secs(2)),
        };
        let cls = c.classify(&err, 1);
        assert_eq!(cls.decision, RetryDecision::RetryAfter(Duration::from_secs(2)));
        assert!(cls.throttle);
        assert_eq!(cls.category, ErrorCategory::ServerBackoff);
    }

    #[test]
    fn test_server_backoff_rejects_insane_retry_after() {
        let c = RetryClassifier::with_base(Duration::from_millis(500));
        let err = FetchError::ServerBackoff {
            status: 503,
            retry_after: Some(Duration::from_secs(600)),
        };
        match c.classify(&err, 1).decision {
            // Falls back to the exponential schedule, well under 600 s.
            RetryDecision::RetryAfter(d) => assert!(d <= Duration::from_millis(500)),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_range_degradation_fails_chunk_without_throttle() {
        let c = RetryClassifier::new();
        let cls = c.classify(&FetchError::ProtocolDegraded("200 for range".into()), 1);
        assert_eq!(cls.decision, RetryDecision::Fail);
        assert_eq!(cls.category, ErrorCategory::RangeDegraded);
        assert!(!cls.throttle);
    }

    #[test]
    fn test_fatal_errors_never_retried() {
        let c = RetryClassifier::new();
        let errs = [
            FetchError::TlsFailure("bad cert".into()),
            FetchError::UnsupportedScheme("gopher".into()),
            FetchError::RequestRejected { status: 403 },
            FetchError::Cancelled,
        ];
        for err in errs {
            let cls = c.classify(&err, 1);
            assert_eq!(cls.decision, RetryDecision::Fail);
            assert_eq!(cls.category, ErrorCategory::Fatal);
        }
    }
}
