//! Structured events emitted by the engine. Renderers (progress bar,
//! JSON lines) are pure consumers living in the CLI crate.

use std::time::Duration;

use crate::plan::FetchPlan;
use crate::probe::ProbeResult;
use crate::request::FetchOutcome;

/// Sink for engine events. All methods default to no-ops so consumers
/// implement only what they render. Implementations must be cheap; they
/// are called from the transfer hot path.
pub trait EventSink: Send + Sync {
    fn on_probe(&self, _probe: &ProbeResult) {}
    fn on_plan(&self, _plan: &FetchPlan) {}
    fn on_chunk_landed(&self, _offset: u64, _length: u64, _duration: Duration) {}
    fn on_concurrency_changed(&self, _n: usize, _reason: &'static str) {}
    fn on_retry(&self, _category: &'static str, _delay: Duration, _attempt: u32) {}
    fn on_progress(&self, _bytes: u64, _total: Option<u64>, _rate: f64, _eta: Option<Duration>) {}
    fn on_complete(&self, _outcome: &FetchOutcome) {}
}

/// Sink that discards everything.
pub struct NullSink;

impl EventSink for NullSink {}
