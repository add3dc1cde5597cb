//! Online bandwidth estimation: sliding sample window plus an EMA over
//! per-sample rates. Feeds the chunker, the optimizer, and progress ETA.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples kept in the sliding window.
const WINDOW_CAPACITY: usize = 30;

/// EMA smoothing factor applied to per-sample rates.
const SMOOTHING_ALPHA: f64 = 0.3;

/// Rates below this are treated as zero for ETA purposes.
const RATE_EPSILON: f64 = 1.0;

/// ETA is unknown until this many samples have been recorded.
const MIN_SAMPLES_FOR_ETA: usize = 3;

#[derive(Debug, Clone, Copy)]
struct TransferSample {
    bytes: u64,
    elapsed: Duration,
}

/// Sliding-window throughput estimator. One instance per fetch; all
/// methods are non-suspending and O(1) except the windowed sum.
#[derive(Debug)]
pub struct BandwidthEstimator {
    window: VecDeque<TransferSample>,
    smoothed: Option<f64>,
    last_record: Instant,
    total_bytes: u64,
}

impl BandwidthEstimator {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW_CAPACITY),
            smoothed: None,
            last_record: Instant::now(),
            total_bytes: 0,
        }
    }

    /// Record bytes transferred since the previous call.
    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_record);
        self.last_record = now;
        self.record_sample(bytes, elapsed);
    }

    /// Record with an explicit elapsed interval. Samples with a
    /// non-positive interval are ignored.
    pub fn record_sample(&mut self, bytes: u64, elapsed: Duration) {
        if elapsed.is_zero() {
            return;
        }
        if self.window.len() == WINDOW_CAPACITY {
            self.window.pop_front();
        }
        self.window.push_back(TransferSample { bytes, elapsed });
        self.total_bytes = self.total_bytes.saturating_add(bytes);

        let rate = bytes as f64 / elapsed.as_secs_f64();
        self.smoothed = Some(match self.smoothed {
            Some(prev) => SMOOTHING_ALPHA * rate + (1.0 - SMOOTHING_ALPHA) * prev,
            None => rate,
        });
    }

    /// Bytes per second over the whole window.
    pub fn instant_rate(&self) -> f64 {
        let elapsed: f64 = self.window.iter().map(|s| s.elapsed.as_secs_f64()).sum();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let bytes: u64 = self.window.iter().map(|s| s.bytes).sum();
        bytes as f64 / elapsed
    }

    /// EMA-smoothed bytes per second. None until the first sample.
    pub fn smoothed_rate(&self) -> Option<f64> {
        self.smoothed
    }

    /// Estimated time to transfer `remaining` bytes, or None while the
    /// estimate is not yet trustworthy.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        if self.window.len() < MIN_SAMPLES_FOR_ETA {
            return None;
        }
        let rate = self.smoothed?;
        if rate < RATE_EPSILON {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn sample_count(&self) -> usize {
        self.window.len()
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_elapsed_ignored() {
        let mut est = BandwidthEstimator::new();
        est.record_sample(1024, Duration::ZERO);
        assert_eq!(est.sample_count(), 0);
        assert!(est.smoothed_rate().is_none());
    }

    #[test]
    fn test_steady_rate_converges() {
        let mut est = BandwidthEstimator::new();
        for _ in 0..10 {
            est.record_sample(1_000_000, Duration::from_secs(1));
        }
        let rate = est.smoothed_rate().unwrap();
        assert!((rate - 1_000_000.0).abs() < 1.0);
        assert!((est.instant_rate() - 1_000_000.0).abs() < 1.0);
    }

    #[test]
    fn test_ema_tracks_change() {
        let mut est = BandwidthEstimator::new();
        est.record_sample(1_000_000, Duration::from_secs(1));
        est.record_sample(2_000_000, Duration::from_secs(1));
        // 0.3 * 2M + 0.7 * 1M
        let rate = est.smoothed_rate().unwrap();
        assert!((rate - 1_300_000.0).abs() < 1.0);
    }

    #[test]
    fn test_eta_requires_three_samples() {
        let mut est = BandwidthEstimator::new();
        est.record_sample(1_000_000, Duration::from_secs(1));
        est.record_sample(1_000_000, Duration::from_secs(1));
        assert!(est.eta(5_000_000).is_none());
        est.record_sample(1_000_000, Duration::from_secs(1));
        let eta = est.eta(5_000_000).unwrap();
        assert!((eta.as_secs_f64() - 5.0).abs() < 0.1);
    }

    #[test]
    fn test_eta_unknown_at_zero_rate() {
        let mut est = BandwidthEstimator::new();
        for _ in 0..5 {
            est.record_sample(0, Duration::from_secs(1));
        }
        assert!(est.eta(1).is_none());
    }

    #[test]
    fn test_window_capacity_bounded() {
        let mut est = BandwidthEstimator::new();
        for _ in 0..100 {
            est.record_sample(1, Duration::from_millis(10));
        }
        assert_eq!(est.sample_count(), 30);
        assert_eq!(est.total_bytes(), 100);
    }
}
