//! Adaptive chunk sizing from the smoothed throughput trend. Plain state
//! with pure transitions; a constant-size policy slots in by constructing
//! with min == max.

/// Hard floor for a chunk, 256 KiB.
pub const MIN_CHUNK_SIZE: u64 = 256 * 1024;

/// Hard ceiling for a chunk, 16 MiB.
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Every fetch starts at 1 MiB.
pub const INITIAL_CHUNK_SIZE: u64 = 1024 * 1024;

/// Throughput must move by more than this fraction to trigger a resize.
const TREND_THRESHOLD: f64 = 0.20;

/// Emits the size for each future chunk. In-flight chunks keep the size
/// they were issued with.
#[derive(Debug)]
pub struct AdaptiveChunker {
    current: u64,
    min: u64,
    max: u64,
    /// Smoothed rate observed when the size last changed.
    rate_at_last_change: Option<f64>,
}

/// Largest power of two <= n, clamped into the legal chunk window.
fn clamp_pow2(n: u64, min: u64, max: u64) -> u64 {
    let mut p = min;
    while p * 2 <= n && p * 2 <= max {
        p *= 2;
    }
    p
}

impl AdaptiveChunker {
    /// Build with user-supplied bounds. Bounds are clamped into
    /// [256 KiB, 16 MiB] and normalized to powers of two.
    pub fn new(min: u64, max: u64) -> Self {
        let min = clamp_pow2(min.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE), MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        let max = clamp_pow2(max.clamp(min, MAX_CHUNK_SIZE), min, MAX_CHUNK_SIZE);
        Self {
            current: INITIAL_CHUNK_SIZE.clamp(min, max),
            min,
            max,
            rate_at_last_change: None,
        }
    }

    /// Size for the next chunk, given the latest smoothed throughput.
    pub fn next_size(&mut self, smoothed_rate: Option<f64>) -> u64 {
        let Some(rate) = smoothed_rate else {
            return self.current;
        };
        match self.rate_at_last_change {
            None => {
                // First observation becomes the baseline.
                self.rate_at_last_change = Some(rate);
            }
            Some(baseline) if baseline > 0.0 => {
                if rate > baseline * (1.0 + TREND_THRESHOLD) && self.current < self.max {
                    self.current *= 2;
                    self.rate_at_last_change = Some(rate);
                } else if rate < baseline * (1.0 - TREND_THRESHOLD) && self.current > self.min {
                    self.current /= 2;
                    self.rate_at_last_change = Some(rate);
                }
            }
            Some(_) => {
                self.rate_at_last_change = Some(rate);
            }
        }
        self.current
    }

    pub fn current_size(&self) -> u64 {
        self.current
    }

    pub fn min_size(&self) -> u64 {
        self.min
    }

    pub fn max_size(&self) -> u64 {
        self.max
    }
}

impl Default for AdaptiveChunker {
    fn default() -> Self {
        Self::new(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_chunk_is_one_mib() {
        let mut c = AdaptiveChunker::default();
        assert_eq!(c.next_size(None), INITIAL_CHUNK_SIZE);
    }

    #[test]
    fn test_doubles_on_improving_rate() {
        let mut c = AdaptiveChunker::default();
        assert_eq!(c.next_size(Some(1000.0)), INITIAL_CHUNK_SIZE);
        // +30% over baseline
        assert_eq!(c.next_size(Some(1300.0)), 2 * INITIAL_CHUNK_SIZE);
        // another +30%
        assert_eq!(c.next_size(Some(1690.0)), 4 * INITIAL_CHUNK_SIZE);
    }

    #[test]
    fn test_halves_on_falling_rate() {
        let mut c = AdaptiveChunker::default();
        c.next_size(Some(1000.0));
        assert_eq!(c.next_size(Some(700.0)), INITIAL_CHUNK_SIZE / 2);
    }

    #[test]
    fn test_small_drift_keeps_size() {
        let mut c = AdaptiveChunker::default();
        c.next_size(Some(1000.0));
        assert_eq!(c.next_size(Some(1100.0)), INITIAL_CHUNK_SIZE);
        assert_eq!(c.next_size(Some(900.0)), INITIAL_CHUNK_SIZE);
    }

    #[test]
    fn test_size_stays_power_of_two_within_bounds() {
        let mut c = AdaptiveChunker::default();
        let mut rate = 100.0;
        for _ in 0..40 {
            rate *= 1.5;
            let size = c.next_size(Some(rate));
            assert!(size.is_power_of_two());
            assert!((MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&size));
        }
        assert_eq!(c.current_size(), MAX_CHUNK_SIZE);
        for _ in 0..40 {
            rate *= 0.5;
            let size = c.next_size(Some(rate));
            assert!(size.is_power_of_two());
            assert!((MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&size));
        }
        assert_eq!(c.current_size(), MIN_CHUNK_SIZE);
    }

    #[test]
    fn test_bounds_normalized_to_powers_of_two() {
        let c = AdaptiveChunker::new(300 * 1024, 5 * 1024 * 1024);
        assert!(c.min_size().is_power_of_two());
        assert!(c.max_size().is_power_of_two());
        assert!(c.min_size() >= MIN_CHUNK_SIZE);
        assert!(c.max_size() <= MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_constant_policy_when_min_equals_max() {
        let mut c = AdaptiveChunker::new(MIN_CHUNK_SIZE, MIN_CHUNK_SIZE);
        c.next_size(Some(1000.0));
        assert_eq!(c.next_size(Some(9000.0)), MIN_CHUNK_SIZE);
    }
}
