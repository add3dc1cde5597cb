//! Target-concurrency controller. Evaluated on a monitor tick and on
//! throttle events; the decision is advisory and applied lazily by the
//! scheduler's permit pool.

use std::time::Duration;

/// Absolute ceiling on concurrent connections.
pub const MAX_CONNECTIONS: usize = 32;

/// Initial target is min(8, configured max).
const INITIAL_TARGET: usize = 8;

/// Throughput must move by more than this fraction between ticks to
/// adjust the target.
const TICK_THRESHOLD: f64 = 0.10;

/// Interval between monitor ticks.
pub const TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Direction of the last adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Steady,
}

/// Why the target changed, reported through the event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustReason {
    ThroughputUp,
    ThroughputDown,
    Throttled,
}

impl AdjustReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustReason::ThroughputUp => "throughput_up",
            AdjustReason::ThroughputDown => "throughput_down",
            AdjustReason::Throttled => "throttled",
        }
    }
}

/// Owns the target concurrency N within [1, max].
#[derive(Debug)]
pub struct ConnectionOptimizer {
    target: usize,
    max: usize,
    last_rate: Option<f64>,
    last_direction: Direction,
    /// Ticks to ignore after a throttle event.
    suppressed_ticks: u8,
}

impl ConnectionOptimizer {
    pub fn new(configured_max: usize) -> Self {
        let max = configured_max.clamp(1, MAX_CONNECTIONS);
        Self {
            target: INITIAL_TARGET.min(max),
            max,
            last_rate: None,
            last_direction: Direction::Steady,
            suppressed_ticks: 0,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn last_direction(&self) -> Direction {
        self.last_direction
    }

    /// Lower the ceiling, e.g. to a handler's max_concurrent_streams.
    pub fn clamp_max(&mut self, cap: usize) {
        self.max = self.max.min(cap.max(1));
        self.target = self.target.min(self.max);
    }

    /// Monitor tick: compare the smoothed rate against the previous tick
    /// and nudge the target by one. Returns the new target when changed.
    pub fn on_tick(&mut self, smoothed_rate: Option<f64>) -> Option<(usize, AdjustReason)> {
        if self.suppressed_ticks > 0 {
            self.suppressed_ticks -= 1;
            return None;
        }
        let rate = smoothed_rate?;
        let previous = self.last_rate.replace(rate);
        let previous = previous?;
        if previous <= 0.0 {
            return None;
        }

        if rate > previous * (1.0 + TICK_THRESHOLD) && self.target < self.max {
            self.target += 1;
            self.last_direction = Direction::Up;
            Some((self.target, AdjustReason::ThroughputUp))
        } else if rate < previous * (1.0 - TICK_THRESHOLD) && self.target > 1 {
            self.target -= 1;
            self.last_direction = Direction::Down;
            Some((self.target, AdjustReason::ThroughputDown))
        } else {
            self.last_direction = Direction::Steady;
            None
        }
    }

    /// Server backoff observed: halve immediately and suppress the next
    /// two ticks so the halving is not undone before it takes effect.
    pub fn on_throttle(&mut self) -> usize {
        self.target = (self.target / 2).max(1);
        self.last_direction = Direction::Down;
        self.suppressed_ticks = 2;
        self.target
    }
}
