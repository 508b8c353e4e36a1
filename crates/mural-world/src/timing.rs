//! Tick interval tracking.

use std::time::{Duration, Instant};

/// Nominal tick interval, used as the starting average.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Smoothed time between consecutive ticks.
#[derive(Debug, Clone)]
pub struct TickTimer {
    /// Start of the previous tick
    last_tick: Instant,
    /// Moving average of the interval in milliseconds
    average_ms: f64,
    /// Ticks recorded
    ticks: u64,
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_INTERVAL)
    }
}

impl TickTimer {
    /// Creates a timer whose average starts at `nominal`.
    #[must_use]
    pub fn new(nominal: Duration) -> Self {
        Self {
            last_tick: Instant::now(),
            average_ms: nominal.as_secs_f64() * 1000.0,
            ticks: 0,
        }
    }

    /// Records a tick now. Returns the time since the previous one.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now - self.last_tick;
        self.last_tick = now;
        self.record(elapsed);
        elapsed
    }

    /// Folds one interval into the average: `avg = (elapsed + avg) / 2`.
    pub fn record(&mut self, elapsed: Duration) {
        self.average_ms = (elapsed.as_secs_f64() * 1000.0 + self.average_ms) / 2.0;
        self.ticks += 1;
    }

    /// Smoothed interval in milliseconds.
    #[must_use]
    pub fn average_ms(&self) -> f64 {
        self.average_ms
    }

    /// Ticks per second derived from the smoothed interval.
    #[must_use]
    pub fn tps(&self) -> f64 {
        if self.average_ms <= f64::EPSILON {
            return 0.0;
        }
        1000.0 / self.average_ms
    }

    /// Ticks recorded so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}
