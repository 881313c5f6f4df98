//! Runtime configuration of one worker.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables of the emulation engine. CLI flags and tests override the
/// defaults; everything here is fixed once the worker is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Timer tick, in milliseconds.
    pub tick_period_ms: u64,
    /// Frames drained from the transport per loop iteration.
    pub rx_batch: usize,
    /// Minimum timer callbacks processed per amortized wheel level.
    pub min_timer_events: u32,
    /// Cached buffers per mbuf pool bucket.
    pub mbuf_cache: u32,
    /// Buckets per timer-wheel level (power of two).
    pub wheel_size: u32,
    /// Level-1 divisor of the timer wheel (power of two).
    pub wheel_level1_div: u32,
    /// Timer-wheel levels (1..=4).
    pub wheel_levels: u8,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            tick_period_ms: 1,
            rx_batch: 64,
            min_timer_events: 64,
            mbuf_cache: 1024,
            wheel_size: 1024,
            wheel_level1_div: 16,
            wheel_levels: 2,
        }
    }
}

impl RuntimeConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn tick_period_sec(&self) -> f64 {
        self.tick_period_ms as f64 / 1000.0
    }
}
