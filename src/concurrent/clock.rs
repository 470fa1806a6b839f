//! Wall-clock and monotonic time sources.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock time in milliseconds since the Unix epoch.
pub trait EpochClock: Send + Sync {
    fn time_ms(&self) -> u64;
}

/// Monotonic time in nanoseconds from an arbitrary origin.
pub trait NanoClock: Send + Sync {
    fn nano_time(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemEpochClock;

impl EpochClock for SystemEpochClock {
    fn time_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Monotonic clock anchored at construction time.
#[derive(Clone, Copy, Debug)]
pub struct SystemNanoClock {
    origin: Instant,
}

impl SystemNanoClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemNanoClock {
    fn default() -> Self {
        Self::new()
    }
}

impl NanoClock for SystemNanoClock {
    fn nano_time(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Wall-clock value sampled once per work cycle and reused for every
/// timestamp within that cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct CachedEpochClock {
    time_ms: u64,
}

impl CachedEpochClock {
    pub fn update(&mut self, now_ms: u64) {
        self.time_ms = now_ms;
    }

    pub fn time_ms(&self) -> u64 {
        self.time_ms
    }
}
