//! Monotonic time sources
//!
//! Routing decisions only ever compare two readings of the same clock, so a
//! clock here is an offset from an arbitrary origin rather than wall time.
//! `ManualClock` lets tests step time deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// A monotonic time source.
pub trait Clock: Send + Sync {
    /// Elapsed time since the clock's origin. Never decreases.
    fn now(&self) -> Duration;
}

/// Clock backed by `tokio::time::Instant`.
///
/// Follows tokio's paused time in tests, so backoff sleeps and request age
/// advance together.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.now_ns
            .fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }

    /// Jump to an absolute offset. Earlier offsets are ignored.
    pub fn set(&self, to: Duration) {
        self.now_ns.fetch_max(to.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.now_ns.load(Ordering::Acquire))
    }
}
