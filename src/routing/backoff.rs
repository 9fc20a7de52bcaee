//! Exponential backoff between retry attempts

use crate::config::RouterConfig;
use std::time::Duration;

/// Delay schedule: `base * multiplier^n`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSchedule {
    base: Duration,
    multiplier: f64,
    max: Duration,
}

impl BackoffSchedule {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier,
            max,
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        Self::new(
            config.backoff_base,
            config.backoff_multiplier,
            config.backoff_max,
        )
    }

    /// Delay before the `n`-th backoff (0-based).
    pub fn delay(&self, n: u32) -> Duration {
        let exponent = n.min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max
        }
    }
}
