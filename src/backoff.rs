//! Exponential backoff with bounded jitter

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Retry delay policy
///
/// `base_delay(n)` doubles from `base` on every attempt and saturates at
/// `cap`. `delay(n)` spreads that value uniformly by `±jitter` so that many
/// consumers retrying against the same outage do not retry in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
    jitter: f64,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base_ms: config.base_ms.max(1),
            cap_ms: config.cap_ms.max(config.base_ms.max(1)),
            jitter: config.jitter.clamp(0.0, 0.99),
        }
    }

    /// Un-jittered delay for a 1-based attempt number; attempt 0 is immediate
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = (self.base_ms as f64) * 2f64.powi(exp);
        Duration::from_millis(scaled.min(self.cap_ms as f64) as u64)
    }

    /// Jittered delay for a 1-based attempt number
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        if base == 0.0 {
            return Duration::ZERO;
        }

        let spread = base * self.jitter;
        if spread < 1.0 {
            return Duration::from_millis(base as u64);
        }

        let lower = (base - spread).max(1.0);
        let upper = base + spread;
        Duration::from_millis(rng.gen_range(lower..=upper).round() as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}
