//! Reconnect backoff with jitter

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay for the first retry
    pub base_ms: u64,
    /// Upper bound on the un-jittered delay
    pub max_ms: u64,
    /// Lower bound of the jitter factor (inclusive)
    pub jitter_min: f64,
    /// Upper bound of the jitter factor (exclusive)
    pub jitter_max: f64,
    /// Fixed delay after a non-transport failure
    pub unexpected_retry_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 250,
            max_ms: 30_000,
            jitter_min: 0.8,
            jitter_max: 1.2,
            unexpected_retry_ms: 1_000,
        }
    }
}

/// Exponential backoff calculator.
///
/// The un-jittered delay for attempt `k` is `min(max, base * 2^k)`; the
/// returned delay scales it by a factor drawn from `[jitter_min, jitter_max)`.
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic jitter for tests and replays.
    pub fn with_seed(config: BackoffConfig, seed: u64) -> Self {
        Self {
            config,
            attempt: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Un-jittered delay for a given attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        // 2^attempt overflows quickly; past 63 the cap has long been reached.
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let ms = self
            .config
            .base_ms
            .saturating_mul(factor)
            .min(self.config.max_ms);
        Duration::from_millis(ms)
    }

    /// Delay before the next reconnect attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        let jitter = if self.config.jitter_min < self.config.jitter_max {
            self.rng
                .gen_range(self.config.jitter_min..self.config.jitter_max)
        } else {
            self.config.jitter_min
        };
        self.attempt = self.attempt.saturating_add(1);
        base.mul_f64(jitter.max(0.0))
    }

    /// Reset after a successful (re)connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn unexpected_retry_delay(&self) -> Duration {
        Duration::from_millis(self.config.unexpected_retry_ms)
    }
}
