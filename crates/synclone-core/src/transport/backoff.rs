//! Backoff delay computation shared by the transport retry loop, the
//! scheduler's retry channel, and the recovery orchestrator's Retry
//! strategy.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Shape of the delay curve across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base` for every attempt.
    Fixed,
    /// `base × (attempt + 1)`.
    Linear,
    /// `base × factor^attempt`.
    Exponential,
    /// Exponential with ±`jitter_factor` noise applied.
    ExponentialJitter,
}

/// A complete backoff policy: strategy plus bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Jitter amplitude as a fraction of the nominal delay (0.25 = ±25%).
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::ExponentialJitter,
            base: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// The nominal (jitter-free) delay before retry number `attempt`
    /// (0-based), capped at `max_delay`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_secs_f64();
        let raw = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * (attempt as f64 + 1.0),
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialJitter => {
                base * self.factor.powi(attempt as i32)
            }
        };
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    /// The delay actually slept: nominal, with ±`jitter_factor` noise for
    /// the jittered strategy.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        match self.strategy {
            BackoffStrategy::ExponentialJitter => apply_jitter(nominal, self.jitter_factor),
            _ => nominal,
        }
    }

    /// Upper bound on any delay this policy can produce.
    pub fn max_possible_delay(&self) -> Duration {
        let jitter = match self.strategy {
            BackoffStrategy::ExponentialJitter => self.jitter_factor,
            _ => 0.0,
        };
        Duration::from_secs_f64(self.max_delay.as_secs_f64() * (1.0 + jitter))
    }
}

/// Add uniform noise in `[-factor, +factor] × delay`.
pub fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || delay.is_zero() {
        return delay;
    }
    let amplitude = delay.as_secs_f64() * factor;
    let offset = rand::rng().random_range(-amplitude..=amplitude);
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
}
