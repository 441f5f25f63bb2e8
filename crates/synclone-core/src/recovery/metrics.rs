//! Recovery metrics and the derived health score.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-strategy counters with a moving-average duration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub uses: u64,
    pub successes: u64,
    pub failures: u64,
    /// Moving average over all recorded invocations.
    pub avg_duration: Duration,
}

impl StrategyStats {
    fn record(&mut self, success: bool, duration: Duration) {
        self.uses += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        // Incremental mean: avg += (x - avg) / n.
        let n = self.uses as f64;
        let delta = duration.as_secs_f64() - self.avg_duration.as_secs_f64();
        self.avg_duration =
            Duration::from_secs_f64((self.avg_duration.as_secs_f64() + delta / n).max(0.0));
    }
}

/// Aggregated recovery metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    pub per_strategy: BTreeMap<String, StrategyStats>,
    /// Calls rejected by an open breaker during recovery.
    pub breaker_rejections: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl RecoveryMetrics {
    pub fn record(&mut self, strategy: &str, success: bool, duration: Duration) {
        self.per_strategy
            .entry(strategy.to_owned())
            .or_default()
            .record(success, duration);
        self.last_updated = Some(Utc::now());
    }

    pub fn record_breaker_rejection(&mut self) {
        self.breaker_rejections += 1;
        self.last_updated = Some(Utc::now());
    }

    /// Overall recovery success rate across strategies; 1.0 when nothing
    /// has been recorded.
    pub fn success_rate(&self) -> f64 {
        let (successes, uses) = self
            .per_strategy
            .values()
            .fold((0u64, 0u64), |(s, u), stats| {
                (s + stats.successes, u + stats.uses)
            });
        if uses == 0 {
            1.0
        } else {
            successes as f64 / uses as f64
        }
    }
}

/// Health classification derived from recovery outcomes and breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// The overall health report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryHealth {
    pub status: HealthStatus,
    pub success_rate: f64,
    pub open_breakers: usize,
}

/// Healthy needs a >= 90% recovery success rate and no open breakers;
/// below 50%, or with more than two open breakers, the system is
/// unhealthy; everything between is degraded.
pub fn derive_health(metrics: &RecoveryMetrics, open_breakers: usize) -> RecoveryHealth {
    let success_rate = metrics.success_rate();
    let status = if success_rate < 0.5 || open_breakers > 2 {
        HealthStatus::Unhealthy
    } else if success_rate < 0.9 || open_breakers > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    RecoveryHealth {
        status,
        success_rate,
        open_breakers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_average_converges() {
        let mut stats = StrategyStats::default();
        stats.record(true, Duration::from_secs(2));
        stats.record(true, Duration::from_secs(4));
        assert_eq!(stats.avg_duration, Duration::from_secs(3));

        stats.record(false, Duration::from_secs(3));
        assert_eq!(stats.avg_duration, Duration::from_secs(3));
        assert_eq!(stats.uses, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn success_rate_defaults_to_one() {
        let metrics = RecoveryMetrics::default();
        assert_eq!(metrics.success_rate(), 1.0);
    }

    #[test]
    fn success_rate_spans_strategies() {
        let mut metrics = RecoveryMetrics::default();
        metrics.record("retry", true, Duration::from_millis(10));
        metrics.record("retry", true, Duration::from_millis(10));
        metrics.record("fallback", false, Duration::from_millis(10));
        metrics.record("auto_fix", true, Duration::from_millis(10));
        assert!((metrics.success_rate() - 0.75).abs() < 1e-9);
        assert!(metrics.last_updated.is_some());
    }

    #[test]
    fn health_thresholds() {
        let mut good = RecoveryMetrics::default();
        for _ in 0..10 {
            good.record("retry", true, Duration::from_millis(1));
        }
        assert_eq!(derive_health(&good, 0).status, HealthStatus::Healthy);
        assert_eq!(derive_health(&good, 1).status, HealthStatus::Degraded);
        assert_eq!(derive_health(&good, 3).status, HealthStatus::Unhealthy);

        let mut poor = RecoveryMetrics::default();
        poor.record("retry", true, Duration::from_millis(1));
        poor.record("retry", false, Duration::from_millis(1));
        poor.record("retry", false, Duration::from_millis(1));
        assert_eq!(derive_health(&poor, 0).status, HealthStatus::Unhealthy);
    }
}
