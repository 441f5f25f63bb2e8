//! Named circuit breakers: a three-state gate that short-circuits calls to
//! a failing resource.
//!
//! One breaker per named resource (e.g. `github-api`), shared process-wide
//! through [`BreakerRegistry`]. The state machine:
//!
//! ```text
//! Closed   -> Open      (window failure count, or slow-call rate, trips)
//! Open     -> HalfOpen  (after `timeout` has elapsed)
//! HalfOpen -> Closed    (`success_threshold` consecutive successes)
//! HalfOpen -> Open      (any failure; the open timer resets)
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Observer invoked on every state transition: `(name, from, to)`.
pub type TransitionObserver = Arc<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

/// Tuning knobs for one breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures in the rolling window that trip Closed -> Open.
    pub failure_threshold: usize,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: usize,
    /// How long Open rejects calls before probing.
    pub timeout: Duration,
    /// Probe calls admitted concurrently while half-open.
    pub max_concurrent_calls: usize,
    /// A call at or above this duration counts as slow.
    pub slow_call_threshold: Duration,
    /// Slow-call fraction that trips the breaker (with at least
    /// `failure_threshold` recent calls observed).
    pub slow_call_rate_threshold: f64,
    /// Rolling window capacity.
    pub window_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            max_concurrent_calls: 1,
            slow_call_threshold: Duration::from_secs(10),
            slow_call_rate_threshold: 0.8,
            window_size: 20,
        }
    }
}

/// Rejection returned when the breaker is not admitting calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BreakerError {
    #[error("circuit breaker '{name}' is open; retry in {retry_in:?}")]
    Open { name: String, retry_in: Duration },

    #[error("circuit breaker '{name}' is half-open and at its probe limit")]
    ProbeLimit { name: String },
}

/// One recorded call outcome in the rolling window.
#[derive(Debug, Clone, Copy)]
struct CallResult {
    success: bool,
    duration: Duration,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    window: VecDeque<CallResult>,
    /// When the breaker last entered Open.
    opened_at: Option<Instant>,
    half_open_in_flight: usize,
    half_open_successes: usize,
    trip_count: u64,
}

/// Point-in-time view of a breaker for observability.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub window_len: usize,
    pub failure_count: usize,
    pub slow_count: usize,
    pub trip_count: u64,
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    observer: RwLock<Option<TransitionObserver>>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_owned(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
                trip_count: 0,
            }),
            observer: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the transition observer (replacing any previous one).
    ///
    /// The observer runs with the breaker's internal lock held and must not
    /// call back into this breaker.
    pub fn set_observer(&self, observer: TransitionObserver) {
        *self.observer.write().expect("observer lock poisoned") = Some(observer);
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Ask for admission. Must be paired with exactly one
    /// [`Self::record_success`] or [`Self::record_failure`] when admitted.
    pub fn try_acquire(&self) -> Result<(), BreakerError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    Ok(())
                } else {
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                        retry_in: self.config.timeout.saturating_sub(elapsed),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.max_concurrent_calls {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(BreakerError::ProbeLimit {
                        name: self.name.clone(),
                    })
                }
            }
        }
    }

    pub fn record_success(&self, duration: Duration) {
        self.record(CallResult {
            success: true,
            duration,
        });
    }

    pub fn record_failure(&self, duration: Duration) {
        self.record(CallResult {
            success: false,
            duration,
        });
    }

    /// Release an admission without recording an outcome. Used when the
    /// caller's context was cancelled mid-call: cancellation says nothing
    /// about the resource's health.
    pub fn record_discard(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Snapshot for metrics and health derivation.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            window_len: inner.window.len(),
            failure_count: inner.window.iter().filter(|c| !c.success).count(),
            slow_count: inner
                .window
                .iter()
                .filter(|c| c.duration >= self.config.slow_call_threshold)
                .count(),
            trip_count: inner.trip_count,
        }
    }

    fn record(&self, result: CallResult) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if result.success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.success_threshold {
                        self.transition(&mut inner, BreakerState::Closed);
                    }
                } else {
                    // One failed probe re-opens and restarts the timer.
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::Closed => {
                inner.window.push_back(result);
                while inner.window.len() > self.config.window_size {
                    inner.window.pop_front();
                }
                if self.should_trip(&inner) {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::Open => {
                // A straggler from before the trip; the window is already
                // cleared, nothing to account.
            }
        }
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        let failures = inner.window.iter().filter(|c| !c.success).count();
        if failures >= self.config.failure_threshold {
            return true;
        }
        if inner.window.len() >= self.config.failure_threshold {
            let slow = inner
                .window
                .iter()
                .filter(|c| c.duration >= self.config.slow_call_threshold)
                .count();
            let rate = slow as f64 / inner.window.len() as f64;
            if rate >= self.config.slow_call_rate_threshold {
                return true;
            }
        }
        false
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.window.clear();
        inner.half_open_in_flight = 0;
        inner.half_open_successes = 0;
        match to {
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.trip_count += 1;
            }
            BreakerState::Closed | BreakerState::HalfOpen => {}
        }

        tracing::info!(breaker = %self.name, from = %from, to = %to, "circuit state transition");

        let observer = self
            .observer
            .read()
            .expect("observer lock poisoned")
            .clone();
        if let Some(observer) = observer {
            observer(&self.name, from, to);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-wide collection of breakers, keyed by resource name.
///
/// Shared by transport and the recovery orchestrator so both observe the
/// same gate for a given resource.
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    observer: RwLock<Option<TransitionObserver>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
            observer: RwLock::new(None),
        }
    }

    /// Observer applied to every breaker created from here on.
    pub fn set_observer(&self, observer: TransitionObserver) {
        *self.observer.write().expect("registry lock poisoned") = Some(observer.clone());
        for breaker in self
            .breakers
            .read()
            .expect("registry lock poisoned")
            .values()
        {
            breaker.set_observer(observer.clone());
        }
    }

    /// Fetch the breaker for `name`, creating it with the default config on
    /// first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(found) = self
            .breakers
            .read()
            .expect("registry lock poisoned")
            .get(name)
        {
            return found.clone();
        }

        let mut breakers = self.breakers.write().expect("registry lock poisoned");
        breakers
            .entry(name.to_owned())
            .or_insert_with(|| {
                let breaker = Arc::new(CircuitBreaker::new(name, self.default_config.clone()));
                if let Some(observer) = self
                    .observer
                    .read()
                    .expect("registry lock poisoned")
                    .clone()
                {
                    breaker.set_observer(observer);
                }
                breaker
            })
            .clone()
    }

    /// Snapshots of every registered breaker.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(|b| b.snapshot())
            .collect()
    }

    /// How many breakers are currently open.
    pub fn open_count(&self) -> usize {
        self.breakers
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|b| b.state() == BreakerState::Open)
            .count()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .breakers
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        f.debug_struct("BreakerRegistry")
            .field("breakers", &names)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            timeout: Duration::from_millis(100),
            max_concurrent_calls: 1,
            slow_call_threshold: Duration::from_secs(10),
            slow_call_rate_threshold: 0.8,
            window_size: 10,
        }
    }

    fn ok(breaker: &CircuitBreaker) {
        breaker.try_acquire().unwrap();
        breaker.record_success(Duration::from_millis(5));
    }

    fn fail(breaker: &CircuitBreaker) {
        breaker.try_acquire().unwrap();
        breaker.record_failure(Duration::from_millis(5));
    }

    #[test]
    fn trips_open_at_failure_threshold() {
        let breaker = CircuitBreaker::new("t", fast_config());
        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Closed);
        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.snapshot().trip_count, 1);
    }

    #[test]
    fn open_rejects_without_admitting() {
        let breaker = CircuitBreaker::new("t", fast_config());
        fail(&breaker);
        fail(&breaker);

        let rejected = breaker.try_acquire();
        assert!(matches!(rejected, Err(BreakerError::Open { .. })));
    }

    #[test]
    fn full_trip_and_recovery_sequence() {
        let breaker = CircuitBreaker::new("t", fast_config());

        // Closed -> Open after two failures.
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);

        // Rejected while the open timer runs.
        assert!(breaker.try_acquire().is_err());

        // Open -> HalfOpen after the timeout, then -> Closed on success.
        std::thread::sleep(Duration::from_millis(110));
        breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success(Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("t", fast_config());
        fail(&breaker);
        fail(&breaker);
        std::thread::sleep(Duration::from_millis(110));

        breaker.try_acquire().unwrap();
        breaker.record_failure(Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.snapshot().trip_count, 2);

        // The open timer restarted: still rejecting immediately after.
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn half_open_limits_concurrent_probes() {
        let mut config = fast_config();
        config.max_concurrent_calls = 2;
        config.success_threshold = 3;
        let breaker = CircuitBreaker::new("t", config);
        fail(&breaker);
        fail(&breaker);
        std::thread::sleep(Duration::from_millis(110));

        breaker.try_acquire().unwrap(); // transition + first probe
        breaker.try_acquire().unwrap(); // second probe
        assert!(matches!(
            breaker.try_acquire(),
            Err(BreakerError::ProbeLimit { .. })
        ));

        // Finishing a probe frees a slot.
        breaker.record_success(Duration::from_millis(5));
        breaker.try_acquire().unwrap();
    }

    #[test]
    fn slow_call_rate_trips() {
        let config = BreakerConfig {
            failure_threshold: 4,
            slow_call_threshold: Duration::from_millis(50),
            slow_call_rate_threshold: 0.75,
            ..fast_config()
        };
        let breaker = CircuitBreaker::new("t", config);

        // Four successful but slow calls: 100% slow rate over >= 4 calls.
        for _ in 0..4 {
            breaker.try_acquire().unwrap();
            breaker.record_success(Duration::from_millis(60));
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn slow_rate_needs_minimum_calls() {
        let config = BreakerConfig {
            failure_threshold: 4,
            slow_call_threshold: Duration::from_millis(50),
            slow_call_rate_threshold: 0.5,
            ..fast_config()
        };
        let breaker = CircuitBreaker::new("t", config);

        // Three slow calls: under the minimum observation count, stays closed.
        for _ in 0..3 {
            breaker.try_acquire().unwrap();
            breaker.record_success(Duration::from_millis(60));
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn observer_sees_transitions() {
        let breaker = CircuitBreaker::new("t", fast_config());
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = transitions.clone();
        breaker.set_observer(Arc::new(move |name, from, to| {
            sink.lock().unwrap().push((name.to_string(), from, to));
        }));

        fail(&breaker);
        fail(&breaker);
        std::thread::sleep(Duration::from_millis(110));
        ok(&breaker);

        let seen = transitions.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("t".to_string(), BreakerState::Closed, BreakerState::Open),
                ("t".to_string(), BreakerState::Open, BreakerState::HalfOpen),
                ("t".to_string(), BreakerState::HalfOpen, BreakerState::Closed),
            ]
        );
    }

    #[test]
    fn registry_shares_breakers_by_name() {
        let registry = BreakerRegistry::default();
        let a = registry.get_or_create("github-api");
        let b = registry.get_or_create("github-api");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.snapshots().len(), 1);
    }

    #[test]
    fn registry_open_count_tracks_state() {
        let registry = BreakerRegistry::new(fast_config());
        let breaker = registry.get_or_create("gitlab-api");
        assert_eq!(registry.open_count(), 0);

        fail(&breaker);
        fail(&breaker);
        assert_eq!(registry.open_count(), 1);
    }

    #[test]
    fn registry_observer_applies_to_existing_and_new() {
        let registry = BreakerRegistry::new(fast_config());
        let existing = registry.get_or_create("a");

        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        registry.set_observer(Arc::new(move |_, _, _| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        let created_after = registry.get_or_create("b");
        fail(&existing);
        fail(&existing);
        fail(&created_after);
        fail(&created_after);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
