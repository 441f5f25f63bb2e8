//! The recovery orchestrator: given a classified [`UserError`] and the
//! failed operation, pick a strategy from the policy table and drive it.
//!
//! Policies match on error code or domain with exact, trailing-`*` prefix,
//! or catch-all `*` patterns; the highest-priority matching rule wins.

pub mod fallback;
pub mod metrics;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::breaker::BreakerRegistry;
use crate::error::solutions::SolutionEngine;
use crate::error::{ErrorCategory, ErrorDomain, UserError};
use crate::transport::backoff::{BackoffPolicy, BackoffStrategy};

use fallback::FallbackProvider;
use metrics::{RecoveryHealth, RecoveryMetrics, derive_health};

/// The recovery strategies a policy can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    Retry,
    CircuitBreaker,
    Fallback,
    GradualRecovery,
    AutoFix,
}

impl RecoveryStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::CircuitBreaker => "circuit_breaker",
            Self::Fallback => "fallback",
            Self::GradualRecovery => "gradual_recovery",
            Self::AutoFix => "auto_fix",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One policy entry. A rule matches when its error-code pattern matches the
/// error's code, or its domain pattern matches the error's domain.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub error_code_pattern: Option<String>,
    pub domain_pattern: Option<String>,
    pub strategy: RecoveryStrategy,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Per-attempt deadline.
    pub timeout: Duration,
    /// Higher wins among matching rules.
    pub priority: i32,
}

impl PolicyRule {
    pub fn matches(&self, error: &UserError) -> bool {
        let code_hit = self
            .error_code_pattern
            .as_deref()
            .is_some_and(|p| matches_pattern(p, &error.code));
        let domain_hit = self
            .domain_pattern
            .as_deref()
            .is_some_and(|p| matches_pattern(p, error.domain.as_str()));
        code_hit || domain_hit
    }
}

/// Exact match, trailing-`*` prefix match, or the catch-all `*`.
pub fn matches_pattern(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// Load-staged execution context handed to the operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attempt {
    /// 0-based attempt (or stage) number.
    pub number: u32,
    /// Load fraction for gradual recovery; 1.0 everywhere else.
    pub load: f64,
}

/// The operation under recovery. Must be re-runnable.
pub type Operation =
    Arc<dyn Fn(Attempt) -> BoxFuture<'static, Result<(), UserError>> + Send + Sync>;

/// What a successful recovery reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub strategy: RecoveryStrategy,
    /// Operation invocations consumed (including the final success).
    pub attempts: u32,
}

/// GradualRecovery's fixed load ramp.
const GRADUAL_STAGES: [f64; 5] = [0.1, 0.3, 0.5, 0.8, 1.0];

/// Policy-driven recovery driver.
pub struct RecoveryOrchestrator {
    rules: Vec<PolicyRule>,
    breakers: Arc<BreakerRegistry>,
    solutions: SolutionEngine,
    fallbacks: std::sync::RwLock<Vec<Arc<dyn FallbackProvider>>>,
    metrics: Mutex<RecoveryMetrics>,
}

impl RecoveryOrchestrator {
    pub fn new(
        rules: Vec<PolicyRule>,
        breakers: Arc<BreakerRegistry>,
        solutions: SolutionEngine,
    ) -> Self {
        Self {
            rules,
            breakers,
            solutions,
            fallbacks: std::sync::RwLock::new(Vec::new()),
            metrics: Mutex::new(RecoveryMetrics::default()),
        }
    }

    /// A reasonable default policy table: retry transient network trouble,
    /// gate repeated API failures behind a breaker, rotate credentials on
    /// auth errors, and try automated fixes for well-understood git states.
    pub fn default_rules() -> Vec<PolicyRule> {
        let quick = BackoffPolicy {
            strategy: BackoffStrategy::ExponentialJitter,
            base: Duration::from_millis(250),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.25,
        };
        vec![
            PolicyRule {
                error_code_pattern: Some("network_*".into()),
                domain_pattern: None,
                strategy: RecoveryStrategy::Retry,
                max_attempts: 3,
                backoff: quick.clone(),
                timeout: Duration::from_secs(30),
                priority: 50,
            },
            PolicyRule {
                error_code_pattern: None,
                domain_pattern: Some("api".into()),
                strategy: RecoveryStrategy::CircuitBreaker,
                max_attempts: 1,
                backoff: quick.clone(),
                timeout: Duration::from_secs(30),
                priority: 40,
            },
            PolicyRule {
                error_code_pattern: Some("auth_*".into()),
                domain_pattern: Some("auth".into()),
                strategy: RecoveryStrategy::Fallback,
                max_attempts: 1,
                backoff: quick.clone(),
                timeout: Duration::from_secs(30),
                priority: 40,
            },
            PolicyRule {
                error_code_pattern: Some("git_state_*".into()),
                domain_pattern: None,
                strategy: RecoveryStrategy::AutoFix,
                max_attempts: 1,
                backoff: quick.clone(),
                timeout: Duration::from_secs(60),
                priority: 30,
            },
            PolicyRule {
                error_code_pattern: Some("*".into()),
                domain_pattern: None,
                strategy: RecoveryStrategy::Retry,
                max_attempts: 2,
                backoff: quick,
                timeout: Duration::from_secs(30),
                priority: 0,
            },
        ]
    }

    /// Register a fallback provider (consulted in descending priority).
    pub fn register_fallback(&self, provider: Arc<dyn FallbackProvider>) {
        let mut fallbacks = self.fallbacks.write().expect("fallback lock poisoned");
        fallbacks.push(provider);
        fallbacks.sort_by_key(|p| std::cmp::Reverse(p.info().priority));
    }

    /// Current metrics snapshot.
    pub async fn metrics(&self) -> RecoveryMetrics {
        self.metrics.lock().await.clone()
    }

    /// Health derived from recovery success rate and open breaker count.
    pub async fn health(&self) -> RecoveryHealth {
        derive_health(&*self.metrics.lock().await, self.breakers.open_count())
    }

    /// Select the highest-priority matching rule.
    pub fn select_rule(&self, error: &UserError) -> Option<&PolicyRule> {
        self.rules
            .iter()
            .filter(|r| r.matches(error))
            .max_by_key(|r| r.priority)
    }

    /// Drive recovery for a classified error.
    ///
    /// Returns the outcome of the selected strategy, or the last error when
    /// the strategy could not recover (the original error when no rule
    /// matches).
    pub async fn recover(
        &self,
        cancel: &CancellationToken,
        error: &UserError,
        operation: Operation,
    ) -> Result<RecoveryOutcome, UserError> {
        let Some(rule) = self.select_rule(error).cloned() else {
            tracing::debug!(code = %error.code, "no recovery rule matches");
            return Err(error.clone());
        };

        tracing::info!(
            code = %error.code,
            strategy = %rule.strategy,
            priority = rule.priority,
            "recovery strategy selected"
        );

        let started = Instant::now();
        let result = match rule.strategy {
            RecoveryStrategy::Retry => self.run_retry(cancel, &rule, &operation).await,
            RecoveryStrategy::CircuitBreaker => {
                self.run_circuit_breaker(cancel, error, &rule, &operation).await
            }
            RecoveryStrategy::Fallback => self.run_fallback(cancel, error, &rule, &operation).await,
            RecoveryStrategy::GradualRecovery => {
                self.run_gradual(cancel, &rule, &operation).await
            }
            RecoveryStrategy::AutoFix => self.run_auto_fix(cancel, error, &rule, &operation).await,
        };

        self.metrics.lock().await.record(
            rule.strategy.as_str(),
            result.is_ok(),
            started.elapsed(),
        );
        result
    }

    // -- strategy drivers --------------------------------------------------

    async fn run_retry(
        &self,
        cancel: &CancellationToken,
        rule: &PolicyRule,
        operation: &Operation,
    ) -> Result<RecoveryOutcome, UserError> {
        let mut last = None;
        for attempt in 0..rule.max_attempts.max(1) {
            if cancel.is_cancelled() {
                return Err(cancelled_error());
            }
            match self.run_once(cancel, rule, operation, attempt, 1.0).await {
                Ok(()) => {
                    return Ok(RecoveryOutcome {
                        strategy: RecoveryStrategy::Retry,
                        attempts: attempt + 1,
                    });
                }
                Err(e) => last = Some(e),
            }
            if attempt + 1 < rule.max_attempts {
                let delay = rule.backoff.delay(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(cancelled_error()),
                }
            }
        }
        Err(last.expect("at least one attempt ran"))
    }

    async fn run_circuit_breaker(
        &self,
        cancel: &CancellationToken,
        error: &UserError,
        rule: &PolicyRule,
        operation: &Operation,
    ) -> Result<RecoveryOutcome, UserError> {
        let breaker = self.breakers.get_or_create(&format!("recovery-{}", error.code));
        if let Err(rejection) = breaker.try_acquire() {
            self.metrics.lock().await.record_breaker_rejection();
            return Err(UserError::new(
                error.domain,
                ErrorCategory::Resource,
                "circuit_open",
                rejection.to_string(),
            ));
        }

        let started = Instant::now();
        match self.run_once(cancel, rule, operation, 0, 1.0).await {
            Ok(()) => {
                breaker.record_success(started.elapsed());
                Ok(RecoveryOutcome {
                    strategy: RecoveryStrategy::CircuitBreaker,
                    attempts: 1,
                })
            }
            Err(e) => {
                breaker.record_failure(started.elapsed());
                Err(e)
            }
        }
    }

    async fn run_fallback(
        &self,
        cancel: &CancellationToken,
        error: &UserError,
        rule: &PolicyRule,
        operation: &Operation,
    ) -> Result<RecoveryOutcome, UserError> {
        let providers: Vec<Arc<dyn FallbackProvider>> = self
            .fallbacks
            .read()
            .expect("fallback lock poisoned")
            .iter()
            .filter(|p| p.can_handle(error))
            .cloned()
            .collect();

        if providers.is_empty() {
            return Err(error
                .clone()
                .with_suggestion("No fallback provider can handle this failure"));
        }

        let mut attempts = 0;
        let mut last = error.clone();
        for provider in providers {
            if cancel.is_cancelled() {
                return Err(cancelled_error());
            }
            let info = provider.info();
            match provider.execute(cancel, error).await {
                Ok(outcome) => {
                    tracing::info!(provider = %info.name, ?outcome, "fallback applied, re-running operation");
                    attempts += 1;
                    match self.run_once(cancel, rule, operation, attempts, 1.0).await {
                        Ok(()) => {
                            return Ok(RecoveryOutcome {
                                strategy: RecoveryStrategy::Fallback,
                                attempts,
                            });
                        }
                        Err(e) => last = e,
                    }
                }
                Err(e) => {
                    tracing::debug!(provider = %info.name, error = %e, "fallback provider declined");
                    last = e;
                }
            }
        }
        Err(last)
    }

    async fn run_gradual(
        &self,
        cancel: &CancellationToken,
        rule: &PolicyRule,
        operation: &Operation,
    ) -> Result<RecoveryOutcome, UserError> {
        for (stage, load) in GRADUAL_STAGES.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(cancelled_error());
            }
            tracing::debug!(stage, load, "gradual recovery stage");
            self.run_once(cancel, rule, operation, stage as u32, *load)
                .await?;
            if stage + 1 < GRADUAL_STAGES.len() {
                // Fixed inter-stage dwell.
                tokio::select! {
                    _ = tokio::time::sleep(rule.backoff.base) => {}
                    _ = cancel.cancelled() => return Err(cancelled_error()),
                }
            }
        }
        Ok(RecoveryOutcome {
            strategy: RecoveryStrategy::GradualRecovery,
            attempts: GRADUAL_STAGES.len() as u32,
        })
    }

    async fn run_auto_fix(
        &self,
        cancel: &CancellationToken,
        error: &UserError,
        rule: &PolicyRule,
        operation: &Operation,
    ) -> Result<RecoveryOutcome, UserError> {
        let Some(solution) = self.solutions.find_automated(&error.code) else {
            return Err(error
                .clone()
                .with_suggestion("No automated solution exists for this error"));
        };

        let mut applied = 0;
        for command in &solution.commands {
            if command.dangerous {
                tracing::warn!(
                    command = %command.command,
                    "refusing dangerous command during auto-fix"
                );
                continue;
            }
            run_fix_command(cancel, &command.command, rule.timeout).await?;
            applied += 1;
        }
        if applied == 0 {
            return Err(error
                .clone()
                .with_suggestion("Every command in the automated solution is marked dangerous"));
        }

        self.run_once(cancel, rule, operation, 0, 1.0).await?;
        Ok(RecoveryOutcome {
            strategy: RecoveryStrategy::AutoFix,
            attempts: 1,
        })
    }

    /// One operation invocation under the rule's per-attempt deadline.
    async fn run_once(
        &self,
        cancel: &CancellationToken,
        rule: &PolicyRule,
        operation: &Operation,
        number: u32,
        load: f64,
    ) -> Result<(), UserError> {
        let attempt = Attempt { number, load };
        let invocation = operation(attempt);
        tokio::select! {
            result = tokio::time::timeout(rule.timeout, invocation) => match result {
                Ok(inner) => inner,
                Err(_) => Err(UserError::new(
                    ErrorDomain::Network,
                    ErrorCategory::Timeout,
                    "recovery_attempt_timeout",
                    format!("recovery attempt exceeded {:?}", rule.timeout),
                )),
            },
            _ = cancel.cancelled() => Err(cancelled_error()),
        }
    }
}

impl fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryOrchestrator")
            .field("rules", &self.rules.len())
            .finish()
    }
}

fn cancelled_error() -> UserError {
    UserError::new(
        ErrorDomain::Api,
        ErrorCategory::State,
        "recovery_cancelled",
        "recovery cancelled by caller",
    )
}

/// Run one auto-fix shell command with a deadline.
async fn run_fix_command(
    cancel: &CancellationToken,
    command: &str,
    timeout: Duration,
) -> Result<(), UserError> {
    tracing::info!(command, "running auto-fix command");
    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| {
            UserError::new(
                ErrorDomain::Cli,
                ErrorCategory::Resource,
                "fix_spawn_failed",
                format!("could not spawn fix command: {e}"),
            )
        })?;

    let wait = async {
        tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                UserError::new(
                    ErrorDomain::Cli,
                    ErrorCategory::Timeout,
                    "fix_timeout",
                    format!("fix command exceeded {timeout:?}"),
                )
            })?
            .map_err(|e| {
                UserError::new(
                    ErrorDomain::Cli,
                    ErrorCategory::Resource,
                    "fix_wait_failed",
                    format!("could not collect fix command output: {e}"),
                )
            })
    };

    let output = tokio::select! {
        output = wait => output?,
        _ = cancel.cancelled() => return Err(cancelled_error()),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(UserError::new(
            ErrorDomain::Cli,
            ErrorCategory::State,
            "fix_command_failed",
            format!("fix command exited with {}: {stderr}", output.status),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
