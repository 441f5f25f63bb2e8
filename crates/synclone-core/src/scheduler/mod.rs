//! Priority-aware worker pool with bounded queues, per-job deadlines,
//! retry with backoff, and cooperative shutdown.
//!
//! Three bounded FIFO queues (`high`, `normal`, `low`); `submit` routes by
//! job priority and fails fast with `QueueFull` instead of blocking.
//! Workers drain with strict priority preference: starvation of the lower
//! tiers is accepted, callers choose priorities deliberately.
//!
//! Results are observational: they flow on a bounded channel and are
//! dropped when the consumer lags. Outcome authority lives in the session
//! state, which job handlers update themselves.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::transport::backoff::{BackoffPolicy, BackoffStrategy};

/// Priority tiers derived from the 0-9 job priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityTier {
    High,
    Normal,
    Low,
}

impl PriorityTier {
    /// `high` is 8-9, `normal` 4-7, `low` 0-3.
    pub fn from_level(priority: u8) -> Self {
        match priority {
            8.. => Self::High,
            4..=7 => Self::Normal,
            _ => Self::Low,
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

/// A handler failure, carrying whether a retry could help.
#[derive(Debug, Clone)]
pub struct JobError {
    pub message: String,
    pub retryable: bool,
}

impl JobError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for JobError {}

/// Execution context handed to a job handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Scoped to the pool's stop signal; handlers must return promptly
    /// once it fires.
    pub cancel: CancellationToken,
    /// 0 on the first execution, incremented per retry.
    pub attempt: u32,
    /// The job's retry budget, so handlers can tell a terminal failure
    /// from one the pool will retry.
    pub max_retries: u32,
}

impl JobContext {
    /// Whether a failure on this execution exhausts the retry budget.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_retries
    }
}

/// The work closure.
pub type JobHandler =
    Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

/// A schedulable unit.
#[derive(Clone)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    /// 0-9; see [`PriorityTier::from_level`].
    pub priority: u8,
    pub can_retry: bool,
    pub max_retries: u32,
    /// Retries consumed so far; lives on the job for the process lifetime,
    /// never persisted.
    pub retry_count: u32,
    pub handler: JobHandler,
}

impl Job {
    pub fn new(name: impl Into<String>, priority: u8, handler: JobHandler) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            priority,
            can_retry: true,
            max_retries: 0,
            retry_count: 0,
            handler,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.can_retry = false;
        self
    }

    pub fn tier(&self) -> PriorityTier {
        PriorityTier::from_level(self.priority)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

/// Observational record of one job execution.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: Uuid,
    pub name: String,
    pub priority: u8,
    /// `None` on success.
    pub error: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration: Duration,
    /// This execution was a retry of an earlier failure.
    pub retried: bool,
    /// The pool will re-enqueue this job after a backoff; a result with
    /// `will_retry == false` is the job's terminal outcome.
    pub will_retry: bool,
}

/// Scheduler failures.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("{tier} queue is full")]
    QueueFull { tier: PriorityTier },

    #[error("worker pool is stopped")]
    Stopped,

    #[error("shutdown timed out with {remaining} workers still busy")]
    ShutdownTimeout { remaining: usize },
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of long-lived workers.
    pub parallel: usize,
    /// Capacity of each priority queue.
    pub queue_capacity: usize,
    /// Capacity of the results channel; overflow is dropped.
    pub results_capacity: usize,
    /// Per-job deadline.
    pub job_timeout: Duration,
    /// Backoff base for the retry channel.
    pub retry_base: Duration,
    /// Backoff cap for the retry channel.
    pub retry_max_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel: 4,
            queue_capacity: 256,
            results_capacity: 256,
            job_timeout: Duration::from_secs(300),
            retry_base: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

struct Queues {
    high_tx: mpsc::Sender<Job>,
    normal_tx: mpsc::Sender<Job>,
    low_tx: mpsc::Sender<Job>,
    high_rx: Mutex<mpsc::Receiver<Job>>,
    normal_rx: Mutex<mpsc::Receiver<Job>>,
    low_rx: Mutex<mpsc::Receiver<Job>>,
    /// Woken on every submit so idle workers re-check the queues.
    wakeup: Notify,
}

impl Queues {
    fn new(capacity: usize) -> Self {
        let (high_tx, high_rx) = mpsc::channel(capacity);
        let (normal_tx, normal_rx) = mpsc::channel(capacity);
        let (low_tx, low_rx) = mpsc::channel(capacity);
        Self {
            high_tx,
            normal_tx,
            low_tx,
            high_rx: Mutex::new(high_rx),
            normal_rx: Mutex::new(normal_rx),
            low_rx: Mutex::new(low_rx),
            wakeup: Notify::new(),
        }
    }

    fn sender(&self, tier: PriorityTier) -> &mpsc::Sender<Job> {
        match tier {
            PriorityTier::High => &self.high_tx,
            PriorityTier::Normal => &self.normal_tx,
            PriorityTier::Low => &self.low_tx,
        }
    }

    /// Strict priority selection: at this instant, a non-empty higher queue
    /// always wins.
    async fn pop_next(&self) -> Option<Job> {
        if let Ok(job) = self.high_rx.lock().await.try_recv() {
            return Some(job);
        }
        if let Ok(job) = self.normal_rx.lock().await.try_recv() {
            return Some(job);
        }
        if let Ok(job) = self.low_rx.lock().await.try_recv() {
            return Some(job);
        }
        None
    }
}

/// The worker pool.
pub struct WorkerPool {
    config: SchedulerConfig,
    queues: Arc<Queues>,
    retry_tx: mpsc::Sender<(Job, Duration)>,
    results_rx: Mutex<Option<mpsc::Receiver<JobResult>>>,
    stop: CancellationToken,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
    dropped_results: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Build the pool and spawn its workers and retry pump immediately.
    pub fn start(config: SchedulerConfig) -> Self {
        let queues = Arc::new(Queues::new(config.queue_capacity));
        let (results_tx, results_rx) = mpsc::channel(config.results_capacity);
        let (retry_tx, mut retry_rx) = mpsc::channel::<(Job, Duration)>(config.queue_capacity);
        let stop = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let dropped_results = Arc::new(AtomicU64::new(0));

        let mut workers = Vec::with_capacity(config.parallel + 1);

        // Retry pump: receives (job, delay) pairs and re-submits each to its
        // original priority queue once the backoff has elapsed.
        {
            let queues = Arc::clone(&queues);
            let stop = stop.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let received = tokio::select! {
                        received = retry_rx.recv() => received,
                        _ = stop.cancelled() => return,
                    };
                    let Some((job, delay)) = received else { return };
                    let queues = Arc::clone(&queues);
                    let stop = stop.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = stop.cancelled() => return,
                        }
                        resubmit(&queues, &stop, job).await;
                    });
                }
            }));
        }

        for worker_index in 0..config.parallel {
            let queues = Arc::clone(&queues);
            let results_tx = results_tx.clone();
            let retry_tx = retry_tx.clone();
            let stop = stop.clone();
            let config = config.clone();
            let in_flight = Arc::clone(&in_flight);
            let dropped_results = Arc::clone(&dropped_results);

            workers.push(tokio::spawn(async move {
                tracing::debug!(worker = worker_index, "worker started");
                loop {
                    if stop.is_cancelled() {
                        break;
                    }
                    match queues.pop_next().await {
                        Some(job) => {
                            in_flight.fetch_add(1, Ordering::SeqCst);
                            run_job(&config, job, &stop, &results_tx, &retry_tx, &dropped_results)
                                .await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        }
                        None => {
                            // Idle: wait for a submit, the stop signal, or a
                            // periodic re-check (a notify can be consumed by
                            // another worker).
                            tokio::select! {
                                _ = queues.wakeup.notified() => {}
                                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                                _ = stop.cancelled() => break,
                            }
                        }
                    }
                }
                tracing::debug!(worker = worker_index, "worker stopped");
            }));
        }

        Self {
            config,
            queues,
            retry_tx,
            results_rx: Mutex::new(Some(results_rx)),
            stop,
            workers: Mutex::new(workers),
            in_flight,
            dropped_results,
        }
    }

    /// Route a job to its priority queue. Fails fast when the queue is at
    /// capacity; callers decide whether to shed or wait.
    pub fn submit(&self, job: Job) -> Result<(), SchedulerError> {
        if self.stop.is_cancelled() {
            return Err(SchedulerError::Stopped);
        }
        let tier = job.tier();
        match self.queues.sender(tier).try_send(job) {
            Ok(()) => {
                self.queues.wakeup.notify_one();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(SchedulerError::QueueFull { tier }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SchedulerError::Stopped),
        }
    }

    /// Take the results stream: a bounded, finite, non-restartable sequence
    /// of [`JobResult`] items. Returns `None` after the first call.
    pub async fn take_results(&self) -> Option<ReceiverStream<JobResult>> {
        self.results_rx
            .lock()
            .await
            .take()
            .map(ReceiverStream::new)
    }

    /// Jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Results dropped because the consumer lagged.
    pub fn dropped_results(&self) -> u64 {
        self.dropped_results.load(Ordering::SeqCst)
    }

    /// Cooperative shutdown: fire the stop signal, wait up to `timeout` for
    /// workers to drain their in-flight jobs, then close the results
    /// channel by dropping the workers' senders.
    pub async fn stop(&self, timeout: Duration) -> Result<(), SchedulerError> {
        self.stop.cancel();

        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        let result = match tokio::time::timeout(timeout, drain).await {
            Ok(()) => Ok(()),
            Err(_) => Err(SchedulerError::ShutdownTimeout {
                remaining: self.in_flight(),
            }),
        };

        let dropped = self.dropped_results();
        if dropped > 0 {
            tracing::warn!(dropped, "results dropped on full channel during run");
        }
        result
    }

    /// The stop token, for wiring job handlers to the pool lifecycle.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("parallel", &self.config.parallel)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Re-submit a retried job to its original priority queue, waiting out a
/// full queue rather than dropping the job.
async fn resubmit(queues: &Queues, stop: &CancellationToken, job: Job) {
    let tier = job.tier();
    let mut job = Some(job);
    loop {
        if stop.is_cancelled() {
            return;
        }
        match queues.sender(tier).try_send(job.take().expect("job present")) {
            Ok(()) => {
                queues.wakeup.notify_one();
                return;
            }
            Err(mpsc::error::TrySendError::Full(returned)) => {
                job = Some(returned);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                    _ = stop.cancelled() => return,
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

async fn run_job(
    config: &SchedulerConfig,
    job: Job,
    stop: &CancellationToken,
    results_tx: &mpsc::Sender<JobResult>,
    retry_tx: &mpsc::Sender<(Job, Duration)>,
    dropped_results: &AtomicU64,
) {
    let start_wall = Utc::now();
    let start = Instant::now();
    let context = JobContext {
        cancel: stop.child_token(),
        attempt: job.retry_count,
        max_retries: if job.can_retry { job.max_retries } else { 0 },
    };

    let outcome = tokio::time::timeout(config.job_timeout, (job.handler)(context)).await;
    let duration = start.elapsed();

    let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(_) => Some(JobError::transient(format!(
            "job deadline of {:?} exceeded",
            config.job_timeout
        ))),
    };

    let will_retry = error.as_ref().is_some_and(|e| {
        e.retryable && job.can_retry && job.retry_count < job.max_retries
    });

    if let Some(e) = &error {
        tracing::debug!(
            job = %job.name,
            error = %e,
            retry_count = job.retry_count,
            will_retry,
            "job failed"
        );
    }

    let result = JobResult {
        job_id: job.id,
        name: job.name.clone(),
        priority: job.priority,
        error: error.as_ref().map(|e| e.message.clone()),
        start: start_wall,
        end: Utc::now(),
        duration,
        retried: job.retry_count > 0,
        will_retry,
    };
    if results_tx.try_send(result).is_err() {
        // Observational channel only; authority is in the session state.
        dropped_results.fetch_add(1, Ordering::SeqCst);
    }

    if will_retry {
        let backoff = BackoffPolicy {
            strategy: BackoffStrategy::ExponentialJitter,
            base: config.retry_base,
            factor: 2.0,
            max_delay: config.retry_max_delay,
            jitter_factor: 0.25,
        };
        let delay = backoff.delay(job.retry_count);
        let mut retried = job;
        retried.retry_count += 1;
        if retry_tx.try_send((retried, delay)).is_err() {
            tracing::warn!("retry channel unavailable, dropping retry");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
