//! The run coordinator: drives one session from enumeration through
//! terminal state.
//!
//! Flow: validate options, start or resume the session, freeze the
//! enumeration snapshot, submit one clone job per pending repository, wait
//! for every repository to reach a terminal record (per-repo retries
//! included), then make the terminal transition. Outcome authority is the
//! persisted `CloneState`; the scheduler's result stream is observational.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use synclone_state::{SessionId, SessionStatus};

use crate::error::{ErrorCategory, ErrorDomain, UserError};
use crate::events::{Event, EventBus};
use crate::provider::filters::RepositoryFilters;
use crate::provider::options::CloneOptions;
use crate::provider::{Provider, RepoOperation};
use crate::scheduler::{Job, JobError, SchedulerConfig, SchedulerError, WorkerPool};

use super::{SessionError, SessionManager};

/// A pre-validated clone request, as handed over by the presentation
/// collaborator.
#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub organization: String,
    pub target_path: PathBuf,
    pub filters: RepositoryFilters,
    pub options: CloneOptions,
}

/// A list-only request: enumeration and filtering without any cloning or
/// session state.
#[derive(Debug, Clone)]
pub struct ListRequest {
    pub organization: String,
    pub filters: RepositoryFilters,
    pub options: CloneOptions,
}

/// Enumerate an organization without creating a session.
pub async fn run_list(
    provider: &Arc<dyn Provider>,
    request: &ListRequest,
    cancel: &CancellationToken,
) -> Result<(Vec<String>, usize), UserError> {
    request.options.validate()?;
    provider
        .list_repositories(cancel, &request.organization, &request.filters)
        .await
        .map_err(|e| e.to_user_error(domain_of(provider.name())))
}

/// What a finished (or interrupted) run reports back.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Results dropped from the observational channel.
    pub dropped_results: u64,
    /// Local directories under the target with no matching remote
    /// repository (populated only with `cleanup_orphans`).
    pub orphans: Vec<PathBuf>,
    pub dry_run: bool,
}

/// Clone jobs run at normal priority; callers with mixed workloads pick
/// their own levels.
const CLONE_PRIORITY: u8 = 5;

/// How long `stop` waits for in-flight clones after the last repository
/// reaches a terminal record.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Run one synclone session to a terminal state.
///
/// Per-repo failures never abort the run; they are recorded in the state
/// and the session still terminates (as `failed` only when the caller's
/// `fail_threshold` says so). Enumeration failure and state-layer errors
/// are fatal. Cancellation leaves the session `in_progress` on disk,
/// ready for resume.
pub async fn run_session(
    manager: &Arc<SessionManager>,
    events: &Arc<EventBus>,
    provider: Arc<dyn Provider>,
    request: CloneRequest,
    cancel: CancellationToken,
) -> anyhow::Result<SessionReport> {
    request
        .options
        .validate()
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let id = SessionId::new(provider.name(), &request.organization)
        .context("invalid provider/organization pair")?;
    let options = &request.options;

    // 1. Start fresh or resume.
    let resuming = options.resume && manager.has(&id);
    let _session = if resuming {
        manager.resume_session(&id).await?
    } else {
        manager
            .start_session(
                &id,
                request.target_path.clone(),
                options.strategy,
                options.parallel,
                options.max_retries,
            )
            .await?
    };

    // 2. Freeze the work list. A resumed session reuses its persisted
    //    pending set; a fresh one enumerates and persists the snapshot
    //    before any scheduling, so pagination drift cannot change it.
    let snapshot: Vec<String> = if resuming {
        manager.get_remaining(&id).await?
    } else {
        let enumerated = provider
            .list_repositories(&cancel, &request.organization, &request.filters)
            .await;
        match enumerated {
            Ok((names, total)) => {
                tracing::info!(session_id = %id, total, "enumeration frozen");
                manager.set_pending(&id, names.clone()).await?;
                names
            }
            Err(e) => {
                let user_error = e.to_user_error(domain_of(provider.name()));
                events.publish(Event::ErrorOccurred {
                    session_id: id.to_string(),
                    repository: None,
                    error: user_error.clone(),
                });
                manager.mark_failed(&id).await?;
                return Err(anyhow::anyhow!("enumeration failed: {user_error}"));
            }
        }
    };

    // 3. Dry run: the plan is persisted, nothing executes.
    if options.dry_run {
        let progress = manager.progress(&id).await?;
        return Ok(SessionReport {
            session_id: id.to_string(),
            status: progress.status,
            total: snapshot.len(),
            completed: progress.completed,
            failed: progress.failed,
            dropped_results: 0,
            orphans: Vec::new(),
            dry_run: true,
        });
    }

    // 4. Schedule clones.
    let state = manager.state(&id).await?;
    let universe: Vec<String> = state
        .pending
        .iter()
        .chain(state.completed.keys())
        .chain(state.failed.keys())
        .cloned()
        .collect();

    let pool = WorkerPool::start(SchedulerConfig {
        parallel: options.parallel,
        // Sized so the whole snapshot plus every retry always fits.
        queue_capacity: (snapshot.len() * 2).max(16),
        results_capacity: (snapshot.len() * (options.max_retries as usize + 1)).max(16),
        ..Default::default()
    });
    let mut results = pool
        .take_results()
        .await
        .expect("fresh pool always has its results stream");
    let attempts: Arc<tokio::sync::Mutex<HashMap<String, u32>>> =
        Arc::new(tokio::sync::Mutex::new(HashMap::new()));

    for name in &snapshot {
        let job = clone_job(manager, events, &provider, &id, &request, name, &attempts);
        if let Err(e) = pool.submit(job) {
            // Capacity is sized to the snapshot; this is a logic error.
            anyhow::bail!("failed to submit clone job for {name}: {e}");
        }
    }

    // 5. Wait until every job reaches its terminal execution (per-repo
    //    retries run inside the pool and are not terminal).
    use tokio_stream::StreamExt;
    let expected = snapshot.len();
    let mut terminal = 0usize;
    let interrupted = loop {
        if terminal >= expected {
            break false;
        }
        tokio::select! {
            result = results.next() => match result {
                Some(result) if !result.will_retry => terminal += 1,
                Some(_) => {}
                None => break false,
            },
            _ = cancel.cancelled() => break true,
        }
    };

    // 6. Drain workers. On interruption the session stays in_progress and
    //    resumable; state writes are atomic, so a hard kill is equivalent.
    match pool.stop(DRAIN_TIMEOUT).await {
        Ok(()) => {}
        Err(SchedulerError::ShutdownTimeout { remaining }) => {
            tracing::warn!(session_id = %id, remaining, "workers did not quiesce before timeout");
        }
        Err(e) => tracing::warn!(session_id = %id, error = %e, "worker pool stop failed"),
    }

    if !interrupted {
        // Jobs killed by the per-job deadline never reached their handler's
        // failure path; whatever is still pending gets a terminal failure
        // record now so the partition invariant covers the whole universe.
        for name in manager.get_remaining(&id).await? {
            let error = UserError::new(
                domain_of(provider.name()),
                ErrorCategory::Timeout,
                "clone_deadline",
                format!("clone of {name} exceeded its deadline on every attempt"),
            );
            manager
                .add_failed(
                    &id,
                    &name,
                    &format!("{}/{name}", request.organization),
                    &RepoOperation::Cloned.to_string(),
                    &error.message,
                    options.max_retries + 1,
                )
                .await?;
            events.publish(Event::ErrorOccurred {
                session_id: id.to_string(),
                repository: Some(name.clone()),
                error,
            });
        }
    }

    if interrupted {
        tracing::info!(session_id = %id, "run cancelled; session left resumable");
        let progress = manager.progress(&id).await?;
        return Ok(SessionReport {
            session_id: id.to_string(),
            status: SessionStatus::InProgress,
            total: progress.completed + progress.failed + progress.pending,
            completed: progress.completed,
            failed: progress.failed,
            dropped_results: pool.dropped_results(),
            orphans: Vec::new(),
            dry_run: false,
        });
    }

    // 7. Terminal transition, governed by the caller's failure threshold.
    let progress = manager.progress(&id).await?;
    let total = expected.max(progress.completed + progress.failed);
    let failed_fraction = if total == 0 {
        0.0
    } else {
        progress.failed as f64 / total as f64
    };
    let threshold_exceeded = options
        .fail_threshold
        .is_some_and(|threshold| failed_fraction > threshold);

    if threshold_exceeded {
        manager.mark_failed(&id).await?;
    } else {
        manager.mark_completed(&id).await?;
    }

    // 8. Orphan scan (report only; deletion is the caller's decision).
    let orphans = if options.cleanup_orphans {
        find_orphans(&request.target_path, &universe).await
    } else {
        Vec::new()
    };

    let final_state = manager.state(&id).await?;
    Ok(SessionReport {
        session_id: id.to_string(),
        status: final_state.status,
        total: final_state.total_repositories,
        completed: final_state.completed.len(),
        failed: final_state.failed.len(),
        dropped_results: pool.dropped_results(),
        orphans,
        dry_run: false,
    })
}

/// Build the clone job for one repository.
///
/// The handler records only terminal outcomes in the session state: a
/// success immediately, a failure once it is non-retryable or the retry
/// budget is spent. Retryable intermediate failures leave the repository
/// in `pending` so an interrupted run resumes them with their budget
/// intact. Terminal events are published exactly once per repository.
fn clone_job(
    manager: &Arc<SessionManager>,
    events: &Arc<EventBus>,
    provider: &Arc<dyn Provider>,
    id: &SessionId,
    request: &CloneRequest,
    name: &str,
    attempts: &Arc<tokio::sync::Mutex<HashMap<String, u32>>>,
) -> Job {
    let manager = Arc::clone(manager);
    let events = Arc::clone(events);
    let provider = Arc::clone(provider);
    let id = id.clone();
    let target = request.target_path.clone();
    let organization = request.organization.clone();
    let strategy = request.options.strategy;
    let job_name = name.to_owned();
    let name = name.to_owned();
    let attempts = Arc::clone(attempts);

    let handler = move |ctx: crate::scheduler::JobContext| {
        let manager = manager.clone();
        let events = events.clone();
        let provider = provider.clone();
        let id = id.clone();
        let target = target.clone();
        let organization = organization.clone();
        let name = name.clone();
        let attempts = attempts.clone();

        Box::pin(async move {
            let started = std::time::Instant::now();
            let result = provider
                .clone_one(&ctx.cancel, &target, &organization, &name, strategy)
                .await;

            match result {
                Ok(repo) => {
                    manager
                        .add_completed(
                            &id,
                            &name,
                            &repo.url,
                            &repo.operation.to_string(),
                            &repo.message,
                        )
                        .await
                        .map_err(fatal_state_error)?;

                    let progress = manager.progress(&id).await.map_err(fatal_state_error)?;
                    events.publish(Event::RepositoryCloned {
                        session_id: id.to_string(),
                        repository: name.clone(),
                        url: repo.url,
                        operation: repo.operation.to_string(),
                        duration_ms: started.elapsed().as_millis() as u64,
                        finished_at: chrono::Utc::now(),
                    });
                    events.publish(Event::TaskCompleted {
                        session_id: id.to_string(),
                        repository: name.clone(),
                        success: true,
                        progress,
                    });
                    Ok(())
                }
                Err(e) => {
                    let attempt_count = {
                        let mut attempts = attempts.lock().await;
                        let count = attempts.entry(name.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    let retryable = e.is_retryable();
                    let user_error = e
                        .to_user_error(domain_of(provider.name()))
                        .with_context("repository", name.clone())
                        .with_context("attempt", attempt_count.to_string());

                    let is_terminal = !retryable || ctx.is_last_attempt();
                    if is_terminal {
                        // Only the final outcome reaches the durable state.
                        // A failure the pool will retry stays in pending, so
                        // a crash before the retry leaves the repository
                        // resumable instead of stuck in failed with an
                        // unspent retry budget.
                        manager
                            .add_failed(
                                &id,
                                &name,
                                &format!("{organization}/{name}"),
                                &RepoOperation::Cloned.to_string(),
                                &user_error.message,
                                attempt_count,
                            )
                            .await
                            .map_err(fatal_state_error)?;

                        let progress =
                            manager.progress(&id).await.map_err(fatal_state_error)?;
                        events.publish(Event::ErrorOccurred {
                            session_id: id.to_string(),
                            repository: Some(name.clone()),
                            error: user_error.clone(),
                        });
                        events.publish(Event::TaskCompleted {
                            session_id: id.to_string(),
                            repository: name.clone(),
                            success: false,
                            progress,
                        });
                    } else {
                        tracing::debug!(
                            session_id = %id,
                            repository = %name,
                            attempt = attempt_count,
                            error = %user_error,
                            "clone failed, retry scheduled"
                        );
                    }

                    if retryable {
                        Err(JobError::transient(user_error.message))
                    } else {
                        Err(JobError::permanent(user_error.message))
                    }
                }
            }
        }) as futures::future::BoxFuture<'static, Result<(), JobError>>
    };

    Job::new(job_name, CLONE_PRIORITY, Arc::new(handler)).with_retries(request.options.max_retries)
}

/// State-layer failures inside a job are unrecoverable for the run.
fn fatal_state_error(e: SessionError) -> JobError {
    JobError::permanent(format!("state error: {e}"))
}

fn domain_of(provider_name: &str) -> ErrorDomain {
    match provider_name {
        "github" => ErrorDomain::Github,
        "gitlab" => ErrorDomain::Gitlab,
        "gitea" => ErrorDomain::Gitea,
        _ => ErrorDomain::Api,
    }
}

/// Directories under `target` that match no enumerated repository.
async fn find_orphans(target: &Path, universe: &[String]) -> Vec<PathBuf> {
    let mut orphans = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(target).await else {
        return orphans;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        if dir_name.starts_with('.') {
            continue;
        }
        if !universe.iter().any(|name| *name == dir_name) {
            orphans.push(entry.path());
        }
    }
    orphans.sort();
    orphans
}

/// Validation-only entry: what would this request do.
///
/// Exposed separately so callers can surface the plan without creating a
/// worker pool.
pub fn validate_request(request: &CloneRequest, provider_name: &str) -> Result<SessionId, UserError> {
    request.options.validate()?;
    SessionId::new(provider_name, &request.organization).map_err(|e| {
        UserError::new(
            ErrorDomain::Config,
            ErrorCategory::Validation,
            "invalid_session_id",
            e.to_string(),
        )
    })
}
