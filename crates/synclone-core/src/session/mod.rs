//! Session coordination: the manager that owns durable state, and the thin
//! handle a caller holds for one (provider, organization) run.
//!
//! The manager is the sole owner of persistence; a [`Session`] is just
//! `{id, manager}` and borrows everything through it, so there is no cycle
//! between sessions and the state layer.

pub mod runner;

use std::sync::Arc;

use chrono::Utc;

use synclone_state::{
    CloneState, CloneStrategy, CompletedRepo, FailedRepo, SessionId, SessionStatus, SessionStore,
    StateError, StateProgress,
};

/// Session-level failures. These are fatal to a run, unlike per-repo
/// failures which are recorded and skipped past.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} already completed; nothing to resume")]
    AlreadyCompleted(SessionId),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Owner of session persistence. All mutation funnels through here, which
/// serializes per session and persists every checkpoint atomically.
#[derive(Debug)]
pub struct SessionManager {
    store: Arc<SessionStore>,
}

impl SessionManager {
    pub fn new(store: Arc<SessionStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Create a fresh in-progress session and persist it immediately.
    ///
    /// Enumeration may still be running; `total_repositories` is finalized
    /// later by [`Self::set_pending`].
    pub async fn start_session(
        self: &Arc<Self>,
        id: &SessionId,
        target_path: std::path::PathBuf,
        strategy: CloneStrategy,
        parallel: usize,
        max_retries: u32,
    ) -> Result<Session, SessionError> {
        let state = CloneState::new(id, target_path, strategy, parallel, max_retries)
            .map_err(StateError::from)?;
        self.store.save(&state).await?;
        tracing::info!(session_id = %id, "session started");
        Ok(Session {
            id: id.clone(),
            manager: Arc::clone(self),
        })
    }

    /// Load an interrupted session and mark it resumed.
    ///
    /// Fails with [`SessionError::AlreadyCompleted`] when there is nothing
    /// left to do.
    pub async fn resume_session(self: &Arc<Self>, id: &SessionId) -> Result<Session, SessionError> {
        let state = self.store.load(id).await?;
        if state.status == SessionStatus::Completed {
            return Err(SessionError::AlreadyCompleted(id.clone()));
        }
        self.store
            .update(id, |s| {
                s.mark_resumed();
                Ok(())
            })
            .await?;
        tracing::info!(session_id = %id, pending = state.pending.len(), "session resumed");
        Ok(Session {
            id: id.clone(),
            manager: Arc::clone(self),
        })
    }

    /// Replace the pending list with the frozen enumeration snapshot.
    pub async fn set_pending(&self, id: &SessionId, names: Vec<String>) -> Result<(), SessionError> {
        self.store
            .update(id, |s| {
                s.set_pending(names);
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Record a success: atomically out of pending (and failed, when a
    /// retry succeeded) and into completed, persisted before returning.
    pub async fn add_completed(
        &self,
        id: &SessionId,
        name: &str,
        url: &str,
        operation: &str,
        message: &str,
    ) -> Result<(), SessionError> {
        let record = CompletedRepo {
            url: url.to_owned(),
            operation: operation.to_owned(),
            message: message.to_owned(),
            finished_at: Utc::now(),
        };
        self.store
            .update(id, |s| {
                s.record_completed(name, record);
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Record a failure: atomically out of pending and into failed,
    /// persisted before returning.
    pub async fn add_failed(
        &self,
        id: &SessionId,
        name: &str,
        url: &str,
        operation: &str,
        message: &str,
        attempt_count: u32,
    ) -> Result<(), SessionError> {
        let record = FailedRepo {
            url: url.to_owned(),
            operation: operation.to_owned(),
            message: message.to_owned(),
            attempt_count,
            last_at: Utc::now(),
        };
        self.store
            .update(id, |s| {
                s.record_failed(name, record);
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// The current pending list.
    pub async fn get_remaining(&self, id: &SessionId) -> Result<Vec<String>, SessionError> {
        Ok(self.store.load(id).await?.pending)
    }

    /// Terminal transition to completed (requires an empty pending list).
    pub async fn mark_completed(&self, id: &SessionId) -> Result<(), SessionError> {
        self.store
            .update(id, |s| {
                s.mark_completed().map_err(StateError::from)?;
                Ok(())
            })
            .await?;
        tracing::info!(session_id = %id, "session completed");
        Ok(())
    }

    /// Terminal transition to failed.
    pub async fn mark_failed(&self, id: &SessionId) -> Result<(), SessionError> {
        self.store
            .update(id, |s| {
                s.mark_failed();
                Ok(())
            })
            .await?;
        tracing::warn!(session_id = %id, "session marked failed");
        Ok(())
    }

    /// Full state snapshot.
    pub async fn state(&self, id: &SessionId) -> Result<CloneState, SessionError> {
        Ok(self.store.load(id).await?)
    }

    /// Derived progress view.
    pub async fn progress(&self, id: &SessionId) -> Result<StateProgress, SessionError> {
        Ok(self.store.load(id).await?.progress())
    }

    pub fn has(&self, id: &SessionId) -> bool {
        self.store.has(id)
    }

    pub fn list(&self) -> Result<Vec<CloneState>, SessionError> {
        Ok(self.store.list()?)
    }

    pub async fn delete(&self, id: &SessionId) -> Result<(), SessionError> {
        Ok(self.store.delete(id).await?)
    }

    /// The most recently active interrupted session, for resume
    /// auto-discovery.
    pub fn latest_in_progress(&self) -> Result<Option<CloneState>, SessionError> {
        Ok(self.store.latest_in_progress()?)
    }

    /// Age-based sweep of terminal sessions.
    pub async fn sweep_terminal(&self, older_than: chrono::Duration) -> Result<usize, SessionError> {
        Ok(self.store.sweep_terminal(older_than).await?)
    }
}

/// A thin handle on one session: the id plus a manager reference.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    manager: Arc<SessionManager>,
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub async fn remaining(&self) -> Result<Vec<String>, SessionError> {
        self.manager.get_remaining(&self.id).await
    }

    pub async fn progress(&self) -> Result<StateProgress, SessionError> {
        self.manager.progress(&self.id).await
    }

    pub async fn state(&self) -> Result<CloneState, SessionError> {
        self.manager.state(&self.id).await
    }
}
