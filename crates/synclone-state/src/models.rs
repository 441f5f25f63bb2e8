//! The durable clone-state record and its identifier types.
//!
//! A [`CloneState`] tracks one synclone run: which repositories are still
//! pending, which completed, which failed. Mutation goes through the
//! `record_*` / `set_pending` / `mark_*` methods so the partition invariant
//! (every enumerated name lives in exactly one of pending / completed /
//! failed) holds at every persisted checkpoint.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Whether this is a terminal status (completed or failed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for SessionStatus {
    type Err = SessionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SessionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SessionStatus`] string.
#[derive(Debug, Clone)]
pub struct SessionStatusParseError(pub String);

impl fmt::Display for SessionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session status: {:?}", self.0)
    }
}

impl std::error::Error for SessionStatusParseError {}

// ---------------------------------------------------------------------------

/// How an existing local clone is reconciled with its remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneStrategy {
    /// Fetch, then hard-reset the working tree to the remote branch tip.
    Reset,
    /// Fetch, then fast-forward merge; divergence is a failure.
    Pull,
    /// Update remote-tracking refs only; working tree untouched.
    Fetch,
}

impl fmt::Display for CloneStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Reset => "reset",
            Self::Pull => "pull",
            Self::Fetch => "fetch",
        };
        f.write_str(s)
    }
}

impl FromStr for CloneStrategy {
    type Err = CloneStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reset" => Ok(Self::Reset),
            "pull" => Ok(Self::Pull),
            "fetch" => Ok(Self::Fetch),
            other => Err(CloneStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CloneStrategy`] string.
#[derive(Debug, Clone)]
pub struct CloneStrategyParseError(pub String);

impl fmt::Display for CloneStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid clone strategy: {:?}", self.0)
    }
}

impl std::error::Error for CloneStrategyParseError {}

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Canonical session identifier: `<provider>:<organization>`.
///
/// Exactly one `:` separator with non-empty segments on both sides. An
/// organization containing a colon is therefore not representable; the
/// parser rejects it rather than guessing, because the on-disk filename
/// contract (`<provider>_<org>.json`) fixes the mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    provider: String,
    organization: String,
}

impl SessionId {
    /// Build a session id from provider and organization names.
    ///
    /// Returns an error if either segment is empty or contains a `:`.
    pub fn new(provider: &str, organization: &str) -> Result<Self, SessionIdParseError> {
        if provider.is_empty() || organization.is_empty() {
            return Err(SessionIdParseError(format!("{provider}:{organization}")));
        }
        if provider.contains(':') || organization.contains(':') {
            return Err(SessionIdParseError(format!("{provider}:{organization}")));
        }
        Ok(Self {
            provider: provider.to_owned(),
            organization: organization.to_owned(),
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    /// The file stem used for the on-disk state file: `<provider>_<org>`.
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.provider, self.organization)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.organization)
    }
}

impl FromStr for SessionId {
    type Err = SessionIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let provider = parts.next().unwrap_or_default();
        let organization = parts.next().unwrap_or_default();
        if parts.next().is_some() {
            return Err(SessionIdParseError(s.to_owned()));
        }
        Self::new(provider, organization).map_err(|_| SessionIdParseError(s.to_owned()))
    }
}

/// Error returned when parsing an invalid [`SessionId`] string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdParseError(pub String);

impl fmt::Display for SessionIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid session id {:?}: expected <provider>:<organization> with non-empty segments",
            self.0
        )
    }
}

impl std::error::Error for SessionIdParseError {}

// ---------------------------------------------------------------------------
// Per-repo records
// ---------------------------------------------------------------------------

/// Record of a successfully processed repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedRepo {
    pub url: String,
    pub operation: String,
    pub message: String,
    pub finished_at: DateTime<Utc>,
}

/// Record of a failed repository, including how many attempts were made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRepo {
    pub url: String,
    pub operation: String,
    pub message: String,
    pub attempt_count: u32,
    pub last_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CloneState
// ---------------------------------------------------------------------------

/// The durable record of a single synclone run.
///
/// Serialized 1:1 as the on-disk JSON state file; field names are part of
/// the stable external contract and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneState {
    pub provider: String,
    pub organization: String,
    pub target_path: PathBuf,
    pub strategy: CloneStrategy,
    pub parallel: usize,
    pub max_retries: u32,
    pub status: SessionStatus,
    pub total_repositories: usize,
    pub pending: Vec<String>,
    pub completed: BTreeMap<String, CompletedRepo>,
    pub failed: BTreeMap<String, FailedRepo>,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Error returned when a state mutation would violate an invariant.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateInvariantError {
    #[error("cannot mark session completed: {0} repositories still pending")]
    PendingNotEmpty(usize),

    #[error("parallel must be >= 1, got {0}")]
    InvalidParallel(usize),
}

impl CloneState {
    /// Create a fresh in-progress state with empty collections.
    pub fn new(
        id: &SessionId,
        target_path: PathBuf,
        strategy: CloneStrategy,
        parallel: usize,
        max_retries: u32,
    ) -> Result<Self, StateInvariantError> {
        if parallel < 1 {
            return Err(StateInvariantError::InvalidParallel(parallel));
        }
        let now = Utc::now();
        Ok(Self {
            provider: id.provider().to_owned(),
            organization: id.organization().to_owned(),
            target_path,
            strategy,
            parallel,
            max_retries,
            status: SessionStatus::InProgress,
            total_repositories: 0,
            pending: Vec::new(),
            completed: BTreeMap::new(),
            failed: BTreeMap::new(),
            start_time: now,
            last_updated: now,
        })
    }

    /// The canonical identifier for this state.
    pub fn session_id(&self) -> SessionId {
        // Provider and organization were validated at construction.
        SessionId {
            provider: self.provider.clone(),
            organization: self.organization.clone(),
        }
    }

    /// Replace the pending list with the frozen enumeration snapshot and
    /// finalize `total_repositories`.
    ///
    /// Names already recorded as completed or failed (a resumed run) are
    /// excluded from pending but still count toward the total.
    pub fn set_pending(&mut self, names: Vec<String>) {
        self.total_repositories = names.len();
        self.pending = names
            .into_iter()
            .filter(|n| !self.completed.contains_key(n) && !self.failed.contains_key(n))
            .collect();
        self.touch();
    }

    /// Move `name` into the completed map, removing it from pending and,
    /// when a retry succeeded after an earlier failure, from failed.
    pub fn record_completed(&mut self, name: &str, record: CompletedRepo) {
        self.pending.retain(|n| n != name);
        self.failed.remove(name);
        self.completed.insert(name.to_owned(), record);
        self.touch();
    }

    /// Move `name` into the failed map, removing it from pending.
    pub fn record_failed(&mut self, name: &str, record: FailedRepo) {
        self.pending.retain(|n| n != name);
        self.completed.remove(name);
        self.failed.insert(name.to_owned(), record);
        self.touch();
    }

    /// Terminal transition to `completed`. Requires an empty pending list.
    pub fn mark_completed(&mut self) -> Result<(), StateInvariantError> {
        if !self.pending.is_empty() {
            return Err(StateInvariantError::PendingNotEmpty(self.pending.len()));
        }
        self.status = SessionStatus::Completed;
        self.touch();
        Ok(())
    }

    /// Terminal transition to `failed`.
    pub fn mark_failed(&mut self) {
        self.status = SessionStatus::Failed;
        self.touch();
    }

    /// Re-open a previously interrupted session for resumption.
    pub fn mark_resumed(&mut self) {
        self.status = SessionStatus::InProgress;
        self.touch();
    }

    /// Advance `last_updated`, keeping it monotonically non-decreasing even
    /// if the wall clock stepped backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_updated {
            self.last_updated = now;
        }
    }

    /// Derived progress view over the current collections.
    pub fn progress(&self) -> StateProgress {
        let completed = self.completed.len();
        let failed = self.failed.len();
        let pending = self.pending.len();
        let percent = if self.total_repositories == 0 {
            0.0
        } else {
            100.0 * (completed + failed) as f64 / self.total_repositories as f64
        };
        StateProgress {
            session_id: self.session_id().to_string(),
            status: self.status,
            completed,
            failed,
            pending,
            percent,
            start_time: self.start_time,
            last_activity: self.last_updated,
        }
    }
}

/// Observational progress snapshot derived from a [`CloneState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateProgress {
    pub session_id: String,
    pub status: SessionStatus,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub percent: f64,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
