//! On-disk session store: one JSON file per session, atomic writes.
//!
//! The durability contract is write-temp-then-rename within the state
//! directory, with an fsync of the temp file before the rename, so the
//! canonical file is always either the pre-write or the post-write state.
//! Writers for the same session are serialized by an in-process lock keyed
//! on the state filename; readers tolerate the transient missing file a
//! rename can expose on some filesystems.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::models::{CloneState, SessionId, SessionStatus};

/// Errors from the session store.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("no state file for session {0}")]
    NotFound(SessionId),

    #[error("state file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state file at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    InvalidSessionId(#[from] crate::models::SessionIdParseError),

    #[error(transparent)]
    Invariant(#[from] crate::models::StateInvariantError),
}

/// File-backed store for [`CloneState`] records.
pub struct SessionStore {
    state_dir: PathBuf,
    /// Per-session write locks, keyed by state filename.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    /// Open a store rooted at `state_dir`, or at the default location when
    /// `None`.
    ///
    /// The default follows the XDG layout: `$XDG_CONFIG_HOME/.gzh/state`,
    /// falling back to `~/.config/.gzh/state`.
    pub fn new(state_dir: Option<PathBuf>) -> Self {
        let state_dir = state_dir.unwrap_or_else(default_state_dir);
        Self {
            state_dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The directory this store reads and writes.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Path of the state file for a session: `<state_dir>/<provider>_<org>.json`.
    pub fn path_for(&self, id: &SessionId) -> PathBuf {
        self.state_dir.join(format!("{}.json", id.file_stem()))
    }

    /// Persist a state record atomically, serialized per session.
    pub async fn save(&self, state: &CloneState) -> Result<(), StateError> {
        let id = state.session_id();
        let lock = self.lock_for(&id).await;
        let _guard = lock.lock().await;
        self.write_atomic(&id, state)
    }

    /// Load a session's state.
    ///
    /// Retries once after a short pause when the file is missing, since a
    /// concurrent atomic rename can briefly expose a gap between unlink and
    /// link on some filesystems.
    pub async fn load(&self, id: &SessionId) -> Result<CloneState, StateError> {
        match self.read_file(id) {
            Err(StateError::NotFound(_)) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.read_file(id)
            }
            other => other,
        }
    }

    /// Load, apply `mutate`, and persist, all under the session's lock.
    ///
    /// This is the read-modify-write primitive the session layer builds on:
    /// once it returns, a crash-and-reload observes the mutated state.
    pub async fn update<F, T>(&self, id: &SessionId, mutate: F) -> Result<T, StateError>
    where
        F: FnOnce(&mut CloneState) -> Result<T, StateError>,
    {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut state = self.read_file(id)?;
        let out = mutate(&mut state)?;
        self.write_atomic(id, &state)?;
        Ok(out)
    }

    /// Whether a state file exists for this session.
    pub fn has(&self, id: &SessionId) -> bool {
        self.path_for(id).exists()
    }

    /// Delete a session's state file. Missing files are not an error.
    pub async fn delete(&self, id: &SessionId) -> Result<(), StateError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::Io { path, source: e }),
        }
    }

    /// List every readable state record in the store.
    ///
    /// Corrupt or foreign files are skipped with a warning rather than
    /// failing the whole listing.
    pub fn list(&self) -> Result<Vec<CloneState>, StateError> {
        let entries = match fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StateError::Io {
                    path: self.state_dir.clone(),
                    source: e,
                });
            }
        };

        let mut states = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StateError::Io {
                path: self.state_dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_state_file(&path) {
                Ok(state) => states.push(state),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable state file");
                }
            }
        }
        Ok(states)
    }

    /// The most recently updated in-progress session, if any.
    pub fn latest_in_progress(&self) -> Result<Option<CloneState>, StateError> {
        let mut states = self.list()?;
        states.retain(|s| s.status == SessionStatus::InProgress);
        states.sort_by_key(|s| s.last_updated);
        Ok(states.pop())
    }

    /// Delete terminal sessions whose `last_updated` is older than
    /// `older_than`. Returns the number of sessions removed.
    pub async fn sweep_terminal(&self, older_than: chrono::Duration) -> Result<usize, StateError> {
        let cutoff = Utc::now() - older_than;
        let mut removed = 0;
        for state in self.list()? {
            if state.status.is_terminal() && state.last_updated < cutoff {
                let id = state.session_id();
                self.delete(&id).await?;
                tracing::info!(session_id = %id, status = %state.status, "swept terminal session");
                removed += 1;
            }
        }
        Ok(removed)
    }

    // -- internals ---------------------------------------------------------

    async fn lock_for(&self, id: &SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id.file_stem()).or_default().clone()
    }

    fn read_file(&self, id: &SessionId) -> Result<CloneState, StateError> {
        let path = self.path_for(id);
        match read_state_file(&path) {
            Err(StateError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Err(StateError::NotFound(id.clone()))
            }
            other => other,
        }
    }

    fn write_atomic(&self, id: &SessionId, state: &CloneState) -> Result<(), StateError> {
        fs::create_dir_all(&self.state_dir).map_err(|e| StateError::Io {
            path: self.state_dir.clone(),
            source: e,
        })?;

        let path = self.path_for(id);
        let tmp = self.state_dir.join(format!(".{}.json.tmp", id.file_stem()));

        let bytes =
            serde_json::to_vec_pretty(state).map_err(|e| StateError::Corrupt {
                path: path.clone(),
                source: e,
            })?;

        // Write and fsync the temp file before the rename makes it visible.
        let mut file = fs::File::create(&tmp).map_err(|e| StateError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        file.write_all(&bytes).map_err(|e| StateError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        file.sync_all().map_err(|e| StateError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        drop(file);

        fs::rename(&tmp, &path).map_err(|e| StateError::Io {
            path: path.clone(),
            source: e,
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("state_dir", &self.state_dir)
            .finish()
    }
}

fn read_state_file(path: &Path) -> Result<CloneState, StateError> {
    let contents = fs::read(path).map_err(|e| StateError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_slice(&contents).map_err(|e| StateError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Default state directory: `$XDG_CONFIG_HOME/.gzh/state` or
/// `~/.config/.gzh/state`.
fn default_state_dir() -> PathBuf {
    let config_home = if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
    };
    config_home.join(".gzh").join("state")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
