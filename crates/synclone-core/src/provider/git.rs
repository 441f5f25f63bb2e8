//! Git execution: fresh clones and the three reconcile strategies for an
//! existing working copy.
//!
//! Commands run through `tokio::process` with `kill_on_drop`, racing the
//! caller's cancellation token; stderr is captured into the error so a
//! failed sync says why.

use std::path::Path;
use std::process::Stdio;

use tokio_util::sync::CancellationToken;

use synclone_state::CloneStrategy;

use super::RepoOperation;

/// Git execution failures.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to spawn git: {0}")]
    Spawn(std::io::Error),

    #[error("git {args} exited with {status}: {stderr}")]
    Exited {
        args: String,
        status: String,
        stderr: String,
    },

    #[error("git operation cancelled")]
    Cancelled,
}

impl GitError {
    /// Network-ish git failures are retryable; local-state failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Spawn(_) => false,
            Self::Cancelled => false,
            Self::Exited { stderr, .. } => {
                let lower = stderr.to_ascii_lowercase();
                lower.contains("could not resolve host")
                    || lower.contains("connection")
                    || lower.contains("timed out")
                    || lower.contains("early eof")
                    || lower.contains("rpc failed")
                    || lower.contains("remote end hung up")
            }
        }
    }

    /// Error-code slug for the taxonomy.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "spawn_failed",
            Self::Cancelled => "cancelled",
            Self::Exited { stderr, .. } => {
                let lower = stderr.to_ascii_lowercase();
                if lower.contains("not possible to fast-forward")
                    || lower.contains("divergent branches")
                    || lower.contains("conflict")
                {
                    "merge_conflict"
                } else if lower.contains("index.lock") {
                    "stale_lock"
                } else if lower.contains("uncommitted changes")
                    || lower.contains("would be overwritten")
                {
                    "dirty_worktree"
                } else {
                    "command_failed"
                }
            }
        }
    }
}

/// Reconcile `dest` with `url` according to the strategy.
///
/// A missing working copy is freshly cloned regardless of strategy. For an
/// existing one:
/// - `reset`: fetch, then hard-reset to the remote-tracked branch tip.
/// - `pull`: fetch, then fast-forward only; divergence is a failure.
/// - `fetch`: update remote-tracking refs, leave the working tree alone.
pub async fn sync_repository(
    cancel: &CancellationToken,
    url: &str,
    dest: &Path,
    strategy: CloneStrategy,
) -> Result<RepoOperation, GitError> {
    if !dest.join(".git").is_dir() {
        if let Some(parent) = dest.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let dest_str = dest.to_string_lossy();
        run_git(cancel, None, &["clone", url, &dest_str]).await?;
        return Ok(RepoOperation::Cloned);
    }

    match strategy {
        CloneStrategy::Reset => {
            run_git(cancel, Some(dest), &["fetch", "--prune", "origin"]).await?;
            run_git(cancel, Some(dest), &["reset", "--hard", "@{upstream}"]).await?;
            Ok(RepoOperation::Reset)
        }
        CloneStrategy::Pull => {
            run_git(cancel, Some(dest), &["fetch", "--prune", "origin"]).await?;
            run_git(cancel, Some(dest), &["merge", "--ff-only", "@{upstream}"]).await?;
            Ok(RepoOperation::Pulled)
        }
        CloneStrategy::Fetch => {
            run_git(cancel, Some(dest), &["fetch", "--prune", "origin"]).await?;
            Ok(RepoOperation::Fetched)
        }
    }
}

/// Run one git command, racing cancellation. Returns stdout on success.
pub async fn run_git(
    cancel: &CancellationToken,
    dir: Option<&Path>,
    args: &[&str],
) -> Result<String, GitError> {
    let mut command = tokio::process::Command::new("git");
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }

    tracing::debug!(args = ?args, dir = ?dir, "running git");

    let child = command.spawn().map_err(GitError::Spawn)?;
    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(GitError::Spawn)?,
        _ = cancel.cancelled() => return Err(GitError::Cancelled),
    };

    if !output.status.success() {
        return Err(GitError::Exited {
            args: args.join(" "),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(stderr: &str) -> GitError {
        GitError::Exited {
            args: "fetch --prune origin".to_string(),
            status: "exit status: 1".to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn network_failures_are_retryable() {
        assert!(exited("fatal: Could not resolve host: github.com").is_retryable());
        assert!(exited("error: RPC failed; curl 18 transfer closed").is_retryable());
        assert!(exited("fatal: the remote end hung up unexpectedly").is_retryable());
        assert!(!exited("fatal: not possible to fast-forward, aborting.").is_retryable());
        assert!(!GitError::Cancelled.is_retryable());
    }

    #[test]
    fn slugs_classify_common_states() {
        assert_eq!(
            exited("fatal: Not possible to fast-forward, aborting.").slug(),
            "merge_conflict"
        );
        assert_eq!(
            exited("fatal: Unable to create '/x/.git/index.lock': File exists.").slug(),
            "stale_lock"
        );
        assert_eq!(
            exited("error: Your local changes would be overwritten by merge").slug(),
            "dirty_worktree"
        );
        assert_eq!(exited("fatal: unknown catastrophe").slug(), "command_failed");
    }

    #[tokio::test]
    async fn run_git_captures_stderr_on_failure() {
        // `git` with a bogus subcommand fails fast without touching disk.
        let result = run_git(&CancellationToken::new(), None, &["definitely-not-a-verb"]).await;
        match result {
            Err(GitError::Exited { stderr, .. }) => {
                assert!(!stderr.is_empty(), "stderr should carry the git message");
            }
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_token_aborts_command() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // `git help` would normally succeed; cancellation wins the race.
        let result = run_git(&cancel, None, &["help"]).await;
        assert!(matches!(result, Err(GitError::Cancelled)));
    }

    #[tokio::test]
    async fn fresh_clone_and_fetch_roundtrip() {
        // Build a tiny origin repository, clone it, then run each strategy
        // against the clone. Skips silently when git is unavailable.
        if run_git(&CancellationToken::new(), None, &["version"]).await.is_err() {
            return;
        }

        let tmp = tempfile::TempDir::new().unwrap();
        let origin = tmp.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        let cancel = CancellationToken::new();

        for args in [
            vec!["init", "--initial-branch=main", "."],
            vec!["config", "user.email", "test@localhost"],
            vec!["config", "user.name", "test"],
        ] {
            run_git(&cancel, Some(&origin), &args).await.unwrap();
        }
        std::fs::write(origin.join("README.md"), "hello").unwrap();
        run_git(&cancel, Some(&origin), &["add", "-A"]).await.unwrap();
        run_git(&cancel, Some(&origin), &["commit", "-m", "init"])
            .await
            .unwrap();

        let dest = tmp.path().join("mirror");
        let url = origin.to_string_lossy().to_string();

        let op = sync_repository(&cancel, &url, &dest, CloneStrategy::Reset)
            .await
            .unwrap();
        assert_eq!(op, RepoOperation::Cloned);
        assert!(dest.join("README.md").exists());

        // Second run with fetch: refs updated, no clone.
        let op = sync_repository(&cancel, &url, &dest, CloneStrategy::Fetch)
            .await
            .unwrap();
        assert_eq!(op, RepoOperation::Fetched);

        // Reset against an unchanged origin is a no-op reset.
        let op = sync_repository(&cancel, &url, &dest, CloneStrategy::Reset)
            .await
            .unwrap();
        assert_eq!(op, RepoOperation::Reset);

        // Pull fast-forwards after origin advances.
        std::fs::write(origin.join("CHANGES.md"), "more").unwrap();
        run_git(&cancel, Some(&origin), &["add", "-A"]).await.unwrap();
        run_git(&cancel, Some(&origin), &["commit", "-m", "more"])
            .await
            .unwrap();
        let op = sync_repository(&cancel, &url, &dest, CloneStrategy::Pull)
            .await
            .unwrap();
        assert_eq!(op, RepoOperation::Pulled);
        assert!(dest.join("CHANGES.md").exists());
    }
}
