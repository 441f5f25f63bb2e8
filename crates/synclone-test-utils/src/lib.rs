//! Shared fixtures for synclone integration tests.
//!
//! Provides a scripted HTTP sender (so the transport stack runs without a
//! network), a scripted provider (so session runs happen without git), and
//! a temp-dir session store helper.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use synclone_core::breaker::BreakerRegistry;
use synclone_core::provider::filters::RepositoryFilters;
use synclone_core::provider::git::GitError;
use synclone_core::provider::{Provider, ProviderError, RepoOperation, RepoResult};
use synclone_core::token::TokenManager;
use synclone_core::transport::{
    HttpSend, Transport, TransportConfig, WireError, WireRequest, WireResponse,
};
use synclone_state::{CloneStrategy, SessionStore};

// ---------------------------------------------------------------------------
// Scripted HTTP sender
// ---------------------------------------------------------------------------

/// An [`HttpSend`] that pops one canned result per attempt and records every
/// request it saw.
pub struct ScriptedSender {
    script: Mutex<Vec<Result<WireResponse, WireError>>>,
    seen: Mutex<Vec<WireRequest>>,
}

impl ScriptedSender {
    /// Responses are consumed front to back; running out panics the test.
    pub fn new(mut script: Vec<Result<WireResponse, WireError>>) -> Arc<Self> {
        script.reverse();
        Arc::new(Self {
            script: Mutex::new(script),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Number of requests that reached the wire.
    pub fn attempts(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// The nth request sent (0-based).
    pub fn request(&self, index: usize) -> WireRequest {
        self.seen.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl HttpSend for ScriptedSender {
    async fn send(&self, request: WireRequest) -> Result<WireResponse, WireError> {
        self.seen.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop()
            .expect("scripted sender ran out of responses")
    }
}

/// A JSON response with the given status.
pub fn json_response(status: u16, body: serde_json::Value) -> WireResponse {
    WireResponse {
        status,
        headers: HashMap::new(),
        body: serde_json::to_vec(&body).expect("serializable body"),
    }
}

/// A transport over the scripted sender with no registered services: every
/// request goes out anonymous, breakers use defaults.
pub fn anonymous_transport(sender: Arc<ScriptedSender>) -> Arc<Transport> {
    let tokens = TokenManager::new(sender.clone(), Default::default());
    Arc::new(Transport::new(
        sender,
        tokens,
        Arc::new(BreakerRegistry::default()),
        TransportConfig::default(),
    ))
}

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

/// Per-repository failure plan for [`FakeProvider`].
#[derive(Debug, Clone, Copy)]
pub enum FailMode {
    /// Fail this many times, then succeed.
    Transient { failures: u32 },
    /// Fail every attempt, non-retryably.
    Permanent,
}

#[derive(Debug)]
struct FailPlan {
    mode: FailMode,
    attempts_seen: u32,
}

/// A provider that enumerates a fixed repo list and "clones" according to
/// scripted per-repo failure plans, touching neither network nor git.
pub struct FakeProvider {
    provider_name: String,
    repos: Vec<String>,
    plans: Mutex<HashMap<String, FailPlan>>,
    clone_log: Mutex<Vec<String>>,
    /// Optional artificial latency per clone.
    delay: Option<std::time::Duration>,
}

impl FakeProvider {
    pub fn new(name: &str, repos: &[&str]) -> Self {
        Self {
            provider_name: name.to_owned(),
            repos: repos.iter().map(|s| s.to_string()).collect(),
            plans: Mutex::new(HashMap::new()),
            clone_log: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Script a failure plan for one repository.
    pub fn fail(self, repo: &str, mode: FailMode) -> Self {
        self.plans.lock().unwrap().insert(
            repo.to_owned(),
            FailPlan {
                mode,
                attempts_seen: 0,
            },
        );
        self
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every clone_one invocation, in order.
    pub fn clone_calls(&self) -> Vec<String> {
        self.clone_log.lock().unwrap().clone()
    }

    fn url_for(&self, organization: &str, name: &str) -> String {
        format!("https://example.com/{organization}/{name}.git")
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn list_repositories(
        &self,
        _cancel: &CancellationToken,
        _organization: &str,
        filters: &RepositoryFilters,
    ) -> Result<(Vec<String>, usize), ProviderError> {
        // Scripted repos carry no metadata; the filter contract is still
        // validated so bad patterns fail the same way they would for real.
        filters.compile()?;
        let names = self.repos.clone();
        let total = names.len();
        Ok((names, total))
    }

    async fn clone_one(
        &self,
        cancel: &CancellationToken,
        _target_dir: &Path,
        organization: &str,
        name: &str,
        _strategy: CloneStrategy,
    ) -> Result<RepoResult, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Git(GitError::Cancelled));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.clone_log.lock().unwrap().push(name.to_owned());

        let mut plans = self.plans.lock().unwrap();
        if let Some(plan) = plans.get_mut(name) {
            match plan.mode {
                FailMode::Permanent => {
                    return Err(ProviderError::Git(GitError::Exited {
                        args: "clone".to_owned(),
                        status: "exit status: 128".to_owned(),
                        stderr: format!("fatal: repository '{name}' not found"),
                    }));
                }
                FailMode::Transient { failures } => {
                    if plan.attempts_seen < failures {
                        plan.attempts_seen += 1;
                        return Err(ProviderError::Git(GitError::Exited {
                            args: "clone".to_owned(),
                            status: "exit status: 128".to_owned(),
                            stderr: "fatal: unable to access: Connection timed out".to_owned(),
                        }));
                    }
                }
            }
        }

        Ok(RepoResult {
            name: name.to_owned(),
            url: self.url_for(organization, name),
            operation: RepoOperation::Cloned,
            message: "cloned".to_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Store helper
// ---------------------------------------------------------------------------

/// A session store in a fresh temp dir. Keep the `TempDir` alive for the
/// duration of the test.
pub fn temp_store() -> (tempfile::TempDir, Arc<SessionStore>) {
    let tmp = tempfile::TempDir::new().expect("create temp dir");
    let store = Arc::new(SessionStore::new(Some(tmp.path().to_path_buf())));
    (tmp, store)
}
