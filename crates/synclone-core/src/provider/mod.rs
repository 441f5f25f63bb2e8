//! Provider adapters: the uniform interface over GitHub, GitLab, and
//! Gitea, plus the registry the session coordinator resolves them from.
//!
//! The trait is object-safe so adapters live in the registry as
//! `Arc<dyn Provider>` and the session layer never knows which host it is
//! talking to.

pub mod filters;
pub mod git;
pub mod gitea;
pub mod github;
pub mod gitlab;
pub mod options;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use synclone_state::CloneStrategy;

use crate::error::{ErrorCategory, ErrorDomain, UserError};
use crate::transport::TransportError;

use filters::RepositoryFilters;
use git::GitError;

/// Repository metadata as returned by a provider listing, the shape the
/// filter contract evaluates against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub name: String,
    pub clone_url: String,
    pub ssh_url: String,
    pub private: bool,
    pub archived: bool,
    pub fork: bool,
    pub language: Option<String>,
    pub topics: Vec<String>,
    pub stars: u64,
}

/// What `clone_one` did to the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoOperation {
    /// Fresh clone into an empty target.
    Cloned,
    /// Existing clone hard-reset to the remote branch tip.
    Reset,
    /// Existing clone fast-forwarded.
    Pulled,
    /// Remote-tracking refs updated, working tree untouched.
    Fetched,
    /// Dry run: nothing touched.
    Skipped,
}

impl fmt::Display for RepoOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cloned => "clone",
            Self::Reset => "reset",
            Self::Pulled => "pull",
            Self::Fetched => "fetch",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Outcome of one repository operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoResult {
    pub name: String,
    pub url: String,
    pub operation: RepoOperation,
    pub message: String,
}

/// Adapter failures.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("unexpected {provider} API payload: {message}")]
    Payload { provider: String, message: String },

    #[error("organization {organization} not found on {provider}")]
    OrgNotFound {
        provider: String,
        organization: String,
    },

    #[error("invalid repository filter: {0}")]
    Filter(#[from] filters::FilterError),
}

impl ProviderError {
    /// Whether retrying the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::Git(e) => e.is_retryable(),
            Self::Payload { .. } | Self::OrgNotFound { .. } | Self::Filter(_) => false,
        }
    }

    /// Lift into the surfaced taxonomy for recording and events.
    pub fn to_user_error(&self, domain: ErrorDomain) -> UserError {
        match self {
            Self::Transport(TransportError::AuthFailed { service, status }) => UserError::new(
                domain,
                ErrorCategory::Auth,
                "bad_credentials",
                format!("{service} rejected the credentials (HTTP {status})"),
            ),
            Self::Transport(TransportError::Exhausted { kind, message, .. }) => UserError::new(
                ErrorDomain::Network,
                ErrorCategory::Network,
                kind.as_str(),
                message.clone(),
            ),
            Self::Transport(TransportError::CircuitOpen(e)) => UserError::new(
                domain,
                ErrorCategory::Resource,
                "circuit_open",
                e.to_string(),
            ),
            Self::Transport(e) => {
                UserError::new(ErrorDomain::Network, ErrorCategory::Network, "transport", e.to_string())
            }
            Self::Git(e) => UserError::new(
                ErrorDomain::Git,
                ErrorCategory::State,
                e.slug(),
                e.to_string(),
            ),
            Self::Payload { message, .. } => {
                UserError::new(domain, ErrorCategory::Format, "bad_payload", message.clone())
            }
            Self::OrgNotFound { organization, .. } => UserError::new(
                domain,
                ErrorCategory::NotFound,
                "org_missing",
                format!("organization {organization} not found"),
            ),
            Self::Filter(e) => UserError::new(
                ErrorDomain::Config,
                ErrorCategory::Validation,
                "bad_filter",
                e.to_string(),
            ),
        }
    }
}

/// The uniform provider contract.
///
/// Object-safe on purpose: the registry stores `Arc<dyn Provider>` and the
/// session coordinator is provider-agnostic.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name as used in session ids (`github`, `gitlab`, `gitea`).
    fn name(&self) -> &str;

    /// Enumerate the organization's repositories, post-filtered by the
    /// filter contract. Returns the names and the filtered total.
    async fn list_repositories(
        &self,
        cancel: &CancellationToken,
        organization: &str,
        filters: &RepositoryFilters,
    ) -> Result<(Vec<String>, usize), ProviderError>;

    /// Clone or update a single repository under `target_dir`.
    async fn clone_one(
        &self,
        cancel: &CancellationToken,
        target_dir: &Path,
        organization: &str,
        name: &str,
        strategy: CloneStrategy,
    ) -> Result<RepoResult, ProviderError>;
}

// Compile-time assertion: Provider must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Provider) {}
};

/// Named collection of provider adapters.
///
/// Providers are stored as `Arc<dyn Provider>` because clone jobs capture
/// them into `'static` closures.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under the name it reports. Replaces and returns
    /// any previous provider with the same name.
    pub fn register(&mut self, provider: impl Provider + 'static) -> Option<Arc<dyn Provider>> {
        let name = provider.name().to_string();
        self.providers.insert(name, Arc::new(provider))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Registered provider names, unordered.
    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct NoopProvider {
        provider_name: String,
    }

    #[async_trait]
    impl Provider for NoopProvider {
        fn name(&self) -> &str {
            &self.provider_name
        }

        async fn list_repositories(
            &self,
            _cancel: &CancellationToken,
            _organization: &str,
            _filters: &RepositoryFilters,
        ) -> Result<(Vec<String>, usize), ProviderError> {
            Ok((vec![], 0))
        }

        async fn clone_one(
            &self,
            _cancel: &CancellationToken,
            _target_dir: &Path,
            organization: &str,
            name: &str,
            _strategy: CloneStrategy,
        ) -> Result<RepoResult, ProviderError> {
            Ok(RepoResult {
                name: name.to_string(),
                url: format!("https://example.com/{organization}/{name}.git"),
                operation: RepoOperation::Skipped,
                message: "noop".to_string(),
            })
        }
    }

    #[test]
    fn registry_register_and_get() {
        let mut registry = ProviderRegistry::new();
        assert!(registry.is_empty());

        registry.register(NoopProvider {
            provider_name: "github".into(),
        });
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("github").unwrap().name(), "github");
        assert!(registry.get("gitlab").is_none());
    }

    #[test]
    fn registry_replaces_same_name() {
        let mut registry = ProviderRegistry::new();
        registry.register(NoopProvider {
            provider_name: "gitea".into(),
        });
        let old = registry.register(NoopProvider {
            provider_name: "gitea".into(),
        });
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn provider_is_object_safe() {
        let provider: Arc<dyn Provider> = Arc::new(NoopProvider {
            provider_name: "noop".into(),
        });
        let result = provider
            .clone_one(
                &CancellationToken::new(),
                &PathBuf::from("/tmp"),
                "acme",
                "r1",
                CloneStrategy::Fetch,
            )
            .await
            .unwrap();
        assert_eq!(result.operation, RepoOperation::Skipped);
    }

    #[test]
    fn operation_display_names() {
        assert_eq!(RepoOperation::Cloned.to_string(), "clone");
        assert_eq!(RepoOperation::Reset.to_string(), "reset");
        assert_eq!(RepoOperation::Pulled.to_string(), "pull");
        assert_eq!(RepoOperation::Fetched.to_string(), "fetch");
    }
}
