//! Fallback providers: capability bundles that put an alternative path in
//! place when a classified failure occurs.
//!
//! A provider is `{can_handle, execute, info}`; the orchestrator consults
//! registered providers in priority order and re-runs the failed operation
//! after the first provider that reports success. What "in place" means is
//! the caller's wiring: an endpoint provider rotates a shared endpoint
//! index the operation reads, a token provider rotates the credential the
//! transport will fetch next.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCategory, ErrorDomain, UserError};
use crate::token::TokenManager;

/// Identity and ordering for a provider.
#[derive(Debug, Clone)]
pub struct FallbackInfo {
    pub name: String,
    /// Higher priority providers are consulted first.
    pub priority: i32,
    pub description: String,
}

/// What a successful fallback put in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackOutcome {
    /// Requests should now target this endpoint.
    Endpoint { url: String },
    /// Reads should now use this path.
    FilePath { path: PathBuf },
    /// The service's credential was replaced.
    TokenSource { service: String },
}

/// The fallback capability bundle.
#[async_trait]
pub trait FallbackProvider: Send + Sync {
    fn info(&self) -> FallbackInfo;

    /// Whether this provider applies to the classified error.
    fn can_handle(&self, error: &UserError) -> bool;

    /// Put the alternative in place. Success means the orchestrator may
    /// re-run the failed operation.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        error: &UserError,
    ) -> Result<FallbackOutcome, UserError>;
}

// ---------------------------------------------------------------------------
// Built-in providers
// ---------------------------------------------------------------------------

/// Rotates through alternative API endpoints on network failures.
///
/// The shared cursor is read by the operation being recovered; rotation
/// advances it to the next endpoint in the list.
pub struct EndpointFallback {
    name: String,
    endpoints: Vec<String>,
    cursor: Arc<AtomicUsize>,
    priority: i32,
}

impl EndpointFallback {
    pub fn new(name: &str, endpoints: Vec<String>, cursor: Arc<AtomicUsize>) -> Self {
        Self {
            name: name.to_owned(),
            endpoints,
            cursor,
            priority: 10,
        }
    }

    /// The endpoint the cursor currently selects.
    pub fn current(&self) -> Option<&str> {
        self.endpoints
            .get(self.cursor.load(Ordering::SeqCst) % self.endpoints.len().max(1))
            .map(|s| s.as_str())
    }
}

#[async_trait]
impl FallbackProvider for EndpointFallback {
    fn info(&self) -> FallbackInfo {
        FallbackInfo {
            name: self.name.clone(),
            priority: self.priority,
            description: format!("{} alternative endpoints", self.endpoints.len()),
        }
    }

    fn can_handle(&self, error: &UserError) -> bool {
        matches!(
            error.category,
            ErrorCategory::Network | ErrorCategory::Timeout
        ) && self.endpoints.len() > 1
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        _error: &UserError,
    ) -> Result<FallbackOutcome, UserError> {
        let next = self.cursor.fetch_add(1, Ordering::SeqCst) + 1;
        let url = self.endpoints[next % self.endpoints.len()].clone();
        tracing::info!(provider = %self.name, endpoint = %url, "rotated to fallback endpoint");
        Ok(FallbackOutcome::Endpoint { url })
    }
}

/// Falls back to alternative file locations when a path is missing or
/// unreadable.
pub struct FilePathFallback {
    name: String,
    candidates: Vec<PathBuf>,
    priority: i32,
}

impl FilePathFallback {
    pub fn new(name: &str, candidates: Vec<PathBuf>) -> Self {
        Self {
            name: name.to_owned(),
            candidates,
            priority: 5,
        }
    }
}

#[async_trait]
impl FallbackProvider for FilePathFallback {
    fn info(&self) -> FallbackInfo {
        FallbackInfo {
            name: self.name.clone(),
            priority: self.priority,
            description: format!("{} alternative paths", self.candidates.len()),
        }
    }

    fn can_handle(&self, error: &UserError) -> bool {
        error.domain == ErrorDomain::File
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        error: &UserError,
    ) -> Result<FallbackOutcome, UserError> {
        for candidate in &self.candidates {
            if tokio::fs::metadata(candidate).await.is_ok() {
                tracing::info!(provider = %self.name, path = %candidate.display(), "using alternative path");
                return Ok(FallbackOutcome::FilePath {
                    path: candidate.clone(),
                });
            }
        }
        Err(UserError::new(
            ErrorDomain::File,
            ErrorCategory::NotFound,
            "no_alternative_path",
            "no alternative file location exists",
        )
        .with_cause(error.clone()))
    }
}

/// Rotates the stored credential for a service on auth failures.
pub struct TokenSourceFallback {
    tokens: Arc<TokenManager>,
    service: String,
    priority: i32,
}

impl TokenSourceFallback {
    pub fn new(tokens: Arc<TokenManager>, service: &str) -> Self {
        Self {
            tokens,
            service: service.to_owned(),
            priority: 8,
        }
    }
}

#[async_trait]
impl FallbackProvider for TokenSourceFallback {
    fn info(&self) -> FallbackInfo {
        FallbackInfo {
            name: format!("token-fallback-{}", self.service),
            priority: self.priority,
            description: "alternative token sources".to_owned(),
        }
    }

    fn can_handle(&self, error: &UserError) -> bool {
        error.category == ErrorCategory::Auth
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        _error: &UserError,
    ) -> Result<FallbackOutcome, UserError> {
        self.tokens
            .handle_auth_failure(&self.service)
            .await
            .map_err(|e| {
                UserError::new(
                    ErrorDomain::Auth,
                    ErrorCategory::Auth,
                    "no_alternative_token",
                    "no refresh or fallback token is available",
                )
                .with_cause(e)
            })?;
        Ok(FallbackOutcome::TokenSource {
            service: self.service.clone(),
        })
    }
}
