//! The closed error taxonomy: every surfaced failure is a [`UserError`]
//! with a domain, a category, a stable code, and actionable suggestions.
//!
//! The taxonomy is the vocabulary the recovery orchestrator's policies
//! match against, so domains and categories are closed enums rather than
//! free-form strings.

pub mod classify;
pub mod solutions;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which subsystem produced the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDomain {
    Github,
    Gitlab,
    Gitea,
    Git,
    Config,
    Network,
    Auth,
    File,
    Api,
    Cli,
}

impl ErrorDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Gitea => "gitea",
            Self::Git => "git",
            Self::Config => "config",
            Self::Network => "network",
            Self::Auth => "auth",
            Self::File => "file",
            Self::Api => "api",
            Self::Cli => "cli",
        }
    }
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Network,
    Auth,
    Timeout,
    NotFound,
    Permission,
    Format,
    State,
    Resource,
    Config,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Auth => "auth",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::Permission => "permission",
            Self::Format => "format",
            Self::State => "state",
            Self::Resource => "resource",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully classified, user-surfaceable error.
///
/// `code` is `<domain>_<category>_<slug>` and is the key the solution
/// knowledge base and recovery policies match on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserError {
    pub code: String,
    pub domain: ErrorDomain,
    pub category: ErrorCategory,
    pub message: String,
    pub description: String,
    pub suggestions: Vec<String>,
    pub context: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl UserError {
    /// Build an error with the canonical `<domain>_<category>_<slug>` code.
    ///
    /// Suggestions are filled from the solution knowledge base when the
    /// caller provides none, so every surfaced error carries at least one.
    pub fn new(
        domain: ErrorDomain,
        category: ErrorCategory,
        slug: &str,
        message: impl Into<String>,
    ) -> Self {
        let code = format!("{domain}_{category}_{slug}");
        let suggestions = solutions::suggestions_for(&code);
        Self {
            code,
            domain,
            category,
            message: message.into(),
            description: String::new(),
            suggestions,
            context: BTreeMap::new(),
            timestamp: Utc::now(),
            request_id: None,
            cause: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_context(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_owned(), value.into());
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

/// `Display` writes `[code] message`; the long-form description and
/// suggestions are presentation-layer concerns.
impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for UserError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_domain_category_slug() {
        let err = UserError::new(
            ErrorDomain::Github,
            ErrorCategory::Auth,
            "token_expired",
            "token expired",
        );
        assert_eq!(err.code, "github_auth_token_expired");
    }

    #[test]
    fn every_error_has_suggestions() {
        // A code with a knowledge-base entry gets its suggestions.
        let known = UserError::new(
            ErrorDomain::Network,
            ErrorCategory::Network,
            "connection_refused",
            "connection refused",
        );
        assert!(!known.suggestions.is_empty());

        // An unknown code still gets the generic fallback.
        let unknown = UserError::new(
            ErrorDomain::Api,
            ErrorCategory::Format,
            "no_such_slug",
            "whatever",
        );
        assert!(!unknown.suggestions.is_empty());
    }

    #[test]
    fn builder_methods_accumulate() {
        let id = Uuid::new_v4();
        let err = UserError::new(
            ErrorDomain::Git,
            ErrorCategory::State,
            "merge_conflict",
            "merge failed",
        )
        .with_description("fast-forward not possible")
        .with_context("repo", "acme/r1")
        .with_request_id(id)
        .with_cause("exit status 1");

        assert_eq!(err.description, "fast-forward not possible");
        assert_eq!(err.context.get("repo").unwrap(), "acme/r1");
        assert_eq!(err.request_id, Some(id));
        assert_eq!(err.cause.as_deref(), Some("exit status 1"));
    }

    #[test]
    fn display_is_code_and_message() {
        let err = UserError::new(
            ErrorDomain::Gitlab,
            ErrorCategory::NotFound,
            "group_missing",
            "group not found",
        );
        assert_eq!(err.to_string(), "[gitlab_not_found_group_missing] group not found");
    }
}
