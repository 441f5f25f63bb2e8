//! Solution knowledge base: remediation bundles keyed by error code.
//!
//! Every surfaced [`super::UserError`] draws its suggestion list from here.
//! A [`Solution`] optionally carries commands the AutoFix recovery strategy
//! can run; commands marked dangerous are never executed automatically.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A single remediation command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolutionCommand {
    /// Shell command line to run.
    pub command: String,
    /// What the command does, shown before execution.
    pub purpose: String,
    /// Dangerous commands (destructive, credential-touching) are listed for
    /// the user but refused by AutoFix.
    pub dangerous: bool,
}

/// A named remediation bundle for one error code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solution {
    /// Error code this solution applies to: `<domain>_<category>_<slug>`.
    pub code: String,
    pub title: String,
    /// Ordered human steps.
    pub steps: Vec<String>,
    /// Commands AutoFix may run, in order.
    pub commands: Vec<SolutionCommand>,
    /// Documentation links.
    pub references: Vec<String>,
    /// Whether the bundle is safe to apply without a human in the loop.
    pub automated: bool,
}

/// Lookup table over the built-in solution catalog.
#[derive(Debug, Clone)]
pub struct SolutionEngine {
    by_code: Arc<HashMap<String, Solution>>,
}

impl SolutionEngine {
    /// Build the engine over the built-in catalog.
    pub fn new() -> Self {
        Self::with_catalog(builtin_catalog())
    }

    /// Build the engine over a caller-supplied catalog (later entries win
    /// on duplicate codes).
    pub fn with_catalog(catalog: Vec<Solution>) -> Self {
        let mut by_code = HashMap::new();
        for solution in catalog {
            by_code.insert(solution.code.clone(), solution);
        }
        Self {
            by_code: Arc::new(by_code),
        }
    }

    /// Exact-code lookup.
    pub fn find(&self, code: &str) -> Option<&Solution> {
        self.by_code.get(code)
    }

    /// Find a solution eligible for automatic application: its `automated`
    /// flag is set and it has at least one non-dangerous command.
    pub fn find_automated(&self, code: &str) -> Option<&Solution> {
        self.find(code)
            .filter(|s| s.automated && s.commands.iter().any(|c| !c.dangerous))
    }
}

impl Default for SolutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Suggestion lines for an error code, used when constructing a
/// [`super::UserError`]. Unknown codes get a generic non-empty fallback.
pub fn suggestions_for(code: &str) -> Vec<String> {
    static GENERIC: [&str; 2] = [
        "Re-run with RUST_LOG=debug for the full request trace",
        "Check provider status pages for ongoing incidents",
    ];
    static ENGINE: std::sync::OnceLock<SolutionEngine> = std::sync::OnceLock::new();
    let engine = ENGINE.get_or_init(SolutionEngine::new);
    match engine.find(code) {
        Some(solution) if !solution.steps.is_empty() => solution.steps.clone(),
        _ => GENERIC.iter().map(|s| s.to_string()).collect(),
    }
}

fn cmd(command: &str, purpose: &str) -> SolutionCommand {
    SolutionCommand {
        command: command.to_string(),
        purpose: purpose.to_string(),
        dangerous: false,
    }
}

fn dangerous_cmd(command: &str, purpose: &str) -> SolutionCommand {
    SolutionCommand {
        command: command.to_string(),
        purpose: purpose.to_string(),
        dangerous: true,
    }
}

/// The built-in catalog. Codes follow `<domain>_<category>_<slug>`.
fn builtin_catalog() -> Vec<Solution> {
    vec![
        Solution {
            code: "network_network_connection_refused".into(),
            title: "Connection refused by provider host".into(),
            steps: vec![
                "Verify the provider base URL is correct and reachable".into(),
                "Check whether a proxy or VPN is required on this network".into(),
            ],
            commands: vec![cmd(
                "curl -sSf -o /dev/null https://api.github.com",
                "probe provider reachability",
            )],
            references: vec![],
            automated: false,
        },
        Solution {
            code: "network_timeout_request_timeout".into(),
            title: "Provider request timed out".into(),
            steps: vec![
                "Retry with a lower parallelism to reduce contention".into(),
                "Increase the per-request timeout for slow networks".into(),
            ],
            commands: vec![],
            references: vec![],
            automated: false,
        },
        Solution {
            code: "network_network_dns_failure".into(),
            title: "Provider hostname did not resolve".into(),
            steps: vec![
                "Check the hostname for typos in the provider base URL".into(),
                "Verify local DNS: `resolvectl query api.github.com`".into(),
            ],
            commands: vec![],
            references: vec![],
            automated: false,
        },
        Solution {
            code: "github_auth_token_expired".into(),
            title: "GitHub token expired".into(),
            steps: vec![
                "Generate a new token at https://github.com/settings/tokens".into(),
                "Export it as GITHUB_TOKEN, or register a fallback token".into(),
            ],
            commands: vec![],
            references: vec!["https://docs.github.com/authentication".into()],
            automated: false,
        },
        Solution {
            code: "github_auth_bad_credentials".into(),
            title: "GitHub rejected the credentials".into(),
            steps: vec![
                "Confirm the token has the `repo` and `read:org` scopes".into(),
                "Fine-grained tokens must grant access to the organization".into(),
            ],
            commands: vec![cmd(
                "curl -sS -H \"Authorization: token $GITHUB_TOKEN\" https://api.github.com/user",
                "validate the token against the identity endpoint",
            )],
            references: vec![],
            automated: false,
        },
        Solution {
            code: "gitlab_auth_token_expired".into(),
            title: "GitLab token expired".into(),
            steps: vec![
                "OAuth2 tokens refresh automatically when a refresh_token is stored".into(),
                "For personal access tokens, rotate at https://gitlab.com/-/user_settings/personal_access_tokens".into(),
            ],
            commands: vec![],
            references: vec![],
            automated: false,
        },
        Solution {
            code: "api_resource_rate_limited".into(),
            title: "Provider API rate limit hit".into(),
            steps: vec![
                "Waits honor the provider's Retry-After automatically; reduce parallelism to stay under the limit".into(),
                "Authenticated requests get a much higher quota than anonymous ones".into(),
            ],
            commands: vec![],
            references: vec![],
            automated: false,
        },
        Solution {
            code: "git_state_merge_conflict".into(),
            title: "Pull strategy hit a non-fast-forward branch".into(),
            steps: vec![
                "Re-run with the `reset` strategy to discard local changes".into(),
                "Or resolve the divergence manually in the repository".into(),
            ],
            commands: vec![dangerous_cmd(
                "git reset --hard @{upstream}",
                "discard local work and match the remote branch",
            )],
            references: vec![],
            automated: true,
        },
        Solution {
            code: "git_state_dirty_worktree".into(),
            title: "Working tree has uncommitted changes".into(),
            steps: vec![
                "Stash or commit local changes before a pull-strategy sync".into(),
            ],
            commands: vec![cmd("git stash", "stash uncommitted changes")],
            automated: true,
            references: vec![],
        },
        Solution {
            code: "git_state_stale_lock".into(),
            title: "Stale git index lock".into(),
            steps: vec![
                "A previous git process died and left .git/index.lock behind".into(),
                "Remove the lock file if no git process is running".into(),
            ],
            commands: vec![cmd(
                "find .git -maxdepth 1 -name index.lock -mmin +10 -delete",
                "remove a lock file older than ten minutes",
            )],
            automated: true,
            references: vec![],
        },
        Solution {
            code: "file_permission_target_unwritable".into(),
            title: "Target directory is not writable".into(),
            steps: vec![
                "Check ownership and mode of the target path".into(),
                "Pick a target under your home directory".into(),
            ],
            commands: vec![],
            references: vec![],
            automated: false,
        },
        Solution {
            code: "config_validation_invalid_session_id".into(),
            title: "Malformed session identifier".into(),
            steps: vec![
                "Session ids are `<provider>:<organization>` with exactly one colon".into(),
            ],
            commands: vec![],
            references: vec![],
            automated: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_codes_are_unique() {
        let catalog = builtin_catalog();
        let mut codes: Vec<&str> = catalog.iter().map(|s| s.code.as_str()).collect();
        let before = codes.len();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), before, "duplicate code in catalog");
    }

    #[test]
    fn find_returns_exact_match() {
        let engine = SolutionEngine::new();
        let solution = engine.find("github_auth_token_expired").unwrap();
        assert_eq!(solution.title, "GitHub token expired");
        assert!(engine.find("github_auth_never_heard_of_it").is_none());
    }

    #[test]
    fn automated_lookup_requires_safe_commands() {
        let engine = SolutionEngine::new();

        // automated + safe command: eligible.
        assert!(engine.find_automated("git_state_stale_lock").is_some());

        // not automated: ineligible even though it has commands.
        assert!(engine.find_automated("github_auth_bad_credentials").is_none());

        // merge_conflict's only command is dangerous: ineligible.
        assert!(engine.find_automated("git_state_merge_conflict").is_none());
    }

    #[test]
    fn suggestions_fall_back_for_unknown_codes() {
        let known = suggestions_for("git_state_merge_conflict");
        assert!(known[0].contains("reset"));

        let unknown = suggestions_for("cli_format_mystery");
        assert!(!unknown.is_empty());
    }

    #[test]
    fn every_catalog_entry_has_steps() {
        for solution in builtin_catalog() {
            assert!(
                !solution.steps.is_empty(),
                "solution {} has no steps",
                solution.code
            );
        }
    }
}
