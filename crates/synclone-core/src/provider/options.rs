//! Clone options: the pre-validated knobs a caller hands to a session.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use synclone_state::CloneStrategy;

use crate::error::{ErrorCategory, ErrorDomain, UserError};

/// Which URL family to clone over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneProtocol {
    #[default]
    Https,
    Ssh,
}

impl fmt::Display for CloneProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Https => "https",
            Self::Ssh => "ssh",
        };
        f.write_str(s)
    }
}

impl FromStr for CloneProtocol {
    type Err = UserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "https" => Ok(Self::Https),
            "ssh" => Ok(Self::Ssh),
            other => Err(UserError::new(
                ErrorDomain::Config,
                ErrorCategory::Validation,
                "bad_protocol",
                format!("protocol must be https or ssh, got {other:?}"),
            )),
        }
    }
}

/// Presentation hint forwarded to the progress collaborator; the core only
/// validates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    #[default]
    Bar,
    Dots,
    Spinner,
    Quiet,
}

impl FromStr for ProgressMode {
    type Err = UserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bar" => Ok(Self::Bar),
            "dots" => Ok(Self::Dots),
            "spinner" => Ok(Self::Spinner),
            "quiet" => Ok(Self::Quiet),
            other => Err(UserError::new(
                ErrorDomain::Config,
                ErrorCategory::Validation,
                "bad_progress_mode",
                format!("progress mode must be bar, dots, spinner, or quiet, got {other:?}"),
            )),
        }
    }
}

/// Options governing a clone run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneOptions {
    pub protocol: CloneProtocol,
    pub strategy: CloneStrategy,
    pub parallel: usize,
    pub max_retries: u32,
    /// Resume the existing session instead of starting fresh.
    pub resume: bool,
    /// Enumerate and plan without touching the network or working trees.
    pub dry_run: bool,
    pub progress_mode: ProgressMode,
    /// Explicit token override for this run.
    pub token: Option<String>,
    /// Report local directories that no longer match any remote repository.
    pub cleanup_orphans: bool,
    /// Failed-repository fraction above which the session ends as failed
    /// instead of completed. `None` means per-repo failures never fail the
    /// session.
    pub fail_threshold: Option<f64>,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            protocol: CloneProtocol::Https,
            strategy: CloneStrategy::Reset,
            parallel: 4,
            max_retries: 3,
            resume: false,
            dry_run: false,
            progress_mode: ProgressMode::Bar,
            token: None,
            cleanup_orphans: false,
            fail_threshold: None,
        }
    }
}

impl CloneOptions {
    /// Check the numeric invariants the rest of the engine assumes.
    pub fn validate(&self) -> Result<(), UserError> {
        if self.parallel < 1 {
            return Err(UserError::new(
                ErrorDomain::Config,
                ErrorCategory::Validation,
                "bad_parallel",
                format!("parallel must be >= 1, got {}", self.parallel),
            ));
        }
        if let Some(threshold) = self.fail_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(UserError::new(
                    ErrorDomain::Config,
                    ErrorCategory::Validation,
                    "bad_fail_threshold",
                    format!("fail_threshold must be within [0, 1], got {threshold}"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        CloneOptions::default().validate().unwrap();
    }

    #[test]
    fn zero_parallel_is_rejected() {
        let options = CloneOptions {
            parallel: 0,
            ..Default::default()
        };
        let err = options.validate().unwrap_err();
        assert_eq!(err.code, "config_validation_bad_parallel");
    }

    #[test]
    fn fail_threshold_bounds() {
        let mut options = CloneOptions {
            fail_threshold: Some(0.25),
            ..Default::default()
        };
        options.validate().unwrap();

        options.fail_threshold = Some(1.5);
        assert!(options.validate().is_err());
    }

    #[test]
    fn protocol_and_progress_mode_parse() {
        assert_eq!("https".parse::<CloneProtocol>().unwrap(), CloneProtocol::Https);
        assert_eq!("ssh".parse::<CloneProtocol>().unwrap(), CloneProtocol::Ssh);
        assert!("ftp".parse::<CloneProtocol>().is_err());

        assert_eq!("quiet".parse::<ProgressMode>().unwrap(), ProgressMode::Quiet);
        assert!("disco".parse::<ProgressMode>().is_err());
    }
}
