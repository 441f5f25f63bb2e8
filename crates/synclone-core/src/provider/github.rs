//! GitHub adapter: org enumeration over the REST API and per-repo clone.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use synclone_state::CloneStrategy;

use crate::transport::{ApiRequest, Transport, TransportError};

use super::filters::RepositoryFilters;
use super::options::CloneProtocol;
use super::{Provider, ProviderError, RepoInfo, RepoResult, git};

/// Service name used for tokens and breaker keying.
const SERVICE: &str = "github";
const PER_PAGE: usize = 100;

/// GitHub adapter configuration.
#[derive(Debug, Clone)]
pub struct GithubConfig {
    pub api_base: String,
    /// Host used when building clone URLs.
    pub clone_host: String,
    pub protocol: CloneProtocol,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_owned(),
            clone_host: "github.com".to_owned(),
            protocol: CloneProtocol::Https,
        }
    }
}

pub struct GithubProvider {
    transport: Arc<Transport>,
    config: GithubConfig,
}

impl GithubProvider {
    pub fn new(transport: Arc<Transport>, config: GithubConfig) -> Self {
        Self { transport, config }
    }

    fn clone_url(&self, organization: &str, name: &str) -> String {
        match self.config.protocol {
            CloneProtocol::Https => format!(
                "https://{}/{organization}/{name}.git",
                self.config.clone_host
            ),
            CloneProtocol::Ssh => format!(
                "git@{}:{organization}/{name}.git",
                self.config.clone_host
            ),
        }
    }
}

/// The subset of the repository payload the filter contract needs.
#[derive(Debug, Deserialize)]
struct GithubRepo {
    name: String,
    #[serde(default)]
    clone_url: Option<String>,
    #[serde(default)]
    ssh_url: Option<String>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    fork: bool,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    stargazers_count: u64,
}

impl GithubRepo {
    fn into_info(self, organization: &str) -> RepoInfo {
        let name = self.name;
        RepoInfo {
            clone_url: self
                .clone_url
                .unwrap_or_else(|| format!("https://github.com/{organization}/{name}.git")),
            ssh_url: self
                .ssh_url
                .unwrap_or_else(|| format!("git@github.com:{organization}/{name}.git")),
            name,
            private: self.private,
            archived: self.archived,
            fork: self.fork,
            language: self.language,
            topics: self.topics,
            stars: self.stargazers_count,
        }
    }
}

#[async_trait]
impl Provider for GithubProvider {
    fn name(&self) -> &str {
        "github"
    }

    async fn list_repositories(
        &self,
        cancel: &CancellationToken,
        organization: &str,
        filters: &RepositoryFilters,
    ) -> Result<(Vec<String>, usize), ProviderError> {
        let compiled = filters.compile()?;
        let mut names = Vec::new();
        let mut page = 1usize;

        loop {
            let url = format!(
                "{}/orgs/{organization}/repos?per_page={PER_PAGE}&page={page}",
                self.config.api_base
            );
            let response = self
                .transport
                .execute(cancel, &ApiRequest::get(SERVICE, url))
                .await
                .map_err(|e| match e {
                    TransportError::HttpStatus { status: 404, .. } => ProviderError::OrgNotFound {
                        provider: "github".to_owned(),
                        organization: organization.to_owned(),
                    },
                    other => ProviderError::Transport(other),
                })?;

            let repos: Vec<GithubRepo> =
                response.json().map_err(|e| ProviderError::Payload {
                    provider: "github".to_owned(),
                    message: format!("repository list page {page}: {e}"),
                })?;
            let page_len = repos.len();

            names.extend(
                repos
                    .into_iter()
                    .map(|r| r.into_info(organization))
                    .filter(|info| compiled.matches(info))
                    .map(|info| info.name),
            );

            if page_len < PER_PAGE {
                break;
            }
            page += 1;
        }

        tracing::info!(
            organization,
            total = names.len(),
            pages = page,
            "github enumeration finished"
        );
        let total = names.len();
        Ok((names, total))
    }

    async fn clone_one(
        &self,
        cancel: &CancellationToken,
        target_dir: &Path,
        organization: &str,
        name: &str,
        strategy: CloneStrategy,
    ) -> Result<RepoResult, ProviderError> {
        let url = self.clone_url(organization, name);
        let dest = target_dir.join(name);
        let operation = git::sync_repository(cancel, &url, &dest, strategy).await?;
        Ok(RepoResult {
            name: name.to_owned(),
            url,
            operation,
            message: format!("{operation} into {}", dest.display()),
        })
    }
}
