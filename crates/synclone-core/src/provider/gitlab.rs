//! GitLab adapter: group project enumeration over the v4 API.

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

const SERVICE: &str = "gitlab";
const PER_PAGE: usize = 100;

/// GitLab adapter configuration.
#[derive(Debug, Clone)]
pub struct GitlabConfig {
    pub base_url: String,
    pub protocol: CloneProtocol,
}

impl Default for GitlabConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gitlab.com".to_owned(),
            protocol: CloneProtocol::Https,
        }
    }
}

pub struct GitlabProvider {
    transport: Arc<Transport>,
    config: GitlabConfig,
}

impl GitlabProvider {
    pub fn new(transport: Arc<Transport>, config: GitlabConfig) -> Self {
        Self { transport, config }
    }
}

/// GitLab calls repositories "projects"; `path` is the clone-safe name.
#[derive(Debug, Deserialize)]
struct GitlabProject {
    path: String,
    #[serde(default)]
    http_url_to_repo: Option<String>,
    #[serde(default)]
    ssh_url_to_repo: Option<String>,
    #[serde(default)]
    visibility: Option<String>,
    #[serde(default)]
    archived: bool,
    /// Present (non-null) only on forks.
    #[serde(default)]
    forked_from_project: Option<serde_json::Value>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    star_count: u64,
}

impl GitlabProject {
    fn into_info(self, group: &str, base_url: &str) -> RepoInfo {
        let host = base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        let name = self.path;
        RepoInfo {
            clone_url: self
                .http_url_to_repo
                .unwrap_or_else(|| format!("{base_url}/{group}/{name}.git")),
            ssh_url: self
                .ssh_url_to_repo
                .unwrap_or_else(|| format!("git@{host}:{group}/{name}.git")),
            name,
            private: self.visibility.as_deref() != Some("public"),
            archived: self.archived,
            fork: self.forked_from_project.is_some(),
            // The list payload does not carry a primary language.
            language: None,
            topics: self.topics,
            stars: self.star_count,
        }
    }
}

#[async_trait]
impl Provider for GitlabProvider {
    fn name(&self) -> &str {
        "gitlab"
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
                "{}/api/v4/groups/{organization}/projects?per_page={PER_PAGE}&page={page}&include_subgroups=false",
                self.config.base_url
            );
            let response = self
                .transport
                .execute(cancel, &ApiRequest::get(SERVICE, url))
                .await
                .map_err(|e| match e {
                    TransportError::HttpStatus { status: 404, .. } => ProviderError::OrgNotFound {
                        provider: "gitlab".to_owned(),
                        organization: organization.to_owned(),
                    },
                    other => ProviderError::Transport(other),
                })?;

            let projects: Vec<GitlabProject> =
                response.json().map_err(|e| ProviderError::Payload {
                    provider: "gitlab".to_owned(),
                    message: format!("project list page {page}: {e}"),
                })?;
            let page_len = projects.len();

            names.extend(
                projects
                    .into_iter()
                    .map(|p| p.into_info(organization, &self.config.base_url))
                    .filter(|info| compiled.matches(info))
                    .map(|info| info.name),
            );

            if page_len < PER_PAGE {
                break;
            }
            page += 1;
        }

        tracing::info!(
            group = organization,
            total = names.len(),
            "gitlab enumeration finished"
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
        let host = self
            .config
            .base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        let url = match self.config.protocol {
            CloneProtocol::Https => {
                format!("{}/{organization}/{name}.git", self.config.base_url)
            }
            CloneProtocol::Ssh => format!("git@{host}:{organization}/{name}.git"),
        };
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
