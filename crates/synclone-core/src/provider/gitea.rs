//! Gitea adapter. Unlike the hosted providers there is no default
//! instance: the base URL is required input.

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

const SERVICE: &str = "gitea";
// Gitea's default API page cap is lower than GitHub's.
const PER_PAGE: usize = 50;

/// Gitea adapter configuration. `base_url` has no default on purpose.
#[derive(Debug, Clone)]
pub struct GiteaConfig {
    pub base_url: String,
    pub protocol: CloneProtocol,
}

impl GiteaConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            protocol: CloneProtocol::Https,
        }
    }
}

pub struct GiteaProvider {
    transport: Arc<Transport>,
    config: GiteaConfig,
}

impl GiteaProvider {
    pub fn new(transport: Arc<Transport>, config: GiteaConfig) -> Self {
        Self { transport, config }
    }

    fn host(&self) -> &str {
        self.config
            .base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
    }
}

#[derive(Debug, Deserialize)]
struct GiteaRepo {
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
    stars_count: u64,
}

impl GiteaRepo {
    fn into_info(self, organization: &str, base_url: &str, host: &str) -> RepoInfo {
        let name = self.name;
        RepoInfo {
            clone_url: self
                .clone_url
                .unwrap_or_else(|| format!("{base_url}/{organization}/{name}.git")),
            ssh_url: self
                .ssh_url
                .unwrap_or_else(|| format!("git@{host}:{organization}/{name}.git")),
            name,
            private: self.private,
            archived: self.archived,
            fork: self.fork,
            language: self.language,
            topics: self.topics,
            stars: self.stars_count,
        }
    }
}

#[async_trait]
impl Provider for GiteaProvider {
    fn name(&self) -> &str {
        "gitea"
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
                "{}/api/v1/orgs/{organization}/repos?limit={PER_PAGE}&page={page}",
                self.config.base_url.trim_end_matches('/')
            );
            let response = self
                .transport
                .execute(cancel, &ApiRequest::get(SERVICE, url))
                .await
                .map_err(|e| match e {
                    TransportError::HttpStatus { status: 404, .. } => ProviderError::OrgNotFound {
                        provider: "gitea".to_owned(),
                        organization: organization.to_owned(),
                    },
                    other => ProviderError::Transport(other),
                })?;

            let repos: Vec<GiteaRepo> = response.json().map_err(|e| ProviderError::Payload {
                provider: "gitea".to_owned(),
                message: format!("repository list page {page}: {e}"),
            })?;
            let page_len = repos.len();

            let host = self.host().to_owned();
            names.extend(
                repos
                    .into_iter()
                    .map(|r| r.into_info(organization, &self.config.base_url, &host))
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
            instance = %self.config.base_url,
            "gitea enumeration finished"
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
        let url = match self.config.protocol {
            CloneProtocol::Https => format!(
                "{}/{organization}/{name}.git",
                self.config.base_url.trim_end_matches('/')
            ),
            CloneProtocol::Ssh => format!("git@{}:{organization}/{name}.git", self.host()),
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

#[cfg(test)]
mod tests {
    use super::*;
    use synclone_test_utils::{ScriptedSender, anonymous_transport, json_response};

    #[tokio::test]
    async fn lists_from_configured_instance() {
        let sender = ScriptedSender::new(vec![Ok(json_response(
            200,
            serde_json::json!([
                {"name": "widget", "private": false, "stars_count": 2},
                {"name": "gadget", "private": true, "stars_count": 0},
            ]),
        ))]);
        let provider = GiteaProvider::new(
            anonymous_transport(sender.clone()),
            GiteaConfig::new("https://git.example.org"),
        );

        let (names, total) = provider
            .list_repositories(
                &CancellationToken::new(),
                "acme",
                &RepositoryFilters::default(),
            )
            .await
            .unwrap();

        assert_eq!(names, vec!["widget", "gadget"]);
        assert_eq!(total, 2);
        assert!(
            sender
                .request(0)
                .url
                .starts_with("https://git.example.org/api/v1/orgs/acme/repos")
        );
    }

    #[tokio::test]
    async fn builds_urls_from_instance_host() {
        let sender = ScriptedSender::new(vec![]);
        let provider = GiteaProvider::new(
            anonymous_transport(sender.clone()),
            GiteaConfig::new("https://git.example.org/"),
        );
        assert_eq!(provider.host(), "git.example.org");

        let ssh = GiteaProvider::new(
            anonymous_transport(sender),
            GiteaConfig {
                base_url: "https://git.example.org".into(),
                protocol: CloneProtocol::Ssh,
            },
        );
        assert_eq!(ssh.host(), "git.example.org");
    }
}
