//! Gitea REST client
//!
//! Only the calls the mirror needs: repository lookup, migration (which is how
//! Gitea creates pull mirrors) and the version endpoint used as a health check.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use url::Url;

use crate::discovery::SourceRepository;

/// How often Gitea pulls from the source once the mirror exists
pub const MIRROR_INTERVAL: &str = "10m";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GiteaRepository {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub mirror: bool,
    #[serde(default)]
    pub private: bool,
}

/// Body of `POST /repos/migrate`
#[derive(Clone, Serialize)]
pub struct MigrateRepoOptions {
    pub clone_addr: String,
    pub auth_token: String,
    pub repo_name: String,
    pub repo_owner: String,
    pub service: String,
    pub mirror: bool,
    pub mirror_interval: String,
    pub private: bool,
    pub description: String,
    pub wiki: bool,
    pub milestones: bool,
    pub labels: bool,
    pub issues: bool,
    pub pull_requests: bool,
    pub releases: bool,
    pub lfs: bool,
}

impl MigrateRepoOptions {
    /// Pull mirror of `repository` named `owner/name`, cloned with `token`
    pub fn mirror_of(repository: &SourceRepository, owner: &str, name: &str, token: &str) -> Self {
        Self {
            clone_addr: repository.clone_url.clone(),
            auth_token: token.to_string(),
            repo_name: name.to_string(),
            repo_owner: owner.to_string(),
            service: "github".to_string(),
            mirror: true,
            mirror_interval: MIRROR_INTERVAL.to_string(),
            private: repository.is_private,
            description: repository.description.clone(),
            wiki: true,
            milestones: true,
            labels: true,
            issues: true,
            pull_requests: true,
            releases: true,
            lfs: true,
        }
    }
}

impl fmt::Debug for MigrateRepoOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrateRepoOptions")
            .field("clone_addr", &self.clone_addr)
            .field("auth_token", &"[REDACTED]")
            .field("repo_owner", &self.repo_owner)
            .field("repo_name", &self.repo_name)
            .field("private", &self.private)
            .finish_non_exhaustive()
    }
}

/// Where mirrors are created
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MirrorDestination: Send + Sync {
    /// `Ok(None)` when the repository does not exist
    async fn get_repo(&self, owner: &str, name: &str) -> Result<Option<GiteaRepository>>;

    async fn migrate_repo(&self, options: MigrateRepoOptions) -> Result<GiteaRepository>;
}

#[derive(Debug, Deserialize)]
struct ServerVersion {
    version: String,
}

/// Gitea API client
#[derive(Clone)]
pub struct GiteaClient {
    client: Client,
    base: Url,
    token: String,
}

impl fmt::Debug for GiteaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GiteaClient")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

impl GiteaClient {
    pub fn new(url: &str, token: &str) -> Result<Self> {
        let base = Url::parse(url).with_context(|| format!("Invalid Gitea URL: {}", url))?;
        if base.cannot_be_a_base() {
            bail!("Invalid Gitea URL: {}", url);
        }

        let client = Client::builder()
            .user_agent(concat!("gitea-mirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base,
            token: token.to_string(),
        })
    }

    /// `{base}/api/v1/{segments...}`, each segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| anyhow!("Invalid Gitea URL: {}", self.base))?;
            path.pop_if_empty().extend(["api", "v1"]).extend(segments);
        }
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(header::AUTHORIZATION, format!("token {}", self.token))
            .header(header::ACCEPT, "application/json")
    }

    /// Server version, used to confirm Gitea is reachable and the token accepted
    pub async fn server_version(&self) -> Result<String> {
        let url = self.endpoint(&["version"])?;
        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .context("Failed to reach Gitea")?;

        let version: ServerVersion = check_status(response)
            .await?
            .json()
            .await
            .context("Failed to parse Gitea version")?;

        Ok(version.version)
    }
}

#[async_trait]
impl MirrorDestination for GiteaClient {
    async fn get_repo(&self, owner: &str, name: &str) -> Result<Option<GiteaRepository>> {
        let url = self.endpoint(&["repos", owner, name])?;
        debug!("Looking up {}/{} in Gitea", owner, name);

        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .with_context(|| format!("Failed to look up {}/{}", owner, name))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let repo = check_status(response)
            .await
            .with_context(|| format!("Failed to look up {}/{}", owner, name))?
            .json()
            .await
            .with_context(|| format!("Failed to parse repository {}/{}", owner, name))?;

        Ok(Some(repo))
    }

    async fn migrate_repo(&self, options: MigrateRepoOptions) -> Result<GiteaRepository> {
        let url = self.endpoint(&["repos", "migrate"])?;
        let target = format!("{}/{}", options.repo_owner, options.repo_name);
        debug!("Requesting migration {:?}", options);

        let response = self
            .authorized(self.client.post(url))
            .json(&options)
            .send()
            .await
            .with_context(|| format!("Failed to create mirror {}", target))?;

        check_status(response)
            .await
            .with_context(|| format!("Failed to create mirror {}", target))?
            .json()
            .await
            .with_context(|| format!("Failed to parse created mirror {}", target))
    }
}

/// Turn a non-success response into an error carrying Gitea's message
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or(body);

    if message.is_empty() {
        bail!("Gitea returned {}", status)
    }
    bail!("Gitea returned {}: {}", status, message)
}
