use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use tokio::process::Command as AsyncCommand;
use tracing::debug;
use url::Url;

/// Username Gitea writes into mirror remotes that carry a token
pub const OAUTH_USERNAME: &str = "oauth2";

/// Origin remote that embeds an `oauth2:<token>` credential
#[derive(Clone, PartialEq, Eq)]
pub struct ManagedRemote {
    url: Url,
    pub secret: String,
    pub owner: String,
    pub repo: String,
}

impl ManagedRemote {
    /// The same remote URL carrying `secret` instead
    pub fn with_secret(&self, secret: &str) -> Result<String> {
        let mut url = self.url.clone();
        url.set_password(Some(secret))
            .map_err(|_| anyhow!("Cannot set a credential on {}", self))?;
        Ok(url.to_string())
    }
}

impl fmt::Display for ManagedRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut url = self.url.clone();
        let _ = url.set_password(Some("***"));
        write!(f, "{}", url)
    }
}

impl fmt::Debug for ManagedRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedRemote")
            .field("url", &self.to_string())
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .finish()
    }
}

/// Result of looking at an origin URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteInspection {
    Managed(ManagedRemote),
    /// Not something the sidecar rotates, with the reason
    Unmanaged(String),
}

/// Classify an origin URL.
///
/// Only `oauth2:<secret>@host/owner/repo[.git]` remotes are managed. A managed
/// remote whose path is not exactly `owner/repo` is an error.
pub fn inspect_remote_url(raw: &str) -> Result<RemoteInspection> {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(_) => return Ok(RemoteInspection::Unmanaged("not a URL".to_string())),
    };

    if url.username() != OAUTH_USERNAME {
        return Ok(RemoteInspection::Unmanaged(format!(
            "username is not {}",
            OAUTH_USERNAME
        )));
    }

    let secret = match url.password() {
        Some(secret) if !secret.is_empty() => secret.to_string(),
        _ => return Ok(RemoteInspection::Unmanaged("no secret".to_string())),
    };

    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let (owner, repo) = match segments.as_slice() {
        [owner, repo] => (owner.to_string(), repo.trim_end_matches(".git").to_string()),
        _ => bail!(
            "Remote path {:?} is not of the form owner/repo",
            url.path()
        ),
    };

    if repo.is_empty() {
        bail!("Remote path {:?} has an empty repository name", url.path());
    }

    Ok(RemoteInspection::Managed(ManagedRemote {
        url,
        secret,
        owner,
        repo,
    }))
}

/// Read and write the origin remote of local repositories
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fails if `path` is not a git repository
    async fn open(&self, path: &Path) -> Result<()>;

    /// `Ok(None)` when there is no origin remote
    async fn origin_url(&self, path: &Path) -> Result<Option<String>>;

    async fn set_origin_url(&self, path: &Path, url: &str) -> Result<()>;
}

/// Git operations through the `git` CLI
#[derive(Debug, Clone, Default)]
pub struct GitClient;

impl GitClient {
    pub fn new() -> Self {
        Self
    }

    /// `git --git-dir=<path> <args...>`, works for bare repositories
    fn git(path: &Path) -> AsyncCommand {
        let mut command = AsyncCommand::new("git");
        command.arg(format!("--git-dir={}", path.display()));
        command
    }

    /// Installed git version, if any
    pub async fn version() -> Result<String> {
        let output = AsyncCommand::new("git")
            .arg("--version")
            .output()
            .await
            .context("Failed to execute git")?;

        if !output.status.success() {
            bail!("git --version failed");
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl RemoteStore for GitClient {
    async fn open(&self, path: &Path) -> Result<()> {
        let output = Self::git(path)
            .args(["rev-parse", "--git-dir"])
            .output()
            .await
            .context("Failed to execute git rev-parse")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Not a git repository {}: {}", path.display(), stderr.trim());
        }

        Ok(())
    }

    async fn origin_url(&self, path: &Path) -> Result<Option<String>> {
        let output = Self::git(path)
            .args(["config", "--get", "remote.origin.url"])
            .output()
            .await
            .context("Failed to execute git config")?;

        if output.status.success() {
            let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Ok((!url.is_empty()).then_some(url));
        }

        // Exit status 1 means the key is not set
        if output.status.code() == Some(1) {
            debug!("No origin remote in {}", path.display());
            return Ok(None);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "Failed to read origin of {}: {}",
            path.display(),
            stderr.trim()
        )
    }

    async fn set_origin_url(&self, path: &Path, url: &str) -> Result<()> {
        let output = Self::git(path)
            .args(["remote", "set-url", "origin", url])
            .output()
            .await
            .context("Failed to execute git remote set-url")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Failed to update origin of {}: {}",
                path.display(),
                stderr.trim()
            );
        }

        Ok(())
    }
}
