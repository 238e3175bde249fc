use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::app::{AppClient, TokenMinter};
use crate::config::Config;
use crate::gitea::GiteaClient;
use crate::github::{enterprise_api_base, GitHubClient};

/// How the engine authenticates against GitHub, decided once at startup
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Personal access token plus the token Gitea clones with
    StaticToken {
        token: String,
        mirroring_token: String,
    },
    /// GitHub App installation
    AppInstallation {
        app_id: u64,
        installation_id: u64,
        private_key_path: PathBuf,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::StaticToken { .. } => f
                .debug_struct("StaticToken")
                .field("token", &"[REDACTED]")
                .field("mirroring_token", &"[REDACTED]")
                .finish(),
            Credential::AppInstallation {
                app_id,
                installation_id,
                private_key_path,
            } => f
                .debug_struct("AppInstallation")
                .field("app_id", app_id)
                .field("installation_id", installation_id)
                .field("private_key_path", private_key_path)
                .finish(),
        }
    }
}

/// Source of the token handed to Gitea when a mirror is created
#[derive(Clone)]
pub enum TokenSource {
    Static(String),
    /// Minted fresh on every request
    Installation(Arc<dyn TokenMinter>),
}

impl TokenSource {
    pub async fn token(&self) -> Result<String> {
        match self {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Installation(minter) => {
                let token = minter.mint_installation_token().await?;
                Ok(token.token)
            }
        }
    }

    pub fn is_installation(&self) -> bool {
        matches!(self, TokenSource::Installation(_))
    }

    /// The app minter, when authenticating as an installation
    pub fn minter(&self) -> Option<Arc<dyn TokenMinter>> {
        match self {
            TokenSource::Static(_) => None,
            TokenSource::Installation(minter) => Some(minter.clone()),
        }
    }
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenSource::Static(_) => write!(f, "Static([REDACTED])"),
            TokenSource::Installation(_) => write!(f, "Installation"),
        }
    }
}

/// Authenticated handles for both sides of the mirror
pub struct Handles {
    pub source: Arc<GitHubClient>,
    pub destination: Arc<GiteaClient>,
    pub tokens: TokenSource,
    /// API base used for every GitHub call, `None` for github.com
    pub api_base: Option<String>,
}

/// Build the GitHub and Gitea handles from a validated configuration
pub fn authenticate(config: &Config) -> Result<Handles> {
    let api_base = config.enterprise_url().map(enterprise_api_base);
    if let Some(base) = &api_base {
        info!("Using GitHub Enterprise API at {}", base);
    }

    let (source, tokens) = match config.credential()? {
        Credential::StaticToken {
            token,
            mirroring_token,
        } => {
            let source = GitHubClient::with_token(&token, api_base.clone())?;
            (source, TokenSource::Static(mirroring_token))
        }
        Credential::AppInstallation {
            app_id,
            installation_id,
            private_key_path,
        } => {
            let app = Arc::new(AppClient::from_key_file(
                app_id,
                installation_id,
                &private_key_path,
                api_base.clone(),
            )?);
            let source = GitHubClient::with_installation(app.clone(), api_base.clone());
            (source, TokenSource::Installation(app))
        }
    };

    let destination = GiteaClient::new(&config.gitea.url, &config.gitea.token)
        .context("Failed to create Gitea client")?;
    debug!("Gitea client ready for {}", config.gitea.url);

    Ok(Handles {
        source: Arc::new(source),
        destination: Arc::new(destination),
        tokens,
        api_base,
    })
}
