use anyhow::{anyhow, bail, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::auth::Credential;
use crate::daemon::parse_duration;
use crate::filter::FilterMatcher;

/// Main configuration structure for gitea-mirror
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// GitHub (source) authentication
    #[serde(default)]
    pub github: GitHubConfig,

    /// Gitea (destination) connection settings
    #[serde(default)]
    pub gitea: GiteaConfig,

    /// Run the credential refresh sidecar next to the orchestrator
    #[serde(default)]
    pub sidecar: bool,

    /// Pass and scan cadence
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Ordered list of mirror mappings
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,
}

/// GitHub authentication. Either `token` or the `app-*` fields are used.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct GitHubConfig {
    /// GitHub Enterprise base URL
    #[serde(default)]
    pub enterprise_url: Option<String>,

    /// Personal access token used to query the API
    #[serde(default)]
    pub token: Option<String>,

    /// Token handed to Gitea for cloning when using a personal access token
    #[serde(default)]
    pub mirroring_token: Option<String>,

    /// GitHub App ID
    #[serde(default)]
    pub app_id: u64,

    /// GitHub App installation ID
    #[serde(default, rename = "app-install-id")]
    pub installation_id: u64,

    /// Path to the GitHub App private key (PEM)
    #[serde(default)]
    pub app_private_key_path: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct GiteaConfig {
    /// Gitea base URL
    #[serde(default)]
    pub url: String,

    /// Gitea API token
    #[serde(default)]
    pub token: String,

    /// Gitea's repository root on disk, scanned by the sidecar
    #[serde(default)]
    pub repos_path: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ScheduleConfig {
    /// Time between full mirroring passes
    #[serde(default = "default_mirror_interval")]
    pub mirror_interval: String, // "1h"

    /// Time between sidecar scans of the repository root
    #[serde(default = "default_scan_interval")]
    pub scan_interval: String, // "45m"
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "pretty", "full"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

/// Kind of GitHub account a mapping reads from
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[serde(alias = "User")]
    User,
    #[serde(alias = "Organization", alias = "org")]
    Organization,
}

/// One source account → destination owner rule
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MirrorConfig {
    /// Prepended to every mirrored repository name
    #[serde(default)]
    pub prefix: String,

    /// Appended to every mirrored repository name
    #[serde(default)]
    pub suffix: String,

    pub from: MirrorFrom,

    pub to: MirrorTo,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MirrorFrom {
    #[serde(rename = "type")]
    pub source_type: SourceType,

    pub name: String,

    #[serde(default)]
    pub filter: FilterConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MirrorTo {
    /// Gitea user or organization that owns the mirrors
    pub name: String,
}

/// Repository filtering configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct FilterConfig {
    /// Regular expressions; a repository must match one of them (if any)
    #[serde(default)]
    pub include: Vec<String>,

    /// Regular expressions; a repository matching any of them is skipped
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Only mirror archived repositories
    #[serde(default)]
    pub only_archived: bool,
}

/// Values coming from command-line flags or their environment variables.
/// Anything set here wins over the configuration file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub enterprise_url: Option<String>,
    pub app_id: Option<u64>,
    pub installation_id: Option<u64>,
    pub private_key_path: Option<String>,
    pub token: Option<String>,
    pub mirroring_token: Option<String>,
    pub gitea_url: Option<String>,
    pub gitea_token: Option<String>,
    pub sidecar: Option<bool>,
    pub repos_path: Option<String>,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_mirror_interval() -> String {
    "1h".to_string()
}
fn default_scan_interval() -> String {
    "45m".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            mirror_interval: default_mirror_interval(),
            scan_interval: default_scan_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl MirrorConfig {
    /// Name of the Gitea repository mirroring `source_name`
    pub fn destination_name(&self, source_name: &str) -> String {
        format!("{}{}{}", self.prefix, source_name, self.suffix)
    }
}

impl FilterConfig {
    pub fn matcher(&self) -> Result<FilterMatcher> {
        FilterMatcher::new(&self.include, &self.exclude, self.only_archived)
    }
}

impl ScheduleConfig {
    pub fn mirror_interval(&self) -> Result<Duration> {
        parse_duration(&self.mirror_interval).context("Invalid schedule.mirror-interval")
    }

    pub fn scan_interval(&self) -> Result<Duration> {
        parse_duration(&self.scan_interval).context("Invalid schedule.scan-interval")
    }
}

impl Config {
    /// Load from an explicit path, else from the default location if present,
    /// else start from defaults (flags and environment may fill the rest)
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Self::default_config_path()?;
                if default_path.exists() {
                    Self::load(&default_path)
                } else {
                    tracing::debug!("No configuration file at {:?}, using defaults", default_path);
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("gitea-mirror").join("config.yml"))
    }

    /// Expand environment variables and `~` in configured paths
    pub fn expand_paths(&mut self) -> Result<()> {
        if let Some(path) = &self.github.app_private_key_path {
            self.github.app_private_key_path = Some(
                shellexpand::full(path)
                    .context("Failed to expand app-private-key-path")?
                    .into_owned(),
            );
        }

        if let Some(path) = &self.gitea.repos_path {
            self.gitea.repos_path = Some(
                shellexpand::full(path)
                    .context("Failed to expand repos-path")?
                    .into_owned(),
            );
        }

        Ok(())
    }

    /// Apply flag/environment values on top of the file configuration
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) -> Result<()> {
        if overrides.enterprise_url.is_some() {
            self.github.enterprise_url = overrides.enterprise_url;
        }
        if let Some(app_id) = overrides.app_id {
            self.github.app_id = app_id;
        }
        if let Some(installation_id) = overrides.installation_id {
            self.github.installation_id = installation_id;
        }
        if overrides.private_key_path.is_some() {
            self.github.app_private_key_path = overrides.private_key_path;
        }
        if overrides.token.is_some() {
            self.github.token = overrides.token;
        }
        if overrides.mirroring_token.is_some() {
            self.github.mirroring_token = overrides.mirroring_token;
        }
        if let Some(url) = overrides.gitea_url {
            self.gitea.url = url;
        }
        if let Some(token) = overrides.gitea_token {
            self.gitea.token = token;
        }
        if let Some(sidecar) = overrides.sidecar {
            self.sidecar = sidecar;
        }
        if overrides.repos_path.is_some() {
            self.gitea.repos_path = overrides.repos_path;
        }

        self.expand_paths()
    }

    /// Resolve the GitHub credential. Called after [`Config::validate`].
    pub fn credential(&self) -> Result<Credential> {
        let github = &self.github;

        match (non_empty(&github.token), github.app_id) {
            (Some(_), app_id) if app_id != 0 => {
                bail!("GitHub token and GitHub App authentication are mutually exclusive")
            }
            (Some(token), _) => {
                let mirroring_token = non_empty(&github.mirroring_token)
                    .ok_or_else(|| anyhow!("GitHub mirroring token is required"))?;
                Ok(Credential::StaticToken {
                    token: token.to_string(),
                    mirroring_token: mirroring_token.to_string(),
                })
            }
            (None, 0) => bail!("GitHub token or GitHub App ID is required"),
            (None, app_id) => {
                if github.installation_id == 0 {
                    bail!("GitHub App installation ID is required");
                }
                let key_path = non_empty(&github.app_private_key_path)
                    .ok_or_else(|| anyhow!("GitHub App private key path is required"))?;
                Ok(Credential::AppInstallation {
                    app_id,
                    installation_id: github.installation_id,
                    private_key_path: PathBuf::from(key_path),
                })
            }
        }
    }

    /// Check everything the engine relies on before anything is mirrored
    pub fn validate(&self) -> Result<()> {
        let credential = self.credential()?;

        if let Credential::AppInstallation {
            private_key_path, ..
        } = &credential
        {
            std::fs::metadata(private_key_path).with_context(|| {
                format!(
                    "GitHub App private key path is invalid: {}",
                    private_key_path.display()
                )
            })?;
        }

        if let Some(enterprise_url) = non_empty(&self.github.enterprise_url) {
            Url::parse(enterprise_url).context("GitHub Enterprise URL is invalid")?;
        }

        if self.gitea.token.is_empty() {
            bail!("Gitea token is required");
        }
        if self.gitea.url.is_empty() {
            bail!("Gitea URL is required");
        }
        Url::parse(&self.gitea.url).context("Gitea URL is invalid")?;

        if self.mirrors.is_empty() {
            bail!("At least one mirror is required");
        }

        for (i, mirror) in self.mirrors.iter().enumerate() {
            if mirror.from.name.is_empty() {
                bail!("Mirror {} has no source", i);
            }
            if mirror.to.name.is_empty() {
                bail!("Mirror {} has no destination", i);
            }
            mirror
                .from
                .filter
                .matcher()
                .with_context(|| format!("Mirror {} has an invalid filter", i))?;
        }

        self.schedule.mirror_interval()?;

        if self.sidecar {
            if !matches!(credential, Credential::AppInstallation { .. }) {
                bail!("Sidecar mode requires GitHub App authentication");
            }
            if non_empty(&self.gitea.repos_path).is_none() {
                bail!("Sidecar mode requires gitea.repos-path");
            }
            self.schedule.scan_interval()?;
        }

        Ok(())
    }

    /// Repository root scanned by the sidecar
    pub fn repos_path(&self) -> Option<PathBuf> {
        non_empty(&self.gitea.repos_path).map(PathBuf::from)
    }

    /// Configured GitHub Enterprise URL, if any
    pub fn enterprise_url(&self) -> Option<&str> {
        non_empty(&self.github.enterprise_url)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
