//! Common test utilities and helpers for gitea-mirror tests
#![allow(dead_code)]
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

/// Environment variables the binary reads as flag fallbacks
pub const FLAG_ENV_VARS: &[&str] = &[
    "GITHUB_ENTERPRISE_URL",
    "GITHUB_APP_ID",
    "GITHUB_INSTALL_ID",
    "GITHUB_PRIVATE_KEY_PATH",
    "GITHUB_TOKEN",
    "GITHUB_MIRRORING_TOKEN",
    "GITEA_URL",
    "GITEA_TOKEN",
    "SIDECAR",
    "REPOS_PATH",
    "RUST_LOG",
];

/// Isolated config directory for running the binary
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub config_dir: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("gitea-mirror");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        Self {
            temp_dir,
            config_dir,
        }
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config_path = self.config_dir.join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }

    /// Static-token configuration mirroring organization `acme` into `mirrors`
    pub fn create_token_config(&self, github_url: &str, gitea_url: &str) -> PathBuf {
        let content = format!(
            r#"
github:
  enterprise-url: "{github_url}"
  token: "ghp_api"
  mirroring-token: "ghp_mirror"
gitea:
  url: "{gitea_url}"
  token: "gitea-token"
logging:
  color: false
mirrors:
  - prefix: "gh-"
    from:
      type: organization
      name: acme
      filter:
        exclude: ["-deprecated$"]
    to:
      name: mirrors
"#
        );
        self.create_test_config(&content)
    }

    /// The built binary with flag environment variables cleared and the
    /// default config location pointed at this environment
    pub fn command(&self) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_gitea-mirror"));
        for var in FLAG_ENV_VARS {
            command.env_remove(var);
        }
        command.env("XDG_CONFIG_HOME", self.temp_dir.path());
        command
    }
}

/// Repository payload as returned by the GitHub API
pub fn github_repo(owner: &str, name: &str, server: &str) -> Value {
    json!({
        "id": 1,
        "name": name,
        "full_name": format!("{}/{}", owner, name),
        "clone_url": format!("{}/{}/{}.git", server, owner, name),
        "private": false,
        "archived": false,
        "description": null
    })
}

/// Repository payload as returned by the Gitea API
pub fn gitea_repo(owner: &str, name: &str) -> Value {
    json!({
        "id": 7,
        "name": name,
        "full_name": format!("{}/{}", owner, name),
        "mirror": true,
        "private": false
    })
}
