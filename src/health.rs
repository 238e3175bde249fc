//! Preflight checks for gitea-mirror
//!
//! Verifies that git is installed, the configuration is complete, both APIs
//! accept their credentials and, in sidecar mode, that the repository root
//! can be scanned.

use crate::auth::authenticate;
use crate::config::Config;
use crate::git::GitClient;
use crate::gitea::GiteaClient;
use crate::sidecar::find_repositories;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub git: CheckResult,
    pub config: CheckResult,
    pub github: CheckResult,
    pub gitea: CheckResult,
    /// Repository root scanned by the sidecar
    pub repos_path: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub async fn run(config: &Config) -> Self {
        Self {
            git: Self::check_git().await,
            config: Self::check_config(config),
            github: Self::check_github(config).await,
            gitea: Self::check_gitea(config).await,
            repos_path: Self::check_repos_path(config),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, r)| r.passed)
    }

    /// Get list of failed checks
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| !r.passed)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.is_warning)
            .collect()
    }

    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 5] {
        [
            ("Git", &self.git),
            ("Configuration", &self.config),
            ("GitHub", &self.github),
            ("Gitea", &self.gitea),
            ("Repository root", &self.repos_path),
        ]
    }

    async fn check_git() -> CheckResult {
        match GitClient::version().await {
            Ok(version) => CheckResult::ok_with_details("Git is installed", version),
            Err(e) => CheckResult::error_with_details(
                "Git is not installed or not in PATH",
                format!("{:#}", e),
            ),
        }
    }

    fn check_config(config: &Config) -> CheckResult {
        match config.validate() {
            Ok(()) => CheckResult::ok_with_details(
                "Configuration is valid",
                format!("{} mirror mapping(s)", config.mirrors.len()),
            ),
            Err(e) => CheckResult::error_with_details("Configuration is invalid", format!("{:#}", e)),
        }
    }

    async fn check_github(config: &Config) -> CheckResult {
        let handles = match authenticate(config) {
            Ok(handles) => handles,
            Err(e) => {
                return CheckResult::error_with_details(
                    "GitHub credentials are unusable",
                    format!("{:#}", e),
                )
            }
        };

        match handles.source.check_access().await {
            Ok(()) => CheckResult::ok("GitHub accepted the configured credentials"),
            Err(e) => CheckResult::error_with_details(
                "GitHub rejected the configured credentials",
                format!("{:#}", e),
            ),
        }
    }

    async fn check_gitea(config: &Config) -> CheckResult {
        let client = match GiteaClient::new(&config.gitea.url, &config.gitea.token) {
            Ok(client) => client,
            Err(e) => {
                return CheckResult::error_with_details("Gitea URL is invalid", format!("{:#}", e))
            }
        };

        match client.server_version().await {
            Ok(version) => CheckResult::ok_with_details(
                format!("Gitea is reachable at {}", config.gitea.url),
                format!("version {}", version),
            ),
            Err(e) => CheckResult::error_with_details(
                format!("Gitea is not reachable at {}", config.gitea.url),
                format!("{:#}", e),
            ),
        }
    }

    fn check_repos_path(config: &Config) -> CheckResult {
        let Some(root) = config.repos_path() else {
            return if config.sidecar {
                CheckResult::error_with_details(
                    "Repository root is not configured",
                    "Set gitea.repos-path or --repos-path",
                )
            } else {
                CheckResult::ok("Sidecar disabled")
            };
        };

        match find_repositories(&root) {
            Ok(found) => CheckResult::ok_with_details(
                format!("Repository root exists: {}", root.display()),
                format!("{} repositories found", found.len()),
            ),
            Err(e) if config.sidecar => CheckResult::error_with_details(
                format!("Repository root is unusable: {}", root.display()),
                format!("{:#}", e),
            ),
            Err(e) => CheckResult::warning_with_details(
                format!("Repository root is unusable: {}", root.display()),
                format!("{:#}", e),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn failing() -> CheckResult {
        CheckResult::error_with_details("failed", "details")
    }

    fn health(config: CheckResult, repos_path: CheckResult) -> HealthCheck {
        HealthCheck {
            git: CheckResult::ok("git"),
            config,
            github: CheckResult::ok("github"),
            gitea: CheckResult::ok("gitea"),
            repos_path,
        }
    }

    #[test]
    fn test_all_passed_with_passing_checks() {
        let check = health(CheckResult::ok("config"), CheckResult::ok("root"));
        assert!(check.all_passed());
        assert!(check.errors().is_empty());
    }

    #[test]
    fn test_errors_and_warnings() {
        let check = health(failing(), CheckResult::warning_with_details("root", "missing"));

        assert!(!check.all_passed());
        assert_eq!(check.errors().len(), 1);
        assert_eq!(check.warnings().len(), 1);
    }

    #[test]
    fn test_repos_path_disabled_sidecar() {
        let config = Config::default();
        let result = HealthCheck::check_repos_path(&config);

        assert!(result.passed);
        assert!(!result.is_warning);
    }

    #[test]
    fn test_repos_path_required_for_sidecar() {
        let mut config = Config::default();
        config.sidecar = true;

        assert!(!HealthCheck::check_repos_path(&config).passed);

        config.gitea.repos_path = Some("/nonexistent/repositories".to_string());
        assert!(!HealthCheck::check_repos_path(&config).passed);
    }

    #[test]
    fn test_repos_path_counts_repositories() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("acme/tool.git").create_dir_all().unwrap();

        let mut config = Config::default();
        config.sidecar = true;
        config.gitea.repos_path = Some(temp.path().to_string_lossy().to_string());

        let result = HealthCheck::check_repos_path(&config);
        assert!(result.passed);
        assert_eq!(result.details.as_deref(), Some("1 repositories found"));
    }

    #[test]
    fn test_invalid_config_check() {
        let result = HealthCheck::check_config(&Config::default());
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn test_gitea_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "1.22.0"})))
            .mount(&server)
            .await;

        let mut config = Config::default();
        config.gitea.url = server.uri();
        config.gitea.token = "t".to_string();

        let result = HealthCheck::check_gitea(&config).await;
        assert!(result.passed);
        assert_eq!(result.details.as_deref(), Some("version 1.22.0"));
    }

    #[tokio::test]
    async fn test_github_check_without_credentials() {
        let result = HealthCheck::check_github(&Config::default()).await;
        assert!(!result.passed);
    }
}
