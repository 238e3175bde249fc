use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use octocrab::{Octocrab, Page};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::app::{AppClient, InstallationToken, TokenMinter};
use crate::discovery::{Listing, RepoPage, RepositorySource, SourceRepository};

/// First wait after a rate-limited response
const RATE_LIMIT_INITIAL_WAIT: Duration = Duration::from_secs(30);

/// Upper bound for the rate-limit backoff
const RATE_LIMIT_MAX_WAIT: Duration = Duration::from_secs(15 * 60);

/// Installation tokens are replaced this long before they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// GitHub client wrapper with authentication management
pub struct GitHubClient {
    auth: SourceAuth,
    base_uri: Option<String>,
}

enum SourceAuth {
    /// Personal access token, valid for the life of the process
    Token(Octocrab),
    /// Installation token minted from the app key, replaced before it expires
    Installation {
        app: Arc<AppClient>,
        cached: Mutex<Option<(InstallationToken, Octocrab)>>,
    },
}

/// Checks whether a secret can still read a repository
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProbe: Send + Sync {
    /// `Ok(())` if `secret` can list pull requests of `owner/repo`
    async fn probe(&self, secret: &str, owner: &str, repo: &str) -> Result<()>;
}

/// The subset of the repository payload the mirror needs
#[derive(Debug, Deserialize)]
struct GitHubRepository {
    name: Option<String>,
    full_name: Option<String>,
    clone_url: Option<String>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    archived: bool,
    description: Option<String>,
}

impl TryFrom<GitHubRepository> for SourceRepository {
    type Error = anyhow::Error;

    fn try_from(repo: GitHubRepository) -> Result<Self> {
        let label = repo
            .full_name
            .clone()
            .or_else(|| repo.name.clone())
            .unwrap_or_else(|| "<unnamed>".to_string());

        let name = repo
            .name
            .ok_or_else(|| anyhow!("Repository {} has no name", label))?;
        let clone_url = repo
            .clone_url
            .ok_or_else(|| anyhow!("Repository {} has no clone URL", label))?;

        Ok(SourceRepository {
            name,
            clone_url,
            is_private: repo.private,
            is_archived: repo.archived,
            description: repo.description.unwrap_or_default(),
        })
    }
}

impl GitHubClient {
    /// Client authenticated with a personal access token
    pub fn with_token(token: &str, base_uri: Option<String>) -> Result<Self> {
        let client = build_client(token, base_uri.as_deref())?;
        info!("Using personal access token authentication");

        Ok(Self {
            auth: SourceAuth::Token(client),
            base_uri,
        })
    }

    /// Client authenticated as an app installation
    pub fn with_installation(app: Arc<AppClient>, base_uri: Option<String>) -> Self {
        info!(
            "Using GitHub App authentication (app {}, installation {})",
            app.app_id(),
            app.installation_id()
        );

        Self {
            auth: SourceAuth::Installation {
                app,
                cached: Mutex::new(None),
            },
            base_uri,
        }
    }

    /// Octocrab handle with a currently valid credential
    async fn client(&self) -> Result<Octocrab> {
        match &self.auth {
            SourceAuth::Token(client) => Ok(client.clone()),
            SourceAuth::Installation { app, cached } => {
                let mut cached = cached.lock().await;

                if let Some((token, client)) = cached.as_ref() {
                    if token.is_fresh(TOKEN_REFRESH_MARGIN) {
                        return Ok(client.clone());
                    }
                    debug!("Installation token expires at {}, refreshing", token.expires_at);
                }

                let token = app.mint_installation_token().await?;
                let client = build_client(&token.token, self.base_uri.as_deref())?;
                *cached = Some((token, client.clone()));
                Ok(client)
            }
        }
    }

    /// Confirm the credential is accepted by the API
    pub async fn check_access(&self) -> Result<()> {
        let client = self.client().await?;
        let _: serde_json::Value = with_rate_limit_wait(|| client.get("/rate_limit", None::<&()>))
            .await
            .context("GitHub rejected the configured credential")?;
        Ok(())
    }
}

#[async_trait]
impl RepositorySource for GitHubClient {
    async fn fetch_page(&self, listing: &Listing, page: u32) -> Result<RepoPage> {
        let client = self.client().await?;
        let route = listing.route();
        let query = listing.query(page);

        let response: Page<GitHubRepository> = {
            let client = &client;
            let route = route.as_str();
            let query = &query;
            with_rate_limit_wait(move || client.get(route, Some(query)))
                .await
                .with_context(|| format!("Failed to fetch {}", route))?
        };

        let next_page = response.next.as_ref().and_then(|uri| page_number(uri.query()));

        let repositories = response
            .items
            .into_iter()
            .map(SourceRepository::try_from)
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Fetched {} repositories from {} (page {})",
            repositories.len(),
            route,
            page
        );

        Ok(RepoPage {
            repositories,
            next_page,
        })
    }
}

/// Probes with its own client built from the secret under test
pub struct GitHubProbe {
    base_uri: Option<String>,
}

impl GitHubProbe {
    pub fn new(base_uri: Option<String>) -> Self {
        Self { base_uri }
    }
}

#[async_trait]
impl CredentialProbe for GitHubProbe {
    async fn probe(&self, secret: &str, owner: &str, repo: &str) -> Result<()> {
        let client = build_client(secret, self.base_uri.as_deref())?;
        let route = format!("/repos/{}/{}/pulls", owner, repo);
        let query = [("per_page", "1")];

        let _: serde_json::Value = {
            let client = &client;
            let route = route.as_str();
            let query = &query;
            with_rate_limit_wait(move || client.get(route, Some(query))).await
        }
        .with_context(|| format!("Credential rejected for {}/{}", owner, repo))?;

        Ok(())
    }
}

/// Build an octocrab client for `token`, optionally against an enterprise host
pub fn build_client(token: &str, base_uri: Option<&str>) -> Result<Octocrab> {
    let mut builder = Octocrab::builder();
    if let Some(base_uri) = base_uri {
        builder = builder
            .base_uri(base_uri)
            .with_context(|| format!("Invalid GitHub API base URL: {}", base_uri))?;
    }

    builder
        .personal_token(token.to_string())
        .build()
        .context("Failed to create GitHub client")
}

/// GitHub Enterprise serves its REST API under `/api/v3`
pub fn enterprise_api_base(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.ends_with("/api/v3") {
        trimmed.to_string()
    } else {
        format!("{}/api/v3", trimmed)
    }
}

/// True for responses GitHub uses to signal rate limiting
pub fn is_rate_limited(error: &octocrab::Error) -> bool {
    match error {
        octocrab::Error::GitHub { source, .. } => {
            let status = source.status_code.as_u16();
            status == 429
                || (status == 403 && source.message.to_lowercase().contains("rate limit"))
        }
        _ => false,
    }
}

/// Run `operation`, sleeping and retrying for as long as GitHub answers with
/// a rate-limit response
pub async fn with_rate_limit_wait<T, F, Fut>(operation: F) -> Result<T, octocrab::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, octocrab::Error>>,
{
    let mut wait = RATE_LIMIT_INITIAL_WAIT;

    loop {
        match operation().await {
            Err(e) if is_rate_limited(&e) => {
                warn!("GitHub rate limit hit, retrying in {:?}", wait);
                tokio::time::sleep(wait).await;
                wait = (wait * 2).min(RATE_LIMIT_MAX_WAIT);
            }
            result => return result,
        }
    }
}

fn page_number(query: Option<&str>) -> Option<u32> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "page")
        .and_then(|(_, value)| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn repo_json(name: &str) -> serde_json::Value {
        json!({
            "id": 1,
            "name": name,
            "full_name": format!("acme/{}", name),
            "clone_url": format!("https://github.com/acme/{}.git", name),
            "private": false,
            "archived": false,
            "description": null
        })
    }

    #[test]
    fn test_page_number() {
        assert_eq!(page_number(Some("per_page=100&page=3")), Some(3));
        assert_eq!(page_number(Some("page=2")), Some(2));
        assert_eq!(page_number(Some("per_page=100")), None);
        assert_eq!(page_number(None), None);
        assert_eq!(page_number(Some("since=2024-01-01%2000%3A00&page=4")), Some(4));
    }

    #[test]
    fn test_enterprise_api_base() {
        assert_eq!(
            enterprise_api_base("https://ghe.example.com"),
            "https://ghe.example.com/api/v3"
        );
        assert_eq!(
            enterprise_api_base("https://ghe.example.com/api/v3/"),
            "https://ghe.example.com/api/v3"
        );
    }

    #[test]
    fn test_repository_conversion() {
        let repo: GitHubRepository = serde_json::from_value(json!({
            "name": "tool",
            "clone_url": "https://github.com/acme/tool.git",
            "private": true,
            "archived": true,
            "description": "A tool"
        }))
        .unwrap();

        let repo = SourceRepository::try_from(repo).unwrap();
        assert_eq!(repo.name, "tool");
        assert!(repo.is_private);
        assert!(repo.is_archived);
        assert_eq!(repo.description, "A tool");
    }

    #[test]
    fn test_repository_without_clone_url_is_rejected() {
        let repo: GitHubRepository = serde_json::from_value(json!({
            "name": "tool",
            "full_name": "acme/tool"
        }))
        .unwrap();

        let err = SourceRepository::try_from(repo).unwrap_err();
        assert!(err.to_string().contains("acme/tool"));
    }

    #[tokio::test]
    async fn test_fetch_page_follows_link_header() {
        let server = MockServer::start().await;

        let next = format!("<{}/orgs/acme/repos?per_page=100&page=2>; rel=\"next\"", server.uri());
        Mock::given(method("GET"))
            .and(path("/orgs/acme/repos"))
            .and(query_param("page", "1"))
            .and(query_param("per_page", "100"))
            .and(header_exists("authorization"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("link", next.as_str())
                    .set_body_json(json!([repo_json("one"), repo_json("two")])),
            )
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/orgs/acme/repos"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([repo_json("three")])))
            .mount(&server)
            .await;

        let client = GitHubClient::with_token("ghp_test", Some(server.uri())).unwrap();
        let listing = Listing::Organization("acme".into());

        let first = client.fetch_page(&listing, 1).await.unwrap();
        assert_eq!(first.repositories.len(), 2);
        assert_eq!(first.next_page, Some(2));

        let second = client.fetch_page(&listing, 2).await.unwrap();
        assert_eq!(second.repositories[0].name, "three");
        assert_eq!(second.next_page, None);
    }

    #[tokio::test]
    async fn test_fetch_page_owned_repositories() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/user/repos"))
            .and(query_param("affiliation", "owner"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([repo_json("mine")])))
            .expect(1)
            .mount(&server)
            .await;

        let client = GitHubClient::with_token("ghp_test", Some(server.uri())).unwrap();
        let page = client
            .fetch_page(&Listing::AuthenticatedUser, 1)
            .await
            .unwrap();

        assert_eq!(page.repositories[0].name, "mine");
    }

    #[tokio::test]
    async fn test_probe_accepted_secret() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/acme/tool/pulls"))
            .and(query_param("per_page", "1"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let probe = GitHubProbe::new(Some(server.uri()));
        assert!(probe.probe("good", "acme", "tool").await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_rejected_secret() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/acme/tool/pulls"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "message": "Bad credentials",
                "documentation_url": "https://docs.github.com/rest"
            })))
            .mount(&server)
            .await;

        let probe = GitHubProbe::new(Some(server.uri()));
        let err = probe.probe("stale", "acme", "tool").await.unwrap_err();
        assert!(err.to_string().contains("acme/tool"));
    }
}
