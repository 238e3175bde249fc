//! GitHub App authentication
//!
//! The app signs a short-lived JWT with its private key and trades it for an
//! installation access token. Installation tokens are what Gitea receives for
//! cloning and what the sidecar writes into mirror remotes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

/// JWTs are valid for at most ten minutes; stay under that
const JWT_LIFETIME: Duration = Duration::from_secs(9 * 60);

/// Backdate `iat` to tolerate clock drift against GitHub
const JWT_CLOCK_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iat: u64,
    exp: u64,
    iss: String,
}

/// A minted installation access token
#[derive(Clone)]
pub struct InstallationToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl InstallationToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            issued_at: Utc::now(),
            expires_at,
        }
    }

    /// Lifetime granted by GitHub
    pub fn ttl(&self) -> ChronoDuration {
        self.expires_at - self.issued_at
    }

    /// True if the token remains usable for at least `margin`
    pub fn is_fresh(&self, margin: Duration) -> bool {
        let margin = ChronoDuration::from_std(margin).unwrap_or_else(|_| ChronoDuration::zero());
        Utc::now() + margin < self.expires_at
    }
}

impl fmt::Debug for InstallationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationToken")
            .field("token", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Something that can mint fresh installation tokens
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenMinter: Send + Sync {
    async fn mint_installation_token(&self) -> Result<InstallationToken>;
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// GitHub App identity bound to one installation
#[derive(Clone)]
pub struct AppClient {
    app_id: u64,
    installation_id: u64,
    key: EncodingKey,
    base_uri: Option<String>,
}

impl fmt::Debug for AppClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppClient")
            .field("app_id", &self.app_id)
            .field("installation_id", &self.installation_id)
            .field("base_uri", &self.base_uri)
            .finish()
    }
}

impl AppClient {
    /// Read the PEM private key from disk
    pub fn from_key_file(
        app_id: u64,
        installation_id: u64,
        key_path: &Path,
        base_uri: Option<String>,
    ) -> Result<Self> {
        let pem = std::fs::read(key_path).with_context(|| {
            format!(
                "Failed to read GitHub App private key: {}",
                key_path.display()
            )
        })?;

        Self::from_pem(app_id, installation_id, &pem, base_uri)
    }

    pub fn from_pem(
        app_id: u64,
        installation_id: u64,
        pem: &[u8],
        base_uri: Option<String>,
    ) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(pem).context("Invalid GitHub App private key")?;

        Ok(Self {
            app_id,
            installation_id,
            key,
            base_uri,
        })
    }

    pub fn app_id(&self) -> u64 {
        self.app_id
    }

    pub fn installation_id(&self) -> u64 {
        self.installation_id
    }

    /// Sign a JWT identifying the app itself
    pub fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("System time is before the UNIX epoch")?;

        let claims = Claims {
            iat: now.saturating_sub(JWT_CLOCK_SKEW).as_secs(),
            exp: (now + JWT_LIFETIME).as_secs(),
            iss: self.app_id.to_string(),
        };

        let jwt = encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .context("Failed to sign GitHub App JWT")?;

        debug!(app_id = self.app_id, exp = claims.exp, "Generated GitHub App JWT");

        Ok(jwt)
    }

    fn jwt_client(&self) -> Result<Octocrab> {
        let jwt = self.generate_jwt()?;
        let mut builder = Octocrab::builder();
        if let Some(base_uri) = &self.base_uri {
            builder = builder
                .base_uri(base_uri.as_str())
                .context("Invalid GitHub API base URL")?;
        }
        builder
            .personal_token(jwt)
            .build()
            .context("Failed to build GitHub App client")
    }
}

#[async_trait]
impl TokenMinter for AppClient {
    #[instrument(skip(self), fields(installation_id = self.installation_id))]
    async fn mint_installation_token(&self) -> Result<InstallationToken> {
        let client = self.jwt_client()?;
        let route = format!("/app/installations/{}/access_tokens", self.installation_id);

        let response: AccessTokenResponse = client
            .post(route, None::<&()>)
            .await
            .context("Failed to mint GitHub App installation token")?;

        let token = InstallationToken::new(response.token, response.expires_at);
        debug!(
            expires_at = %token.expires_at,
            ttl_secs = token.ttl().num_seconds(),
            "Minted installation token"
        );

        Ok(token)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Fresh RSA key pair as (private PEM, public PEM)
    pub(crate) fn generate_key_pair() -> (String, String) {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        (
            private.to_pkcs1_pem(LineEnding::LF).unwrap().to_string(),
            public.to_pkcs1_pem(LineEnding::LF).unwrap(),
        )
    }

    #[test]
    fn test_invalid_private_key() {
        let result = AppClient::from_pem(1, 2, b"not a key", None);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_key_file() {
        let result = AppClient::from_key_file(1, 2, Path::new("/nonexistent/key.pem"), None);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("private key"));
    }

    #[test]
    fn test_jwt_claims() {
        let (private_pem, public_pem) = generate_key_pair();
        let app = AppClient::from_pem(12345, 2, private_pem.as_bytes(), None).unwrap();

        let jwt = app.generate_jwt().unwrap();

        let key = DecodingKey::from_rsa_pem(public_pem.as_bytes()).unwrap();
        let data = decode::<Claims>(&jwt, &key, &Validation::new(Algorithm::RS256)).unwrap();

        assert_eq!(data.claims.iss, "12345");
        assert!(data.claims.exp > data.claims.iat);
        assert!(data.claims.exp - data.claims.iat <= 10 * 60);
    }

    #[test]
    fn test_token_freshness() {
        let token = InstallationToken::new("ghs_x", Utc::now() + ChronoDuration::minutes(30));

        assert!(token.is_fresh(Duration::from_secs(5 * 60)));
        assert!(!token.is_fresh(Duration::from_secs(60 * 60)));
        assert!(token.ttl() <= ChronoDuration::minutes(30));
        assert!(!format!("{:?}", token).contains("ghs_x"));
    }

    #[tokio::test]
    async fn test_mint_installation_token() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/app/installations/77/access_tokens"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "token": "ghs_minted",
                "expires_at": "2099-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (private_pem, _) = generate_key_pair();
        let app = AppClient::from_pem(1, 77, private_pem.as_bytes(), Some(server.uri())).unwrap();

        let token = app.mint_installation_token().await.unwrap();

        assert_eq!(token.token, "ghs_minted");
        assert!(token.is_fresh(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_mint_failure_is_reported() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/app/installations/77/access_tokens"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "message": "Not Found",
                "documentation_url": "https://docs.github.com"
            })))
            .mount(&server)
            .await;

        let (private_pem, _) = generate_key_pair();
        let app = AppClient::from_pem(1, 77, private_pem.as_bytes(), Some(server.uri())).unwrap();

        let err = app.mint_installation_token().await.unwrap_err();
        assert!(err.to_string().contains("installation token"));
    }
}
