//! gitea-mirror - Keep a Gitea instance mirroring GitHub accounts
//!
//! gitea-mirror discovers the repositories of GitHub users and organizations
//! and asks Gitea to create a pull mirror for every one that does not exist
//! yet. Gitea then keeps the mirrors up to date itself.
//!
//! ## Core Features
//!
//! - **Discovery**: Paginated repository listing with include/exclude filters
//! - **Idempotent mirroring**: A repository is created once and then left alone
//! - **GitHub App support**: Installation tokens minted per mirror
//! - **Credential sidecar**: Rotates expired tokens stored in mirror remotes
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`auth`]: Credentials and authenticated client handles
//! - [`discovery`]: Repository enumeration
//! - [`sync`]: Mirror creation
//! - [`sidecar`]: Credential refresh for existing mirrors
//! - [`daemon`]: Task lifecycle and scheduling

pub mod app;
pub mod auth;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod filter;
pub mod git;
pub mod gitea;
pub mod github;
pub mod health;
pub mod sidecar;
pub mod sync;

pub use auth::{authenticate, Credential, Handles, TokenSource};
pub use config::{Config, ConfigOverrides};
pub use daemon::Daemon;
pub use discovery::{Listing, SourceRepository};
pub use filter::FilterMatcher;
pub use git::GitClient;
pub use gitea::GiteaClient;
pub use github::GitHubClient;
pub use health::HealthCheck;
pub use sidecar::{CredentialRefresher, RefreshOutcome, Sidecar};
pub use sync::{SyncEngine, SyncResult, SyncSummary};
