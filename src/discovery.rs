use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MirrorFrom, SourceType};
use crate::filter::FilterMatcher;

/// Repositories requested per page
pub const PAGE_SIZE: u32 = 100;

/// Snapshot of a repository as reported by the source API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRepository {
    pub name: String,
    pub clone_url: String,
    pub is_private: bool,
    pub is_archived: bool,
    /// Empty when the source has no description
    pub description: String,
}

/// Which repository listing a mapping reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    /// Repositories owned by the authenticated user
    AuthenticatedUser,
    /// Public repositories of a named user
    User(String),
    /// Repositories of an organization
    Organization(String),
}

impl Listing {
    /// Pick the listing for a mapping source.
    ///
    /// A personal access token identifies a user, so user mappings list that
    /// user's own repositories (private ones included) and the configured name
    /// is not consulted. An app installation has no user identity and can only
    /// list the named user's public repositories.
    pub fn for_source(from: &MirrorFrom, installation: bool) -> Self {
        match from.source_type {
            SourceType::Organization => Listing::Organization(from.name.clone()),
            SourceType::User if installation => Listing::User(from.name.clone()),
            SourceType::User => Listing::AuthenticatedUser,
        }
    }

    /// API route for this listing
    pub fn route(&self) -> String {
        match self {
            Listing::AuthenticatedUser => "/user/repos".to_string(),
            Listing::User(name) => format!("/users/{}/repos", name),
            Listing::Organization(name) => format!("/orgs/{}/repos", name),
        }
    }

    /// Query parameters for one page
    pub fn query(&self, page: u32) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("per_page", PAGE_SIZE.to_string()),
            ("page", page.to_string()),
        ];
        if matches!(self, Listing::AuthenticatedUser) {
            query.push(("affiliation", "owner".to_string()));
        }
        query
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listing::AuthenticatedUser => write!(f, "authenticated user"),
            Listing::User(name) => write!(f, "user {}", name),
            Listing::Organization(name) => write!(f, "organization {}", name),
        }
    }
}

/// One page of a listing
#[derive(Debug, Clone, Default)]
pub struct RepoPage {
    pub repositories: Vec<SourceRepository>,
    /// Page number of the next page, `None` on the last page
    pub next_page: Option<u32>,
}

/// Paged access to source repository listings
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepositorySource: Send + Sync {
    async fn fetch_page(&self, listing: &Listing, page: u32) -> Result<RepoPage>;
}

/// A running enumeration: the producer task and the receiving end of its channel
pub struct Enumeration {
    pub repositories: mpsc::Receiver<SourceRepository>,
    /// Resolves to the number of repositories sent, or the error that ended the listing
    pub handle: JoinHandle<Result<usize>>,
}

/// Start a producer task that pages through `listing` and sends every
/// repository accepted by `filter`.
///
/// The channel closes when the listing is exhausted, when a page fails, when
/// the receiver is dropped, or when `cancel` fires.
pub fn spawn_enumeration(
    source: Arc<dyn RepositorySource>,
    listing: Listing,
    filter: FilterMatcher,
    cancel: CancellationToken,
) -> Enumeration {
    let (tx, rx) = mpsc::channel(PAGE_SIZE as usize);

    let handle = tokio::spawn(async move {
        let sent = enumerate(source.as_ref(), &listing, &filter, &cancel, &tx).await?;
        info!("Listed {} matching repositories for {}", sent, listing);
        Ok(sent)
    });

    Enumeration {
        repositories: rx,
        handle,
    }
}

async fn enumerate(
    source: &dyn RepositorySource,
    listing: &Listing,
    filter: &FilterMatcher,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<SourceRepository>,
) -> Result<usize> {
    let mut page = 1;
    let mut sent = 0;

    loop {
        debug!("Fetching page {} for {}", page, listing);

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Enumeration of {} cancelled", listing);
                return Ok(sent);
            }
            result = source.fetch_page(listing, page) => result,
        };

        let RepoPage {
            repositories,
            next_page,
        } = result.with_context(|| format!("Failed to list repositories for {} (page {})", listing, page))?;

        for repository in repositories {
            if !filter.matches(&repository.name, repository.is_archived) {
                debug!("Filtered out {}", repository.name);
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(sent),
                result = tx.send(repository) => {
                    if result.is_err() {
                        debug!("Receiver for {} went away", listing);
                        return Ok(sent);
                    }
                }
            }
            sent += 1;
        }

        match next_page {
            Some(next) if next > page => page = next,
            Some(next) => {
                warn!("Source reported next page {} after page {}, stopping", next, page);
                break;
            }
            None => break,
        }
    }

    Ok(sent)
}
