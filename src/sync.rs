//! Sync Engine - creates Gitea pull mirrors for discovered GitHub repositories
//!
//! Each mapping runs one enumeration producer feeding a bounded channel while
//! the engine consumes it, one repository at a time. Mappings run in the order
//! they are configured. Existing mirrors are never updated; Gitea refreshes
//! them on its own schedule once they exist.

use crate::auth::{Handles, TokenSource};
use crate::config::MirrorConfig;
use crate::discovery::{spawn_enumeration, Listing, RepositorySource, SourceRepository};
use crate::gitea::{MigrateRepoOptions, MirrorDestination};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome for one source repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResult {
    Created { name: String },
    Skipped { name: String, reason: String },
    Failed { name: String, error: String },
}

/// What happened to one mapping during a pass
#[derive(Debug, Clone, Default)]
pub struct MappingReport {
    pub source: String,
    pub results: Vec<SyncResult>,
    /// Set when enumeration failed and the mapping was cut short
    pub error: Option<String>,
    pub cancelled: bool,
}

/// Results from a complete pass over every mapping
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub mappings: usize,
    pub mappings_aborted: usize,
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub duration: Duration,
}

impl SyncSummary {
    fn record(&mut self, report: &MappingReport) {
        self.mappings += 1;
        if report.error.is_some() {
            self.mappings_aborted += 1;
        }
        if report.cancelled {
            self.cancelled = true;
        }

        for result in &report.results {
            match result {
                SyncResult::Created { .. } => self.created += 1,
                SyncResult::Skipped { .. } => self.skipped += 1,
                SyncResult::Failed { .. } => self.failed += 1,
            }
        }
    }
}

/// The main sync engine that creates mirrors for every mapping
#[derive(Clone)]
pub struct SyncEngine {
    source: Arc<dyn RepositorySource>,
    destination: Arc<dyn MirrorDestination>,
    tokens: TokenSource,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn RepositorySource>,
        destination: Arc<dyn MirrorDestination>,
        tokens: TokenSource,
    ) -> Self {
        Self {
            source,
            destination,
            tokens,
        }
    }

    pub fn from_handles(handles: &Handles) -> Self {
        Self::new(
            handles.source.clone(),
            handles.destination.clone(),
            handles.tokens.clone(),
        )
    }

    /// Run every mapping once, in order
    pub async fn run_pass(&self, mirrors: &[MirrorConfig], cancel: &CancellationToken) -> SyncSummary {
        let start_time = Instant::now();
        let mut summary = SyncSummary::default();

        info!("Starting mirror pass over {} mappings", mirrors.len());

        for mirror in mirrors {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let report = self.run_mapping(mirror, cancel).await;
            summary.record(&report);

            if report.cancelled {
                break;
            }
        }

        summary.duration = start_time.elapsed();

        info!(
            "Mirror pass completed in {:.2}s: {} created, {} skipped, {} failed, {} of {} mappings aborted{}",
            summary.duration.as_secs_f64(),
            summary.created,
            summary.skipped,
            summary.failed,
            summary.mappings_aborted,
            summary.mappings,
            if summary.cancelled { " (stopped early)" } else { "" }
        );

        summary
    }

    /// Enumerate one mapping and mirror everything it yields
    pub async fn run_mapping(&self, mirror: &MirrorConfig, cancel: &CancellationToken) -> MappingReport {
        let listing = Listing::for_source(&mirror.from, self.tokens.is_installation());
        let mut report = MappingReport {
            source: listing.to_string(),
            ..Default::default()
        };

        if listing == Listing::AuthenticatedUser {
            warn!(
                "Mapping for user {} lists the repositories owned by the token's user, not {} specifically",
                mirror.from.name, mirror.from.name
            );
        }

        let filter = match mirror.from.filter.matcher() {
            Ok(filter) => filter,
            Err(e) => {
                error!("Skipping mapping for {}: {:#}", listing, e);
                report.error = Some(format!("{:#}", e));
                return report;
            }
        };

        info!("Mirroring {} into {}", listing, mirror.to.name);

        let mut enumeration = spawn_enumeration(self.source.clone(), listing, filter, cancel.clone());

        loop {
            let repository = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                next = enumeration.repositories.recv() => match next {
                    Some(repository) => repository,
                    None => break,
                },
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                result = self.sync_repository(&repository, mirror) => result,
            };
            report.results.push(result);
        }

        // Unblocks a producer waiting on a full channel
        drop(enumeration.repositories);

        match enumeration.handle.await {
            Ok(Ok(count)) => debug!("Enumeration of {} finished after {} repositories", report.source, count),
            Ok(Err(e)) => {
                error!("Aborting mapping for {}: {:#}", report.source, e);
                report.error = Some(format!("{:#}", e));
            }
            Err(e) => {
                error!("Enumeration task for {} failed: {}", report.source, e);
                report.error = Some(e.to_string());
            }
        }

        if report.cancelled {
            info!("Mapping for {} stopped", report.source);
        }

        report
    }

    /// Create the mirror for `repository` unless it already exists
    pub async fn sync_repository(&self, repository: &SourceRepository, mirror: &MirrorConfig) -> SyncResult {
        let owner = mirror.to.name.as_str();
        let repo_name = mirror.destination_name(&repository.name);
        let name = format!("{}/{}", owner, repo_name);

        match self.destination.get_repo(owner, &repo_name).await {
            Ok(Some(_)) => {
                debug!("Mirror {} already exists", name);
                return SyncResult::Skipped {
                    name,
                    reason: "already exists".to_string(),
                };
            }
            Ok(None) => {}
            Err(e) => {
                error!("Failed to look up {}: {:#}", name, e);
                return SyncResult::Failed {
                    name,
                    error: format!("{:#}", e),
                };
            }
        }

        let token = match self.tokens.token().await {
            Ok(token) => token,
            Err(e) => {
                error!("Failed to obtain a mirroring token for {}: {:#}", name, e);
                return SyncResult::Failed {
                    name,
                    error: format!("{:#}", e),
                };
            }
        };

        let options = MigrateRepoOptions::mirror_of(repository, owner, &repo_name, &token);

        match self.destination.migrate_repo(options).await {
            Ok(created) => {
                info!("Created mirror {} from {}", created.full_name, repository.clone_url);
                SyncResult::Created { name }
            }
            Err(e) => {
                error!("Failed to create mirror {}: {:#}", name, e);
                SyncResult::Failed {
                    name,
                    error: format!("{:#}", e),
                }
            }
        }
    }
}
