//! Credential refresh sidecar
//!
//! Gitea stores the token it cloned with inside each mirror's origin remote.
//! Installation tokens expire after an hour, after which Gitea can no longer
//! pull. The sidecar runs next to Gitea, walks its repository root and swaps
//! a freshly minted token into every remote whose token stopped working.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::TokenMinter;
use crate::git::{inspect_remote_url, RemoteInspection, RemoteStore};
use crate::github::CredentialProbe;

const SCAN_CHANNEL_CAPACITY: usize = 64;

/// What a scan did to one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    NoOrigin,
    Unmanaged(String),
    Valid,
    Refreshed,
    Failed(String),
}

/// Inspects one repository's origin and rotates its token when rejected
pub struct CredentialRefresher {
    remotes: Arc<dyn RemoteStore>,
    probe: Arc<dyn CredentialProbe>,
    minter: Arc<dyn TokenMinter>,
}

impl CredentialRefresher {
    pub fn new(
        remotes: Arc<dyn RemoteStore>,
        probe: Arc<dyn CredentialProbe>,
        minter: Arc<dyn TokenMinter>,
    ) -> Self {
        Self {
            remotes,
            probe,
            minter,
        }
    }

    pub async fn inspect_and_refresh(&self, path: &Path) -> RefreshOutcome {
        match self.refresh(path).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Credential check failed for {}: {:#}", path.display(), e);
                RefreshOutcome::Failed(format!("{:#}", e))
            }
        }
    }

    async fn refresh(&self, path: &Path) -> Result<RefreshOutcome> {
        self.remotes.open(path).await?;

        let raw = match self.remotes.origin_url(path).await? {
            Some(raw) => raw,
            None => return Ok(RefreshOutcome::NoOrigin),
        };

        let remote = match inspect_remote_url(&raw)? {
            RemoteInspection::Managed(remote) => remote,
            RemoteInspection::Unmanaged(reason) => {
                debug!("Not managing {}: {}", path.display(), reason);
                return Ok(RefreshOutcome::Unmanaged(reason));
            }
        };

        match self
            .probe
            .probe(&remote.secret, &remote.owner, &remote.repo)
            .await
        {
            Ok(()) => {
                debug!("Credential for {} is still valid", remote);
                return Ok(RefreshOutcome::Valid);
            }
            Err(e) => info!("Credential for {} rejected ({:#}), rotating", remote, e),
        }

        let token = self
            .minter
            .mint_installation_token()
            .await
            .context("Failed to mint a replacement token")?;

        let url = remote.with_secret(&token.token)?;
        self.remotes.set_origin_url(path, &url).await?;

        info!("Rotated credential for {}", path.display());
        Ok(RefreshOutcome::Refreshed)
    }
}

enum ScanEvent {
    Repository(PathBuf),
    Finished { found: usize },
}

#[derive(Debug, Default)]
struct ScanTally {
    refreshed: usize,
    failed: usize,
}

/// Periodic scan of the Gitea repository root
pub struct Sidecar {
    refresher: CredentialRefresher,
    root: PathBuf,
    scan_interval: Duration,
}

impl Sidecar {
    pub fn new(refresher: CredentialRefresher, root: PathBuf, scan_interval: Duration) -> Self {
        Self {
            refresher,
            root,
            scan_interval,
        }
    }

    /// Scan until `cancel` fires. The first scan starts immediately.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Credential sidecar watching {} every {:?}",
            self.root.display(),
            self.scan_interval
        );

        let (tx, mut rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        let discovery = tokio::spawn(discover_periodically(
            self.root.clone(),
            self.scan_interval,
            tx,
            cancel.clone(),
        ));

        let mut tally = ScanTally::default();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ScanEvent::Repository(path) => {
                    // Stop is only honoured between repositories
                    match self.refresher.inspect_and_refresh(&path).await {
                        RefreshOutcome::Refreshed => tally.refreshed += 1,
                        RefreshOutcome::Failed(_) => tally.failed += 1,
                        _ => {}
                    }
                }
                ScanEvent::Finished { found } => {
                    info!(
                        "Scan finished: {} repositories, {} credentials rotated, {} failures",
                        found, tally.refreshed, tally.failed
                    );
                    tally = ScanTally::default();
                }
            }
        }

        // Lets a walk blocked on a full channel observe the shutdown
        drop(rx);

        if let Err(e) = discovery.await {
            error!("Repository discovery task failed: {}", e);
        }

        info!("Credential sidecar stopped");
    }
}

async fn discover_periodically(
    root: PathBuf,
    scan_interval: Duration,
    tx: mpsc::Sender<ScanEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        debug!("Scanning {} for repositories", root.display());

        let walk = {
            let root = root.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                walk_repositories(&root, &cancel, |path| {
                    tx.blocking_send(ScanEvent::Repository(path)).is_ok()
                })
            })
        };

        match walk.await {
            Ok(Ok(found)) => {
                if tx.send(ScanEvent::Finished { found }).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => warn!("Failed to scan {}: {:#}", root.display(), e),
            Err(e) => {
                error!("Repository walk panicked: {}", e);
                break;
            }
        }
    }
}

/// Every `*.git` directory below `root`
pub fn find_repositories(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    walk_repositories(root, &CancellationToken::new(), |path| {
        found.push(path);
        true
    })?;
    found.sort();
    Ok(found)
}

/// Depth-first walk calling `emit` for each directory named `*.git`.
/// Repositories are not descended into and symlinks are not followed.
/// Stops early when `emit` returns false or `cancel` fires.
fn walk_repositories<F>(root: &Path, cancel: &CancellationToken, mut emit: F) -> Result<usize>
where
    F: FnMut(PathBuf) -> bool,
{
    if !root.is_dir() {
        bail!("Repository root {} is not a directory", root.display());
    }

    let mut pending = vec![root.to_path_buf()];
    let mut found = 0;

    while let Some(dir) = pending.pop() {
        if cancel.is_cancelled() {
            break;
        }

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if dir == root => {
                return Err(e).with_context(|| format!("Failed to read {}", root.display()))
            }
            Err(e) => {
                warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                continue;
            }
        };

        for entry in entries.flatten() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }

            let path = entry.path();
            if entry.file_name().to_string_lossy().ends_with(".git") {
                found += 1;
                if !emit(path) {
                    return Ok(found);
                }
            } else {
                pending.push(path);
            }
        }
    }

    Ok(found)
}
