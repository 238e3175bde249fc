//! Long-running mode
//!
//! Runs the mirror orchestrator on a fixed cadence and, in sidecar mode, the
//! credential refresh sidecar next to it. Both share one cancellation token;
//! stopping trips the token and then waits for every task to finish.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::auth::authenticate;
use crate::config::{Config, MirrorConfig};
use crate::git::GitClient;
use crate::github::GitHubProbe;
use crate::sidecar::{CredentialRefresher, Sidecar};
use crate::sync::{SyncEngine, SyncSummary};

/// Parse durations like "30s", "45m", "1h", "2d" or raw seconds
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let seconds = if let Some(value) = duration_str.strip_suffix('s') {
        value.parse::<u64>().context("Invalid seconds value")?
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value.parse::<u64>().map(|v| v * 60).context("Invalid minutes value")?
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value.parse::<u64>().map(|v| v * 3600).context("Invalid hours value")?
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value.parse::<u64>().map(|v| v * 86400).context("Invalid days value")?
    } else {
        duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30m', '1h', '2d'")?
    };

    if seconds == 0 {
        bail!("Duration must be greater than zero");
    }

    Ok(Duration::from_secs(seconds))
}

/// Run a mirror pass now and then every `period` until `cancel` fires.
/// A pass that overruns the period delays the next one instead of overlapping.
pub async fn run_orchestrator(
    engine: SyncEngine,
    mirrors: Arc<Vec<MirrorConfig>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Mirror orchestrator started with interval: {:?}", period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let summary = engine.run_pass(&mirrors, &cancel).await;
        if summary.cancelled {
            break;
        }
    }

    info!("Mirror orchestrator stopped");
}

/// Owns the long-lived tasks and their shared cancellation token
pub struct Daemon {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Daemon {
    /// Authenticate and start every task the configuration asks for
    pub fn launch(config: &Config) -> Result<Self> {
        let handles = authenticate(config)?;
        let engine = SyncEngine::from_handles(&handles);
        let mirror_interval = config.schedule.mirror_interval()?;

        let sidecar = if config.sidecar {
            let minter = handles
                .tokens
                .minter()
                .ok_or_else(|| anyhow!("Sidecar mode requires GitHub App authentication"))?;
            let root = config
                .repos_path()
                .ok_or_else(|| anyhow!("Sidecar mode requires gitea.repos-path"))?;

            let refresher = CredentialRefresher::new(
                Arc::new(GitClient::new()),
                Arc::new(GitHubProbe::new(handles.api_base.clone())),
                minter,
            );
            Some(Sidecar::new(refresher, root, config.schedule.scan_interval()?))
        } else {
            None
        };

        Ok(Self::start(
            engine,
            config.mirrors.clone(),
            mirror_interval,
            sidecar,
        ))
    }

    /// Spawn the orchestrator and, when given, the sidecar
    pub fn start(
        engine: SyncEngine,
        mirrors: Vec<MirrorConfig>,
        mirror_interval: Duration,
        sidecar: Option<Sidecar>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push((
            "orchestrator",
            tokio::spawn(run_orchestrator(
                engine,
                Arc::new(mirrors),
                mirror_interval,
                cancel.clone(),
            )),
        ));

        if let Some(sidecar) = sidecar {
            tasks.push(("sidecar", tokio::spawn(sidecar.run(cancel.clone()))));
        }

        info!("Started {} task(s)", tasks.len());

        Self { cancel, tasks }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until SIGINT/SIGTERM, then stop
    pub async fn run_until_signal(self) {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received, stopping...");
        self.stop().await;
    }

    /// Trip the token, then wait for every task to acknowledge by finishing
    pub async fn stop(self) {
        self.cancel.cancel();

        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => info!("{} stopped", name),
                Err(e) => error!("{} task failed: {}", name, e),
            }
        }
    }
}

/// One mirror pass, aborted cleanly on Ctrl-C
pub async fn run_once(config: &Config) -> Result<SyncSummary> {
    let handles = authenticate(config)?;
    let engine = SyncEngine::from_handles(&handles);
    let cancel = CancellationToken::new();

    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping pass...");
            cancel.cancel();
        })
    };

    let summary = engine.run_pass(&config.mirrors, &cancel).await;
    watcher.abort();

    Ok(summary)
}

/// Wait for shutdown signals (SIGTERM, SIGINT, Ctrl+C)
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenSource;
    use crate::config::{FilterConfig, MirrorFrom, MirrorTo, SourceType};
    use crate::discovery::tests::HangingSource;
    use crate::discovery::{MockRepositorySource, RepoPage};
    use crate::gitea::MockMirrorDestination;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mirrors() -> Vec<MirrorConfig> {
        vec![MirrorConfig {
            prefix: String::new(),
            suffix: String::new(),
            from: MirrorFrom {
                source_type: SourceType::Organization,
                name: "acme".to_string(),
                filter: FilterConfig::default(),
            },
            to: MirrorTo {
                name: "mirrors".to_string(),
            },
        }]
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("45m").unwrap(), Duration::from_secs(45 * 60));
        assert_eq!(parse_duration("1H").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(2 * 86400));
        assert_eq!(parse_duration(" 90 ").unwrap(), Duration::from_secs(90));

        assert!(parse_duration("0m").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[tokio::test]
    async fn test_first_pass_runs_immediately() {
        let passes = Arc::new(AtomicUsize::new(0));
        let mut source = MockRepositorySource::new();
        {
            let passes = passes.clone();
            source.expect_fetch_page().returning(move |_, _| {
                passes.fetch_add(1, Ordering::SeqCst);
                Ok(RepoPage::default())
            });
        }

        let engine = SyncEngine::new(
            Arc::new(source),
            Arc::new(MockMirrorDestination::new()),
            TokenSource::Static("t".to_string()),
        );
        let daemon = Daemon::start(engine, mirrors(), Duration::from_secs(3600), None);

        for _ in 0..100 {
            if passes.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::timeout(Duration::from_secs(5), daemon.stop())
            .await
            .expect("daemon should stop promptly");

        assert_eq!(passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_mid_enumeration() {
        let engine = SyncEngine::new(
            Arc::new(HangingSource),
            Arc::new(MockMirrorDestination::new()),
            TokenSource::Static("t".to_string()),
        );
        let daemon = Daemon::start(engine, mirrors(), Duration::from_secs(3600), None);
        let token = daemon.cancellation_token();

        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(5), daemon.stop())
            .await
            .expect("daemon should stop promptly");

        assert!(token.is_cancelled());
    }
}
