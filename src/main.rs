use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gitea_mirror::config::LoggingConfig;
use gitea_mirror::daemon::run_once;
use gitea_mirror::health::CheckResult;
use gitea_mirror::{Config, ConfigOverrides, Daemon, HealthCheck};

#[derive(Parser)]
#[command(name = "gitea-mirror")]
#[command(about = "Mirror GitHub users and organizations into Gitea")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    overrides: OverrideArgs,
}

/// Flags that override the configuration file
#[derive(Args)]
struct OverrideArgs {
    /// GitHub Enterprise base URL
    #[arg(long, env = "GITHUB_ENTERPRISE_URL", global = true)]
    github_enterprise_url: Option<String>,

    /// GitHub App ID
    #[arg(long, env = "GITHUB_APP_ID", global = true)]
    github_app_id: Option<u64>,

    /// GitHub App installation ID
    #[arg(long, env = "GITHUB_INSTALL_ID", global = true)]
    github_install_id: Option<u64>,

    /// Path to the GitHub App private key
    #[arg(long, env = "GITHUB_PRIVATE_KEY_PATH", global = true)]
    github_private_key_path: Option<String>,

    /// GitHub personal access token
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true, global = true)]
    github_token: Option<String>,

    /// Token Gitea clones with when using a personal access token
    #[arg(long, env = "GITHUB_MIRRORING_TOKEN", hide_env_values = true, global = true)]
    github_mirroring_token: Option<String>,

    /// Gitea base URL
    #[arg(long, env = "GITEA_URL", global = true)]
    gitea_url: Option<String>,

    /// Gitea API token
    #[arg(long, env = "GITEA_TOKEN", hide_env_values = true, global = true)]
    gitea_token: Option<String>,

    /// Also run the credential refresh sidecar
    #[arg(
        long,
        env = "SIDECAR",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        global = true
    )]
    sidecar: Option<bool>,

    /// Gitea repository root scanned by the sidecar
    #[arg(long, env = "REPOS_PATH", global = true)]
    repos_path: Option<String>,
}

impl OverrideArgs {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            enterprise_url: self.github_enterprise_url,
            app_id: self.github_app_id,
            installation_id: self.github_install_id,
            private_key_path: self.github_private_key_path,
            token: self.github_token,
            mirroring_token: self.github_mirroring_token,
            gitea_url: self.gitea_url,
            gitea_token: self.gitea_token,
            sidecar: self.sidecar,
            repos_path: self.repos_path,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror on a schedule until interrupted (default)
    Run,

    /// Run a single mirroring pass and exit
    Once,

    /// System health check and diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    config.apply_overrides(cli.overrides.into_overrides())?;

    init_logging(&config.logging, cli.verbose)?;
    info!("Starting gitea-mirror v{}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&config).await,
        Commands::Once => cmd_once(&config).await,
        Commands::Doctor => cmd_doctor(&config).await,
    }
}

/// Initialize logging from the configuration; RUST_LOG wins, --verbose forces debug
fn init_logging(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let layer = fmt::layer().with_ansi(logging.color);

    match logging.format.as_str() {
        "compact" => tracing_subscriber::registry()
            .with(layer.compact())
            .with(filter)
            .init(),
        "pretty" => tracing_subscriber::registry()
            .with(layer.pretty())
            .with(filter)
            .init(),
        "full" => tracing_subscriber::registry().with(layer).with(filter).init(),
        other => bail!("Unknown log format: {} (expected compact, pretty or full)", other),
    }

    Ok(())
}

async fn cmd_run(config: &Config) -> Result<()> {
    config.validate()?;

    let daemon = Daemon::launch(config)?;
    daemon.run_until_signal().await;

    Ok(())
}

async fn cmd_once(config: &Config) -> Result<()> {
    config.validate()?;

    let summary = run_once(config).await?;

    if summary.failed > 0 || summary.mappings_aborted > 0 {
        bail!(
            "{} repositories failed, {} mappings aborted",
            summary.failed,
            summary.mappings_aborted
        );
    }

    Ok(())
}

async fn cmd_doctor(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config).await;
    print_health_report(&health);

    if !health.all_passed() {
        std::process::exit(1);
    }

    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 gitea-mirror Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
    }

    println!();
    let errors = health.errors();
    let warnings = health.warnings();
    if errors.is_empty() {
        println!("✅ All checks passed");
    } else {
        println!("❌ {} check(s) failed", errors.len());
    }
    if !warnings.is_empty() {
        println!("⚠️  {} warning(s)", warnings.len());
    }
}
