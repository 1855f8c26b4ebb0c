//! Headless worker daemon: dispatcher + engines without the HTTP surface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use orchestrator::config::{load_config, OrchestratorConfig};
use orchestrator::dispatcher::Dispatcher;
use orchestrator::engine::EngineDeps;
use orchestrator::io::ci::GitHubCi;
use orchestrator::io::generator::{CliGenerator, GeneratorExecutor};
use orchestrator::io::git::GitCli;
use orchestrator::io::store::SqliteStore;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "CI-driven background agent orchestrator worker"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "orchestrator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher until interrupted.
    Run,
    /// Check the configuration and external tooling, then exit.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    orchestrator::logging::init();
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Doctor => doctor(config).await,
    }
}

async fn run(config: OrchestratorConfig) -> Result<()> {
    let config = Arc::new(config);
    let store = Arc::new(SqliteStore::open(&config.db_path).await?);
    let generator = CliGenerator::new(config.generator.command.clone());
    if let Err(err) = generator.available().await {
        warn!(error = %err, "generator tool not available; tasks will fail until it is installed");
    }

    let deps = EngineDeps {
        store: Arc::clone(&store),
        vcs: Arc::new(GitCli),
        generator: Arc::new(generator),
        ci: Arc::new(GitHubCi::new(
            config.ci.api_base.clone(),
            (!config.ci.token.is_empty()).then(|| config.ci.token.clone()),
            config.ci_poll_interval(),
        )),
        config: Arc::clone(&config),
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    Dispatcher::new(deps).run(shutdown).await?;
    store.close().await;
    Ok(())
}

async fn doctor(config: OrchestratorConfig) -> Result<()> {
    config.validate()?;
    println!("config ok");

    let generator = CliGenerator::new(config.generator.command.clone());
    match generator.available().await {
        Ok(()) => println!("generator ok ({})", config.generator.command.join(" ")),
        Err(err) => println!("generator unavailable: {err}"),
    }

    let store = SqliteStore::open(&config.db_path).await?;
    store.close().await;
    println!("store ok ({})", config.db_path.display());
    Ok(())
}
