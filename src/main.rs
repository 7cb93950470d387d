//! Agentlink CLI - agent fleet coordination
//!
//! Serves the command and port-forward tools over stdio as JSON lines and
//! optionally injects child agents into labelled containers.

mod config;

use agentlink_lib::{AgentlinkConfig, DockerCli, Fleet, LocalTunnelProvider};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{ConfigManager, Overrides};

/// Agentlink - coordinate a fleet of remote agents
#[derive(Parser, Debug)]
#[command(name = "agentlink")]
#[command(about = "Agentlink - coordinate a fleet of remote agents")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Config file (default: ~/.agentlink/config.yaml)
    #[arg(long, global = true, env = "AGENTLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "AGENTLINK_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the tool surface on stdin/stdout
    #[command(long_about = r#"
Read one JSON tool request per line from stdin and write one JSON reply
per line to stdout. Logs go to stderr.

Tools reach only this host's agent (the parent). Injected child agents are
tracked but not dialable from here, and log ingestion and streaming are
available through the agentlink-lib API only.

EXAMPLES:
  echo '{"tool": "async-command-list"}' | agentlink serve

  agentlink serve --inject --access-url https://control.example.com
    "#)]
    Serve {
        #[command(flatten)]
        overrides: Overrides,

        /// Also run the container injector
        #[arg(long)]
        inject: bool,
    },

    /// Run only the container injector until interrupted
    Inject {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Setup logging to stderr; stdout carries the tool protocol
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false),
        )
        .with(filter)
        .init();
}

fn load_config(path: Option<&PathBuf>, overrides: &Overrides) -> Result<AgentlinkConfig> {
    let mut config = ConfigManager::load(path.map(PathBuf::as_path))?;
    overrides.apply(&mut config);
    Ok(config)
}

fn build_fleet(config: AgentlinkConfig) -> Result<Fleet> {
    let provider = Arc::new(LocalTunnelProvider::new());
    let fleet = Fleet::new(config, provider.clone()).context("Failed to initialize fleet")?;
    // The parent agent is this host.
    provider.register(fleet.parent.id);
    Ok(fleet)
}

async fn start_injector(fleet: &Fleet, cancel: CancellationToken) -> Result<JoinHandle<()>> {
    let bootstrap = fleet.bootstrap_source().context(
        "Injection needs injector.bootstrap_path, injector.bootstrap_url or injector.access_url",
    )?;
    let docker = Arc::new(DockerCli::with_binary(
        fleet.config.injector.docker_binary.clone(),
    ));
    let injector = fleet.injector(docker.clone(), docker, bootstrap);

    injector
        .start(cancel)
        .await
        .context("Failed to start injector")
}

/// Answer tool requests from stdin until EOF or Ctrl+C
async fn serve_stdio(fleet: &Fleet) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                return Ok(());
            }

            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read request")? else {
                    info!("Input closed, shutting down...");
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }

                let reply = fleet.tools.handle_json(&line).await;
                let mut json = serde_json::to_string(&reply).context("Failed to encode reply")?;
                json.push('\n');
                stdout
                    .write_all(json.as_bytes())
                    .await
                    .context("Failed to write reply")?;
                stdout.flush().await.context("Failed to write reply")?;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Serve { overrides, inject } => {
            let config = load_config(cli.config.as_ref(), &overrides)?;
            let run_injector = inject || config.injector.enabled;
            let fleet = build_fleet(config)?;
            info!(agent_id = %fleet.parent.id, "Agentlink serving on stdio");

            let cancel = CancellationToken::new();
            let injector_task = if run_injector {
                Some(start_injector(&fleet, cancel.clone()).await?)
            } else {
                None
            };

            let result = serve_stdio(&fleet).await;
            if let Err(e) = &result {
                error!("Tool server error: {:#}", e);
            }

            cancel.cancel();
            if let Some(task) = injector_task {
                let _ = task.await;
            }
            fleet.shutdown().await;

            info!("Agentlink stopped");
            result
        }
        Commands::Inject { overrides } => {
            let config = load_config(cli.config.as_ref(), &overrides)?;
            let fleet = build_fleet(config)?;

            let cancel = CancellationToken::new();
            let task = start_injector(&fleet, cancel.clone()).await?;

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");

            cancel.cancel();
            let _ = task.await;
            fleet.shutdown().await;

            info!("Agentlink stopped");
            Ok(())
        }
    }
}
