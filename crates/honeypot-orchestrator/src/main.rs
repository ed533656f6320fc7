//! honeypot-orchestrator daemon
//!
//! Owns the Docker socket and serves the provider RPC the frontend speaks to
//! acquire and yield disposable SSH-accessible sandboxes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bollard::Docker;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use honeypot_core::config::{self, OrchestratorConfig};
use honeypot_orchestrator::{reaper, rpc, OrchestratorState, SandboxOrchestrator};

#[derive(Parser)]
#[command(name = "honeypot-orchestrator")]
#[command(about = "Sandbox orchestrator for the SSH honeypot")]
#[command(version)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address, `host:port` (overrides config's `http_api_bind_address`).
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output.
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    let stdout_layer = tracing_subscriber::fmt::layer();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(stdout_layer)
        .init();

    tracing::info!("honeypot-orchestrator starting");

    let config = load_config(&args)?;
    let bind_addr = args.bind.unwrap_or_else(|| config.http_api_bind_address.clone());

    let docker = Docker::connect_with_local_defaults().context("failed to connect to docker socket")?;
    docker.ping().await.context("docker ping failed; is the daemon reachable?")?;

    let sandboxes = SandboxOrchestrator::new(docker, config.clone());
    let state = Arc::new(OrchestratorState::new(config, Arc::clone(&sandboxes)));

    let cancel = CancellationToken::new();
    let cancel_signals = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
            _ = terminate => tracing::info!("received SIGTERM, shutting down"),
        }

        cancel_signals.cancel();
    });

    let reaper_handle = tokio::spawn(reaper::run(Arc::clone(&state), cancel.clone()));

    tracing::info!(%bind_addr, "starting provider rpc server");
    rpc::run(Arc::clone(&state), &bind_addr, cancel.clone()).await?;

    reaper_handle.await.context("shutdown reaper task panicked")?;

    tracing::info!("honeypot-orchestrator shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> Result<OrchestratorConfig> {
    let config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_dir().join("orchestrator.toml");
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!(path = ?default_path, error = %e, "failed to load config, using defaults");
                OrchestratorConfig::default()
            })
        } else {
            tracing::info!("no config file found, using defaults");
            OrchestratorConfig::default()
        }
    };

    Ok(config.apply_env_overrides())
}
