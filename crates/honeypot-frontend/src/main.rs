//! honeypot-frontend daemon
//!
//! Accepts attacker SSH connections, authenticates them against a
//! configurable, intentionally-gameable policy, acquires a disposable
//! sandbox for each session from the orchestrator's provider RPC, and
//! transparently proxies every channel while logging to Postgres.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use honeypot_core::config::{self, FrontendConfig};
use honeypot_frontend::logger::EventLogger;
use honeypot_frontend::provider::ProviderClient;
use honeypot_frontend::server::{load_or_generate_host_key, SshServer};
use honeypot_frontend::session::{self, SessionManager};
use honeypot_frontend::FrontendState;

#[derive(Parser)]
#[command(name = "honeypot-frontend")]
#[command(about = "Attacker-facing SSH honeypot")]
#[command(version)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address, `host:port` (overrides config's `ssh_server_port`).
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output.
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// How long [`EventLogger::begin`] will retry acquiring a transaction before
/// giving up and letting the session proceed unlogged.
const LOGGER_ACQUIRE_DEADLINE: Duration = Duration::from_secs(10);

/// Initialize tracing: always a stdout layer, plus a non-blocking file
/// layer when `config.log_file` is set. The returned guard must be held for
/// the life of the process or the file writer's background flush thread
/// shuts down early.
fn init_logging(args: &Args, config: &FrontendConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = if args.foreground || config.enable_debug_logging {
        "debug"
    } else {
        &args.log_level
    };
    let filter = tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()));
    let stdout_layer = tracing_subscriber::fmt::layer();

    match &config.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("honeypot-frontend.log"));
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking);

            tracing_subscriber::registry().with(filter).with(stdout_layer).with(file_layer).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout_layer).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let _log_file_guard = init_logging(&args, &config);
    tracing::info!("honeypot-frontend starting");

    let bind_addr = args
        .bind
        .unwrap_or_else(|| format!("0.0.0.0:{}", config.ssh_server_port));

    let host_key = load_or_generate_host_key(&config.host_key_path).await?;
    tracing::info!(
        fingerprint = %host_key.clone_public_key().context("host key has no public half")?.fingerprint(),
        "loaded host key"
    );

    let provider = Arc::new(ProviderClient::connect(
        config.backend_address.clone(),
        config.backoff.clone(),
    ));

    let logger = match EventLogger::connect(
        &config.database_url(),
        config.db_min_connections,
        config.db_max_connections,
        config.backoff.clone(),
        LOGGER_ACQUIRE_DEADLINE,
    )
    .await
    {
        Ok(logger) => Some(Arc::new(logger)),
        Err(e) => {
            tracing::warn!(error = %e, "event logger unavailable; sessions will proceed unlogged");
            None
        }
    };

    let sessions = Arc::new(SessionManager::new(None));
    let session_timeout = config.ssh_session_timeout;

    let state = Arc::new(FrontendState::new(
        config,
        Arc::clone(&sessions),
        Arc::clone(&provider),
        logger,
    ));

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

    let cancel_supervisor = cancel.clone();
    let supervisor_handle = tokio::spawn(session::supervisor::run(
        Arc::clone(&sessions),
        Arc::clone(&provider),
        session_timeout,
        cancel_supervisor,
    ));

    let server = SshServer::new(host_key, Arc::clone(&state), cancel.clone());

    tracing::info!(%bind_addr, "starting SSH server");
    server.run(&bind_addr).await?;

    supervisor_handle.await.context("transport supervisor task panicked")?;

    tracing::info!("honeypot-frontend shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> Result<FrontendConfig> {
    let config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!(path = ?default_path, error = %e, "failed to load config, using defaults");
                FrontendConfig::default()
            })
        } else {
            tracing::info!("no config file found, using defaults");
            FrontendConfig::default()
        }
    };

    Ok(config.apply_env_overrides())
}
