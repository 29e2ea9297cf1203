#![forbid(unsafe_code)]

//! `assistant-relay`: HTTP relay between a chat UI and the assistant CLI.
//!
//! Bootstraps configuration, opens the conversation store, and serves the
//! HTTP API until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use assistant_relay::config::GlobalConfig;
use assistant_relay::persistence::db;
use assistant_relay::transport::http::{self, AppState};
use assistant_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "assistant-relay", about = "Assistant CLI chat relay", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// HTTP port; overrides the config file and the `PORT` variable.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("assistant-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match args.config.as_deref() {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(port) = env_port()? {
        config.http_port = port;
    }
    if let Some(port) = args.port {
        config.http_port = port;
    }
    let config = Arc::new(config);
    info!(host_cli = %config.host_cli, port = config.http_port, "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect_from_config(&config).await?);
    info!(path = %config.db_path.display(), "database connected");

    let state = Arc::new(AppState::new(Arc::clone(&config), db));

    // ── Start transport ─────────────────────────────────
    let ct = CancellationToken::new();
    let http_ct = ct.clone();
    let http_state = Arc::clone(&state);
    let mut http_handle = tokio::spawn(http::serve(http_state, http_ct));

    info!("assistant-relay ready");

    // ── Wait for shutdown signal ────────────────────────
    let early = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            None
        }
        joined = &mut http_handle => Some(joined),
    };
    ct.cancel();

    let joined = match early {
        Some(joined) => joined,
        None => http_handle.await,
    };
    let served = joined
        .map_err(|err| AppError::Transport(format!("http transport task failed: {err}")))
        .and_then(|served| served);
    if let Err(err) = &served {
        error!(%err, "http transport failed");
    }

    state.db.close().await;
    info!("assistant-relay shut down");
    served
}

fn env_port() -> Result<Option<u16>> {
    match std::env::var("PORT") {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| AppError::Config(format!("invalid PORT {raw:?}: {err}"))),
        Err(_) => Ok(None),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
