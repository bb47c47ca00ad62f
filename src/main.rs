use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

use watch_relay::api::{self, AppState};
use watch_relay::config;
use watch_relay::logging::{self, LogConfig};
use watch_relay::relay::Relay;
use watch_relay::tracker::{ActionClient, HttpTrackerClient};

#[derive(Debug, Parser)]
#[command(author, version, about = "Relay media server webhooks to a watch tracker")]
struct Args {
    /// Path to YAML config file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
    /// Port to listen on (overrides app.port)
    #[arg(long, env = "PORT")]
    port: Option<u16>,
    /// Number of events kept in history (overrides app.history_size)
    #[arg(long, env = "HISTORY_SIZE")]
    history_size: Option<usize>,
    /// Directory for rolling log files; console only when unset
    #[arg(long, env = "LOG_DIR")]
    log_dir: Option<PathBuf>,
    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", value_parser = BoolishValueParser::new())]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = logging::init(&LogConfig {
        verbose: args.verbose,
        json: args.log_json,
        dir: args.log_dir.clone(),
    })?;

    let mut cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.apply_overrides(args.port, args.history_size);
    config::validate(&cfg)?;

    let relay = Relay::start(&cfg, |account| {
        let client = HttpTrackerClient::from_config(&cfg, account)?;
        Ok(Arc::new(client) as Arc<dyn ActionClient>)
    })?;

    let app = api::router(AppState::from_relay(&relay));
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.app.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(%addr, users = cfg.users.len(), "starting webhook server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    relay
        .shutdown(Duration::from_secs(cfg.app.shutdown_grace_seconds))
        .await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(?err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received terminate signal, shutting down"),
    }
}
