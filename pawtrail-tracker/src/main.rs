//! pawtrail-tracker - walk tracking daemon
//!
//! Hosts the walk-session core on the device: rebuilds in-flight walks from
//! the server, resumes uploads of buffered samples, and serves a local
//! read-only status API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pawtrail_common::config::{resolve_config_path, LoggingConfig, TomlConfig};
use pawtrail_tracker::remote::HttpWalkApi;
use pawtrail_tracker::{build_router, AppState, WalkTracker};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for pawtrail-tracker
#[derive(Parser, Debug)]
#[command(name = "pawtrail-tracker")]
#[command(about = "Walk session and location tracking daemon")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port for the local status API (overrides the config file)
    #[arg(short, long, env = "PAWTRAIL_PORT")]
    port: Option<u16>,

    /// SQLite database path (overrides the config file)
    #[arg(short, long, env = "PAWTRAIL_DATABASE")]
    database: Option<PathBuf>,
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "pawtrail_tracker={level},pawtrail_common={level},tower_http=debug",
            level = logging.level
        )
        .into()
    });

    match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref()).context("No configuration file found")?;
    let mut config = TomlConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(database) = args.database {
        config.database_path = Some(database);
    }

    init_tracing(&config.logging)?;

    info!("Starting pawtrail-tracker v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration: {}", config_path.display());

    let db_path = config.database_path();
    info!("Database: {}", db_path.display());
    let pool = pawtrail_common::db::init_database(&db_path)
        .await
        .context("Failed to initialize database")?;

    let api = HttpWalkApi::new(&config.api).context("Failed to build walk API client")?;
    info!("Walk API: {}", config.api.base_url);

    let tracker = Arc::new(WalkTracker::init(&config, pool, Arc::new(api)));

    match tracker.recover().await {
        Ok(report) => info!(
            "Recovered {} walk(s), resumed uploads for {}",
            report.restored.len(),
            report.resumed.len()
        ),
        // Keep running: buffered samples stay put until the server is reachable
        Err(e) => tracing::warn!(error = %e, "Cold-start recovery failed"),
    }
    tracker.start_background().await;

    let app = build_router(AppState::new(tracker.clone()));
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracker.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
