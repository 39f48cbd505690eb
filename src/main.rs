//! File Sharing Server
//!
//! Multi-client TCP file sharing with framed, checksum-verified transfers,
//! an activity log, and real-time notifications between clients.

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fileshare_server::db::SqliteManager;
use fileshare_server::pool::Pool;
use fileshare_server::{Config, Server, ServerState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "fileshare_server=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting file sharing server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Database: {}", config.database.url);
    tracing::info!(
        "Workers: {} core / {} max, backend pool: {}",
        config.workers.core_size,
        config.workers.max_size,
        config.database.pool_size
    );

    // Backend pool; connections open lazily on first use
    let manager = SqliteManager::new(&config.database.url)
        .with_context(|| format!("Invalid database URL: {}", config.database.url))?;
    let pool = Pool::new(manager, config.pool_config());

    let state = ServerState::new(config, pool.clone());

    let server = Server::bind(state).await.context("Failed to start server")?;
    server.run(shutdown_signal()).await.context("Server error")?;

    pool.close().await;
    tracing::info!(stats = ?pool.stats(), "Server shutdown complete");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
