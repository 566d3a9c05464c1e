//! Reference sync server for inkstone workspaces
//!
//! Provides:
//! - Account registration and login with per-device sessions
//! - Single-use refresh token rotation
//! - A cursor-paged change feed per account
//! - Encrypted object upload, download, and tombstoning
//!
//! The server stores ciphertext only. Key derivation and note encryption
//! happen on the devices; nothing in this process can read a note.

mod config;
mod routes;
mod storage;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::storage::Storage;

#[derive(Parser, Debug)]
#[command(name = "sync-server")]
#[command(about = "Reference sync server for inkstone workspaces")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 7870, env = "INKSTONE_PORT")]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0", env = "INKSTONE_BIND")]
    bind: String,

    /// Path to the data directory
    #[arg(long, default_value = "./data", env = "INKSTONE_DATA_PATH")]
    data_path: String,
}

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub storage: Storage,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sync_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.data_path)?;
    let storage = Storage::new(&cli.data_path)?;

    let state = Arc::new(AppState { config, storage });

    // Periodic sweep for long uptimes; load already drops expired tokens
    let sweeper = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            if let Err(e) = sweeper.storage.cleanup_expired() {
                tracing::warn!("Session cleanup failed: {}", e);
            }
        }
    });

    let app = routes::router(state);

    // Parse bind address
    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port).parse()?;

    tracing::info!("Starting sync-server on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Sync server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
