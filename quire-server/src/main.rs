//! Quire sync server.
//!
//! Opens the RocksDB store and serves the WebSocket realtime port, the HTTP
//! pull/push fallback and the periodic compaction sweep from one process.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use quire_sync::{
    router, AllowAll, Collaborators, CompactionScheduler, HttpState, MemorySearchIndex,
    RealtimeServer, RocksStore, RoomManager, SyncEngine,
};
use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "quire")]
#[command(version = "0.1.0")]
#[command(about = "Collaborative document sync server", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "QUIRE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = ServerConfig::load(cli.config.as_deref())?;
    let sync_config = config.sync_config();

    info!("Starting quire server");
    let store = Arc::new(
        RocksStore::open(config.store_config())
            .with_context(|| format!("opening store at {}", config.data_path.display()))?,
    );

    // Stored block rows double as the seed for documents that were never synced.
    let collaborators = Collaborators {
        permissions: Arc::new(AllowAll),
        initial_content: store.clone(),
        block_store: store.clone(),
        search_index: Arc::new(MemorySearchIndex::new()),
    };
    let engine = SyncEngine::new(store, collaborators, sync_config.clone());
    let rooms = Arc::new(RoomManager::new(sync_config.broadcast_capacity));

    let scheduler = CompactionScheduler::new(
        engine.clone(),
        sync_config.compaction_interval,
        sync_config.idle_eviction,
    )
    .spawn();

    let ws_listener = TcpListener::bind(&config.ws_bind)
        .await
        .with_context(|| format!("binding WebSocket port {}", config.ws_bind))?;
    let http_listener = TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("binding HTTP port {}", config.http_bind))?;
    info!("HTTP fallback listening on {}", config.http_bind);

    let realtime = RealtimeServer::new(engine.clone(), rooms.clone());
    let app = router(HttpState {
        engine: engine.clone(),
        rooms,
    });

    tokio::select! {
        result = realtime.serve(ws_listener) => {
            if let Err(e) = result {
                error!("WebSocket server stopped: {}", e);
            }
        }
        result = axum::serve(http_listener, app).into_future() => {
            if let Err(e) = result {
                error!("HTTP server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    scheduler.shutdown().await;
    let flushed = engine.shutdown().await;
    if flushed > 0 {
        info!("Materialized {} documents with pending edits", flushed);
    }
    // Final sweep so the log is as short as possible at the next start.
    let report = CompactionScheduler::new(
        engine,
        sync_config.compaction_interval,
        sync_config.idle_eviction,
    )
    .sweep()
    .await;
    info!(
        "Stopped: {} documents compacted, {} failed",
        report.compacted, report.failed
    );
    Ok(())
}
