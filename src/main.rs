//! Cube Master Server
//!
//! Runs the master server with configuration from the environment.
//! Stops on Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cube_master::{
    info::UdpInfoQuery,
    storage::MemoryStore,
    MasterConfig, MasterServer, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Cube Master v{}", VERSION);

    let config = MasterConfig::from_env();

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &config.users_file {
        let loaded = store
            .load_users(path)
            .with_context(|| format!("loading users from {}", path.display()))?;
        info!("Loaded {} users from {}", loaded, path.display());
    }

    let info_query = Arc::new(UdpInfoQuery::new(config.info_timeout));
    let server = Arc::new(MasterServer::new(config, store, info_query));

    let running = server.clone();
    let mut task = tokio::spawn(async move { running.run().await });

    tokio::select! {
        result = &mut task => {
            return result.context("server task panicked")?.context("server failed");
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    info!("Shutting down");
                    server.shutdown();
                }
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
        }
    }

    task.await.context("server task panicked")?.context("server failed")
}
