//! Voxel World Server
//!
//! Opens the configured world and serves it over WebSocket until Ctrl-C.

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voxel_world::{ServerConfig, WorldServer, VERSION};

#[cfg(feature = "debug-tracing")]
const DEFAULT_FILTER: &str = "debug";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_FILTER: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_env();
    info!("Voxel World Server v{}", VERSION);
    info!(
        "World {} in {} (auth {})",
        config.world.world_id,
        config.world.worlds_root.display(),
        if config.auth.is_configured() { "enabled" } else { "disabled" }
    );

    let server = Arc::new(WorldServer::open(config)?);
    let world = server.world().clone();
    info!("World age {} days", world.world_state().age);

    let running = server.clone();
    let mut handle = tokio::spawn(async move { running.run().await });

    tokio::select! {
        result = &mut handle => result??,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down");
            server.shutdown();
            handle.await??;
        }
    }

    Ok(())
}
