//! Standalone switchboard authority.
//!
//! ```text
//! switchboard-server [BIND_ADDR] [DATA_DIR] [SCHEMA_ROOT]
//! ```
//!
//! Arguments fall back to `SWITCHBOARD_BIND`, `SWITCHBOARD_DATA` and
//! `SWITCHBOARD_SCHEMAS`. Without a data directory nothing is persisted.
//! Log verbosity follows `RUST_LOG`.

use std::env;
use std::path::PathBuf;

use switchboard_sync::{ServerConfig, SyncServer};

fn config_from_env() -> ServerConfig {
    let mut args = env::args().skip(1);
    let mut setting = |var: &str| args.next().or_else(|| env::var(var).ok());

    let defaults = ServerConfig::default();
    ServerConfig {
        bind_addr: setting("SWITCHBOARD_BIND").unwrap_or(defaults.bind_addr),
        storage_path: setting("SWITCHBOARD_DATA").map(PathBuf::from),
        schema_root: setting("SWITCHBOARD_SCHEMAS").map(PathBuf::from),
        ..defaults
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = config_from_env();
    log::info!(
        "Starting switchboard on {} (storage: {}, schemas: {})",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map_or("memory".to_string(), |p| p.display().to_string()),
        config
            .schema_root
            .as_ref()
            .map_or("none".to_string(), |p| p.display().to_string()),
    );
    let server = SyncServer::new(config)?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                log::error!("Server stopped: {e}");
            }
            server.shutdown().await?;
            result
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, flushing pending writes");
            server.shutdown().await?;
            Ok(())
        }
    }
}
