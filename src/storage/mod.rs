//! Storage implementations.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::StorageConfig;
use crate::interfaces::{EventFetcher, EventLog, ProcessorStateStore};

pub mod memory;
pub mod schema;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{MemoryEventLog, MemoryStateStore};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteEventLog, SqliteStateStore};

/// Storage handles used by the engine.
pub struct Storage {
    pub event_log: Arc<dyn EventLog>,
    pub fetcher: Arc<dyn EventFetcher>,
    pub state_store: Arc<dyn ProcessorStateStore>,
}

/// Initialize storage based on configuration.
pub async fn init_storage(config: &StorageConfig) -> Result<Storage, Box<dyn std::error::Error>> {
    info!("Storage: {} at {}", config.storage_type, config.path);

    match config.storage_type.as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)?;
            }

            let pool =
                sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.path)).await?;

            let event_log = Arc::new(SqliteEventLog::new(pool.clone()));
            event_log.init().await?;

            let state_store = Arc::new(SqliteStateStore::new(pool));
            state_store.init().await?;

            Ok(Storage {
                event_log: event_log.clone(),
                fetcher: event_log,
                state_store,
            })
        }
        #[cfg(not(feature = "sqlite"))]
        "sqlite" => {
            error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err("SQLite feature not enabled".into())
        }
        "memory" => {
            let event_log = Arc::new(MemoryEventLog::new());

            Ok(Storage {
                event_log: event_log.clone(),
                fetcher: event_log,
                state_store: Arc::new(MemoryStateStore::new()),
            })
        }
        other => {
            error!("Unknown storage type: {}", other);
            Err(format!("Unknown storage type: {}", other).into())
        }
    }
}
