pub mod in_memory;
pub mod store;

use std::sync::Arc;

use tracing::info;
use trellis_core::config::{MemoryBackend, MemoryConfig};
use trellis_core::error::Result;
use trellis_core::traits::MemoryStore;

pub use in_memory::InMemoryStore;
pub use store::SqliteStore;

/// Open the memory backend selected by configuration.
pub fn open_store(config: &MemoryConfig) -> Result<Arc<dyn MemoryStore>> {
    match config.backend {
        MemoryBackend::Memory => {
            info!("Using in-memory conversation store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        MemoryBackend::Sqlite if config.path == ":memory:" => {
            info!("Using in-memory SQLite conversation store");
            Ok(Arc::new(SqliteStore::in_memory()?))
        }
        MemoryBackend::Sqlite => {
            let path = config.resolved_path();
            info!(path = %path.display(), "Using SQLite conversation store");
            Ok(Arc::new(SqliteStore::open(&path)?))
        }
    }
}
