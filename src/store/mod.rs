//! Storage backends
//!
//! Each backend implements all three storage seams: [`LedgerStore`],
//! [`EventStore`] and [`RecordStore`].
//!
//! - [`MemoryStore`]: single-mutex in-process state, for tests and ephemeral runs
//! - [`SqliteStore`]: durable SQLite file
//!
//! [`LedgerStore`]: crate::ledger::LedgerStore
//! [`EventStore`]: crate::webhook::dedup::EventStore
//! [`RecordStore`]: crate::webhook::records::RecordStore

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use crate::error::StoreError;
use crate::ledger::LedgerStore;
use crate::webhook::dedup::EventStore;
use crate::webhook::records::RecordStore;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// The three store handles a service needs, usually backed by one object
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub events: Arc<dyn EventStore>,
    pub records: Arc<dyn RecordStore>,
}

impl Stores {
    /// Fresh in-memory stores
    pub fn memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::new()))
    }

    /// SQLite stores at `path`, schema created if missing
    pub async fn sqlite(path: impl Into<std::path::PathBuf>) -> Result<Self, StoreError> {
        let store = SqliteStore::new(path);
        store.init().await?;
        Ok(Self::from_backend(Arc::new(store)))
    }

    /// Share one backend across all three seams
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: LedgerStore + EventStore + RecordStore,
    {
        Self {
            ledger: backend.clone(),
            events: backend.clone(),
            records: backend,
        }
    }
}
