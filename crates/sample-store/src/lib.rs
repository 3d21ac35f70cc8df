//! Sample Store
//!
//! Durable, priority-ordered, capacity-bounded log of pending samples backed
//! by SQLite. Producers insert batches, the transfer cycle removes ordered
//! batches, and eviction policies keep the store under its size cap.

mod eviction;
mod sample;
mod store;

pub use eviction::{EvictionConfig, EvictionPolicy, Evictor};
pub use sample::{RemovalOrder, Sample, SamplePayload, StoredRecord};
pub use store::{SampleStore, StoreConfig};

use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database hit its size cap. Never retried internally; the caller
    /// runs the eviction strategy and retries the operation.
    #[error("sample store is full")]
    Full,
    /// Opening the database kept failing after the configured retries.
    #[error("sample store unavailable after {attempts} open attempts")]
    Unavailable {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },
    /// Any other database failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}
