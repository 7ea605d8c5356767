//! Persistence for authority replicants.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  change   ┌──────────────────────┐  spawn_blocking  ┌──────────────────┐
//! │  Registry   │ ────────► │ PersistenceScheduler │ ───────────────► │ PersistenceAdapter│
//! │ (replicants)│           │ (throttle per key)   │                  │  RocksDB / memory │
//! └──────┬──────┘           └──────────────────────┘                  └────────┬─────────┘
//!        │ first declare                                                       │
//!        └◄──────────────────────────── load_all() at startup ◄────────────────┘
//! ```
//!
//! One record per replicant holds its latest value. Records are read once
//! when the registry starts and consumed lazily, on first declaration.

pub mod memory;
pub mod rocks;
pub mod scheduler;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::operation::deserialize_present;
use switchboard_core::{ReplicantKey, Revision};

pub use memory::MemoryStore;
pub use rocks::{ReplicantMetadata, ReplicantStore, StoreConfig};
pub use scheduler::PersistenceScheduler;

/// The persisted form of one replicant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub key: ReplicantKey,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub value: Option<Value>,
    /// Revision at the time of the write, kept for diagnostics
    pub revision: Revision,
}

impl PersistedRecord {
    pub fn new(key: ReplicantKey, value: Option<Value>, revision: Revision) -> Self {
        Self { key, value, revision }
    }
}

/// Storage collaborator consumed by the registry. Calls block; the
/// scheduler runs them off the async threads.
pub trait PersistenceAdapter: Send + Sync + 'static {
    fn load_all(&self) -> Result<Vec<PersistedRecord>, StoreError>;

    fn save(&self, record: &PersistedRecord) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("replicant not found: {0}")]
    NotFound(ReplicantKey),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
