//! In-memory adapter, used when no storage path is configured and in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use switchboard_core::ReplicantKey;

use super::{PersistedRecord, PersistenceAdapter, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<ReplicantKey, PersistedRecord>>,
    writes: AtomicU64,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, as if `records` had been saved by an earlier run.
    pub fn with_records(records: impl IntoIterator<Item = PersistedRecord>) -> Self {
        let store = Self::new();
        store
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(records.into_iter().map(|r| (r.key.clone(), r)));
        store
    }

    pub fn get(&self, key: &ReplicantKey) -> Option<PersistedRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful saves so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every save fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl PersistenceAdapter for MemoryStore {
    fn load_all(&self) -> Result<Vec<PersistedRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    fn save(&self, record: &PersistedRecord) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io("store is failing writes".into()));
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.key.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
