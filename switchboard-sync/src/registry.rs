//! Authority-side registry of declared replicants.
//!
//! ```text
//!  Declare / ProposeOperations / Read
//!            │
//!            ▼
//!   ┌─────────────────┐  on_operations   ┌───────────────┐
//!   │    Registry     │ ───────────────► │ BroadcastGroup│ ──► room members
//!   │ key → Replicant │                  └───────────────┘
//!   └────────┬────────┘  on_change       ┌──────────────────────┐
//!            └─────────────────────────► │ PersistenceScheduler │
//!                                        └──────────────────────┘
//! ```
//!
//! Replicants are created lazily on first declaration, seeded from the
//! records loaded when the registry was opened.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use switchboard_core::{
    AuthoritativeState, Operation, Replicant, ReplicantError, ReplicantKey, ReplicantOptions,
    Revision, Schema, SchemaError,
};
use tokio::sync::RwLock;

use crate::broadcast::RoomManager;
use crate::protocol::{MessageType, ProtocolError, ReadBody, SyncMessage, AUTHORITY_ID};
use crate::storage::{
    MemoryStore, PersistedRecord, PersistenceAdapter, PersistenceScheduler, StoreError,
};

pub const SCHEMA_MISMATCH: &str = "Mismatched schema version";
pub const REVISION_MISMATCH: &str = "Mismatched revision number";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} has not been declared")]
    Undeclared(ReplicantKey),
    #[error(transparent)]
    Replicant(#[from] ReplicantError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryStats {
    pub declared: usize,
    pub batches_broadcast: u64,
    pub proposals_rejected: u64,
    pub persisted_writes: u64,
    pub failed_writes: u64,
}

pub struct Registry {
    replicants: RwLock<HashMap<ReplicantKey, Replicant>>,
    /// Loaded at startup, consumed on first declaration
    persisted: Mutex<HashMap<ReplicantKey, PersistedRecord>>,
    rooms: Arc<RoomManager>,
    scheduler: Arc<PersistenceScheduler>,
    schema_root: Option<PathBuf>,
    batches_broadcast: Arc<AtomicU64>,
    proposals_rejected: AtomicU64,
}

impl Registry {
    /// Open a registry over `adapter`, reading every persisted record.
    pub fn new(
        adapter: Arc<dyn PersistenceAdapter>,
        rooms: Arc<RoomManager>,
        schema_root: Option<PathBuf>,
    ) -> Result<Self, StoreError> {
        let records = adapter.load_all()?;
        log::info!("Loaded {} persisted replicant(s)", records.len());
        let persisted = records.into_iter().map(|r| (r.key.clone(), r)).collect();
        Ok(Self::build(adapter, persisted, rooms, schema_root))
    }

    /// A registry that keeps nothing across restarts.
    pub fn in_memory(rooms: Arc<RoomManager>, schema_root: Option<PathBuf>) -> Self {
        Self::build(Arc::new(MemoryStore::new()), HashMap::new(), rooms, schema_root)
    }

    fn build(
        adapter: Arc<dyn PersistenceAdapter>,
        persisted: HashMap<ReplicantKey, PersistedRecord>,
        rooms: Arc<RoomManager>,
        schema_root: Option<PathBuf>,
    ) -> Self {
        Self {
            replicants: RwLock::new(HashMap::new()),
            persisted: Mutex::new(persisted),
            rooms,
            scheduler: Arc::new(PersistenceScheduler::new(adapter)),
            schema_root,
            batches_broadcast: Arc::new(AtomicU64::new(0)),
            proposals_rejected: AtomicU64::new(0),
        }
    }

    /// Return the declared replicant, creating it on first use.
    pub async fn declare(
        &self,
        key: ReplicantKey,
        options: ReplicantOptions,
    ) -> Result<Replicant, RegistryError> {
        if let Some(existing) = self.replicants.read().await.get(&key) {
            return Ok(existing.clone());
        }

        let mut replicants = self.replicants.write().await;
        if let Some(existing) = replicants.get(&key) {
            return Ok(existing.clone());
        }

        let schema = self.resolve_schema(&key, &options)?;
        let persisted = self
            .persisted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        if persisted.is_some() {
            log::info!("Seeding {key} from its persisted value");
        }
        let replicant = Replicant::authority(
            key.clone(),
            options.clone(),
            schema,
            persisted.and_then(|r| r.value),
        )?;

        let room = self.rooms.get_or_create(&key).await;
        let broadcasts = self.batches_broadcast.clone();
        replicant.on_operations(move |batch| {
            match SyncMessage::operations(AUTHORITY_ID, batch).and_then(|msg| room.broadcast(&msg)) {
                Ok(receivers) => {
                    broadcasts.fetch_add(1, Ordering::Relaxed);
                    log::trace!(
                        "Broadcast revision {} of {} to {receivers} receiver(s)",
                        batch.revision,
                        batch.key
                    );
                }
                Err(e) => log::error!("Failed to broadcast revision {} of {}: {e}", batch.revision, batch.key),
            }
        });

        if options.persistent {
            let scheduler = self.scheduler.clone();
            let weak = replicant.downgrade();
            let interval = Duration::from_millis(options.persistence_interval_ms);
            let record_key = key.clone();
            replicant.on_change(move |change| {
                let revision = weak.upgrade().map_or(0, |r| r.revision());
                scheduler.schedule(
                    PersistedRecord::new(record_key.clone(), change.new_value.clone(), revision),
                    interval,
                );
            });
        }

        log::debug!("Declared {key}");
        replicants.insert(key, replicant.clone());
        Ok(replicant)
    }

    /// Inline schema, then the declared path, then
    /// `<schema_root>/<namespace>/schemas/<name>.json` if it exists.
    fn resolve_schema(
        &self,
        key: &ReplicantKey,
        options: &ReplicantOptions,
    ) -> Result<Option<Schema>, SchemaError> {
        if let Some(document) = &options.schema {
            return Schema::new(document.clone()).map(Some);
        }
        if let Some(path) = &options.schema_path {
            return Schema::load(path).map(Some);
        }
        match self.conventional_schema_path(key) {
            Some(path) if path.is_file() => {
                log::debug!("Using schema {} for {key}", path.display());
                Schema::load(&path).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn conventional_schema_path(&self, key: &ReplicantKey) -> Option<PathBuf> {
        let root: &Path = self.schema_root.as_deref()?;
        Some(
            root.join(&key.namespace)
                .join("schemas")
                .join(format!("{}.json", key.name)),
        )
    }

    pub async fn get(&self, key: &ReplicantKey) -> Option<Replicant> {
        self.replicants.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &ReplicantKey) -> bool {
        self.replicants.read().await.contains_key(key)
    }

    pub async fn keys(&self) -> Vec<ReplicantKey> {
        self.replicants.read().await.keys().cloned().collect()
    }

    /// Current value, or `None` if the replicant was never declared.
    pub async fn read(&self, key: &ReplicantKey) -> Option<Value> {
        self.get(key).await.and_then(|r| r.value())
    }

    /// Commit a batch on the authority's behalf, outside the per-tick queue.
    pub async fn apply_operations(
        &self,
        key: &ReplicantKey,
        operations: Vec<Operation>,
    ) -> Result<Revision, RegistryError> {
        let replicant = self
            .get(key)
            .await
            .ok_or_else(|| RegistryError::Undeclared(key.clone()))?;
        Ok(replicant.apply_operations(operations)?)
    }

    /// Answer one request. `JoinRoom`/`LeaveRoom` belong to the connection
    /// and are not handled here.
    pub async fn handle_message(&self, msg: &SyncMessage) -> Option<SyncMessage> {
        match self.respond(msg).await {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("Rejecting {:?} request {}: {e}", msg.msg_type, msg.request_id);
                SyncMessage::reject(AUTHORITY_ID, msg.request_id, e.to_string(), None).ok()
            }
        }
    }

    async fn respond(&self, msg: &SyncMessage) -> Result<Option<SyncMessage>, ProtocolError> {
        let reply = match msg.msg_type {
            MessageType::Declare => self.on_declare(msg).await?,
            MessageType::ProposeOperations => self.on_propose(msg).await?,
            MessageType::Read => {
                let key = msg.room_key()?;
                let body = match self.get(&key).await {
                    Some(replicant) => ReadBody {
                        value: replicant.value(),
                        revision: Some(replicant.revision()),
                    },
                    None => ReadBody {
                        value: None,
                        revision: None,
                    },
                };
                SyncMessage::ack(AUTHORITY_ID, msg.request_id, &body)?
            }
            MessageType::Ping => SyncMessage::pong(AUTHORITY_ID),
            MessageType::Pong => return Ok(None),
            other => {
                log::debug!("Unhandled message type: {other:?}");
                if msg.request_id == 0 {
                    return Ok(None);
                }
                SyncMessage::reject(AUTHORITY_ID, msg.request_id, format!("unexpected {other:?}"), None)?
            }
        };
        Ok(Some(reply))
    }

    async fn on_declare(&self, msg: &SyncMessage) -> Result<SyncMessage, ProtocolError> {
        let body = msg.declare_body()?;
        match self.declare(body.key.clone(), body.opts).await {
            Ok(replicant) => SyncMessage::ack(AUTHORITY_ID, msg.request_id, &replicant.snapshot()),
            Err(e) => {
                log::warn!("Declaration of {} rejected: {e}", body.key);
                SyncMessage::reject(AUTHORITY_ID, msg.request_id, e.to_string(), None)
            }
        }
    }

    /// A stale proposal is rejected so the proposer resets, but its
    /// operations are still committed against the current state.
    async fn on_propose(&self, msg: &SyncMessage) -> Result<SyncMessage, ProtocolError> {
        let body = msg.propose_body()?;
        let replicant = match self.declare(body.key.clone(), body.opts).await {
            Ok(replicant) => replicant,
            Err(e) => return SyncMessage::reject(AUTHORITY_ID, msg.request_id, e.to_string(), None),
        };

        let current = replicant.snapshot();
        let rejection = if current.schema_digest.is_some() && body.schema_digest != current.schema_digest {
            Some((SCHEMA_MISMATCH, current))
        } else if body.revision != current.revision {
            Some((
                REVISION_MISMATCH,
                AuthoritativeState {
                    schema: None,
                    schema_digest: None,
                    ..current
                },
            ))
        } else {
            None
        };

        let applied = if body.operations.is_empty() {
            Ok(replicant.revision())
        } else {
            replicant.apply_operations(body.operations)
        };

        match (rejection, applied) {
            (Some((reason, authoritative)), applied) => {
                self.proposals_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Proposal for {} at revision {} rejected: {reason}",
                    body.key,
                    body.revision
                );
                if let Err(e) = applied {
                    log::warn!("Operations of the rejected proposal for {} failed: {e}", body.key);
                }
                SyncMessage::reject(AUTHORITY_ID, msg.request_id, reason, Some(authoritative))
            }
            (None, Ok(_)) => Ok(SyncMessage::ack_empty(AUTHORITY_ID, msg.request_id)),
            (None, Err(e)) => {
                log::warn!("Proposal for {} failed to apply: {e}", body.key);
                SyncMessage::reject(AUTHORITY_ID, msg.request_id, e.to_string(), Some(replicant.snapshot()))
            }
        }
    }

    /// Flush every queued same-tick batch now. Returns how many replicants
    /// had one.
    pub async fn flush_all_pending(&self) -> usize {
        let replicants: Vec<Replicant> = self.replicants.read().await.values().cloned().collect();
        let mut flushed = 0;
        for replicant in replicants {
            if replicant.queued_operations() > 0 {
                replicant.flush_operations();
                flushed += 1;
            }
        }
        flushed
    }

    /// Flush queued batches, then every pending persistence write.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let flushed = self.flush_all_pending().await;
        let written = self.scheduler.flush_all().await?;
        log::info!("Registry shut down: flushed {flushed} batch(es), wrote {written} value(s)");
        Ok(())
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            declared: self.replicants.read().await.len(),
            batches_broadcast: self.batches_broadcast.load(Ordering::Relaxed),
            proposals_rejected: self.proposals_rejected.load(Ordering::Relaxed),
            persisted_writes: self.scheduler.persisted_writes(),
            failed_writes: self.scheduler.failed_writes(),
        }
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}
