//! Replicant events and the listener registry.
//!
//! Listeners are plain callbacks invoked synchronously, in registration
//! order, after the replicant's lock has been released, so a listener may
//! read or write the replicant that notified it. Events reach listeners and
//! subscribers in the order their commits took the lock.

use std::sync::Arc;

use serde_json::Value;

use crate::operation::Operation;
use crate::replicant::{ReplicantKey, Revision};

/// A committed change: one per flushed batch, overwrite or resync.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub new_value: Option<Value>,
    pub old_value: Option<Value>,
    pub operations: Vec<Operation>,
}

/// A revisioned batch of operations, as broadcast by an authority.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationBatch {
    pub key: ReplicantKey,
    pub operations: Vec<Operation>,
    pub revision: Revision,
}

/// A peer's outgoing batch, stamped with what the peer believes.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub key: ReplicantKey,
    pub operations: Vec<Operation>,
    pub revision: Revision,
    pub schema_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicantEvent {
    Change(Change),
    Declared { value: Option<Value>, revision: Revision },
    DeclarationRejected { reason: String },
    OperationsRejected { reason: String },
    /// A full resync is about to replace the local value.
    FullUpdate { value: Option<Value> },
    /// Authority side: a batch ready to be broadcast.
    Operations(OperationBatch),
    /// Peer side: a batch ready to be proposed.
    Proposal(Proposal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Change,
    Declared,
    DeclarationRejected,
    OperationsRejected,
    FullUpdate,
    Operations,
    Proposal,
}

impl ReplicantEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ReplicantEvent::Change(_) => EventKind::Change,
            ReplicantEvent::Declared { .. } => EventKind::Declared,
            ReplicantEvent::DeclarationRejected { .. } => EventKind::DeclarationRejected,
            ReplicantEvent::OperationsRejected { .. } => EventKind::OperationsRejected,
            ReplicantEvent::FullUpdate { .. } => EventKind::FullUpdate,
            ReplicantEvent::Operations(_) => EventKind::Operations,
            ReplicantEvent::Proposal(_) => EventKind::Proposal,
        }
    }
}

pub type Listener = Arc<dyn Fn(&ReplicantEvent) + Send + Sync>;

/// Returned by registration; pass to `off` to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registered {
    id: ListenerId,
    kind: EventKind,
    once: bool,
    callback: Listener,
}

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    entries: Vec<Registered>,
}

impl Listeners {
    pub(crate) fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }

    pub(crate) fn insert(&mut self, id: ListenerId, kind: EventKind, once: bool, callback: Listener) {
        self.entries.push(Registered {
            id,
            kind,
            once,
            callback,
        });
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub(crate) fn count(&self, kind: EventKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    /// Snapshot the callbacks for `kind`, dropping one-shot registrations.
    pub(crate) fn take_matching(&mut self, kind: EventKind) -> Vec<Listener> {
        let matching = self
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| Arc::clone(&e.callback))
            .collect();
        self.entries.retain(|e| !(e.kind == kind && e.once));
        matching
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("registered", &self.entries.len())
            .finish()
    }
}
