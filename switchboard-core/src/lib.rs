//! # Switchboard Core
//!
//! Replicated values with operation-level change tracking.
//!
//! A *replicant* is one named, namespaced value held by an authority and
//! mirrored by any number of peers. Every in-place edit becomes an
//! [`Operation`]; operations are batched per tick and stamped with a
//! revision so peers can detect gaps and resync.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Replicant                       │
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────┐  │
//! │  │  ValueTree │◄──│   Proxy    │   │    Schema    │  │
//! │  │  (arena)   │   │  handles   │   │  validation  │  │
//! │  └─────┬──────┘   └────────────┘   └──────────────┘  │
//! │        │ operations, revision, listeners             │
//! └────────┼─────────────────────────────────────────────┘
//!          ▼
//!   switchboard-sync (wire protocol, registry, storage)
//! ```
//!
//! Nothing here does I/O beyond reading schema files; transports and
//! persistence live in `switchboard-sync`.

pub mod error;
pub mod events;
pub mod operation;
pub mod pointer;
pub mod proxy;
pub mod replicant;
pub mod schema;
pub mod tree;

pub use error::ReplicantError;
pub use events::{Change, EventKind, ListenerId, OperationBatch, Proposal, ReplicantEvent};
pub use operation::{ArrayMutator, MalformedOperation, Operation, OperationKind};
pub use pointer::PointerError;
pub use proxy::{Assigned, NodeHandle, Proxy};
pub use replicant::{
    AuthoritativeState, BatchOutcome, Replicant, ReplicantKey, ReplicantOptions, ReplicantStatus,
    Revision, Role, WeakReplicant,
};
pub use schema::{Schema, SchemaError, ValidationError, Violation};
pub use tree::{ContainerKind, NodeId, ValueTree};
