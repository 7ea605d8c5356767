//! # switchboard-sync: transport, registry and persistence for replicants
//!
//! Connects authority and peer [`switchboard_core::Replicant`]s over
//! WebSocket (or in-process channels) and keeps authority values on disk.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient   │ ◄────────────────► │ SyncServer   │
//! │ (per peer)   │    Binary Proto    │ (authority)  │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ Replicant    │                    │ Registry     │
//! │ (peer role)  │                    │ (authority)  │
//! └──────────────┘                    └──┬────────┬──┘
//!                                        │        │
//!                              ┌─────────┴──┐  ┌──┴───────────────────┐
//!                              │ RoomManager│  │ PersistenceScheduler │
//!                              │ (fan-out)  │  │ → RocksDB / memory   │
//!                              └────────────┘  └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary envelope (bincode) with JSON bodies
//! - [`broadcast`]: Per-replicant rooms
//! - [`registry`]: Declared authority replicants and request handling
//! - [`server`]: WebSocket and in-process authority server
//! - [`client`]: Peer connection with resync and reconnect
//! - [`peer`]: Peer replicant handle
//! - [`storage`]: Persistence adapters and throttled writes

pub mod broadcast;
pub mod client;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use client::{ClientConfig, ConnectionState, SyncClient};
pub use peer::PeerReplicant;
pub use protocol::{
    DeclareBody, MessageType, OperationsBody, ProposeBody, ProtocolError, ReadBody, RejectBody,
    RoomBody, SyncMessage, AUTHORITY_ID,
};
pub use registry::{Registry, RegistryError, RegistryStats, REVISION_MISMATCH, SCHEMA_MISMATCH};
pub use server::{LocalConnection, ServerConfig, ServerStats, SyncServer};
pub use storage::{
    MemoryStore, PersistedRecord, PersistenceAdapter, PersistenceScheduler, ReplicantMetadata,
    ReplicantStore, StoreConfig, StoreError,
};
