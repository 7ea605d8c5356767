//! WebSocket authority server with per-replicant rooms.
//!
//! Architecture:
//! ```text
//! Peer A ──┐                      ┌── Registry ── Replicant (authority)
//!           ├── connection task ──┤                   │ on_operations
//! Peer B ──┘   (one per socket)   │                   ▼
//!                                 └── RoomManager ── BroadcastGroup
//!                                                     │
//!                                       ┌─────────────┼─────────────┐
//!                                       ▼             ▼             ▼
//!                                    Peer A        Peer B        Peer C
//! ```
//!
//! Every connection is reduced to a pair of byte channels, so the same
//! request loop serves WebSocket clients and in-process
//! [`LocalConnection`]s. Requests on one connection are answered in order;
//! room broadcasts are forwarded by one task per joined room.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use switchboard_core::ReplicantKey;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::RoomManager;
use crate::protocol::{MessageType, SyncMessage, AUTHORITY_ID};
use crate::registry::{Registry, RegistryStats};
use crate::storage::{MemoryStore, PersistenceAdapter, ReplicantStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds (0 disables)
    pub heartbeat_interval_secs: u64,
    /// RocksDB path (None = nothing survives a restart)
    pub storage_path: Option<PathBuf>,
    /// Directory searched for `<namespace>/schemas/<name>.json`
    pub schema_root: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            schema_root: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub registry: RegistryStats,
}

/// In-process connection to a [`SyncServer`]. Carries encoded
/// [`SyncMessage`]s, exactly like a WebSocket would.
pub struct LocalConnection {
    pub outgoing: mpsc::UnboundedSender<Vec<u8>>,
    pub incoming: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// The authority server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB at `storage_path` if configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let adapter: Arc<dyn PersistenceAdapter> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(ReplicantStore::open(store_config)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Self::with_adapter(config, adapter)
    }

    /// Create a server over any persistence adapter.
    pub fn with_adapter(config: ServerConfig, adapter: Arc<dyn PersistenceAdapter>) -> Result<Self, StoreError> {
        let room_manager = Arc::new(RoomManager::new(config.broadcast_capacity));
        let registry = Registry::new(adapter, room_manager.clone(), config.schema_root.clone())?;
        Ok(Self {
            config,
            registry: Arc::new(registry),
            room_manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Default configuration, in memory.
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        let room_manager = Arc::new(RoomManager::new(config.broadcast_capacity));
        let registry = Registry::in_memory(room_manager.clone(), None);
        Self {
            config,
            registry: Arc::new(registry),
            room_manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Switchboard listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept WebSocket connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_websocket(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Open an in-process connection.
    pub fn connect_local(&self) -> LocalConnection {
        let (to_server, from_peer) = mpsc::unbounded_channel();
        let (to_peer, from_server) = mpsc::unbounded_channel();
        let server = self.clone();
        tokio::spawn(async move {
            server.serve_connection("local".to_string(), from_peer, to_peer).await;
        });
        LocalConnection {
            outgoing: to_server,
            incoming: from_server,
        }
    }

    /// Bridge one WebSocket to the request loop.
    async fn handle_websocket(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let server = self.clone();
        let requests = tokio::spawn(async move {
            server.serve_connection(addr.to_string(), in_rx, out_tx).await;
        });

        let mut heartbeat = (self.config.heartbeat_interval_secs > 0)
            .then(|| tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_secs)));

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            if in_tx.send(bytes).is_err() {
                                break Ok(());
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        _ => {}
                    }
                }

                out = out_rx.recv() => {
                    match out {
                        Some(bytes) => {
                            if let Err(e) = ws_sender.send(Message::Binary(bytes.into())).await {
                                break Err(e.into());
                            }
                        }
                        None => break Ok(()),
                    }
                }

                _ = async {
                    match heartbeat.as_mut() {
                        Some(interval) => interval.tick().await,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        // Closing the request channel ends the loop and its cleanup.
        drop(in_tx);
        let _ = requests.await;
        result
    }

    /// Answer requests from `incoming` until it closes, then leave every
    /// joined room.
    async fn serve_connection(
        &self,
        label: String,
        mut incoming: mpsc::UnboundedReceiver<Vec<u8>>,
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut joined: HashMap<ReplicantKey, (Uuid, JoinHandle<()>)> = HashMap::new();

        while let Some(bytes) = incoming.recv().await {
            {
                let mut s = self.stats.write().await;
                s.total_messages += 1;
                s.total_bytes += bytes.len() as u64;
            }

            let msg = match SyncMessage::decode(&bytes) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("Failed to decode message from {label}: {e}");
                    continue;
                }
            };

            let reply = match msg.msg_type {
                MessageType::JoinRoom => Some(self.join_room(&msg, &outgoing, &mut joined).await),
                MessageType::LeaveRoom => Some(self.leave_room(&msg, &mut joined).await),
                _ => self.registry.handle_message(&msg).await,
            };

            if let Some(reply) = reply {
                let encoded = match reply.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::error!("Failed to encode reply for {label}: {e}");
                        continue;
                    }
                };
                if outgoing.send(encoded).is_err() {
                    break;
                }
            }
        }

        for (key, (peer_id, forwarder)) in joined.drain() {
            forwarder.abort();
            self.release_room(&key, &peer_id).await;
        }

        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        log::debug!("Connection {label} finished");
    }

    async fn join_room(
        &self,
        msg: &SyncMessage,
        outgoing: &mpsc::UnboundedSender<Vec<u8>>,
        joined: &mut HashMap<ReplicantKey, (Uuid, JoinHandle<()>)>,
    ) -> SyncMessage {
        let key = match msg.room_key() {
            Ok(key) => key,
            Err(e) => return reject(msg.request_id, e.to_string()),
        };
        if joined.contains_key(&key) {
            return SyncMessage::ack_empty(AUTHORITY_ID, msg.request_id);
        }

        let room = self.room_manager.get_or_create(&key).await;
        let mut rx = room.add_peer(msg.peer_id).await;
        let outgoing = outgoing.clone();
        let peer_id = msg.peer_id;
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(data) => {
                        if outgoing.send(data.to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        // The peer sees the revision gap and resyncs.
                        log::warn!("Peer {peer_id} lagged by {n} messages");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        log::info!("Peer {peer_id} joined {key}");
        joined.insert(key, (peer_id, forwarder));

        self.stats.write().await.active_rooms = self.room_manager.room_count().await;
        SyncMessage::ack_empty(AUTHORITY_ID, msg.request_id)
    }

    async fn leave_room(
        &self,
        msg: &SyncMessage,
        joined: &mut HashMap<ReplicantKey, (Uuid, JoinHandle<()>)>,
    ) -> SyncMessage {
        let key = match msg.room_key() {
            Ok(key) => key,
            Err(e) => return reject(msg.request_id, e.to_string()),
        };
        if let Some((peer_id, forwarder)) = joined.remove(&key) {
            forwarder.abort();
            self.release_room(&key, &peer_id).await;
            log::info!("Peer {peer_id} left {key}");
        }
        SyncMessage::ack_empty(AUTHORITY_ID, msg.request_id)
    }

    async fn release_room(&self, key: &ReplicantKey, peer_id: &Uuid) {
        if let Some(room) = self.room_manager.get(key).await {
            room.remove_peer(peer_id).await;
        }
        if !self.registry.contains(key).await && self.room_manager.remove_if_empty(key).await {
            log::debug!("Room {key} removed (empty)");
        }
        self.stats.write().await.active_rooms = self.room_manager.room_count().await;
    }

    /// Flush queued batches and pending writes.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        log::info!("Switchboard shutting down");
        self.registry.shutdown().await
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.room_manager.room_count().await;
        stats.registry = self.registry.stats().await;
        stats
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

fn reject(request_id: u64, reason: String) -> SyncMessage {
    SyncMessage::reject(AUTHORITY_ID, request_id, reason, None).unwrap_or(SyncMessage {
        msg_type: MessageType::Reject,
        peer_id: AUTHORITY_ID,
        request_id,
        payload: Vec::new(),
    })
}
