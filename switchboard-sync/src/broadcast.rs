//! Per-replicant rooms: fan-out of operation batches to subscribed peers.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! connection that joined a room gets an independent receiver buffering up
//! to `capacity` encoded messages; a receiver that falls further behind
//! lags and is told how many messages it missed.
//!
//! Batches are echoed to every member, the proposing peer included: peers
//! only change their local value when the authority's batch comes back.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use switchboard_core::ReplicantKey;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_undelivered: u64,
    pub active_peers: usize,
}

/// One room per replicant.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    messages_sent: AtomicU64,
    /// Sends that found no receiver at all
    messages_undelivered: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_undelivered: AtomicU64::new(0),
        }
    }

    /// Add a peer; returns the receiver its connection forwards from.
    pub async fn add_peer(&self, peer_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.peers.write().await.insert(peer_id);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode once and send to every member. Lock-free, so it can be called
    /// from a synchronous replicant listener.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(Arc::new(msg.encode()?)))
    }

    /// Broadcast pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(encoded) {
            Ok(count) => count,
            Err(_) => {
                self.messages_undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_undelivered: self.messages_undelivered.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver that is not tracked as a peer.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

/// Maps replicant keys to their rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<ReplicantKey, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, key: &ReplicantKey) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(key) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock
        if let Some(room) = rooms.get(key) {
            return room.clone();
        }
        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(key.clone(), room.clone());
        room
    }

    pub async fn get(&self, key: &ReplicantKey) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(key).cloned()
    }

    /// Remove a room nobody is in. Rooms backing a declared replicant must
    /// not be removed: its broadcast hook holds the group.
    pub async fn remove_if_empty(&self, key: &ReplicantKey) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(key) {
            if room.peer_count().await == 0 {
                rooms.remove(key);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<ReplicantKey> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
