//! Peer-side connection to a switchboard authority.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, automatic reconnect)
//! - Declaration handshake and proposal routing for peer replicants
//! - Revision-checked application of authority batches, with full resync
//!   on any gap
//! - Heartbeat pings and per-request timeouts
//!
//! One client multiplexes any number of replicants over a single
//! connection, WebSocket or in-process.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use switchboard_core::{
    AuthoritativeState, BatchOutcome, OperationBatch, Proposal, Replicant, ReplicantKey,
    ReplicantOptions, ReplicantStatus, Revision,
};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageType, ProtocolError, ReadBody, SyncMessage};
use crate::server::SyncServer;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the authority
    pub url: String,
    /// How long to wait for an `Ack`/`Reject`
    pub request_timeout: Duration,
    /// Delay between reconnect attempts (None = stay disconnected)
    pub reconnect_delay: Option<Duration>,
    /// Protocol ping interval (None = no heartbeat)
    pub heartbeat_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            request_timeout: Duration::from_secs(10),
            reconnect_delay: Some(Duration::from_secs(1)),
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Short timeouts and a fast reconnect.
    pub fn for_testing(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(2),
            reconnect_delay: Some(Duration::from_millis(50)),
            heartbeat_interval: None,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone)]
enum Transport {
    WebSocket(String),
    Local(SyncServer),
}

/// What to do with the answer to an outstanding request.
enum Pending {
    Declare {
        key: ReplicantKey,
        done: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Propose {
        key: ReplicantKey,
    },
    /// Automatic resync; `revision` is the batch that triggered it.
    Resync {
        key: ReplicantKey,
        revision: Option<Revision>,
    },
    Reply(oneshot::Sender<SyncMessage>),
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct ClientInner {
    peer_id: Uuid,
    config: ClientConfig,
    transport: Transport,
    state: RwLock<ConnectionState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_request: AtomicU64,
    replicants: Mutex<HashMap<ReplicantKey, Replicant>>,
    /// Keys to redeclare after a reconnect
    declared: Mutex<HashSet<ReplicantKey>>,
    /// Bumped per connection; tasks of an older one stand down
    generation: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Connection to an authority, shared by every peer replicant created
/// through it. Cheap to clone.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Connect over WebSocket to `config.url`.
    pub async fn connect(config: ClientConfig) -> Result<Self, ProtocolError> {
        let transport = Transport::WebSocket(config.url.clone());
        Self::start(config, transport).await
    }

    /// Connect in-process to a server running on the same runtime.
    pub async fn connect_local(server: &SyncServer, config: ClientConfig) -> Result<Self, ProtocolError> {
        Self::start(config, Transport::Local(server.clone())).await
    }

    async fn start(config: ClientConfig, transport: Transport) -> Result<Self, ProtocolError> {
        let inner = Arc::new(ClientInner {
            peer_id: Uuid::new_v4(),
            config,
            transport,
            state: RwLock::new(ConnectionState::Disconnected),
            outgoing: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            replicants: Mutex::new(HashMap::new()),
            declared: Mutex::new(HashSet::new()),
            generation: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        establish(&inner).await?;
        Ok(Self { inner })
    }

    pub fn peer_id(&self) -> Uuid {
        self.inner.peer_id
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// Get the peer replicant for `key`, creating it on first use. Its
    /// proposals are sent through this client.
    pub fn replicant(&self, key: ReplicantKey, options: ReplicantOptions) -> Replicant {
        let mut replicants = lock(&self.inner.replicants);
        if let Some(existing) = replicants.get(&key) {
            return existing.clone();
        }
        let replicant = Replicant::peer(key.clone(), options);
        let weak = Arc::downgrade(&self.inner);
        replicant.on_proposal(move |proposal| {
            if let Some(inner) = weak.upgrade() {
                inner.send_proposal(proposal);
            }
        });
        replicants.insert(key, replicant.clone());
        replicant
    }

    /// Join the replicant's room and run the declaration handshake.
    ///
    /// Returns once the authority has answered. A rejection is an error
    /// unless the replicant has a `DeclarationRejected` listener.
    pub async fn declare(&self, replicant: &Replicant) -> Result<(), ProtocolError> {
        declare(&self.inner, replicant).await
    }

    /// Read the authority's current value out of band.
    pub async fn read(&self, key: &ReplicantKey) -> Result<ReadBody, ProtocolError> {
        let peer_id = self.inner.peer_id;
        let reply = self
            .inner
            .request(|id| SyncMessage::read(peer_id, id, key))
            .await?;
        reply.ack_body()
    }

    /// Replace the replicant's value with the authority's.
    pub async fn resync(&self, replicant: &Replicant) -> Result<(), ProtocolError> {
        let read = self.read(replicant.key()).await?;
        replicant.apply_full_update(read.value, read.revision);
        Ok(())
    }

    /// Stop receiving batches for `key` and forget its replicant.
    pub async fn leave(&self, key: &ReplicantKey) -> Result<(), ProtocolError> {
        lock(&self.inner.declared).remove(key);
        if let Some(replicant) = lock(&self.inner.replicants).remove(key) {
            replicant.handle_disconnect();
        }
        let peer_id = self.inner.peer_id;
        self.inner
            .request(|id| SyncMessage::leave_room(peer_id, id, key))
            .await?;
        Ok(())
    }

    /// Close the connection for good. Replicants fall back to undeclared.
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.outgoing).take();
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        self.inner.fail_pending();
        self.inner.disconnect_replicants();
        *self.inner.state.write().await = ConnectionState::Disconnected;
        log::info!("Peer {} disconnected", self.inner.peer_id);
    }

    /// Drop the transport without closing the client, as a network
    /// failure would.
    #[cfg(test)]
    fn sever(&self) {
        lock(&self.inner.outgoing).take();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClientInner {
    fn next_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let bytes = msg.encode()?;
        match lock(&self.outgoing).as_ref() {
            Some(tx) => tx.send(bytes).map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Send a request and wait for its `Ack`. A `Reject` becomes
    /// [`ProtocolError::Rejected`].
    async fn request(
        &self,
        build: impl FnOnce(u64) -> Result<SyncMessage, ProtocolError>,
    ) -> Result<SyncMessage, ProtocolError> {
        let id = self.next_id();
        let msg = build(id)?;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, Pending::Reply(tx));
        if let Err(e) = self.send(&msg) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                return Err(ProtocolError::Timeout);
            }
        };
        if reply.msg_type == MessageType::Reject {
            let reason = reply
                .reject_body()
                .map(|b| b.reason)
                .unwrap_or_else(|e| e.to_string());
            return Err(ProtocolError::Rejected(reason));
        }
        Ok(reply)
    }

    fn send_proposal(&self, proposal: &Proposal) {
        let Some(replicant) = self.replicant(&proposal.key) else {
            return;
        };
        let id = self.next_id();
        let msg = match SyncMessage::propose(self.peer_id, id, proposal, &replicant.options()) {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("Failed to encode proposal for {}: {e}", proposal.key);
                return;
            }
        };
        lock(&self.pending).insert(
            id,
            Pending::Propose {
                key: proposal.key.clone(),
            },
        );
        if let Err(e) = self.send(&msg) {
            lock(&self.pending).remove(&id);
            log::warn!("Dropping proposal for {}: {e}", proposal.key);
        }
    }

    fn request_resync(&self, key: &ReplicantKey, revision: Option<Revision>) {
        let id = self.next_id();
        let msg = match SyncMessage::read(self.peer_id, id, key) {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("Failed to encode resync for {key}: {e}");
                return;
            }
        };
        lock(&self.pending).insert(
            id,
            Pending::Resync {
                key: key.clone(),
                revision,
            },
        );
        if let Err(e) = self.send(&msg) {
            lock(&self.pending).remove(&id);
            log::warn!("Cannot resync {key}: {e}");
        }
    }

    fn replicant(&self, key: &ReplicantKey) -> Option<Replicant> {
        lock(&self.replicants).get(key).cloned()
    }

    fn handle_incoming(&self, msg: SyncMessage) {
        match msg.msg_type {
            MessageType::Operations => match msg.operations_body() {
                Ok(body) => self.handle_batch(body.into()),
                Err(e) => log::warn!("Malformed operations message: {e}"),
            },
            MessageType::Ack | MessageType::Reject => {
                let pending = lock(&self.pending).remove(&msg.request_id);
                match pending {
                    Some(pending) => self.handle_reply(pending, msg),
                    None => log::debug!("Reply to unknown request {}", msg.request_id),
                }
            }
            MessageType::Ping => {
                let _ = self.send(&SyncMessage::pong(self.peer_id));
            }
            MessageType::Pong => log::trace!("Pong from authority"),
            other => log::debug!("Unhandled message type: {other:?}"),
        }
    }

    fn handle_batch(&self, batch: OperationBatch) {
        let Some(replicant) = self.replicant(&batch.key) else {
            return;
        };
        // Already folded into the declaration snapshot or a resync.
        if replicant.status() == ReplicantStatus::Declared && batch.revision <= replicant.revision() {
            log::trace!("Skipping stale revision {} of {}", batch.revision, batch.key);
            return;
        }
        if let BatchOutcome::ResyncNeeded(revision) = replicant.handle_operations(&batch) {
            log::debug!("Resyncing {} after revision {revision}", batch.key);
            self.request_resync(&batch.key, Some(revision));
        }
    }

    fn handle_reply(&self, pending: Pending, msg: SyncMessage) {
        let rejected = msg.msg_type == MessageType::Reject;
        match pending {
            Pending::Reply(tx) => {
                let _ = tx.send(msg);
            }
            Pending::Declare { key, done } => {
                let result = match self.replicant(&key) {
                    None => Err(ProtocolError::ConnectionClosed),
                    Some(replicant) if rejected => {
                        let reason = msg.reject_body().map(|b| b.reason).unwrap_or_else(|e| e.to_string());
                        replicant
                            .reject_declare(reason.clone())
                            .map_err(|_| ProtocolError::Rejected(reason))
                    }
                    Some(replicant) => msg
                        .ack_body::<AuthoritativeState>()
                        .and_then(|state| replicant.complete_declare(state).map_err(ProtocolError::from))
                        .map(|gap| {
                            if let Some(revision) = gap {
                                self.request_resync(&key, Some(revision));
                            }
                        }),
                };
                let _ = done.send(result);
            }
            Pending::Propose { key } if rejected => {
                let Some(replicant) = self.replicant(&key) else {
                    return;
                };
                let body = match msg.reject_body() {
                    Ok(body) => body,
                    Err(e) => {
                        log::warn!("Malformed rejection for {key}: {e}");
                        return;
                    }
                };
                match body.authoritative {
                    Some(authoritative) => {
                        let stale = authoritative.revision < replicant.revision();
                        if let Err(e) = replicant.reject_operations(body.reason, authoritative) {
                            log::warn!("Failed to reset {key}: {e}");
                        }
                        if stale {
                            self.request_resync(&key, None);
                        }
                    }
                    None => {
                        log::warn!("Proposal for {key} rejected: {}", body.reason);
                        self.request_resync(&key, None);
                    }
                }
            }
            Pending::Propose { .. } => {}
            Pending::Resync { key, revision } => {
                let Some(replicant) = self.replicant(&key) else {
                    return;
                };
                if rejected {
                    log::warn!("Resync of {key} refused");
                    return;
                }
                match msg.ack_body::<ReadBody>() {
                    Ok(read) => replicant.apply_full_update(read.value, read.revision.or(revision)),
                    Err(e) => log::warn!("Malformed resync reply for {key}: {e}"),
                }
            }
        }
    }

    fn fail_pending(&self) {
        let pending: Vec<Pending> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for p in pending {
            if let Pending::Declare { done, .. } = p {
                let _ = done.send(Err(ProtocolError::ConnectionClosed));
            }
        }
    }

    fn disconnect_replicants(&self) {
        let replicants: Vec<Replicant> = lock(&self.replicants).values().cloned().collect();
        for replicant in replicants {
            replicant.handle_disconnect();
        }
    }
}

async fn declare(inner: &Arc<ClientInner>, replicant: &Replicant) -> Result<(), ProtocolError> {
    let key = replicant.key().clone();
    let peer_id = inner.peer_id;
    inner
        .request(|id| SyncMessage::join_room(peer_id, id, &key))
        .await?;

    let Some(opts) = replicant.begin_declare() else {
        return Ok(());
    };
    let id = inner.next_id();
    let msg = match SyncMessage::declare(peer_id, id, &key, &opts) {
        Ok(msg) => msg,
        Err(e) => {
            replicant.handle_disconnect();
            return Err(e);
        }
    };
    let (done, rx) = oneshot::channel();
    lock(&inner.pending).insert(id, Pending::Declare { key: key.clone(), done });
    if let Err(e) = inner.send(&msg) {
        lock(&inner.pending).remove(&id);
        replicant.handle_disconnect();
        return Err(e);
    }

    let result = match tokio::time::timeout(inner.config.request_timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
        Err(_) => {
            lock(&inner.pending).remove(&id);
            replicant.handle_disconnect();
            Err(ProtocolError::Timeout)
        }
    };
    if result.is_ok() && replicant.status() == ReplicantStatus::Declared {
        lock(&inner.declared).insert(key.clone());
        log::debug!("Declared {key} at revision {}", replicant.revision());
    }
    result
}

/// Open the transport and start the connection's tasks.
async fn establish(inner: &Arc<ClientInner>) -> Result<(), ProtocolError> {
    *inner.state.write().await = ConnectionState::Connecting;

    let (outgoing, incoming, mut tasks) = match open_transport(&inner.transport).await {
        Ok(parts) => parts,
        Err(e) => {
            *inner.state.write().await = ConnectionState::Disconnected;
            return Err(e);
        }
    };

    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    *lock(&inner.outgoing) = Some(outgoing);
    tasks.push(tokio::spawn(run_incoming(Arc::downgrade(inner), incoming, generation)));
    if let Some(period) = inner.config.heartbeat_interval {
        tasks.push(tokio::spawn(run_heartbeat(Arc::downgrade(inner), period, generation)));
    }
    {
        let mut all = lock(&inner.tasks);
        all.retain(|t| !t.is_finished());
        all.extend(tasks);
    }

    *inner.state.write().await = ConnectionState::Connected;
    log::info!("Peer {} connected", inner.peer_id);
    Ok(())
}

type TransportParts = (
    mpsc::UnboundedSender<Vec<u8>>,
    mpsc::UnboundedReceiver<Vec<u8>>,
    Vec<JoinHandle<()>>,
);

async fn open_transport(transport: &Transport) -> Result<TransportParts, ProtocolError> {
    match transport {
        Transport::Local(server) => {
            let conn = server.connect_local();
            Ok((conn.outgoing, conn.incoming, Vec::new()))
        }
        Transport::WebSocket(url) => {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let writer = tokio::spawn(async move {
                while let Some(bytes) = out_rx.recv().await {
                    if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            let (in_tx, in_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let reader = tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            if in_tx.send(data.into()).is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Err(e) => {
                            log::warn!("WebSocket error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }
            });
            Ok((out_tx, in_rx, vec![writer, reader]))
        }
    }
}

async fn run_incoming(
    weak: Weak<ClientInner>,
    mut incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    generation: u64,
) {
    while let Some(bytes) = incoming.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match SyncMessage::decode(&bytes) {
            Ok(msg) => inner.handle_incoming(msg),
            Err(e) => log::warn!("Failed to decode message from authority: {e}"),
        }
    }
    if let Some(inner) = weak.upgrade() {
        connection_lost(inner, generation).await;
    }
}

async fn run_heartbeat(weak: Weak<ClientInner>, period: Duration, generation: u64) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        interval.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if inner.send(&SyncMessage::ping(inner.peer_id)).is_err() {
            return;
        }
    }
}

async fn connection_lost(inner: Arc<ClientInner>, generation: u64) {
    if inner.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    log::warn!("Peer {} lost its connection", inner.peer_id);
    lock(&inner.outgoing).take();
    inner.fail_pending();
    inner.disconnect_replicants();

    match inner.config.reconnect_delay {
        Some(delay) if !inner.closed.load(Ordering::SeqCst) => {
            *inner.state.write().await = ConnectionState::Reconnecting;
            tokio::spawn(reconnect(Arc::downgrade(&inner), delay));
        }
        _ => *inner.state.write().await = ConnectionState::Disconnected,
    }
}

/// Retry until connected, then redeclare every replicant that was declared.
fn reconnect(weak: Weak<ClientInner>, delay: Duration) -> BoxFuture {
    Box::pin(async move {
        loop {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            match establish(&inner).await {
                Ok(()) => {
                    let keys: Vec<ReplicantKey> = lock(&inner.declared).iter().cloned().collect();
                    for key in keys {
                        let Some(replicant) = inner.replicant(&key) else {
                            continue;
                        };
                        if let Err(e) = declare(&inner, &replicant).await {
                            log::warn!("Failed to redeclare {key}: {e}");
                        }
                    }
                    return;
                }
                Err(e) => {
                    *inner.state.write().await = ConnectionState::Reconnecting;
                    log::debug!("Reconnect attempt failed: {e}");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OperationsBody;
    use crate::registry::REVISION_MISMATCH;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use switchboard_core::Operation;

    fn key() -> ReplicantKey {
        ReplicantKey::new("scores", "game")
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn setup(default: Value) -> (SyncServer, Replicant, SyncClient) {
        let server = SyncServer::with_defaults();
        let authority = server
            .registry()
            .declare(key(), ReplicantOptions::default().with_default(default))
            .await
            .unwrap();
        let client = SyncClient::connect_local(&server, ClientConfig::for_testing("local"))
            .await
            .unwrap();
        (server, authority, client)
    }

    #[tokio::test]
    async fn test_declare_adopts_authoritative_value() {
        let (_server, authority, client) = setup(json!({"home": 0})).await;
        authority.root().unwrap().set("home", 3).unwrap();
        authority.flush_operations();

        let peer = client.replicant(key(), ReplicantOptions::default());
        client.declare(&peer).await.unwrap();
        assert_eq!(peer.status(), ReplicantStatus::Declared);
        assert_eq!(peer.value(), Some(json!({"home": 3})));
        assert_eq!(peer.revision(), 1);
        assert_eq!(client.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_peer_write_round_trips_through_authority() {
        let (_server, authority, client) = setup(json!({"home": 0})).await;
        let peer = client.replicant(key(), ReplicantOptions::default());
        client.declare(&peer).await.unwrap();

        peer.root().unwrap().set("home", 4).unwrap();
        assert_eq!(peer.value(), Some(json!({"home": 0})), "applied only on echo");

        eventually(|| peer.revision() == 1).await;
        assert_eq!(authority.value(), Some(json!({"home": 4})));
        assert_eq!(peer.value(), Some(json!({"home": 4})));
    }

    #[tokio::test]
    async fn test_authority_batches_reach_declared_peer() {
        let (_server, authority, client) = setup(json!([])).await;
        let peer = client.replicant(key(), ReplicantOptions::default());
        client.declare(&peer).await.unwrap();

        authority.root().unwrap().push(json!("a")).unwrap();
        authority.flush_operations();
        authority.root().unwrap().push(json!("b")).unwrap();
        authority.flush_operations();

        eventually(|| peer.revision() == 2).await;
        assert_eq!(peer.value(), Some(json!(["a", "b"])));
    }

    #[tokio::test]
    async fn test_stale_proposal_resets_peer() {
        let (_server, authority, client) = setup(json!({"home": 0})).await;
        let peer = client.replicant(key(), ReplicantOptions::default());
        let rejected = Arc::new(Mutex::new(Vec::new()));
        let seen = rejected.clone();
        peer.on_operations_rejected(move |reason| lock(&seen).push(reason.to_string()));
        client.declare(&peer).await.unwrap();

        authority.apply_operations(vec![Operation::update("/", "home", json!(1))]).unwrap();
        authority.apply_operations(vec![Operation::update("/", "home", json!(2))]).unwrap();
        peer.root().unwrap().set("away", 9).unwrap();
        peer.flush_operations();

        eventually(|| !lock(&rejected).is_empty()).await;
        assert_eq!(lock(&rejected).as_slice(), [REVISION_MISMATCH.to_string()]);
        eventually(|| peer.revision() == 3).await;
        assert_eq!(peer.value(), authority.value());
        assert_eq!(authority.value(), Some(json!({"home": 2, "away": 9})));
    }

    #[tokio::test]
    async fn test_revision_gap_triggers_resync() {
        let (_server, authority, client) = setup(json!({"home": 0})).await;
        let peer = client.replicant(key(), ReplicantOptions::default());
        client.declare(&peer).await.unwrap();

        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        peer.on_full_update(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        authority.set_value(json!({"home": 7})).unwrap();
        authority.flush_operations();
        eventually(|| peer.revision() == 1).await;
        let gap = OperationsBody {
            key: key(),
            operations: vec![Operation::update("/", "home", json!(8))],
            revision: 5,
        };
        // Revision 5 does not follow 1.
        let msg = SyncMessage::operations(Uuid::nil(), &gap.into()).unwrap();
        client.inner.handle_incoming(msg);

        eventually(|| updates.load(Ordering::SeqCst) == 1).await;
        assert_eq!(peer.value(), Some(json!({"home": 7})));
        assert_eq!(peer.revision(), 1);
    }

    /// Drive a declaration by hand so a broadcast can arrive before its ack.
    fn start_declare(client: &SyncClient, peer: &Replicant, id: u64) -> oneshot::Receiver<Result<(), ProtocolError>> {
        let (done, rx) = oneshot::channel();
        peer.begin_declare().unwrap();
        lock(&client.inner.pending).insert(id, Pending::Declare { key: key(), done });
        rx
    }

    fn broadcast(client: &SyncClient, home: i64, revision: Revision) {
        let batch = OperationsBody {
            key: key(),
            operations: vec![Operation::update("/", "home", json!(home))],
            revision,
        };
        let msg = SyncMessage::operations(Uuid::nil(), &batch.into()).unwrap();
        client.inner.handle_incoming(msg);
    }

    fn answer(client: &SyncClient, id: u64, home: i64, revision: Revision) {
        let ack = AuthoritativeState {
            value: Some(json!({"home": home})),
            revision,
            ..Default::default()
        };
        client.inner.handle_incoming(SyncMessage::ack(Uuid::nil(), id, &ack).unwrap());
    }

    #[tokio::test]
    async fn test_commit_between_snapshot_and_ack_is_kept() {
        let (_server, _authority, client) = setup(json!({"home": 0})).await;
        let peer = client.replicant(key(), ReplicantOptions::default());
        let rx = start_declare(&client, &peer, 9_000);

        broadcast(&client, 4, 2);
        answer(&client, 9_000, 3, 1);

        rx.await.unwrap().unwrap();
        assert_eq!(peer.status(), ReplicantStatus::Declared);
        assert_eq!(peer.revision(), 2);
        assert_eq!(peer.value(), Some(json!({"home": 4})));
    }

    #[tokio::test]
    async fn test_gap_behind_the_ack_resyncs() {
        let (_server, authority, client) = setup(json!({"home": 0})).await;
        authority.set_value(json!({"home": 7})).unwrap();
        authority.flush_operations();

        let peer = client.replicant(key(), ReplicantOptions::default());
        let rx = start_declare(&client, &peer, 9_001);
        broadcast(&client, 8, 5);
        answer(&client, 9_001, 0, 0);
        rx.await.unwrap().unwrap();

        eventually(|| peer.revision() == 1).await;
        assert_eq!(peer.value(), Some(json!({"home": 7})));
    }

    #[tokio::test]
    async fn test_declaration_rejection() {
        let (_server, _authority, client) = setup(json!(null)).await;
        let opts = ReplicantOptions::default().with_schema_path("/nonexistent/schema.json");
        let other = ReplicantKey::new("scores", "missing");

        let peer = client.replicant(other.clone(), opts.clone());
        let result = client.declare(&peer).await;
        assert!(matches!(result, Err(ProtocolError::Rejected(_))));
        assert_eq!(peer.status(), ReplicantStatus::Undeclared);

        let reasons = Arc::new(AtomicUsize::new(0));
        let counter = reasons.clone();
        peer.on_declaration_rejected(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        client.declare(&peer).await.unwrap();
        assert_eq!(reasons.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_returns_value_and_revision() {
        let (_server, authority, client) = setup(json!(1)).await;
        authority.set_value(json!(2)).unwrap();
        authority.flush_operations();
        let read = client.read(&key()).await.unwrap();
        assert_eq!(read.value, Some(json!(2)));
        assert_eq!(read.revision, Some(1));
    }

    #[tokio::test]
    async fn test_disconnect_resets_replicants() {
        let (_server, _authority, client) = setup(json!(1)).await;
        let peer = client.replicant(key(), ReplicantOptions::default());
        client.declare(&peer).await.unwrap();

        client.disconnect().await;
        assert_eq!(peer.status(), ReplicantStatus::Undeclared);
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert!(matches!(client.read(&key()).await, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_reconnect_redeclares() {
        let (_server, authority, client) = setup(json!({"home": 0})).await;
        let peer = client.replicant(key(), ReplicantOptions::default());
        client.declare(&peer).await.unwrap();

        client.sever();
        eventually(|| peer.status() == ReplicantStatus::Undeclared).await;
        authority.set_value(json!({"home": 5})).unwrap();
        authority.flush_operations();

        eventually(|| peer.status() == ReplicantStatus::Declared).await;
        assert_eq!(peer.value(), Some(json!({"home": 5})));
        assert_eq!(peer.revision(), 1);
    }

    #[tokio::test]
    async fn test_leave_stops_batches() {
        let (server, _authority, client) = setup(json!(0)).await;
        let peer = client.replicant(key(), ReplicantOptions::default());
        client.declare(&peer).await.unwrap();
        client.leave(&key()).await.unwrap();

        let room = server.room_manager().get(&key()).await.unwrap();
        assert_eq!(room.peer_count().await, 0);
        assert_eq!(peer.status(), ReplicantStatus::Undeclared);
    }
}
