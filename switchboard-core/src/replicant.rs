//! The shared replicant base and its two roles.
//!
//! ```text
//!            Authority                                  Peer
//!   write ─► validate ─► apply ─► queue       write ─► validate ─► queue (or defer)
//!                                   │                                  │
//!                      end of tick  ▼                     end of tick  ▼
//!         revision+1 ─► Operations ─► Change                     Proposal ──► authority
//!                                                                               │
//!                                Operations(rev) ◄──────────────────────────────┘
//!                                rev == local + 1 ? apply : resync
//! ```
//!
//! A [`Replicant`] is a cheap handle (`Arc`) around one mutex-guarded state.
//! Events are queued while the lock is held, so they leave in commit order,
//! and listeners run after it is released.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::ReplicantError;
use crate::events::{
    Change, EventKind, Listener, ListenerId, Listeners, OperationBatch, Proposal, ReplicantEvent,
};
use crate::operation::{deserialize_present, ArrayMutator, Operation, OperationKind};
use crate::pointer;
use crate::proxy::{Assigned, Proxy};
use crate::schema::Schema;
use crate::tree::{ContainerKind, NodeId, ValueTree, DEFAULT_MAX_SEQUENCE_LENGTH};

pub type Revision = u64;

pub const DEFAULT_PERSISTENCE_INTERVAL_MS: u64 = 100;
const EVENT_CHANNEL_CAPACITY: usize = 64;
/// On a multi-thread runtime a batch is flushed once the queue has stopped
/// growing for this long.
const FLUSH_SETTLE: Duration = Duration::from_millis(2);

/// Identity of a replicant: unique across the whole system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicantKey {
    pub namespace: String,
    pub name: String,
}

impl ReplicantKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReplicantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// Per-declaration options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicantOptions {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub default_value: Option<Value>,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    #[serde(default = "default_persistence_interval")]
    pub persistence_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_path: Option<PathBuf>,
    /// Inline schema document. Only the authority honours it.
    #[serde(skip)]
    pub schema: Option<Value>,
    /// Longest array an index or `length` write may create. Local only,
    /// never taken from the wire.
    #[serde(skip, default = "default_max_array_length")]
    pub max_array_length: usize,
}

fn default_persistent() -> bool {
    true
}

fn default_persistence_interval() -> u64 {
    DEFAULT_PERSISTENCE_INTERVAL_MS
}

fn default_max_array_length() -> usize {
    DEFAULT_MAX_SEQUENCE_LENGTH
}

impl Default for ReplicantOptions {
    fn default() -> Self {
        Self {
            default_value: None,
            persistent: true,
            persistence_interval_ms: DEFAULT_PERSISTENCE_INTERVAL_MS,
            schema_path: None,
            schema: None,
            max_array_length: DEFAULT_MAX_SEQUENCE_LENGTH,
        }
    }
}

impl ReplicantOptions {
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_schema_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.schema_path = Some(path.into());
        self
    }

    pub fn with_persistence_interval(mut self, interval_ms: u64) -> Self {
        self.persistence_interval_ms = interval_ms;
        self
    }

    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn with_max_array_length(mut self, max: usize) -> Self {
        self.max_array_length = max;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Authority,
    Peer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicantStatus {
    Undeclared,
    Declaring,
    Declared,
}

/// The authority's view of a replicant, as sent in declaration acks and
/// proposal rejections.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthoritativeState {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub value: Option<Value>,
    pub revision: Revision,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_digest: Option<String>,
}

/// What a peer did with an incoming batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Applied,
    /// Arrived while declaring; replayed once the declaration completes.
    Buffered,
    /// Not for this replicant, or not declared.
    Ignored,
    /// Out of order or failed to apply; the peer must resync. Carries the
    /// revision of the batch that triggered it.
    ResyncNeeded(Revision),
}

/// A pending container write, routed through [`Replicant::write`].
pub(crate) enum Write {
    Set(String, Assigned),
    Delete(String),
    Mutate(ArrayMutator, Vec<Value>),
}

/// Peer writes made before declaration completes.
#[derive(Debug)]
enum Deferred {
    Overwrite(Value),
    Enqueue(Operation),
}

struct State {
    status: ReplicantStatus,
    revision: Revision,
    tree: ValueTree,
    schema: Option<Schema>,
    schema_digest: Option<String>,
    options: ReplicantOptions,
    queue: Vec<Operation>,
    pending_flush: bool,
    /// Bumped per scheduled flush, so a late task never flushes a newer batch.
    flush_epoch: u64,
    flush_task: Option<JoinHandle<()>>,
    /// Value before the first operation of the queued batch.
    batch_start: Option<Option<Value>>,
    deferred: Vec<Deferred>,
    /// Authority batches received while declaring.
    early: Vec<OperationBatch>,
    listeners: Listeners,
    outbox: VecDeque<ReplicantEvent>,
    draining: bool,
}

struct Inner {
    key: ReplicantKey,
    role: Role,
    id: Uuid,
    state: Mutex<State>,
    events: broadcast::Sender<ReplicantEvent>,
}

/// One synchronized value.
#[derive(Clone)]
pub struct Replicant {
    inner: Arc<Inner>,
}

impl fmt::Debug for Replicant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicant")
            .field("key", &self.inner.key)
            .field("role", &self.inner.role)
            .field("id", &self.inner.id)
            .finish()
    }
}

#[derive(Clone)]
pub struct WeakReplicant(Weak<Inner>);

impl WeakReplicant {
    pub fn upgrade(&self) -> Option<Replicant> {
        self.0.upgrade().map(|inner| Replicant { inner })
    }
}

impl Replicant {
    /// Create an authority replicant.
    ///
    /// A `persisted` value that fails the schema is discarded in favour of
    /// the default (`options.default_value`, else the schema's defaults). The
    /// resulting initial value must itself pass the schema.
    pub fn authority(
        key: ReplicantKey,
        options: ReplicantOptions,
        schema: Option<Schema>,
        persisted: Option<Value>,
    ) -> Result<Self, ReplicantError> {
        let fallback = || {
            options
                .default_value
                .clone()
                .or_else(|| schema.as_ref().and_then(Schema::default_value))
        };
        let initial = match persisted {
            Some(value) => match &schema {
                Some(s) if !s.is_valid(&value) => {
                    log::warn!("{key}: persisted value fails its schema, using the default instead");
                    fallback()
                }
                _ => Some(value),
            },
            None => fallback(),
        };
        if let (Some(schema), Some(value)) = (&schema, &initial) {
            schema.validate(value)?;
        }
        Ok(Self::build(
            key,
            Role::Authority,
            ReplicantStatus::Declared,
            options,
            schema,
            initial,
        ))
    }

    /// Create an undeclared peer replicant. The local value starts at
    /// `options.default_value` until the authority answers.
    pub fn peer(key: ReplicantKey, options: ReplicantOptions) -> Self {
        let initial = options.default_value.clone();
        Self::build(key, Role::Peer, ReplicantStatus::Undeclared, options, None, initial)
    }

    fn build(
        key: ReplicantKey,
        role: Role,
        status: ReplicantStatus,
        options: ReplicantOptions,
        schema: Option<Schema>,
        initial: Option<Value>,
    ) -> Self {
        let id = Uuid::new_v4();
        let schema_digest = schema.as_ref().map(|s| s.digest().to_string());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = State {
            status,
            revision: 0,
            tree: ValueTree::with_value(id, initial).with_max_sequence_length(options.max_array_length),
            schema,
            schema_digest,
            options,
            queue: Vec::new(),
            pending_flush: false,
            flush_epoch: 0,
            flush_task: None,
            batch_start: None,
            deferred: Vec::new(),
            early: Vec::new(),
            listeners: Listeners::default(),
            outbox: VecDeque::new(),
            draining: false,
        };
        Self {
            inner: Arc::new(Inner {
                key,
                role,
                id,
                state: Mutex::new(state),
                events,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&ValueTree) -> R) -> R {
        f(&self.lock().tree)
    }

    /// A detached copy of the current value to rehearse operations on.
    fn scratch(&self, state: &State) -> ValueTree {
        ValueTree::with_value(self.inner.id, state.tree.value())
            .with_max_sequence_length(state.tree.max_sequence_length())
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn key(&self) -> &ReplicantKey {
        &self.inner.key
    }

    /// Process-unique identity, used for ownership checks.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn status(&self) -> ReplicantStatus {
        self.lock().status
    }

    pub fn revision(&self) -> Revision {
        self.lock().revision
    }

    pub fn value(&self) -> Option<Value> {
        self.lock().tree.value()
    }

    /// Value at an encoded pointer.
    pub fn get(&self, pointer: &str) -> Result<Option<Value>, ReplicantError> {
        let segments = pointer::decode(pointer)?;
        Ok(self.lock().tree.get(&segments))
    }

    pub fn schema(&self) -> Option<Schema> {
        self.lock().schema.clone()
    }

    pub fn schema_digest(&self) -> Option<String> {
        self.lock().schema_digest.clone()
    }

    pub fn options(&self) -> ReplicantOptions {
        self.lock().options.clone()
    }

    /// Operations waiting for the next flush.
    pub fn queued_operations(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn ptr_eq(&self, other: &Replicant) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Non-owning handle, for listeners that must not keep the replicant
    /// alive.
    pub fn downgrade(&self) -> WeakReplicant {
        WeakReplicant(Arc::downgrade(&self.inner))
    }

    /// Current value, revision and schema, as the authority reports them.
    pub fn snapshot(&self) -> AuthoritativeState {
        let state = self.lock();
        AuthoritativeState {
            value: state.tree.value(),
            revision: state.revision,
            schema: state.schema.as_ref().map(|s| s.document().clone()),
            schema_digest: state.schema_digest.clone(),
        }
    }

    /// Proxy for the root container, if the value is a map or sequence.
    pub fn root(&self) -> Option<Proxy> {
        let node = self.lock().tree.root_node()?;
        Some(Proxy::new(self.clone(), node))
    }

    /// Proxy for the container at an encoded pointer.
    pub fn proxy(&self, pointer: &str) -> Result<Proxy, ReplicantError> {
        let segments = pointer::decode(pointer)?;
        let node = self.lock().tree.resolve(&segments, "object")?;
        Ok(Proxy::new(self.clone(), node))
    }

    // ─── Listeners ────────────────────────────────────────────────────

    /// Register a listener. A `Change` listener attached while the replicant
    /// is declared is invoked once immediately with the current value.
    pub fn on(&self, kind: EventKind, listener: impl Fn(&ReplicantEvent) + Send + Sync + 'static) -> ListenerId {
        self.register(kind, false, Arc::new(listener))
    }

    /// Like [`on`](Self::on), but the listener fires at most once.
    pub fn once(&self, kind: EventKind, listener: impl Fn(&ReplicantEvent) + Send + Sync + 'static) -> ListenerId {
        self.register(kind, true, Arc::new(listener))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.lock().listeners.remove(id)
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock().listeners.count(kind)
    }

    pub fn remove_all_listeners(&self) {
        self.lock().listeners.clear();
    }

    /// Channel view of every event this replicant emits.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicantEvent> {
        self.inner.events.subscribe()
    }

    pub fn on_change(&self, f: impl Fn(&Change) + Send + Sync + 'static) -> ListenerId {
        self.on(EventKind::Change, move |event| {
            if let ReplicantEvent::Change(change) = event {
                f(change)
            }
        })
    }

    pub fn once_change(&self, f: impl Fn(&Change) + Send + Sync + 'static) -> ListenerId {
        self.once(EventKind::Change, move |event| {
            if let ReplicantEvent::Change(change) = event {
                f(change)
            }
        })
    }

    pub fn on_declared(&self, f: impl Fn(Option<&Value>, Revision) + Send + Sync + 'static) -> ListenerId {
        self.on(EventKind::Declared, move |event| {
            if let ReplicantEvent::Declared { value, revision } = event {
                f(value.as_ref(), *revision)
            }
        })
    }

    pub fn on_declaration_rejected(&self, f: impl Fn(&str) + Send + Sync + 'static) -> ListenerId {
        self.on(EventKind::DeclarationRejected, move |event| {
            if let ReplicantEvent::DeclarationRejected { reason } = event {
                f(reason)
            }
        })
    }

    pub fn on_operations_rejected(&self, f: impl Fn(&str) + Send + Sync + 'static) -> ListenerId {
        self.on(EventKind::OperationsRejected, move |event| {
            if let ReplicantEvent::OperationsRejected { reason } = event {
                f(reason)
            }
        })
    }

    pub fn on_full_update(&self, f: impl Fn(Option<&Value>) + Send + Sync + 'static) -> ListenerId {
        self.on(EventKind::FullUpdate, move |event| {
            if let ReplicantEvent::FullUpdate { value } = event {
                f(value.as_ref())
            }
        })
    }

    pub fn on_operations(&self, f: impl Fn(&OperationBatch) + Send + Sync + 'static) -> ListenerId {
        self.on(EventKind::Operations, move |event| {
            if let ReplicantEvent::Operations(batch) = event {
                f(batch)
            }
        })
    }

    pub fn on_proposal(&self, f: impl Fn(&Proposal) + Send + Sync + 'static) -> ListenerId {
        self.on(EventKind::Proposal, move |event| {
            if let ReplicantEvent::Proposal(proposal) = event {
                f(proposal)
            }
        })
    }

    fn register(&self, kind: EventKind, once: bool, callback: Listener) -> ListenerId {
        let (id, immediate) = {
            let mut state = self.lock();
            let id = state.listeners.next_id();
            let immediate = (kind == EventKind::Change && state.status == ReplicantStatus::Declared).then(|| {
                ReplicantEvent::Change(Change {
                    new_value: state.tree.value(),
                    old_value: None,
                    operations: Vec::new(),
                })
            });
            if !(once && immediate.is_some()) {
                state.listeners.insert(id, kind, once, Arc::clone(&callback));
            }
            (id, immediate)
        };
        if let Some(event) = immediate {
            callback(&event);
        }
        id
    }

    /// Deliver queued events in order. Whoever finds the outbox idle drains
    /// it, including events queued by other threads or by listeners meanwhile.
    fn drain_events(&self) {
        {
            let mut state = self.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        loop {
            let next = {
                let mut state = self.lock();
                match state.outbox.pop_front() {
                    Some(event) => {
                        let callbacks = state.listeners.take_matching(event.kind());
                        Some((event, callbacks))
                    }
                    None => {
                        state.draining = false;
                        None
                    }
                }
            };
            let Some((event, callbacks)) = next else {
                return;
            };
            for callback in callbacks {
                callback(&event);
            }
            let _ = self.inner.events.send(event);
        }
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Replace the whole value. Assigning a scalar equal to the current value
    /// is a no-op.
    pub fn set_value(&self, value: Value) -> Result<(), ReplicantError> {
        let mut state = self.lock();
        if !is_container(&value) && state.tree.value().as_ref() == Some(&value) {
            return Ok(());
        }
        if let Some(schema) = &state.schema {
            schema.validate(&value)?;
        }
        self.submit(&mut state, Operation::overwrite(value))?;
        Ok(())
    }

    pub(crate) fn write(&self, node: NodeId, write: Write) -> Result<Value, ReplicantError> {
        let mut state = self.lock();
        let segments = state.tree.path_of(node).ok_or(ReplicantError::StaleHandle)?;
        let path = pointer::encode(&segments);

        let op = match write {
            Write::Set(key, assigned) => {
                let value = match assigned {
                    Assigned::Value(value) => value,
                    Assigned::Handle(handle) => {
                        if handle.owner != self.inner.id {
                            return Err(ReplicantError::OwnershipViolation {
                                path: handle.path,
                                owner: handle.key.to_string(),
                                target: self.inner.key.to_string(),
                            });
                        }
                        if state.tree.child_node(node, &key) == Some(handle.node) {
                            return Ok(Value::Null);
                        }
                        state
                            .tree
                            .node_value(handle.node)
                            .ok_or(ReplicantError::StaleHandle)?
                    }
                };
                if !is_container(&value) && state.tree.member(node, &key).as_ref() == Some(&value) {
                    return Ok(Value::Null);
                }
                if state.tree.has_member(node, &key) {
                    Operation::update(path, key, value)
                } else {
                    Operation::add(path, key, value)
                }
            }
            Write::Delete(key) => {
                if !state.tree.has_member(node, &key) {
                    return Ok(Value::Null);
                }
                Operation::delete(path, key)
            }
            Write::Mutate(mutator, args) => {
                if state.tree.kind(node) != Some(ContainerKind::Seq) {
                    return Err(ReplicantError::TypeMismatch {
                        path,
                        expected: "array",
                        found: "object",
                    });
                }
                Operation::mutate(path, mutator, args)
            }
        };

        // Validate against a scratch copy so a rejected write never touches
        // the live tree. Peers also read mutator results from it, since
        // their own tree only changes when the authority echoes the batch.
        let dry_run = if state.schema.is_some() || self.inner.role == Role::Peer {
            let mut scratch = self.scratch(&state);
            let result = scratch.perform(&op)?;
            if let (Some(schema), Some(candidate)) = (&state.schema, scratch.value()) {
                schema.validate(&candidate)?;
            }
            Some(result)
        } else {
            None
        };

        let applied = self.submit(&mut state, op)?;
        Ok(match self.inner.role {
            Role::Authority => applied,
            Role::Peer => dry_run.unwrap_or(Value::Null),
        })
    }

    /// Route a validated operation: the authority applies and queues it, a
    /// declared peer queues it, an undeclared peer defers it.
    fn submit(&self, state: &mut State, op: Operation) -> Result<Value, ReplicantError> {
        match self.inner.role {
            Role::Authority => {
                let snapshot = state.batch_start.is_none().then(|| state.tree.value());
                let result = state.tree.perform(&op)?;
                if let Some(snapshot) = snapshot {
                    state.batch_start = Some(snapshot);
                }
                self.enqueue(state, op);
                Ok(result)
            }
            Role::Peer if state.status == ReplicantStatus::Declared => {
                self.enqueue(state, op);
                Ok(Value::Null)
            }
            Role::Peer => {
                state.deferred.push(match op.kind {
                    OperationKind::Overwrite { new_value } => Deferred::Overwrite(new_value),
                    _ => Deferred::Enqueue(op),
                });
                Ok(Value::Null)
            }
        }
    }

    fn enqueue(&self, state: &mut State, op: Operation) {
        state.queue.push(op);
        if !state.pending_flush {
            state.pending_flush = true;
            state.flush_epoch += 1;
            state.flush_task = self.schedule_flush(state.flush_epoch);
        }
    }

    /// Flush at the end of the current tick.
    ///
    /// On a current-thread runtime the task cannot start before the writing
    /// task yields. On a multi-thread runtime another worker may pick it up
    /// while the burst is still running, so it waits until the queue has
    /// stopped growing for [`FLUSH_SETTLE`] (this needs the runtime's time
    /// driver). Outside a runtime nothing is scheduled and the owner calls
    /// [`flush_operations`](Self::flush_operations).
    fn schedule_flush(&self, epoch: u64) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let settle = runtime.runtime_flavor() != RuntimeFlavor::CurrentThread;
        let weak = Arc::downgrade(&self.inner);
        Some(runtime.spawn(async move {
            let mut seen = None;
            loop {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let replicant = Replicant { inner };
                let queued = {
                    let state = replicant.lock();
                    if !state.pending_flush || state.flush_epoch != epoch {
                        return;
                    }
                    state.queue.len()
                };
                if !settle || seen == Some(queued) {
                    replicant.flush(Some(epoch));
                    return;
                }
                seen = Some(queued);
                drop(replicant);
                tokio::time::sleep(FLUSH_SETTLE).await;
            }
        }))
    }

    /// Emit the queued batch: an authority bumps its revision and emits
    /// `Operations` then `Change`; a declared peer emits a `Proposal`.
    pub fn flush_operations(&self) {
        self.flush(None);
    }

    /// Flush, or with `epoch` only if that scheduled batch is still pending.
    fn flush(&self, epoch: Option<u64>) {
        {
            let mut state = self.lock();
            if epoch.is_some_and(|e| e != state.flush_epoch || !state.pending_flush) {
                return;
            }
            state.pending_flush = false;
            state.flush_task = None;
            let operations = std::mem::take(&mut state.queue);
            let old_value = state.batch_start.take().flatten();
            if operations.is_empty() {
                return;
            }
            match self.inner.role {
                Role::Authority => {
                    state.revision += 1;
                    log::trace!(
                        "{}: flushing {} operation(s) at revision {}",
                        self.inner.key,
                        operations.len(),
                        state.revision
                    );
                    let batch = OperationBatch {
                        key: self.inner.key.clone(),
                        operations: operations.clone(),
                        revision: state.revision,
                    };
                    let new_value = state.tree.value();
                    state.outbox.push_back(ReplicantEvent::Operations(batch));
                    state.outbox.push_back(ReplicantEvent::Change(Change {
                        new_value,
                        old_value,
                        operations,
                    }));
                }
                Role::Peer if state.status == ReplicantStatus::Declared => {
                    let proposal = Proposal {
                        key: self.inner.key.clone(),
                        operations,
                        revision: state.revision,
                        schema_digest: state.schema_digest.clone(),
                    };
                    state.outbox.push_back(ReplicantEvent::Proposal(proposal));
                }
                Role::Peer => {
                    state
                        .deferred
                        .extend(operations.into_iter().map(Deferred::Enqueue));
                    return;
                }
            }
        }
        self.drain_events();
    }

    // ─── Authority ────────────────────────────────────────────────────

    /// Apply a batch outside the per-tick queue as one revision step.
    ///
    /// Any queued batch is flushed first so revisions stay in commit order.
    /// The batch is rehearsed on a scratch copy, so a failing operation
    /// leaves the value untouched. Returns the new revision.
    pub fn apply_operations(&self, operations: Vec<Operation>) -> Result<Revision, ReplicantError> {
        if self.inner.role != Role::Authority {
            return Err(ReplicantError::invalid_args(
                "applyOperations",
                "only an authority applies batches directly",
            ));
        }
        self.flush_operations();

        let revision = {
            let mut state = self.lock();
            let mut scratch = self.scratch(&state);
            for op in &operations {
                scratch.apply(op)?;
            }
            let old_value = state.tree.value();
            for op in &operations {
                state.tree.apply(op)?;
            }
            state.revision += 1;
            let revision = state.revision;
            let batch = OperationBatch {
                key: self.inner.key.clone(),
                operations: operations.clone(),
                revision,
            };
            let new_value = state.tree.value();
            state.outbox.push_back(ReplicantEvent::Operations(batch));
            state.outbox.push_back(ReplicantEvent::Change(Change {
                new_value,
                old_value,
                operations,
            }));
            revision
        };
        self.drain_events();
        Ok(revision)
    }

    // ─── Peer ─────────────────────────────────────────────────────────

    /// Start declaring. Returns the options to send, or `None` when already
    /// declaring or declared.
    pub fn begin_declare(&self) -> Option<ReplicantOptions> {
        let mut state = self.lock();
        if self.inner.role != Role::Peer || state.status != ReplicantStatus::Undeclared {
            return None;
        }
        state.status = ReplicantStatus::Declaring;
        Some(state.options.clone())
    }

    /// Adopt the authority's answer to a declaration, apply the batches that
    /// overtook it, then replay writes made while declaring.
    ///
    /// Returns `Some(revision)` when an overtaking batch did not follow the
    /// acknowledged revision; the caller must then resync.
    pub fn complete_declare(&self, ack: AuthoritativeState) -> Result<Option<Revision>, ReplicantError> {
        let schema = match ack.schema.map(Schema::new).transpose() {
            Ok(schema) => schema,
            Err(err) => {
                self.lock().status = ReplicantStatus::Undeclared;
                return Err(err.into());
            }
        };

        let ack_revision = ack.revision;
        let (early, deferred) = {
            let mut state = self.lock();
            if state.status != ReplicantStatus::Declaring {
                log::debug!("{}: ignoring declaration ack while {:?}", self.inner.key, state.status);
                return Ok(None);
            }
            if let Some(schema) = schema {
                state.schema_digest = Some(schema.digest().to_string());
                state.schema = Some(schema);
            }
            if ack.schema_digest.is_some() {
                state.schema_digest = ack.schema_digest;
            }

            let old_value = state.tree.value();
            let changed = ack.revision != state.revision || ack.value != old_value;
            if changed {
                state.tree.replace_root(ack.value.clone());
                state.revision = ack.revision;
            }
            state.status = ReplicantStatus::Declared;

            state.outbox.push_back(ReplicantEvent::Declared {
                value: ack.value.clone(),
                revision: ack.revision,
            });
            if changed {
                state.outbox.push_back(ReplicantEvent::Change(Change {
                    new_value: ack.value.clone(),
                    old_value,
                    operations: ack.value.map(Operation::overwrite).into_iter().collect(),
                }));
            } else if ack.value.is_none() && ack.revision == 0 {
                // Never set anywhere: nothing else would tell listeners that
                // declaration finished.
                state.outbox.push_back(ReplicantEvent::Change(Change {
                    new_value: None,
                    old_value: None,
                    operations: Vec::new(),
                }));
            }
            (std::mem::take(&mut state.early), std::mem::take(&mut state.deferred))
        };
        log::debug!("{}: declared at revision {}", self.inner.key, self.revision());
        self.drain_events();

        let mut resync = None;
        for batch in early.iter().filter(|b| b.revision > ack_revision) {
            if let BatchOutcome::ResyncNeeded(revision) = self.handle_operations(batch) {
                resync = Some(revision);
                break;
            }
        }

        for action in deferred {
            match action {
                Deferred::Overwrite(value) => {
                    if let Err(err) = self.set_value(value) {
                        log::warn!("{}: dropping deferred overwrite: {err}", self.inner.key);
                    }
                }
                Deferred::Enqueue(op) => {
                    let mut state = self.lock();
                    if let Err(err) = self.rehearse_after_queue(&state, &op) {
                        log::warn!("{}: dropping deferred {} at {}: {err}", self.inner.key, op.method(), op.path);
                        continue;
                    }
                    self.enqueue(&mut state, op);
                }
            }
        }
        Ok(resync)
    }

    /// Check `op` against the schema as it would apply after the queued
    /// batch. Peers do not apply their own writes, so the queue is replayed
    /// on a scratch copy first.
    fn rehearse_after_queue(&self, state: &State, op: &Operation) -> Result<(), ReplicantError> {
        let Some(schema) = &state.schema else {
            return Ok(());
        };
        let mut scratch = self.scratch(state);
        for queued in &state.queue {
            scratch.apply(queued)?;
        }
        scratch.perform(op)?;
        if let Some(candidate) = scratch.value() {
            schema.validate(&candidate)?;
        }
        Ok(())
    }

    /// The authority refused the declaration. Without a registered
    /// `DeclarationRejected` listener this is returned as an error.
    pub fn reject_declare(&self, reason: impl Into<String>) -> Result<(), ReplicantError> {
        let reason = reason.into();
        {
            let mut state = self.lock();
            state.status = ReplicantStatus::Undeclared;
            state.early.clear();
            if state.listeners.count(EventKind::DeclarationRejected) == 0 {
                return Err(ReplicantError::ProtocolRejection(reason));
            }
            state
                .outbox
                .push_back(ReplicantEvent::DeclarationRejected { reason });
        }
        self.drain_events();
        Ok(())
    }

    /// Apply an authority batch if it is the next one in sequence.
    pub fn handle_operations(&self, batch: &OperationBatch) -> BatchOutcome {
        if self.inner.role != Role::Peer || batch.key != self.inner.key {
            return BatchOutcome::Ignored;
        }
        {
            let mut state = self.lock();
            match state.status {
                ReplicantStatus::Declared => {}
                ReplicantStatus::Declaring => {
                    state.early.push(batch.clone());
                    return BatchOutcome::Buffered;
                }
                ReplicantStatus::Undeclared => return BatchOutcome::Ignored,
            }
            if batch.revision != state.revision + 1 {
                log::debug!(
                    "{}: batch revision {} does not follow local revision {}",
                    self.inner.key,
                    batch.revision,
                    state.revision
                );
                return BatchOutcome::ResyncNeeded(batch.revision);
            }
            let old_value = state.tree.value();
            for op in &batch.operations {
                if let Err(err) = state.tree.apply(op) {
                    log::warn!("{}: failed to apply {} at {}: {err}", self.inner.key, op.method(), op.path);
                    return BatchOutcome::ResyncNeeded(batch.revision);
                }
            }
            state.revision = batch.revision;
            let new_value = state.tree.value();
            state.outbox.push_back(ReplicantEvent::Change(Change {
                new_value,
                old_value,
                operations: batch.operations.clone(),
            }));
        }
        self.drain_events();
        BatchOutcome::Applied
    }

    /// Replace the local value wholesale. The revision is left untouched when
    /// `revision` is `None`.
    pub fn apply_full_update(&self, value: Option<Value>, revision: Option<Revision>) {
        self.lock()
            .outbox
            .push_back(ReplicantEvent::FullUpdate { value: value.clone() });
        self.drain_events();
        {
            let mut state = self.lock();
            let old_value = state.tree.replace_root(value.clone());
            if let Some(revision) = revision {
                state.revision = revision;
            }
            state.outbox.push_back(ReplicantEvent::Change(Change {
                new_value: value.clone(),
                old_value,
                operations: value.map(Operation::overwrite).into_iter().collect(),
            }));
        }
        self.drain_events();
    }

    /// The authority refused a proposal: drop queued work and hard-reset to
    /// its state.
    pub fn reject_operations(
        &self,
        reason: impl Into<String>,
        authoritative: AuthoritativeState,
    ) -> Result<(), ReplicantError> {
        let reason = reason.into();
        let schema = authoritative.schema.map(Schema::new).transpose()?;
        let listened = {
            let mut state = self.lock();
            state.queue.clear();
            state.pending_flush = false;
            state.batch_start = None;
            if let Some(task) = state.flush_task.take() {
                task.abort();
            }
            if let Some(schema) = schema {
                state.schema_digest = Some(schema.digest().to_string());
                state.schema = Some(schema);
            }
            if authoritative.schema_digest.is_some() {
                state.schema_digest = authoritative.schema_digest;
            }
            let old_value = state.tree.replace_root(authoritative.value.clone());
            state.revision = authoritative.revision;
            state.outbox.push_back(ReplicantEvent::Change(Change {
                new_value: authoritative.value.clone(),
                old_value,
                operations: authoritative.value.map(Operation::overwrite).into_iter().collect(),
            }));
            state.outbox.push_back(ReplicantEvent::OperationsRejected {
                reason: reason.clone(),
            });
            state.listeners.count(EventKind::OperationsRejected) > 0
        };
        if !listened {
            log::warn!("{}: proposal rejected: {reason}", self.inner.key);
        }
        self.drain_events();
        Ok(())
    }

    /// Connection lost: back to undeclared, discarding queued and deferred
    /// writes.
    pub fn handle_disconnect(&self) {
        if self.inner.role != Role::Peer {
            return;
        }
        let mut state = self.lock();
        state.status = ReplicantStatus::Undeclared;
        state.queue.clear();
        state.deferred.clear();
        state.early.clear();
        state.pending_flush = false;
        state.batch_start = None;
        if let Some(task) = state.flush_task.take() {
            task.abort();
        }
    }
}

fn is_container(value: &Value) -> bool {
    value.is_object() || value.is_array()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scores_schema() -> Schema {
        Schema::new(json!({
            "type": "object",
            "properties": {"home": {"type": "number", "default": 0}}
        }))
        .unwrap()
    }

    fn scores() -> Replicant {
        Replicant::authority(
            ReplicantKey::new("game", "scores"),
            ReplicantOptions::default(),
            Some(scores_schema()),
            None,
        )
        .unwrap()
    }

    fn record_changes(replicant: &Replicant) -> Arc<Mutex<Vec<Change>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        replicant.on_change(move |change| sink.lock().unwrap().push(change.clone()));
        seen
    }

    fn record_events(replicant: &Replicant, kind: EventKind) -> Arc<Mutex<Vec<ReplicantEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        replicant.on(kind, move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    fn declared_peer(value: Value, revision: Revision) -> Replicant {
        let peer = Replicant::peer(ReplicantKey::new("game", "scores"), ReplicantOptions::default());
        peer.begin_declare().unwrap();
        peer.complete_declare(AuthoritativeState {
            value: Some(value),
            revision,
            ..Default::default()
        })
        .unwrap();
        peer
    }

    #[test]
    fn test_schema_default_seeds_authority() {
        let replicant = scores();
        assert_eq!(replicant.value(), Some(json!({"home": 0})));
        assert_eq!(replicant.revision(), 0);
        assert_eq!(replicant.status(), ReplicantStatus::Declared);
    }

    #[test]
    fn test_update_emits_one_operation_and_bumps_revision() {
        let replicant = scores();
        let batches = record_events(&replicant, EventKind::Operations);

        replicant.root().unwrap().set("home", 3).unwrap();
        // Applied immediately on the authority.
        assert_eq!(replicant.get("/home").unwrap(), Some(json!(3)));
        assert_eq!(replicant.revision(), 0);

        replicant.flush_operations();
        assert_eq!(replicant.revision(), 1);
        let batches = batches.lock().unwrap();
        let ReplicantEvent::Operations(batch) = &batches[0] else {
            panic!("expected an operations event");
        };
        assert_eq!(batch.revision, 1);
        assert_eq!(batch.operations, vec![Operation::update("/", "home", json!(3))]);
    }

    #[test]
    fn test_burst_collapses_into_one_revision() {
        let replicant = scores();
        let changes = record_changes(&replicant);
        for burst in 1..=3u64 {
            let root = replicant.root().unwrap();
            root.set("home", burst as i64 * 10).unwrap();
            root.set("away", 1).unwrap();
            root.delete("away").unwrap();
            replicant.flush_operations();
            assert_eq!(replicant.revision(), burst);
        }
        let changes = changes.lock().unwrap();
        // One immediate notification on attach, then one per burst.
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[1].old_value, Some(json!({"home": 0})));
        assert_eq!(changes[1].operations.len(), 3);
    }

    #[test]
    fn test_invalid_write_is_rejected_before_mutation() {
        let replicant = scores();
        let err = replicant.root().unwrap().set("home", "three").unwrap_err();
        assert!(matches!(err, ReplicantError::Validation(_)));
        assert_eq!(replicant.value(), Some(json!({"home": 0})));
        assert_eq!(replicant.queued_operations(), 0);

        assert!(replicant.set_value(json!([])).is_err());
        assert_eq!(replicant.queued_operations(), 0);
    }

    #[test]
    fn test_ownership_violation_leaves_both_untouched() {
        let a = Replicant::authority(
            ReplicantKey::new("ns", "a"),
            ReplicantOptions::default().with_default(json!({"shared": {"x": 1}})),
            None,
            None,
        )
        .unwrap();
        let b = Replicant::authority(
            ReplicantKey::new("ns", "b"),
            ReplicantOptions::default().with_default(json!({})),
            None,
            None,
        )
        .unwrap();

        let shared = a.proxy("/shared").unwrap();
        let err = b.root().unwrap().set("stolen", &shared).unwrap_err();
        assert!(matches!(err, ReplicantError::OwnershipViolation { .. }));
        assert_eq!(a.queued_operations(), 0);
        assert_eq!(b.queued_operations(), 0);
        assert_eq!(b.value(), Some(json!({})));
    }

    #[test]
    fn test_same_owner_handle_is_copied() {
        let replicant = Replicant::authority(
            ReplicantKey::new("ns", "copy"),
            ReplicantOptions::default().with_default(json!({"a": {"x": 1}})),
            None,
            None,
        )
        .unwrap();
        let root = replicant.root().unwrap();
        let a = root.child("a").unwrap();
        root.set("b", &a).unwrap();
        root.child("b").unwrap().set("x", 2).unwrap();
        assert_eq!(replicant.value(), Some(json!({"a": {"x": 1}, "b": {"x": 2}})));

        // Assigning a container to the slot it already occupies does nothing.
        root.set("a", &a).unwrap();
        assert_eq!(replicant.queued_operations(), 2);
    }

    #[test]
    fn test_late_change_listener_fires_immediately() {
        let replicant = scores();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        replicant.once_change(move |change| {
            assert_eq!(change.new_value, Some(json!({"home": 0})));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(replicant.listener_count(EventKind::Change), 0);

        replicant.root().unwrap().set("home", 1).unwrap();
        replicant.flush_operations();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_persisted_value_falls_back_to_default() {
        let replicant = Replicant::authority(
            ReplicantKey::new("game", "scores"),
            ReplicantOptions::default(),
            Some(scores_schema()),
            Some(json!({"home": "nope"})),
        )
        .unwrap();
        assert_eq!(replicant.value(), Some(json!({"home": 0})));

        let kept = Replicant::authority(
            ReplicantKey::new("game", "scores"),
            ReplicantOptions::default(),
            Some(scores_schema()),
            Some(json!({"home": 7})),
        )
        .unwrap();
        assert_eq!(kept.value(), Some(json!({"home": 7})));
    }

    #[test]
    fn test_invalid_explicit_default_fails_construction() {
        let result = Replicant::authority(
            ReplicantKey::new("game", "scores"),
            ReplicantOptions::default().with_default(json!("scoreboard")),
            Some(scores_schema()),
            None,
        );
        assert!(matches!(result, Err(ReplicantError::Validation(_))));
    }

    #[test]
    fn test_apply_operations_commits_queued_batch_first() {
        let replicant = scores();
        let batches = record_events(&replicant, EventKind::Operations);
        replicant.root().unwrap().set("home", 1).unwrap();
        let revision = replicant
            .apply_operations(vec![Operation::update("/", "home", json!(2))])
            .unwrap();
        assert_eq!(revision, 2);
        assert_eq!(replicant.value(), Some(json!({"home": 2})));

        let revisions: Vec<_> = batches
            .lock()
            .unwrap()
            .iter()
            .map(|e| match e {
                ReplicantEvent::Operations(b) => b.revision,
                _ => 0,
            })
            .collect();
        assert_eq!(revisions, vec![1, 2]);
    }

    #[test]
    fn test_apply_operations_failure_leaves_value() {
        let replicant = scores();
        let result = replicant.apply_operations(vec![
            Operation::update("/", "home", json!(5)),
            Operation::mutate("/", ArrayMutator::Push, vec![json!(1)]),
        ]);
        assert!(matches!(result, Err(ReplicantError::TypeMismatch { .. })));
        assert_eq!(replicant.value(), Some(json!({"home": 0})));
        assert_eq!(replicant.revision(), 0);
    }

    #[test]
    fn test_peer_defers_writes_until_declared() {
        let peer = Replicant::peer(
            ReplicantKey::new("game", "scores"),
            ReplicantOptions::default().with_default(json!({"home": 0})),
        );
        let proposals = record_events(&peer, EventKind::Proposal);
        let declared = record_events(&peer, EventKind::Declared);

        peer.root().unwrap().set("home", 9).unwrap();
        assert_eq!(peer.queued_operations(), 0);

        assert!(peer.begin_declare().is_some());
        assert!(peer.begin_declare().is_none());
        assert_eq!(peer.status(), ReplicantStatus::Declaring);

        peer.complete_declare(AuthoritativeState {
            value: Some(json!({"home": 3})),
            revision: 1,
            schema: Some(json!({"type": "object"})),
            schema_digest: None,
        })
        .unwrap();
        assert_eq!(declared.lock().unwrap().len(), 1);
        assert_eq!(peer.value(), Some(json!({"home": 3})));
        assert_eq!(peer.revision(), 1);
        assert_eq!(peer.queued_operations(), 1);

        peer.flush_operations();
        let proposals = proposals.lock().unwrap();
        let ReplicantEvent::Proposal(proposal) = &proposals[0] else {
            panic!("expected a proposal");
        };
        assert_eq!(proposal.revision, 1);
        assert_eq!(proposal.operations, vec![Operation::update("/", "home", json!(9))]);
        assert_eq!(
            proposal.schema_digest.as_deref(),
            Some(crate::schema::digest(&json!({"type": "object"})).as_str())
        );
    }

    #[test]
    fn test_declaring_never_set_value_still_notifies() {
        let peer = Replicant::peer(ReplicantKey::new("ns", "empty"), ReplicantOptions::default());
        let changes = record_changes(&peer);
        peer.begin_declare();
        peer.complete_declare(AuthoritativeState::default()).unwrap();
        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new_value, None);
        assert!(changes[0].operations.is_empty());
    }

    #[test]
    fn test_peer_write_waits_for_echo() {
        let peer = declared_peer(json!({"queue": [1, 2, 3]}), 4);
        let queue = peer.proxy("/queue").unwrap();
        assert_eq!(queue.pop().unwrap(), json!(3));
        // Not applied locally until the authority broadcasts it back.
        assert_eq!(peer.get("/queue").unwrap(), Some(json!([1, 2, 3])));

        let outcome = peer.handle_operations(&OperationBatch {
            key: peer.key().clone(),
            operations: vec![Operation::mutate("/queue", ArrayMutator::Pop, vec![])],
            revision: 5,
        });
        assert_eq!(outcome, BatchOutcome::Applied);
        assert_eq!(peer.get("/queue").unwrap(), Some(json!([1, 2])));
        assert_eq!(peer.revision(), 5);
    }

    #[test]
    fn test_out_of_order_batches_force_resync() {
        let peer = declared_peer(json!({"home": 0}), 0);
        let batch = |revision: Revision, home: i64| OperationBatch {
            key: peer.key().clone(),
            operations: vec![Operation::update("/", "home", json!(home))],
            revision,
        };
        assert_eq!(peer.handle_operations(&batch(3, 3)), BatchOutcome::ResyncNeeded(3));
        assert_eq!(peer.handle_operations(&batch(2, 2)), BatchOutcome::ResyncNeeded(2));
        assert_eq!(peer.handle_operations(&batch(1, 1)), BatchOutcome::Applied);
        assert_eq!(peer.value(), Some(json!({"home": 1})));

        let other = OperationBatch {
            key: ReplicantKey::new("game", "other"),
            ..batch(2, 2)
        };
        assert_eq!(peer.handle_operations(&other), BatchOutcome::Ignored);
    }

    #[test]
    fn test_batches_overtaking_the_ack_are_replayed() {
        let peer = Replicant::peer(ReplicantKey::new("game", "scores"), ReplicantOptions::default());
        let changes = record_changes(&peer);
        let batch = |revision: Revision, home: i64| OperationBatch {
            key: peer.key().clone(),
            operations: vec![Operation::update("/", "home", json!(home))],
            revision,
        };
        assert_eq!(peer.handle_operations(&batch(1, 1)), BatchOutcome::Ignored);

        peer.begin_declare().unwrap();
        // Committed after the authority took its snapshot at revision 1.
        assert_eq!(peer.handle_operations(&batch(1, 1)), BatchOutcome::Buffered);
        assert_eq!(peer.handle_operations(&batch(2, 2)), BatchOutcome::Buffered);
        assert_eq!(peer.value(), None);

        let resync = peer
            .complete_declare(AuthoritativeState {
                value: Some(json!({"home": 1})),
                revision: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resync, None);
        assert_eq!(peer.revision(), 2);
        assert_eq!(peer.value(), Some(json!({"home": 2})));
        let changes = changes.lock().unwrap();
        assert_eq!(changes.last().unwrap().operations, batch(2, 2).operations);
    }

    #[test]
    fn test_gap_after_the_ack_asks_for_resync() {
        let peer = Replicant::peer(ReplicantKey::new("game", "scores"), ReplicantOptions::default());
        peer.begin_declare().unwrap();
        let batch = OperationBatch {
            key: peer.key().clone(),
            operations: vec![Operation::update("/", "home", json!(3))],
            revision: 3,
        };
        assert_eq!(peer.handle_operations(&batch), BatchOutcome::Buffered);

        let resync = peer
            .complete_declare(AuthoritativeState {
                value: Some(json!({"home": 1})),
                revision: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resync, Some(3));
        assert_eq!(peer.revision(), 1);
        assert_eq!(peer.value(), Some(json!({"home": 1})));
    }

    #[test]
    fn test_deferred_writes_are_checked_against_the_adopted_schema() {
        let peer = Replicant::peer(
            ReplicantKey::new("game", "scores"),
            ReplicantOptions::default().with_default(json!({"home": 0})),
        );
        let root = peer.root().unwrap();
        root.set("home", "three").unwrap();
        root.set("away", 2).unwrap();
        peer.begin_declare().unwrap();
        peer.complete_declare(AuthoritativeState {
            value: Some(json!({"home": 1})),
            revision: 1,
            schema: Some(scores_schema().document().clone()),
            schema_digest: None,
        })
        .unwrap();

        assert_eq!(peer.queued_operations(), 1);
        let proposals = record_events(&peer, EventKind::Proposal);
        peer.flush_operations();
        let proposals = proposals.lock().unwrap();
        let ReplicantEvent::Proposal(proposal) = &proposals[0] else {
            panic!("expected a proposal");
        };
        assert_eq!(proposal.operations, vec![Operation::update("/", "away", json!(2))]);
    }

    #[test]
    fn test_concurrent_commits_broadcast_in_revision_order() {
        let replicant = Replicant::authority(
            ReplicantKey::new("ns", "counter"),
            ReplicantOptions::default().with_default(json!({})),
            None,
            None,
        )
        .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        replicant.on_operations(move |batch| sink.lock().unwrap().push(batch.revision));

        std::thread::scope(|s| {
            for t in 0..8i64 {
                let replicant = &replicant;
                s.spawn(move || {
                    for i in 0..500 {
                        replicant
                            .apply_operations(vec![Operation::update("/", "n", json!(t * 500 + i))])
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(replicant.revision(), 4000);
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (1..=4000).collect::<Vec<Revision>>());
    }

    #[test]
    fn test_oversized_arrays_are_refused() {
        let replicant = Replicant::authority(
            ReplicantKey::new("ns", "list"),
            ReplicantOptions::default().with_default(json!([])),
            None,
            None,
        )
        .unwrap();
        let huge = Operation::update("/", "length", json!(1u64 << 62));
        assert!(matches!(
            replicant.apply_operations(vec![huge]),
            Err(ReplicantError::InvalidArguments { .. })
        ));
        assert_eq!(replicant.value(), Some(json!([])));
        assert_eq!(replicant.revision(), 0);

        let small = Replicant::authority(
            ReplicantKey::new("ns", "small"),
            ReplicantOptions::default()
                .with_default(json!({"list": []}))
                .with_max_array_length(4),
            None,
            None,
        )
        .unwrap();
        let list = small.proxy("/list").unwrap();
        assert!(list.set("4", 1).is_err());
        list.set("3", 1).unwrap();
        small.flush_operations();
        assert_eq!(small.value(), Some(json!({"list": [null, null, null, 1]})));
    }

    #[test]
    fn test_idempotent_full_update() {
        let peer = declared_peer(json!({"home": 3}), 1);
        let changes = record_changes(&peer);
        let updates = record_events(&peer, EventKind::FullUpdate);
        changes.lock().unwrap().clear();

        peer.apply_full_update(Some(json!({"home": 3})), Some(1));
        assert_eq!(peer.value(), Some(json!({"home": 3})));
        assert_eq!(peer.revision(), 1);
        assert_eq!(changes.lock().unwrap().len(), 1);
        assert_eq!(updates.lock().unwrap().len(), 1);

        peer.apply_full_update(Some(json!({"home": 4})), None);
        assert_eq!(peer.revision(), 1);
    }

    #[test]
    fn test_declaration_rejection_needs_a_listener() {
        let peer = Replicant::peer(ReplicantKey::new("ns", "x"), ReplicantOptions::default());
        peer.begin_declare();
        assert!(matches!(
            peer.reject_declare("invalid default"),
            Err(ReplicantError::ProtocolRejection(_))
        ));
        assert_eq!(peer.status(), ReplicantStatus::Undeclared);

        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        peer.on_declaration_rejected(move |reason| sink.lock().unwrap().push(reason.to_string()));
        peer.begin_declare();
        peer.reject_declare("invalid default").unwrap();
        assert_eq!(*reasons.lock().unwrap(), vec!["invalid default".to_string()]);
    }

    #[test]
    fn test_rejected_proposal_resets_to_authority() {
        let peer = declared_peer(json!({"home": 3}), 1);
        peer.root().unwrap().set("home", 4).unwrap();
        peer.root().unwrap().set("away", 1).unwrap();
        assert_eq!(peer.queued_operations(), 2);

        peer.reject_operations(
            "Mismatched revision number",
            AuthoritativeState {
                value: Some(json!({"home": 5})),
                revision: 2,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(peer.queued_operations(), 0);
        assert_eq!(peer.value(), Some(json!({"home": 5})));
        assert_eq!(peer.revision(), 2);
    }

    #[test]
    fn test_disconnect_discards_pending_work() {
        let peer = declared_peer(json!({"home": 3}), 1);
        peer.root().unwrap().set("home", 4).unwrap();
        peer.handle_disconnect();
        assert_eq!(peer.status(), ReplicantStatus::Undeclared);
        assert_eq!(peer.queued_operations(), 0);

        // Writes while disconnected are deferred, then dropped on the next
        // disconnect.
        peer.root().unwrap().set("home", 5).unwrap();
        peer.handle_disconnect();
        peer.begin_declare();
        peer.complete_declare(AuthoritativeState {
            value: Some(json!({"home": 3})),
            revision: 1,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(peer.queued_operations(), 0);
    }

    #[test]
    fn test_mutator_on_map_is_type_mismatch() {
        let replicant = scores();
        let err = replicant.root().unwrap().push(json!(1)).unwrap_err();
        assert!(matches!(err, ReplicantError::TypeMismatch { expected: "array", .. }));
    }

    #[test]
    fn test_weak_handle_does_not_keep_replicant_alive() {
        let replicant = scores();
        let weak = replicant.downgrade();
        assert!(weak.upgrade().unwrap().ptr_eq(&replicant));
        drop(replicant);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_options_wire_shape() {
        let options = ReplicantOptions::default().with_default(Value::Null);
        let encoded = serde_json::to_value(&options).unwrap();
        assert_eq!(
            encoded,
            json!({"defaultValue": null, "persistent": true, "persistenceIntervalMs": 100})
        );
        let decoded: ReplicantOptions = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.default_value, Some(Value::Null));

        let bare: ReplicantOptions = serde_json::from_value(json!({})).unwrap();
        assert_eq!(bare, ReplicantOptions::default());
    }

    #[tokio::test]
    async fn test_flush_is_scheduled_on_the_runtime() {
        let replicant = scores();
        let root = replicant.root().unwrap();
        root.set("home", 1).unwrap();
        root.set("home", 2).unwrap();
        assert_eq!(replicant.revision(), 0);

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(replicant.revision(), 1);
        assert_eq!(replicant.queued_operations(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let replicant = scores();
        let mut events = replicant.subscribe();
        replicant.root().unwrap().set("home", 1).unwrap();
        replicant.flush_operations();
        assert_eq!(events.recv().await.unwrap().kind(), EventKind::Operations);
        assert_eq!(events.recv().await.unwrap().kind(), EventKind::Change);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_burst_on_multi_thread_runtime_is_one_revision() {
        let replicant = Replicant::authority(
            ReplicantKey::new("ns", "bulk"),
            ReplicantOptions::default().with_default(json!({})),
            None,
            None,
        )
        .unwrap();
        let root = replicant.root().unwrap();
        for i in 0..2000i64 {
            root.set(format!("k{i}"), i).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(replicant.revision(), 1);
        assert_eq!(replicant.queued_operations(), 0);
        assert_eq!(replicant.get("/k1999").unwrap(), Some(json!(1999)));
    }
}
