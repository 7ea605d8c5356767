//! Arena-backed storage for a replicant's value.
//!
//! Every map or sequence inside a value lives in an arena entry owned by
//! exactly one [`ValueTree`]; scalars are stored inline. A [`NodeId`] is only
//! meaningful inside the tree that allocated it, and an entry's generation is
//! bumped when its container is released so that stale ids are detected
//! instead of aliasing whatever container reuses the slot.
//!
//! ```text
//!   root ─► #0 map ──┬─ "home"  ─► 3
//!                    └─ "teams" ─► #1 seq ──┬─ [0] ─► #2 map
//!                                           └─ [1] ─► #3 map
//! ```
//!
//! Paths are never stored. A container knows its parent, and its key is found
//! by scanning the parent, so a container moved by `shift`/`sort`/`splice`
//! keeps its id and reports its new path.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ReplicantError;
use crate::operation::{ArrayMutator, Operation, OperationKind};
use crate::pointer;

/// Stable handle to a container inside one [`ValueTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Map,
    Seq,
}

impl ContainerKind {
    pub fn name(self) -> &'static str {
        match self {
            ContainerKind::Map => "object",
            ContainerKind::Seq => "array",
        }
    }
}

#[derive(Debug)]
enum Slot {
    Scalar(Value),
    Node(NodeId),
}

#[derive(Debug)]
enum Container {
    Map(BTreeMap<String, Slot>),
    Seq(Vec<Slot>),
}

#[derive(Debug)]
struct NodeData {
    parent: Option<NodeId>,
    container: Container,
}

#[derive(Debug)]
struct Entry {
    generation: u32,
    data: Option<NodeData>,
}

/// A value held as an arena of containers.
#[derive(Debug)]
pub struct ValueTree {
    owner: Uuid,
    entries: Vec<Entry>,
    free: Vec<u32>,
    root: Option<Slot>,
    max_seq_len: usize,
}

/// Longest sequence an index or `length` write may create by default.
pub const DEFAULT_MAX_SEQUENCE_LENGTH: usize = 1 << 20;

impl ValueTree {
    /// Create an empty tree (value absent) owned by `owner`.
    pub fn new(owner: Uuid) -> Self {
        Self {
            owner,
            entries: Vec::new(),
            free: Vec::new(),
            root: None,
            max_seq_len: DEFAULT_MAX_SEQUENCE_LENGTH,
        }
    }

    /// Cap the length that index and `length` writes may grow a sequence to.
    /// Mutators that insert their arguments are not capped.
    pub fn with_max_sequence_length(mut self, max: usize) -> Self {
        self.max_seq_len = max;
        self
    }

    pub fn max_sequence_length(&self) -> usize {
        self.max_seq_len
    }

    pub fn with_value(owner: Uuid, value: Option<Value>) -> Self {
        let mut tree = Self::new(owner);
        tree.replace_root(value);
        tree
    }

    /// Identity of the replicant this tree belongs to.
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Number of live containers.
    pub fn live_nodes(&self) -> usize {
        self.entries.iter().filter(|e| e.data.is_some()).count()
    }

    /// Materialize the whole value.
    pub fn value(&self) -> Option<Value> {
        self.root.as_ref().map(|slot| self.export(slot))
    }

    /// Replace the whole value, returning the previous one.
    pub fn replace_root(&mut self, value: Option<Value>) -> Option<Value> {
        let previous = self.root.take().map(|slot| self.release(slot));
        self.root = value.map(|v| self.import(v, None));
        previous
    }

    pub fn root_node(&self) -> Option<NodeId> {
        match self.root {
            Some(Slot::Node(id)) => Some(id),
            _ => None,
        }
    }

    /// Value at `segments`, if every step exists.
    pub fn get(&self, segments: &[String]) -> Option<Value> {
        let mut slot = self.root.as_ref()?;
        for segment in segments {
            let Slot::Node(id) = slot else {
                return None;
            };
            slot = self.child_slot(*id, segment)?;
        }
        Some(self.export(slot))
    }

    /// Resolve `segments` to a container. `expected` names the container kind
    /// the caller needs, for the error message.
    pub fn resolve(&self, segments: &[String], expected: &'static str) -> Result<NodeId, ReplicantError> {
        let mut slot = self.root.as_ref();
        for (depth, segment) in segments.iter().enumerate() {
            match slot {
                Some(Slot::Node(id)) => slot = self.child_slot(*id, segment),
                other => {
                    return Err(ReplicantError::TypeMismatch {
                        path: pointer::encode(&segments[..depth]),
                        expected: "object",
                        found: self.describe(other),
                    })
                }
            }
        }
        match slot {
            Some(Slot::Node(id)) => Ok(*id),
            other => Err(ReplicantError::TypeMismatch {
                path: pointer::encode(segments),
                expected,
                found: self.describe(other),
            }),
        }
    }

    /// Current path of a container, or `None` once it has been released.
    pub fn path_of(&self, id: NodeId) -> Option<Vec<String>> {
        let mut segments = Vec::new();
        let mut current = id;
        loop {
            match self.data(current)?.parent {
                None => {
                    if self.root_node() != Some(current) {
                        return None;
                    }
                    break;
                }
                Some(parent) => {
                    segments.push(self.key_in(parent, current)?);
                    current = parent;
                }
            }
        }
        segments.reverse();
        Some(segments)
    }

    /// Current encoded pointer of a container.
    pub fn pointer_of(&self, id: NodeId) -> Option<String> {
        self.path_of(id).map(|p| pointer::encode(&p))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.data(id).is_some()
    }

    pub fn kind(&self, id: NodeId) -> Option<ContainerKind> {
        self.data(id).map(|d| match d.container {
            Container::Map(_) => ContainerKind::Map,
            Container::Seq(_) => ContainerKind::Seq,
        })
    }

    pub fn len(&self, id: NodeId) -> Option<usize> {
        self.data(id).map(|d| match &d.container {
            Container::Map(m) => m.len(),
            Container::Seq(v) => v.len(),
        })
    }

    pub fn keys(&self, id: NodeId) -> Vec<String> {
        match self.data(id).map(|d| &d.container) {
            Some(Container::Map(m)) => m.keys().cloned().collect(),
            Some(Container::Seq(v)) => (0..v.len()).map(|i| i.to_string()).collect(),
            None => Vec::new(),
        }
    }

    /// Materialized value of a container.
    pub fn node_value(&self, id: NodeId) -> Option<Value> {
        self.data(id).map(|_| self.export_node(id))
    }

    pub fn member(&self, id: NodeId, key: &str) -> Option<Value> {
        if key == "length" {
            if let Some(Container::Seq(v)) = self.data(id).map(|d| &d.container) {
                return Some(Value::from(v.len()));
            }
        }
        self.child_slot(id, key).map(|slot| self.export(slot))
    }

    pub fn has_member(&self, id: NodeId, key: &str) -> bool {
        match self.data(id).map(|d| &d.container) {
            Some(Container::Seq(_)) if key == "length" => true,
            Some(_) => self.child_slot(id, key).is_some(),
            None => false,
        }
    }

    /// Container stored directly under `key`, if the member is one.
    pub fn child_node(&self, id: NodeId, key: &str) -> Option<NodeId> {
        match self.child_slot(id, key)? {
            Slot::Node(child) => Some(*child),
            Slot::Scalar(_) => None,
        }
    }

    // ─── Mutation ─────────────────────────────────────────────────────

    /// Apply an operation, returning the previous value at the location it
    /// touched.
    pub fn apply(&mut self, op: &Operation) -> Result<Option<Value>, ReplicantError> {
        match &op.kind {
            OperationKind::Overwrite { new_value } => Ok(self.replace_root(Some(new_value.clone()))),
            OperationKind::Add { prop, new_value } | OperationKind::Update { prop, new_value } => {
                let id = self.resolve(&op.segments()?, "object")?;
                self.set_member(id, prop, new_value.clone())
            }
            OperationKind::Delete { prop } => match self.resolve(&op.segments()?, "object") {
                Ok(id) => self.delete_member(id, prop),
                Err(_) => Ok(None),
            },
            OperationKind::Mutate { mutator, args } => {
                let id = self.resolve(&op.segments()?, "array")?;
                let previous = self.node_value(id);
                self.mutate(id, *mutator, args)?;
                Ok(previous)
            }
        }
    }

    /// Apply an operation, returning what the equivalent direct call returns:
    /// the mutator's result for sequence mutators, otherwise the previous
    /// value (`null` when there was none).
    pub fn perform(&mut self, op: &Operation) -> Result<Value, ReplicantError> {
        match &op.kind {
            OperationKind::Mutate { mutator, args } => {
                let id = self.resolve(&op.segments()?, "array")?;
                self.mutate(id, *mutator, args)
            }
            _ => Ok(self.apply(op)?.unwrap_or(Value::Null)),
        }
    }

    /// Set `key` on a container, returning the previous member.
    pub fn set_member(&mut self, id: NodeId, key: &str, value: Value) -> Result<Option<Value>, ReplicantError> {
        match self.kind(id).ok_or(ReplicantError::StaleHandle)? {
            ContainerKind::Map => {
                let slot = self.import(value, Some(id));
                let previous = self.map_mut(id)?.insert(key.to_string(), slot);
                Ok(previous.map(|s| self.release(s)))
            }
            ContainerKind::Seq if key == "length" => {
                let new_len = array_length(&value)?;
                self.set_length(id, new_len)
            }
            ContainerKind::Seq => {
                let index = parse_index(key).ok_or_else(|| {
                    ReplicantError::invalid_args("set", format!("{key:?} is not an array index"))
                })?;
                if index >= self.max_seq_len {
                    return Err(ReplicantError::invalid_args(
                        "set",
                        format!("index {index} exceeds the maximum array length {}", self.max_seq_len),
                    ));
                }
                let slot = self.import(value, Some(id));
                let seq = self.seq_mut(id)?;
                let old_len = seq.len();
                if index >= old_len {
                    seq.resize_with(index + 1, || Slot::Scalar(Value::Null));
                }
                let previous = std::mem::replace(&mut seq[index], slot);
                let previous = self.release(previous);
                Ok((index < old_len).then_some(previous))
            }
        }
    }

    /// Remove `key` from a container. Sequences keep their length and the
    /// removed element becomes `null`.
    pub fn delete_member(&mut self, id: NodeId, key: &str) -> Result<Option<Value>, ReplicantError> {
        match self.kind(id).ok_or(ReplicantError::StaleHandle)? {
            ContainerKind::Map => {
                let previous = self.map_mut(id)?.remove(key);
                Ok(previous.map(|s| self.release(s)))
            }
            ContainerKind::Seq => {
                let Some(index) = parse_index(key) else {
                    return Ok(None);
                };
                let seq = self.seq_mut(id)?;
                if index >= seq.len() {
                    return Ok(None);
                }
                let previous = std::mem::replace(&mut seq[index], Slot::Scalar(Value::Null));
                Ok(Some(self.release(previous)))
            }
        }
    }

    /// Run a sequence mutator. Returns what the mutator itself returns
    /// (new length, removed element(s), or the sequence).
    pub fn mutate(&mut self, id: NodeId, mutator: ArrayMutator, args: &[Value]) -> Result<Value, ReplicantError> {
        match self.kind(id) {
            None => return Err(ReplicantError::StaleHandle),
            Some(ContainerKind::Map) => {
                return Err(ReplicantError::TypeMismatch {
                    path: self.pointer_of(id).unwrap_or_default(),
                    expected: "array",
                    found: "object",
                })
            }
            Some(ContainerKind::Seq) => {}
        }
        let method = mutator.name();
        let len = self.len(id).unwrap_or(0);

        match mutator {
            ArrayMutator::Push => {
                let slots = self.import_all(args, id);
                let seq = self.seq_mut(id)?;
                seq.extend(slots);
                Ok(Value::from(seq.len()))
            }
            ArrayMutator::Pop => {
                let slot = self.seq_mut(id)?.pop();
                Ok(slot.map(|s| self.release(s)).unwrap_or(Value::Null))
            }
            ArrayMutator::Shift => {
                let seq = self.seq_mut(id)?;
                let slot = (!seq.is_empty()).then(|| seq.remove(0));
                Ok(slot.map(|s| self.release(s)).unwrap_or(Value::Null))
            }
            ArrayMutator::Unshift => {
                let slots = self.import_all(args, id);
                let seq = self.seq_mut(id)?;
                seq.splice(0..0, slots);
                Ok(Value::from(seq.len()))
            }
            ArrayMutator::Splice => {
                let start = relative_index(args.first(), len, 0, method)?;
                let delete_count = match args.len() {
                    0 => 0,
                    1 => len - start,
                    _ => clamp_count(&args[1], len - start, method)?,
                };
                let inserted = self.import_all(args.get(2..).unwrap_or_default(), id);
                let removed: Vec<Slot> = self
                    .seq_mut(id)?
                    .splice(start..start + delete_count, inserted)
                    .collect();
                Ok(Value::Array(removed.into_iter().map(|s| self.release(s)).collect()))
            }
            ArrayMutator::Sort => {
                if args.first().is_some_and(|a| !a.is_null()) {
                    return Err(ReplicantError::invalid_args(
                        method,
                        "comparator functions cannot be replayed",
                    ));
                }
                let slots = std::mem::take(self.seq_mut(id)?);
                // Nulls stand in for undefined elements and sort last.
                let mut keyed: Vec<(Option<Vec<u16>>, Slot)> = slots
                    .into_iter()
                    .map(|slot| {
                        let value = self.export(&slot);
                        let key = (!value.is_null()).then(|| js_string(&value).encode_utf16().collect());
                        (key, slot)
                    })
                    .collect();
                keyed.sort_by(|a, b| match (&a.0, &b.0) {
                    (Some(x), Some(y)) => x.cmp(y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                });
                *self.seq_mut(id)? = keyed.into_iter().map(|(_, slot)| slot).collect();
                Ok(self.export_node(id))
            }
            ArrayMutator::Reverse => {
                self.seq_mut(id)?.reverse();
                Ok(self.export_node(id))
            }
            ArrayMutator::Fill => {
                let value = args.first().cloned().unwrap_or(Value::Null);
                let start = relative_index(args.get(1), len, 0, method)?;
                let end = relative_index(args.get(2), len, len, method)?;
                for index in start..end.max(start) {
                    self.replace_index(id, index, value.clone())?;
                }
                Ok(self.export_node(id))
            }
            ArrayMutator::CopyWithin => {
                let target = relative_index(args.first(), len, 0, method)?;
                let start = relative_index(args.get(1), len, 0, method)?;
                let end = relative_index(args.get(2), len, len, method)?;
                let count = end.saturating_sub(start).min(len - target);
                let copied: Vec<Value> = (start..start + count)
                    .filter_map(|i| self.member(id, &i.to_string()))
                    .collect();
                for (offset, value) in copied.into_iter().enumerate() {
                    self.replace_index(id, target + offset, value)?;
                }
                Ok(self.export_node(id))
            }
        }
    }

    fn replace_index(&mut self, id: NodeId, index: usize, value: Value) -> Result<(), ReplicantError> {
        let slot = self.import(value, Some(id));
        let previous = std::mem::replace(&mut self.seq_mut(id)?[index], slot);
        self.release(previous);
        Ok(())
    }

    fn set_length(&mut self, id: NodeId, new_len: usize) -> Result<Option<Value>, ReplicantError> {
        if new_len > self.max_seq_len {
            return Err(ReplicantError::invalid_args(
                "set",
                format!("length {new_len} exceeds the maximum array length {}", self.max_seq_len),
            ));
        }
        let seq = self.seq_mut(id)?;
        let old_len = seq.len();
        if new_len >= old_len {
            seq.resize_with(new_len, || Slot::Scalar(Value::Null));
        } else {
            let removed: Vec<Slot> = seq.drain(new_len..).collect();
            for slot in removed {
                self.release(slot);
            }
        }
        Ok(Some(Value::from(old_len)))
    }

    // ─── Arena plumbing ───────────────────────────────────────────────

    fn data(&self, id: NodeId) -> Option<&NodeData> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.data.as_ref())
    }

    fn data_mut(&mut self, id: NodeId) -> Option<&mut NodeData> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.data.as_mut())
    }

    fn map_mut(&mut self, id: NodeId) -> Result<&mut BTreeMap<String, Slot>, ReplicantError> {
        match self.data_mut(id).map(|d| &mut d.container) {
            Some(Container::Map(m)) => Ok(m),
            Some(Container::Seq(_)) => Err(ReplicantError::TypeMismatch {
                path: String::new(),
                expected: "object",
                found: "array",
            }),
            None => Err(ReplicantError::StaleHandle),
        }
    }

    fn seq_mut(&mut self, id: NodeId) -> Result<&mut Vec<Slot>, ReplicantError> {
        match self.data_mut(id).map(|d| &mut d.container) {
            Some(Container::Seq(v)) => Ok(v),
            Some(Container::Map(_)) => Err(ReplicantError::TypeMismatch {
                path: String::new(),
                expected: "array",
                found: "object",
            }),
            None => Err(ReplicantError::StaleHandle),
        }
    }

    fn child_slot(&self, id: NodeId, key: &str) -> Option<&Slot> {
        match &self.data(id)?.container {
            Container::Map(m) => m.get(key),
            Container::Seq(v) => parse_index(key).and_then(|i| v.get(i)),
        }
    }

    fn key_in(&self, parent: NodeId, child: NodeId) -> Option<String> {
        let is_child = |slot: &Slot| matches!(slot, Slot::Node(c) if *c == child);
        match &self.data(parent)?.container {
            Container::Map(m) => m.iter().find(|(_, s)| is_child(s)).map(|(k, _)| k.clone()),
            Container::Seq(v) => v.iter().position(is_child).map(|i| i.to_string()),
        }
    }

    fn describe(&self, slot: Option<&Slot>) -> &'static str {
        match slot {
            None => "undefined",
            Some(Slot::Scalar(v)) => type_name(v),
            Some(Slot::Node(id)) => self.kind(*id).map_or("undefined", ContainerKind::name),
        }
    }

    fn allocate(&mut self, parent: Option<NodeId>, container: Container) -> NodeId {
        let data = NodeData { parent, container };
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.data = Some(data);
            NodeId {
                index,
                generation: entry.generation,
            }
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(Entry {
                generation: 0,
                data: Some(data),
            });
            NodeId { index, generation: 0 }
        }
    }

    fn import(&mut self, value: Value, parent: Option<NodeId>) -> Slot {
        match value {
            Value::Object(map) => {
                let id = self.allocate(parent, Container::Map(BTreeMap::new()));
                let children: BTreeMap<String, Slot> = map
                    .into_iter()
                    .map(|(k, v)| (k, self.import(v, Some(id))))
                    .collect();
                if let Some(data) = self.data_mut(id) {
                    data.container = Container::Map(children);
                }
                Slot::Node(id)
            }
            Value::Array(items) => {
                let id = self.allocate(parent, Container::Seq(Vec::new()));
                let children: Vec<Slot> = items
                    .into_iter()
                    .map(|v| self.import(v, Some(id)))
                    .collect();
                if let Some(data) = self.data_mut(id) {
                    data.container = Container::Seq(children);
                }
                Slot::Node(id)
            }
            scalar => Slot::Scalar(scalar),
        }
    }

    fn import_all(&mut self, values: &[Value], parent: NodeId) -> Vec<Slot> {
        values
            .iter()
            .cloned()
            .map(|v| self.import(v, Some(parent)))
            .collect()
    }

    fn export(&self, slot: &Slot) -> Value {
        match slot {
            Slot::Scalar(v) => v.clone(),
            Slot::Node(id) => self.export_node(*id),
        }
    }

    fn export_node(&self, id: NodeId) -> Value {
        match self.data(id).map(|d| &d.container) {
            Some(Container::Map(m)) => Value::Object(
                m.iter()
                    .map(|(k, s)| (k.clone(), self.export(s)))
                    .collect::<Map<String, Value>>(),
            ),
            Some(Container::Seq(v)) => Value::Array(v.iter().map(|s| self.export(s)).collect()),
            None => Value::Null,
        }
    }

    /// Detach a slot from the arena, returning its materialized value.
    fn release(&mut self, slot: Slot) -> Value {
        match slot {
            Slot::Scalar(v) => v,
            Slot::Node(id) => {
                let value = self.export_node(id);
                self.free_node(id);
                value
            }
        }
    }

    fn free_node(&mut self, id: NodeId) {
        let Some(entry) = self.entries.get_mut(id.index as usize) else {
            return;
        };
        if entry.generation != id.generation {
            return;
        }
        let Some(data) = entry.data.take() else {
            return;
        };
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);

        let children: Vec<Slot> = match data.container {
            Container::Map(m) => m.into_values().collect(),
            Container::Seq(v) => v,
        };
        for child in children {
            if let Slot::Node(child) = child {
                self.free_node(child);
            }
        }
    }
}

/// JSON type name of a value.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Canonical array index: digits only, no leading zeros.
fn parse_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

fn array_length(value: &Value) -> Result<usize, ReplicantError> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| ReplicantError::invalid_args("set", "array length must be a non-negative integer"))
}

fn to_integer(value: &Value, method: &str) -> Result<f64, ReplicantError> {
    match value {
        Value::Null => Ok(0.0),
        Value::Number(n) => {
            let n = n.as_f64().unwrap_or(0.0);
            Ok(if n.is_nan() { 0.0 } else { n.trunc() })
        }
        other => Err(ReplicantError::invalid_args(
            method,
            format!("expected a number, got {}", type_name(other)),
        )),
    }
}

/// Resolve a possibly-negative index argument against `len`, clamped to
/// `0..=len`. Absent or `null` arguments take `default`.
fn relative_index(arg: Option<&Value>, len: usize, default: usize, method: &str) -> Result<usize, ReplicantError> {
    let n = match arg {
        None | Some(Value::Null) => return Ok(default),
        Some(value) => to_integer(value, method)?,
    };
    let len_f = len as f64;
    Ok(if n < 0.0 {
        (len_f + n).max(0.0) as usize
    } else {
        n.min(len_f) as usize
    })
}

fn clamp_count(arg: &Value, max: usize, method: &str) -> Result<usize, ReplicantError> {
    let n = to_integer(arg, method)?;
    Ok(n.clamp(0.0, max as f64) as usize)
}

/// Number formatting of `Number.prototype.toString`: shortest round-trip
/// digits, plain notation for decimal exponents in `-7..21`, exponent
/// notation outside it.
fn js_number(f: f64) -> String {
    if f == 0.0 {
        return "0".to_string();
    }
    let scientific = format!("{:e}", f.abs());
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((scientific.as_str(), "0"));
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    // Position of the decimal point relative to the first digit.
    let n = exponent.parse::<i32>().unwrap_or(0) + 1;

    let body = if k <= n && n <= 21 {
        format!("{digits}{}", "0".repeat((n - k) as usize))
    } else if 0 < n && n <= 21 {
        let (int, frac) = digits.split_at(n as usize);
        format!("{int}.{frac}")
    } else if -6 < n && n <= 0 {
        format!("0.{}{digits}", "0".repeat((-n) as usize))
    } else {
        let (head, tail) = digits.split_at(1);
        let sign = if n > 0 { '+' } else { '-' };
        if tail.is_empty() {
            format!("{head}e{sign}{}", (n - 1).abs())
        } else {
            format!("{head}.{tail}e{sign}{}", (n - 1).abs())
        }
    };
    if f < 0.0 {
        format!("-{body}")
    } else {
        body
    }
}

/// String conversion used by the default sort order.
fn js_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                js_number(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|v| if v.is_null() { String::new() } else { js_string(v) })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}
