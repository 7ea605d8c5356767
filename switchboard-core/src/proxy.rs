//! Handles for mutating containers inside a replicant.
//!
//! A [`Proxy`] names one container of one replicant. Writing through it
//! produces exactly the operation a peer needs to replay the write:
//!
//! ```text
//!   scores.root().set("home", 3)          ─►  update  /      {prop: "home", newValue: 3}
//!   scores.proxy("/teams")?.push(team)    ─►  push    /teams {mutatorArgs: [team]}
//!   scores.root().delete("away")          ─►  delete  /      {prop: "away"}
//! ```
//!
//! A proxy keeps pointing at the same container when that container moves
//! (e.g. after `shift`), and reports [`ReplicantError::StaleHandle`] once the
//! container has been removed.

use std::fmt;

use serde_json::Value;
use uuid::Uuid;

use crate::error::ReplicantError;
use crate::operation::ArrayMutator;
use crate::replicant::{Replicant, ReplicantKey, Write};
use crate::tree::{ContainerKind, NodeId};

/// A container reference that can be assigned into a replicant. Only the
/// replicant that owns the container accepts it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeHandle {
    pub(crate) owner: Uuid,
    pub(crate) key: ReplicantKey,
    pub(crate) node: NodeId,
    pub(crate) path: String,
}

impl NodeHandle {
    pub fn owner(&self) -> &ReplicantKey {
        &self.key
    }

    /// Path of the container when the handle was taken.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Right-hand side of [`Proxy::set`].
#[derive(Debug, Clone, PartialEq)]
pub enum Assigned {
    Value(Value),
    Handle(NodeHandle),
}

impl From<Value> for Assigned {
    fn from(value: Value) -> Self {
        Assigned::Value(value)
    }
}

impl From<NodeHandle> for Assigned {
    fn from(handle: NodeHandle) -> Self {
        Assigned::Handle(handle)
    }
}

impl From<&Proxy> for Assigned {
    fn from(proxy: &Proxy) -> Self {
        Assigned::Handle(proxy.handle())
    }
}

macro_rules! assign_scalar {
    ($($t:ty),*) => {
        $(impl From<$t> for Assigned {
            fn from(value: $t) -> Self {
                Assigned::Value(Value::from(value))
            }
        })*
    };
}

assign_scalar!(bool, i32, i64, u32, u64, f64, &str, String);

/// A live view of one container.
#[derive(Clone)]
pub struct Proxy {
    replicant: Replicant,
    node: NodeId,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("replicant", self.replicant.key())
            .field("path", &self.path().ok())
            .finish()
    }
}

impl Proxy {
    pub(crate) fn new(replicant: Replicant, node: NodeId) -> Self {
        Self { replicant, node }
    }

    pub fn replicant(&self) -> &Replicant {
        &self.replicant
    }

    /// Current encoded path of the container.
    pub fn path(&self) -> Result<String, ReplicantError> {
        self.replicant
            .read(|tree| tree.pointer_of(self.node))
            .ok_or(ReplicantError::StaleHandle)
    }

    pub fn is_alive(&self) -> bool {
        self.replicant.read(|tree| tree.path_of(self.node).is_some())
    }

    pub fn kind(&self) -> Option<ContainerKind> {
        self.replicant.read(|tree| tree.kind(self.node))
    }

    pub fn value(&self) -> Result<Value, ReplicantError> {
        self.replicant
            .read(|tree| tree.node_value(self.node))
            .ok_or(ReplicantError::StaleHandle)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.replicant.read(|tree| tree.member(self.node, key))
    }

    pub fn has(&self, key: &str) -> bool {
        self.replicant.read(|tree| tree.has_member(self.node, key))
    }

    pub fn len(&self) -> usize {
        self.replicant.read(|tree| tree.len(self.node)).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.replicant.read(|tree| tree.keys(self.node))
    }

    /// Proxy for a nested container.
    pub fn child(&self, key: &str) -> Option<Proxy> {
        let node = self.replicant.read(|tree| tree.child_node(self.node, key))?;
        Some(Proxy::new(self.replicant.clone(), node))
    }

    /// Reference to this container, for assigning elsewhere.
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            owner: self.replicant.id(),
            key: self.replicant.key().clone(),
            node: self.node,
            path: self.path().unwrap_or_default(),
        }
    }

    /// Assign a member. On a sequence `key` is an index or `"length"`.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Assigned>) -> Result<(), ReplicantError> {
        self.replicant
            .write(self.node, Write::Set(key.into(), value.into()))
            .map(drop)
    }

    /// Remove a member. Removing an absent member succeeds without emitting
    /// anything.
    pub fn delete(&self, key: &str) -> Result<(), ReplicantError> {
        self.replicant
            .write(self.node, Write::Delete(key.to_string()))
            .map(drop)
    }

    /// Run a sequence mutator with its raw argument list.
    pub fn mutate(&self, mutator: ArrayMutator, args: Vec<Value>) -> Result<Value, ReplicantError> {
        self.replicant.write(self.node, Write::Mutate(mutator, args))
    }

    /// Append one element, returning the new length.
    pub fn push(&self, item: Value) -> Result<usize, ReplicantError> {
        self.push_all(vec![item])
    }

    pub fn push_all(&self, items: Vec<Value>) -> Result<usize, ReplicantError> {
        self.mutate(ArrayMutator::Push, items).map(as_len)
    }

    /// Remove the last element (`null` when empty).
    pub fn pop(&self) -> Result<Value, ReplicantError> {
        self.mutate(ArrayMutator::Pop, Vec::new())
    }

    /// Remove the first element (`null` when empty).
    pub fn shift(&self) -> Result<Value, ReplicantError> {
        self.mutate(ArrayMutator::Shift, Vec::new())
    }

    pub fn unshift(&self, items: Vec<Value>) -> Result<usize, ReplicantError> {
        self.mutate(ArrayMutator::Unshift, items).map(as_len)
    }

    /// Remove `delete_count` elements at `start` (negative counts from the
    /// end) and insert `items` there. Returns the removed elements.
    pub fn splice(&self, start: i64, delete_count: usize, items: Vec<Value>) -> Result<Vec<Value>, ReplicantError> {
        let mut args = vec![Value::from(start), Value::from(delete_count)];
        args.extend(items);
        match self.mutate(ArrayMutator::Splice, args)? {
            Value::Array(removed) => Ok(removed),
            _ => Ok(Vec::new()),
        }
    }

    /// Sort in default (string) order.
    pub fn sort(&self) -> Result<(), ReplicantError> {
        self.mutate(ArrayMutator::Sort, Vec::new()).map(drop)
    }

    pub fn reverse(&self) -> Result<(), ReplicantError> {
        self.mutate(ArrayMutator::Reverse, Vec::new()).map(drop)
    }

    pub fn fill(&self, value: Value, start: Option<i64>, end: Option<i64>) -> Result<(), ReplicantError> {
        let mut args = vec![value];
        match (start, end) {
            (None, None) => {}
            (start, None) => args.push(Value::from(start.unwrap_or(0))),
            (start, Some(end)) => {
                args.push(Value::from(start.unwrap_or(0)));
                args.push(Value::from(end));
            }
        }
        self.mutate(ArrayMutator::Fill, args).map(drop)
    }

    pub fn copy_within(&self, target: i64, start: i64, end: Option<i64>) -> Result<(), ReplicantError> {
        let mut args = vec![Value::from(target), Value::from(start)];
        if let Some(end) = end {
            args.push(Value::from(end));
        }
        self.mutate(ArrayMutator::CopyWithin, args).map(drop)
    }
}

fn as_len(value: Value) -> usize {
    value.as_u64().unwrap_or(0) as usize
}
