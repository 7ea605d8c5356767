//! Operations: the unit of incremental change.
//!
//! Wire shape (JSON):
//! ```text
//! { "path": "/players", "method": "push",   "args": { "mutatorArgs": ["ann"] } }
//! { "path": "/",        "method": "update", "args": { "prop": "home", "newValue": 3 } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::pointer::{self, PointerError};

/// In-place sequence mutators, named after the array methods they mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayMutator {
    Push,
    Pop,
    Shift,
    Unshift,
    Splice,
    Sort,
    Reverse,
    Fill,
    CopyWithin,
}

impl ArrayMutator {
    pub const ALL: [ArrayMutator; 9] = [
        ArrayMutator::Push,
        ArrayMutator::Pop,
        ArrayMutator::Shift,
        ArrayMutator::Unshift,
        ArrayMutator::Splice,
        ArrayMutator::Sort,
        ArrayMutator::Reverse,
        ArrayMutator::Fill,
        ArrayMutator::CopyWithin,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ArrayMutator::Push => "push",
            ArrayMutator::Pop => "pop",
            ArrayMutator::Shift => "shift",
            ArrayMutator::Unshift => "unshift",
            ArrayMutator::Splice => "splice",
            ArrayMutator::Sort => "sort",
            ArrayMutator::Reverse => "reverse",
            ArrayMutator::Fill => "fill",
            ArrayMutator::CopyWithin => "copyWithin",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }
}

impl std::fmt::Display for ArrayMutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What an operation does at its path.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    /// Replace the whole value (path is always the root).
    Overwrite { new_value: Value },
    /// Set a member that did not exist before.
    Add { prop: String, new_value: Value },
    /// Set a member that already existed.
    Update { prop: String, new_value: Value },
    /// Remove a member. Removing an absent member is not an error.
    Delete { prop: String },
    /// Run a sequence mutator with its exact argument list.
    Mutate { mutator: ArrayMutator, args: Vec<Value> },
}

/// A single described mutation of a replicant's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOperation", into = "RawOperation")]
pub struct Operation {
    /// Encoded pointer to the container the operation targets.
    pub path: String,
    pub kind: OperationKind,
}

impl Operation {
    pub fn overwrite(new_value: Value) -> Self {
        Self {
            path: pointer::ROOT.to_string(),
            kind: OperationKind::Overwrite { new_value },
        }
    }

    pub fn add(path: impl Into<String>, prop: impl Into<String>, new_value: Value) -> Self {
        Self {
            path: path.into(),
            kind: OperationKind::Add { prop: prop.into(), new_value },
        }
    }

    pub fn update(path: impl Into<String>, prop: impl Into<String>, new_value: Value) -> Self {
        Self {
            path: path.into(),
            kind: OperationKind::Update { prop: prop.into(), new_value },
        }
    }

    pub fn delete(path: impl Into<String>, prop: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: OperationKind::Delete { prop: prop.into() },
        }
    }

    pub fn mutate(path: impl Into<String>, mutator: ArrayMutator, args: Vec<Value>) -> Self {
        Self {
            path: path.into(),
            kind: OperationKind::Mutate { mutator, args },
        }
    }

    /// Method name as it appears on the wire.
    pub fn method(&self) -> &'static str {
        match &self.kind {
            OperationKind::Overwrite { .. } => "overwrite",
            OperationKind::Add { .. } => "add",
            OperationKind::Update { .. } => "update",
            OperationKind::Delete { .. } => "delete",
            OperationKind::Mutate { mutator, .. } => mutator.name(),
        }
    }

    /// Decoded path segments.
    pub fn segments(&self) -> Result<Vec<String>, PointerError> {
        pointer::decode(&self.path)
    }
}

/// An operation whose JSON form could not be understood.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedOperation {
    #[error("unknown operation method {0:?}")]
    UnknownMethod(String),
    #[error("operation {method:?} is missing argument {arg:?}")]
    MissingArgument { method: String, arg: &'static str },
    #[error("operation {method:?} has a non-{expected} {arg:?} argument")]
    InvalidArgument {
        method: String,
        arg: &'static str,
        expected: &'static str,
    },
}

#[derive(Serialize, Deserialize)]
struct RawOperation {
    path: String,
    method: String,
    #[serde(default)]
    args: Map<String, Value>,
}

impl From<Operation> for RawOperation {
    fn from(op: Operation) -> Self {
        let method = op.method().to_string();
        let mut args = Map::new();
        match op.kind {
            OperationKind::Overwrite { new_value } => {
                args.insert("newValue".into(), new_value);
            }
            OperationKind::Add { prop, new_value } | OperationKind::Update { prop, new_value } => {
                args.insert("prop".into(), Value::String(prop));
                args.insert("newValue".into(), new_value);
            }
            OperationKind::Delete { prop } => {
                args.insert("prop".into(), Value::String(prop));
            }
            OperationKind::Mutate { args: mutator_args, .. } => {
                args.insert("mutatorArgs".into(), Value::Array(mutator_args));
            }
        }
        RawOperation {
            path: op.path,
            method,
            args,
        }
    }
}

impl TryFrom<RawOperation> for Operation {
    type Error = MalformedOperation;

    fn try_from(raw: RawOperation) -> Result<Self, Self::Error> {
        let RawOperation { path, method, mut args } = raw;

        let kind = match method.as_str() {
            "overwrite" => OperationKind::Overwrite {
                new_value: take_arg(&mut args, &method, "newValue")?,
            },
            "add" | "update" | "delete" => {
                let prop = match take_arg(&mut args, &method, "prop")? {
                    Value::String(s) => s,
                    // Sequence indices may arrive as numbers.
                    Value::Number(n) => n.to_string(),
                    _ => {
                        return Err(MalformedOperation::InvalidArgument {
                            method: method.clone(),
                            arg: "prop",
                            expected: "string",
                        })
                    }
                };
                if method == "delete" {
                    OperationKind::Delete { prop }
                } else {
                    let new_value = take_arg(&mut args, &method, "newValue")?;
                    if method == "add" {
                        OperationKind::Add { prop, new_value }
                    } else {
                        OperationKind::Update { prop, new_value }
                    }
                }
            }
            other => {
                let mutator = ArrayMutator::from_name(other)
                    .ok_or_else(|| MalformedOperation::UnknownMethod(other.to_string()))?;
                let mutator_args = match args.remove("mutatorArgs") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items,
                    Some(_) => {
                        return Err(MalformedOperation::InvalidArgument {
                            method: method.clone(),
                            arg: "mutatorArgs",
                            expected: "array",
                        })
                    }
                };
                OperationKind::Mutate {
                    mutator,
                    args: mutator_args,
                }
            }
        };

        Ok(Operation { path, kind })
    }
}

/// Deserialize a value field where a present `null` must stay distinct from
/// an absent field. Pair with `#[serde(default)]`.
pub fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn take_arg(
    args: &mut Map<String, Value>,
    method: &str,
    arg: &'static str,
) -> Result<Value, MalformedOperation> {
    args.remove(arg).ok_or_else(|| MalformedOperation::MissingArgument {
        method: method.to_string(),
        arg,
    })
}
