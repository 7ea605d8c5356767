use crate::pointer::PointerError;
use crate::schema::{SchemaError, ValidationError};

/// Errors raised while declaring, mutating or replaying a replicant.
#[derive(Debug, thiserror::Error)]
pub enum ReplicantError {
    /// A candidate value failed the replicant's schema. Nothing was mutated.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A container owned by one replicant was assigned into another.
    #[error("value at {path:?} belongs to replicant {owner} and cannot be assigned into {target}")]
    OwnershipViolation {
        path: String,
        owner: String,
        target: String,
    },

    /// An operation expected a container of one kind and found something else.
    #[error("expected {expected} at {path:?} but found {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },

    /// A proxy outlived the container it pointed at.
    #[error("handle no longer refers to a live container")]
    StaleHandle,

    #[error(transparent)]
    Pointer(#[from] PointerError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The authority refused a declaration or proposal.
    #[error("rejected by authority: {0}")]
    ProtocolRejection(String),
}

impl ReplicantError {
    pub(crate) fn invalid_args(method: impl Into<String>, reason: impl Into<String>) -> Self {
        ReplicantError::InvalidArguments {
            method: method.into(),
            reason: reason.into(),
        }
    }
}
