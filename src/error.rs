// Error taxonomy for tree, bucket, iteration and persistence operations
// Every core operation returns `Result<T, BTreeError>`; the outer layers
// (config, builders, wrappers) wrap these into anyhow errors.

use std::collections::TryReserveError;
use std::fmt;

use crate::state::Oid;

/// Result alias used throughout the core engine
pub type Result<T, E = BTreeError> = std::result::Result<T, E>;

/// Reason codes reported by the three-way bucket merge.
///
/// The numeric values are the ones stored by existing conflict logs, so they
/// are part of the public contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    NextChanged = 0,
    ValueChangedInBoth = 1,
    DeleteVsChangeNew = 2,
    DeleteVsChangeCommitted = 3,
    DuelingInsert = 4,
    BothDeleted = 5,
    DuelingInsertTail = 6,
    DeleteAndChangeCommittedTail = 7,
    DeleteAndChangeNewTail = 8,
    DuelingDeletes = 9,
    EmptyResult = 10,
    NonDegenerateTree = 11,
    EmptyInput = 12,
    FirstItemDeleted = 13,
}

impl ConflictReason {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConflictReason::NextChanged => "conflicting changes to the bucket chain",
            ConflictReason::ValueChangedInBoth => "conflicting changes to a value",
            ConflictReason::DeleteVsChangeNew | ConflictReason::DeleteVsChangeCommitted => {
                "a key was deleted in one transaction and changed in the other"
            }
            ConflictReason::DuelingInsert | ConflictReason::DuelingInsertTail => {
                "the same key was inserted in both transactions"
            }
            ConflictReason::BothDeleted => "the same key was deleted in both transactions",
            ConflictReason::DeleteAndChangeCommittedTail
            | ConflictReason::DeleteAndChangeNewTail => "conflicting deletes and changes",
            ConflictReason::DuelingDeletes => "conflicting deletes",
            ConflictReason::EmptyResult => "the merged bucket would be empty",
            ConflictReason::NonDegenerateTree => "the tree has more than one bucket",
            ConflictReason::EmptyInput => "a conflicting state is empty",
            ConflictReason::FirstItemDeleted => "the first item of the bucket was deleted",
        };
        write!(f, "{} (reason {})", text, self.code())
    }
}

/// Positions of the three merge cursors when a conflict was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictPositions {
    pub old: isize,
    pub committed: isize,
    pub new: isize,
}

impl ConflictPositions {
    pub const UNKNOWN: ConflictPositions = ConflictPositions {
        old: -1,
        committed: -1,
        new: -1,
    };
}

/// Errors raised by the B+Tree engine
#[derive(Debug, thiserror::Error)]
pub enum BTreeError {
    #[error("Key comparison failed: {0}")]
    KeyComparison(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Structural invariant violated: {0}")]
    StructuralInvariant(String),

    #[error("Concurrent modification: the bucket being iterated changed size")]
    ConcurrentModification,

    #[error("Out of memory while resizing a node")]
    OutOfMemory,

    #[error("Index out of range: {0}")]
    IndexOutOfRange(isize),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("empty tree")]
    Empty,

    #[error("no key satisfies the conditions")]
    NoKeyInRange,

    #[error("Failed to load object {oid}: {reason}")]
    Load { oid: Oid, reason: String },

    #[error("Conflict: {reason}")]
    Conflict {
        reason: ConflictReason,
        positions: ConflictPositions,
    },
}

impl BTreeError {
    pub(crate) fn not_found(key: &impl fmt::Debug) -> Self {
        BTreeError::KeyNotFound(format!("{key:?}"))
    }

    pub(crate) fn bucket_changed() -> Self {
        BTreeError::ConcurrentModification
    }

    pub(crate) fn conflict(reason: ConflictReason, positions: ConflictPositions) -> Self {
        BTreeError::Conflict { reason, positions }
    }

    /// True for the exact "key not found" kind; used by the convenience
    /// wrappers that swallow a missing key and nothing else.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, BTreeError::KeyNotFound(_))
    }

    pub fn is_comparison(&self) -> bool {
        matches!(self, BTreeError::KeyComparison(_))
    }

    /// True when an iteration detected that its bucket changed size mid-flight
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, BTreeError::ConcurrentModification)
    }
}

impl From<TryReserveError> for BTreeError {
    fn from(_: TryReserveError) -> Self {
        BTreeError::OutOfMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_reason_codes_are_stable() {
        assert_eq!(ConflictReason::NextChanged.code(), 0);
        assert_eq!(ConflictReason::NonDegenerateTree.code(), 11);
        assert_eq!(ConflictReason::FirstItemDeleted.code(), 13);
        let err = BTreeError::conflict(ConflictReason::DuelingInsert, ConflictPositions::UNKNOWN);
        assert!(err.to_string().contains("reason 4"));
    }

    #[test]
    fn test_error_kind_predicates() {
        assert!(BTreeError::not_found(&3).is_key_not_found());
        assert!(!BTreeError::KeyComparison("x".into()).is_key_not_found());
        assert!(BTreeError::bucket_changed().is_concurrent_modification());
        assert!(!BTreeError::StructuralInvariant("other".into()).is_concurrent_modification());
        // the message alone does not make an error a concurrent modification
        let lookalike = BTreeError::StructuralInvariant(BTreeError::bucket_changed().to_string());
        assert!(!lookalike.is_concurrent_modification());
        assert_eq!(BTreeError::Empty.to_string(), "empty tree");
    }
}
