//! Error types for the batch registry

use thiserror::Error;
use uuid::Uuid;

use crate::domain::{CommitRef, ConflictReason, RecordStatus};

use super::retry::is_retryable_db_error;

/// Errors surfaced by the batch registry
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A digest did not have the expected width
    #[error("invalid input length for {field}: expected {expected} bytes, got {actual}")]
    InvalidInputLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A digest was not valid hex
    #[error("invalid hex for {field}: {reason}")]
    InvalidHex { field: &'static str, reason: String },

    /// Batch creation with no candidates
    #[error("cannot create an empty batch")]
    EmptyBatch,

    /// The same identity was passed twice to one batch
    #[error("duplicate candidate in batch: {0}")]
    DuplicateCandidate(String),

    /// A candidate was not selectable when the snapshot was written
    #[error("candidate {identity} is not eligible: {reason}")]
    CandidateNotEligible { identity: String, reason: String },

    /// Leaf absent from a tree
    #[error("leaf not found in tree: {0}")]
    LeafNotFound(String),

    /// Leaf occurs more than once in a tree
    #[error("leaf {leaf} is ambiguous: occurs at positions {positions:?}")]
    AmbiguousLeaf { leaf: String, positions: Vec<usize> },

    /// Proof requested for a position outside the tree
    #[error("leaf index {index} out of range for tree with {leaf_count} leaves")]
    LeafIndexOutOfRange { index: usize, leaf_count: usize },

    /// The ledger refused the commit; the snapshot has been abandoned
    #[error("ledger rejected submission for snapshot {snapshot_id}: {reason}")]
    SubmissionRejected { snapshot_id: Uuid, reason: String },

    /// The commit's fate is unknown after all attempts; the snapshot stays open
    #[error("ledger confirmation timed out for snapshot {snapshot_id}")]
    Timeout { snapshot_id: Uuid },

    /// The commit is known to the ledger but not yet confirmed
    #[error("submission for snapshot {snapshot_id} is pending on the ledger")]
    SubmissionPending { snapshot_id: Uuid },

    /// Ledger collaborator error outside the submission path
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A commit event does not match local state
    #[error("reconciliation conflict for batch {batch_id} ({reason}): {detail}")]
    ReconciliationConflict {
        batch_id: u64,
        snapshot_id: Option<Uuid>,
        reason: ConflictReason,
        detail: String,
    },

    /// Persisted batch data is inconsistent with its stored root
    #[error("integrity mismatch for batch {batch_id}: {detail}")]
    IntegrityMismatch { batch_id: u64, detail: String },

    /// Status change outside the lifecycle state machine
    #[error("invalid status transition for {identity}: {from} -> {to}")]
    InvalidStatusTransition {
        identity: String,
        from: RecordStatus,
        to: RecordStatus,
    },

    /// Record not found
    #[error("record not found: {0}")]
    RecordNotFound(String),

    /// Snapshot not found
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(Uuid),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Transient failures that may succeed unchanged on a later attempt.
    ///
    /// Integrity and conflict errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Database(e) => is_retryable_db_error(e),
            RegistryError::Ledger(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn conflict(
        batch_id: u64,
        snapshot_id: Option<Uuid>,
        reason: ConflictReason,
        detail: impl Into<String>,
    ) -> Self {
        RegistryError::ReconciliationConflict {
            batch_id,
            snapshot_id,
            reason,
            detail: detail.into(),
        }
    }
}

/// Errors returned by ledger implementations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The ledger refused the commit (fatal for this submission)
    #[error("submission rejected: {0}")]
    SubmissionRejected(String),

    /// Confirmation was not observed in time; the outcome must be queried
    #[error("confirmation timed out")]
    Timeout { commit_ref: Option<CommitRef> },

    /// Network or RPC failure
    #[error("ledger transport error: {0}")]
    Transport(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transport(_) | LedgerError::Timeout { .. })
    }
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
