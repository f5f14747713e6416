//! Collaborator traits: the ledger and the record store

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use uuid::Uuid;

use crate::domain::{
    ApplyOutcome, BatchRecord, BatchSnapshot, BatchWrite, ChainPosition, CommitPage,
    CommitReceipt, CommitRequest, ConflictRecord, EligibleBacklog, EligibleRecord, Hash256,
    LeafRecord, RecordStatus, SnapshotState, SubmissionOutcome, WatcherCheckpoint,
};

use super::{LedgerError, Result};

/// External append-only commit log.
///
/// The handle is constructed explicitly and shared as `Arc<dyn Ledger>`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Submit a commit and suspend until it is confirmed.
    ///
    /// `SubmissionRejected` is fatal for this request; `Timeout` and
    /// `Transport` leave the outcome unknown.
    async fn submit_commit(
        &self,
        request: &CommitRequest,
    ) -> std::result::Result<CommitReceipt, LedgerError>;

    /// Determine what became of an earlier submission of `request`
    async fn submission_outcome(
        &self,
        request: &CommitRequest,
    ) -> std::result::Result<SubmissionOutcome, LedgerError>;

    /// Confirmed commit events strictly after `after`, in ledger order,
    /// at most `limit` of them
    async fn fetch_commits(
        &self,
        after: Option<ChainPosition>,
        limit: usize,
    ) -> std::result::Result<CommitPage, LedgerError>;
}

/// Durable local state: records, snapshots, batches, leaves, checkpoints.
///
/// Invariant: batch, leaves, status flips, snapshot state and checkpoint of
/// one reconciliation are written in a single transaction.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Insert a new record
    async fn insert_record(&self, record: &EligibleRecord) -> Result<()>;

    async fn get_record(&self, identity_hash: &Hash256) -> Result<Option<EligibleRecord>>;

    /// Move a record along the lifecycle, returning the previous status.
    ///
    /// ELIGIBLE -> BATCHED is reserved for `apply_batch`.
    async fn transition_status(
        &self,
        identity_hash: &Hash256,
        to: RecordStatus,
    ) -> Result<RecordStatus>;

    /// ELIGIBLE records not held by a leaf or an open snapshot, ordered by
    /// (eligible_since, identity_hash)
    async fn select_eligible(&self, limit: usize) -> Result<Vec<EligibleRecord>>;

    async fn eligible_backlog(&self) -> Result<EligibleBacklog>;

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Persist an OPEN snapshot and its members atomically.
    ///
    /// Fails with `CandidateNotEligible` if any member is not selectable.
    async fn create_snapshot(&self, snapshot: &BatchSnapshot) -> Result<()>;

    async fn get_snapshot(&self, snapshot_id: Uuid) -> Result<Option<BatchSnapshot>>;

    /// Move an OPEN snapshot to ABANDONED
    async fn abandon_snapshot(&self, snapshot_id: Uuid) -> Result<()>;

    async fn list_snapshots(&self, state: Option<SnapshotState>) -> Result<Vec<BatchSnapshot>>;

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Apply one reconciled batch, advancing `checkpoint` in the same
    /// transaction when given.
    async fn apply_batch(
        &self,
        write: &BatchWrite,
        checkpoint: Option<WatcherCheckpoint>,
    ) -> Result<ApplyOutcome>;

    /// Record a conflict, advancing `checkpoint` in the same transaction
    /// when given
    async fn record_conflict(
        &self,
        conflict: &ConflictRecord,
        checkpoint: Option<WatcherCheckpoint>,
    ) -> Result<()>;

    async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>>;

    /// Advance a checkpoint; positions never move backwards
    async fn advance_checkpoint(&self, checkpoint: &WatcherCheckpoint) -> Result<()>;

    async fn get_checkpoint(&self, name: &str) -> Result<Option<WatcherCheckpoint>>;

    // ------------------------------------------------------------------
    // Batches and leaves
    // ------------------------------------------------------------------

    async fn get_batch(&self, batch_id: u64) -> Result<Option<BatchRecord>>;

    async fn get_leaf(&self, identity_hash: &Hash256) -> Result<Option<LeafRecord>>;

    /// Leaves of one batch ordered by offset
    async fn get_batch_leaves(&self, batch_id: u64) -> Result<Vec<LeafRecord>>;
}
