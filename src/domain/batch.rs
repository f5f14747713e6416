//! Batch, leaf and snapshot records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ledger::{BatchMetadata, ChainPosition, CommitEvent, CommitRef, CommitRequest};
use super::types::{hash256_hex, EligibleRecord, Hash256};

/// A batch confirmed on the ledger and reconciled locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Identifier assigned by the ledger
    pub batch_id: u64,

    #[serde(with = "hash256_hex")]
    pub merkle_root: Hash256,

    pub commit_ref: CommitRef,
    pub record_count: u32,
    pub region_code: u16,
    pub snapshot_id: Option<Uuid>,
    pub position: ChainPosition,
    pub created_at: DateTime<Utc>,
}

/// Membership of one record in one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafRecord {
    #[serde(with = "hash256_hex")]
    pub identity_hash: Hash256,

    #[serde(with = "hash256_hex")]
    pub leaf_hash: Hash256,

    pub batch_id: u64,

    /// Position in the batch, contiguous from 0
    pub offset: u32,
}

/// State of a batch snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SnapshotState {
    /// Persisted, submission in flight or unresolved
    Open,
    /// Reconciled into the given batch
    Confirmed { batch_id: u64 },
    /// Rejected or never landed; members are selectable again
    Abandoned,
}

impl SnapshotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotState::Open => "open",
            SnapshotState::Confirmed { .. } => "confirmed",
            SnapshotState::Abandoned => "abandoned",
        }
    }

    pub fn batch_id(&self) -> Option<u64> {
        match self {
            SnapshotState::Confirmed { batch_id } => Some(*batch_id),
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotState::Confirmed { batch_id } => write!(f, "confirmed({batch_id})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One member of a snapshot, with the exact field values that were hashed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMember {
    pub offset: u32,

    #[serde(with = "hash256_hex")]
    pub identity_hash: Hash256,

    #[serde(with = "hash256_hex")]
    pub file_hash: Hash256,

    pub eligible_since: u64,
    pub region_code: u16,

    #[serde(with = "hash256_hex")]
    pub leaf_hash: Hash256,
}

impl SnapshotMember {
    pub fn from_record(offset: u32, record: &EligibleRecord) -> Self {
        Self {
            offset,
            identity_hash: record.identity_hash,
            file_hash: record.file_hash,
            eligible_since: record.eligible_since,
            region_code: record.region_code,
            leaf_hash: record.leaf_hash(),
        }
    }

    /// Leaf hash recomputed from the member's fields
    pub fn recompute_leaf(&self) -> Hash256 {
        crate::crypto::compute_leaf_hash(
            &self.identity_hash,
            &self.file_hash,
            self.eligible_since,
            self.region_code,
        )
    }
}

/// The exact ordered candidate set of one submission, persisted before the
/// root is sent to the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub snapshot_id: Uuid,
    pub label: String,
    pub region_code: u16,

    /// Root the coordinator computed over `members`
    #[serde(with = "hash256_hex")]
    pub merkle_root: Hash256,

    pub members: Vec<SnapshotMember>,
    pub state: SnapshotState,
    pub created_at: DateTime<Utc>,
}

impl BatchSnapshot {
    pub fn record_count(&self) -> u32 {
        self.members.len() as u32
    }

    pub fn is_open(&self) -> bool {
        self.state == SnapshotState::Open
    }

    pub fn metadata(&self) -> BatchMetadata {
        BatchMetadata::new(self.snapshot_id, self.label.clone())
    }

    pub fn commit_request(&self) -> CommitRequest {
        CommitRequest {
            snapshot_id: self.snapshot_id,
            merkle_root: self.merkle_root,
            record_count: self.record_count(),
            region_code: self.region_code,
            metadata: self.metadata().encode(),
        }
    }
}

/// Everything one reconciliation writes, applied in a single transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchWrite {
    pub batch: BatchRecord,
    pub leaves: Vec<LeafRecord>,
    pub snapshot_id: Uuid,
}

/// Result of applying a `BatchWrite`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// A batch with this id already existed; nothing was written
    AlreadyApplied,
}

/// Why a commit event could not be reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    InvalidMetadata,
    UnknownSnapshot,
    SnapshotConsumed,
    SnapshotCorrupt,
    CountMismatch,
    RootMismatch,
    RecordAlreadyBatched,
    RecordNotEligible,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::InvalidMetadata => "invalid_metadata",
            ConflictReason::UnknownSnapshot => "unknown_snapshot",
            ConflictReason::SnapshotConsumed => "snapshot_consumed",
            ConflictReason::SnapshotCorrupt => "snapshot_corrupt",
            ConflictReason::CountMismatch => "count_mismatch",
            ConflictReason::RootMismatch => "root_mismatch",
            ConflictReason::RecordAlreadyBatched => "record_already_batched",
            ConflictReason::RecordNotEligible => "record_not_eligible",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid_metadata" => Ok(ConflictReason::InvalidMetadata),
            "unknown_snapshot" => Ok(ConflictReason::UnknownSnapshot),
            "snapshot_consumed" => Ok(ConflictReason::SnapshotConsumed),
            "snapshot_corrupt" => Ok(ConflictReason::SnapshotCorrupt),
            "count_mismatch" => Ok(ConflictReason::CountMismatch),
            "root_mismatch" => Ok(ConflictReason::RootMismatch),
            "record_already_batched" => Ok(ConflictReason::RecordAlreadyBatched),
            "record_not_eligible" => Ok(ConflictReason::RecordNotEligible),
            other => Err(format!("unknown conflict reason: {other}")),
        }
    }
}

/// Durable record of a commit event rejected during reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub batch_id: u64,
    pub snapshot_id: Option<Uuid>,
    pub reason: ConflictReason,
    pub detail: String,
    pub commit_ref: CommitRef,
    pub position: ChainPosition,
    pub created_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn from_event(
        event: &CommitEvent,
        snapshot_id: Option<Uuid>,
        reason: ConflictReason,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            batch_id: event.batch_id,
            snapshot_id,
            reason,
            detail: detail.into(),
            commit_ref: event.commit_ref.clone(),
            position: event.position,
            created_at: Utc::now(),
        }
    }
}

/// Last fully processed ledger position of a named watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherCheckpoint {
    pub name: String,
    pub position: ChainPosition,
    pub updated_at: DateTime<Utc>,
}

impl WatcherCheckpoint {
    pub fn new(name: impl Into<String>, position: ChainPosition) -> Self {
        Self {
            name: name.into(),
            position,
            updated_at: Utc::now(),
        }
    }
}

/// Selectable backlog summary, used by the batch worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EligibleBacklog {
    pub count: u64,
    pub oldest_eligible_since: Option<u64>,
}
