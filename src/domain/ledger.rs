//! Ledger-facing types: commit requests, receipts and events

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::types::{hash256_hex, Hash256};
use crate::crypto::u32_be;

/// Domain prefix of the metadata bytes attached to every commit
pub const METADATA_DOMAIN: &[u8] = b"BATCH_META_V1";

/// Position of an event in the ledger's total order.
///
/// Ordered lexicographically by (block number, log index).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChainPosition {
    pub block_number: u64,
    pub log_index: u64,
}

impl ChainPosition {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }

    /// Position that sorts after every event of `block_number`
    pub fn end_of_block(block_number: u64) -> Self {
        Self::new(block_number, u64::MAX)
    }

    /// Resume position for a scan that must include all of `block_number`
    pub fn before_block(block_number: u64) -> Option<Self> {
        block_number.checked_sub(1).map(Self::end_of_block)
    }
}

impl fmt::Display for ChainPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

/// Opaque ledger transaction reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitRef(pub String);

impl CommitRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata bytes attached to a commit.
///
/// Layout: `BATCH_META_V1 || snapshot_id (16) || u32_be(len(label)) || label`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMetadata {
    pub snapshot_id: Uuid,
    pub label: String,
}

impl BatchMetadata {
    pub fn new(snapshot_id: Uuid, label: impl Into<String>) -> Self {
        Self {
            snapshot_id,
            label: label.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let label = self.label.as_bytes();
        let mut out = Vec::with_capacity(METADATA_DOMAIN.len() + 16 + 4 + label.len());
        out.extend_from_slice(METADATA_DOMAIN);
        out.extend_from_slice(self.snapshot_id.as_bytes());
        out.extend_from_slice(&u32_be(label.len() as u32));
        out.extend_from_slice(label);
        out
    }

    /// Decode metadata bytes; `None` on any other layout
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let rest = bytes.strip_prefix(METADATA_DOMAIN)?;
        if rest.len() < 20 {
            return None;
        }
        let (id, rest) = rest.split_at(16);
        let (len, label) = rest.split_at(4);
        let len = u32::from_be_bytes(len.try_into().ok()?) as usize;
        if label.len() != len {
            return None;
        }

        Some(Self {
            snapshot_id: Uuid::from_slice(id).ok()?,
            label: String::from_utf8(label.to_vec()).ok()?,
        })
    }
}

/// A request to commit one batch root to the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    /// Local snapshot this commit belongs to (also encoded in `metadata`)
    pub snapshot_id: Uuid,

    #[serde(with = "hash256_hex")]
    pub merkle_root: Hash256,

    pub record_count: u32,
    pub region_code: u16,
    pub metadata: Vec<u8>,
}

/// Confirmation of a commit accepted by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    /// Identifier assigned by the ledger
    pub batch_id: u64,
    pub commit_ref: CommitRef,
    pub position: ChainPosition,
}

/// A confirmed commit as observed on the ledger's event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEvent {
    pub batch_id: u64,

    #[serde(with = "hash256_hex")]
    pub merkle_root: Hash256,

    pub record_count: u32,
    pub region_code: u16,
    pub metadata: Vec<u8>,
    pub commit_ref: CommitRef,
    pub position: ChainPosition,
}

impl CommitEvent {
    /// Event equivalent of a confirmed submission
    pub fn from_receipt(request: &CommitRequest, receipt: CommitReceipt) -> Self {
        Self {
            batch_id: receipt.batch_id,
            merkle_root: request.merkle_root,
            record_count: request.record_count,
            region_code: request.region_code,
            metadata: request.metadata.clone(),
            commit_ref: receipt.commit_ref,
            position: receipt.position,
        }
    }

    pub fn receipt(&self) -> CommitReceipt {
        CommitReceipt {
            batch_id: self.batch_id,
            commit_ref: self.commit_ref.clone(),
            position: self.position,
        }
    }
}

/// One page of commit events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitPage {
    /// Events strictly after the requested position, in ledger order
    pub events: Vec<CommitEvent>,

    /// Highest position covered by this scan. The next fetch resumes after
    /// it even when `events` is empty.
    pub high_water: Option<ChainPosition>,
}

/// Result of querying the ledger for a submission whose confirmation was
/// not observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// The commit landed
    Confirmed(CommitReceipt),
    /// The transaction is known but not yet confirmed
    Pending,
    /// The ledger has no trace of the submission
    NotFound,
}
