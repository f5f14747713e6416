//! Reconciliation of one confirmed commit into local state
//!
//! Both the coordinator's confirmation path and the chain watcher go through
//! [`Reconciler::reconcile`], so batch and leaf records have exactly one
//! writer. The committed leaf set is always rebuilt from the snapshot named
//! in the commit metadata, never from the current ELIGIBLE set.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::crypto::{HashScheme, MerkleTree};
use crate::domain::{
    to_hex, ApplyOutcome, BatchMetadata, BatchRecord, BatchWrite, CommitEvent, ConflictReason,
    LeafRecord, SnapshotState, WatcherCheckpoint,
};
use crate::infra::{RecordStore, RegistryError, Result};

/// What a reconciliation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The batch was written
    Applied { record_count: u32 },
    /// A batch with this id already existed
    AlreadyReconciled,
}

/// Turns commit events into atomic batch writes
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    scheme: HashScheme,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RecordStore>, scheme: HashScheme) -> Self {
        Self { store, scheme }
    }

    pub fn scheme(&self) -> HashScheme {
        self.scheme
    }

    /// Reconcile `event`, advancing `checkpoint` in the same transaction.
    ///
    /// Any mismatch between the event and local state is returned as
    /// `ReconciliationConflict` and nothing is written.
    #[instrument(skip(self, event, checkpoint), fields(batch_id = event.batch_id, position = %event.position))]
    pub async fn reconcile(
        &self,
        event: &CommitEvent,
        checkpoint: Option<WatcherCheckpoint>,
    ) -> Result<ReconcileOutcome> {
        if self.store.get_batch(event.batch_id).await?.is_some() {
            if let Some(checkpoint) = &checkpoint {
                self.store.advance_checkpoint(checkpoint).await?;
            }
            debug!("batch already reconciled, skipping");
            return Ok(ReconcileOutcome::AlreadyReconciled);
        }

        // The other writer may have landed between the batch lookup and here
        let Some(write) = self.plan(event).await? else {
            if let Some(checkpoint) = &checkpoint {
                self.store.advance_checkpoint(checkpoint).await?;
            }
            debug!("snapshot already confirmed into this batch, skipping");
            return Ok(ReconcileOutcome::AlreadyReconciled);
        };
        let record_count = write.batch.record_count;

        match self.store.apply_batch(&write, checkpoint).await? {
            ApplyOutcome::Applied => {
                info!(
                    snapshot_id = %write.snapshot_id,
                    record_count,
                    "commit reconciled"
                );
                Ok(ReconcileOutcome::Applied { record_count })
            }
            ApplyOutcome::AlreadyApplied => Ok(ReconcileOutcome::AlreadyReconciled),
        }
    }

    /// Validate `event` against its snapshot and build the batch write.
    ///
    /// Returns `None` when the snapshot is already confirmed into this same
    /// batch, so there is nothing left to write.
    pub async fn plan(&self, event: &CommitEvent) -> Result<Option<BatchWrite>> {
        let batch_id = event.batch_id;

        let metadata = BatchMetadata::decode(&event.metadata).ok_or_else(|| {
            RegistryError::conflict(
                batch_id,
                None,
                ConflictReason::InvalidMetadata,
                format!("undecodable metadata ({} bytes)", event.metadata.len()),
            )
        })?;
        let snapshot_id = metadata.snapshot_id;
        let conflict = |reason, detail: String| {
            RegistryError::conflict(batch_id, Some(snapshot_id), reason, detail)
        };

        let snapshot = self.store.get_snapshot(snapshot_id).await?.ok_or_else(|| {
            conflict(
                ConflictReason::UnknownSnapshot,
                format!("snapshot {snapshot_id} not found"),
            )
        })?;

        if let SnapshotState::Confirmed { batch_id: other } = snapshot.state {
            if other == batch_id {
                return Ok(None);
            }
            return Err(conflict(
                ConflictReason::SnapshotConsumed,
                format!("snapshot already confirmed in batch {other}"),
            ));
        }
        if snapshot.state == SnapshotState::Abandoned {
            warn!(
                batch_id,
                snapshot_id = %snapshot_id,
                "commit landed for an abandoned snapshot"
            );
        }

        if event.record_count != snapshot.record_count() {
            return Err(conflict(
                ConflictReason::CountMismatch,
                format!(
                    "event reports {} records, snapshot holds {}",
                    event.record_count,
                    snapshot.record_count()
                ),
            ));
        }

        let mut leaves = Vec::with_capacity(snapshot.members.len());
        for (index, member) in snapshot.members.iter().enumerate() {
            if member.offset as usize != index {
                return Err(conflict(
                    ConflictReason::SnapshotCorrupt,
                    format!("member at position {index} has offset {}", member.offset),
                ));
            }
            let leaf = member.recompute_leaf();
            if leaf != member.leaf_hash {
                return Err(conflict(
                    ConflictReason::SnapshotCorrupt,
                    format!("stored leaf differs from encoding at offset {index}"),
                ));
            }
            leaves.push(leaf);
        }

        let root = MerkleTree::build_with(self.scheme, leaves).root();
        if root != event.merkle_root {
            return Err(conflict(
                ConflictReason::RootMismatch,
                format!(
                    "event root {} != recomputed {}",
                    to_hex(&event.merkle_root),
                    to_hex(&root)
                ),
            ));
        }

        let batch = BatchRecord {
            batch_id,
            merkle_root: root,
            commit_ref: event.commit_ref.clone(),
            record_count: event.record_count,
            region_code: event.region_code,
            snapshot_id: Some(snapshot_id),
            position: event.position,
            created_at: Utc::now(),
        };
        let leaves = snapshot
            .members
            .iter()
            .map(|m| LeafRecord {
                identity_hash: m.identity_hash,
                leaf_hash: m.leaf_hash,
                batch_id,
                offset: m.offset,
            })
            .collect();

        Ok(Some(BatchWrite {
            batch,
            leaves,
            snapshot_id,
        }))
    }
}
