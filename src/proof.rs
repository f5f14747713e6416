//! Inclusion proof service
//!
//! Proofs are generated from persisted leaves only, and only after the
//! rebuilt tree has been checked against the stored root.

use std::sync::Arc;

use tracing::{debug, error, instrument};

use crate::crypto::{HashScheme, MerkleTree};
use crate::domain::{to_hex, Hash256, InclusionProof, ProofResult};
use crate::infra::{RecordStore, RegistryError, Result};

pub struct ProofService {
    store: Arc<dyn RecordStore>,
    scheme: HashScheme,
}

impl ProofService {
    pub fn new(store: Arc<dyn RecordStore>, scheme: HashScheme) -> Self {
        Self { store, scheme }
    }

    /// Inclusion proof for one record.
    ///
    /// A record without a leaf is `NotYetBatched`; any inconsistency in the
    /// stored batch is `IntegrityMismatch`.
    #[instrument(skip(self, identity_hash), fields(identity = %to_hex(identity_hash)))]
    pub async fn get_proof(&self, identity_hash: &Hash256) -> Result<ProofResult> {
        let Some(leaf) = self.store.get_leaf(identity_hash).await? else {
            debug!("record not batched yet");
            return Ok(ProofResult::NotYetBatched);
        };
        let batch_id = leaf.batch_id;
        let mismatch = |detail: String| {
            error!(batch_id, detail = %detail, "batch integrity check failed");
            RegistryError::IntegrityMismatch { batch_id, detail }
        };

        let batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| mismatch("leaf references a missing batch".to_string()))?;

        let leaves = self.store.get_batch_leaves(batch_id).await?;
        for (index, stored) in leaves.iter().enumerate() {
            if stored.offset as usize != index {
                return Err(mismatch(format!(
                    "offsets not contiguous: position {index} holds offset {}",
                    stored.offset
                )));
            }
        }
        if leaves.len() != batch.record_count as usize {
            return Err(mismatch(format!(
                "batch records {} leaves, {} stored",
                batch.record_count,
                leaves.len()
            )));
        }

        let tree = MerkleTree::build_with(
            self.scheme,
            leaves.iter().map(|l| l.leaf_hash).collect(),
        );
        if tree.root() != batch.merkle_root {
            return Err(mismatch(format!(
                "rebuilt root {} != stored root {}",
                to_hex(&tree.root()),
                to_hex(&batch.merkle_root)
            )));
        }

        let position = tree.position(&leaf.leaf_hash)?;
        if position != leaf.offset as usize {
            return Err(mismatch(format!(
                "leaf found at {position}, stored offset {}",
                leaf.offset
            )));
        }

        let proof = InclusionProof {
            batch_id,
            merkle_root: batch.merkle_root,
            leaf_hash: leaf.leaf_hash,
            offset: leaf.offset,
            proof: tree.proof_at(position)?,
        };
        if !proof.verify(self.scheme) {
            return Err(mismatch("generated proof does not verify".to_string()));
        }

        debug!(batch_id, offset = leaf.offset, "proof generated");
        Ok(ProofResult::Included(proof))
    }

    /// Check a proof under this service's hashing scheme
    pub fn verify_proof(&self, proof: &InclusionProof) -> bool {
        proof.verify(self.scheme)
    }
}
