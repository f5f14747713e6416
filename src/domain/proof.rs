//! Inclusion proof output types

use serde::{Deserialize, Serialize};

use super::types::{hash256_hex, hash256_hex_vec, Hash256};
use crate::crypto::{verify_with, HashScheme};

/// Proof that one leaf is included in a committed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub batch_id: u64,

    #[serde(with = "hash256_hex")]
    pub merkle_root: Hash256,

    #[serde(with = "hash256_hex")]
    pub leaf_hash: Hash256,

    /// Leaf index in the batch
    pub offset: u32,

    /// Sibling hashes, bottom level first
    #[serde(with = "hash256_hex_vec")]
    pub proof: Vec<Hash256>,
}

impl InclusionProof {
    /// Check the proof without any stored state
    pub fn verify(&self, scheme: HashScheme) -> bool {
        verify_with(
            scheme,
            &self.leaf_hash,
            &self.proof,
            self.offset as usize,
            &self.merkle_root,
        )
    }
}

/// Answer to a proof request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProofResult {
    /// The record has no leaf yet
    NotYetBatched,
    Included(InclusionProof),
}

impl ProofResult {
    pub fn inclusion(&self) -> Option<&InclusionProof> {
        match self {
            ProofResult::Included(proof) => Some(proof),
            ProofResult::NotYetBatched => None,
        }
    }
}
