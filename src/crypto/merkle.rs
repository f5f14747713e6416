//! Binary Merkle tree over ordered leaf hashes
//!
//! Leaf order is the input order. A level with an odd number of nodes pairs
//! its last node with itself. The empty tree has the all-zero root and a
//! single leaf is its own root (under the compat scheme).

use crate::domain::{to_hex, Hash256, ZERO_HASH};
use crate::infra::{RegistryError, Result};

use super::hash::HashScheme;

/// Merkle tree with every level materialised, bottom level first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    scheme: HashScheme,
    leaves: Vec<Hash256>,
    levels: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    /// Build a tree with the compat scheme
    pub fn build(leaves: Vec<Hash256>) -> Self {
        Self::build_with(HashScheme::Compat, leaves)
    }

    /// Build a tree with an explicit hashing scheme
    pub fn build_with(scheme: HashScheme, leaves: Vec<Hash256>) -> Self {
        let levels = build_levels(scheme, &leaves);
        Self {
            scheme,
            leaves,
            levels,
        }
    }

    pub fn scheme(&self) -> HashScheme {
        self.scheme
    }

    /// Root digest (all zeros for an empty tree)
    pub fn root(&self) -> Hash256 {
        self.levels
            .last()
            .and_then(|l| l.first().copied())
            .unwrap_or(ZERO_HASH)
    }

    /// Leaves in input order, as given to `build`
    pub fn leaves(&self) -> &[Hash256] {
        &self.leaves
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Number of sibling hashes in every proof of this tree
    pub fn depth(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// Unique position of `leaf`.
    ///
    /// Fails with `LeafNotFound` when absent and `AmbiguousLeaf` when the
    /// value occurs more than once.
    pub fn position(&self, leaf: &Hash256) -> Result<usize> {
        let positions: Vec<usize> = self
            .leaves
            .iter()
            .enumerate()
            .filter(|(_, l)| *l == leaf)
            .map(|(i, _)| i)
            .collect();

        match positions.as_slice() {
            [] => Err(RegistryError::LeafNotFound(to_hex(leaf))),
            [index] => Ok(*index),
            _ => Err(RegistryError::AmbiguousLeaf {
                leaf: to_hex(leaf),
                positions,
            }),
        }
    }

    /// Sibling path for the unique occurrence of `leaf`
    pub fn proof(&self, leaf: &Hash256) -> Result<Vec<Hash256>> {
        let index = self.position(leaf)?;
        self.proof_at(index)
    }

    /// Sibling path for the leaf at `index`, bottom level first
    pub fn proof_at(&self, index: usize) -> Result<Vec<Hash256>> {
        if index >= self.leaves.len() {
            return Err(RegistryError::LeafIndexOutOfRange {
                index,
                leaf_count: self.leaves.len(),
            });
        }

        let mut path = Vec::with_capacity(self.depth());
        let mut idx = index;
        for level in &self.levels[..self.depth()] {
            // An unpaired last node is its own sibling
            let sibling = level.get(idx ^ 1).or_else(|| level.get(idx)).copied();
            match sibling {
                Some(sibling) => path.push(sibling),
                None => {
                    return Err(RegistryError::Internal(format!(
                        "tree level too short for index {idx}"
                    )))
                }
            }
            idx /= 2;
        }

        Ok(path)
    }

    /// Verify a proof against this tree's root and scheme
    pub fn verify_proof(&self, leaf: &Hash256, proof: &[Hash256], index: usize) -> bool {
        verify_with(self.scheme, leaf, proof, index, &self.root())
    }
}

fn build_levels(scheme: HashScheme, leaves: &[Hash256]) -> Vec<Vec<Hash256>> {
    let mut levels = Vec::new();
    if leaves.is_empty() {
        return levels;
    }

    levels.push(leaves.iter().map(|l| scheme.hash_leaf(l)).collect::<Vec<_>>());

    while levels.last().map_or(0, Vec::len) > 1 {
        let next: Vec<Hash256> = match levels.last() {
            Some(current) => current
                .chunks(2)
                .map(|pair| {
                    let left = &pair[0];
                    let right = pair.get(1).unwrap_or(left);
                    scheme.hash_node(left, right)
                })
                .collect(),
            None => break,
        };
        levels.push(next);
    }

    levels
}

/// Verify a compat-scheme proof
pub fn verify(leaf: &Hash256, proof: &[Hash256], index: usize, root: &Hash256) -> bool {
    verify_with(HashScheme::Compat, leaf, proof, index, root)
}

/// Recompute the path from `leaf` to the root using the bits of `index`
/// (bit clear: current node is the left child).
///
/// An index with bits set beyond `proof.len()` levels is rejected.
pub fn verify_with(
    scheme: HashScheme,
    leaf: &Hash256,
    proof: &[Hash256],
    index: usize,
    root: &Hash256,
) -> bool {
    let mut current = scheme.hash_leaf(leaf);
    let mut idx = index;

    for sibling in proof {
        current = if idx & 1 == 0 {
            scheme.hash_node(&current, sibling)
        } else {
            scheme.hash_node(sibling, &current)
        };
        idx >>= 1;
    }

    idx == 0 && current == *root
}
