//! Cryptographic primitives for batch commitments
//!
//! Provides:
//! - Leaf encoding (packed, keccak-256) matching the registry contract
//! - Merkle tree construction, proof generation and verification
//! - Compat and domain-separated node hashing schemes

mod hash;
mod merkle;

pub use hash::*;
pub use merkle::*;
