//! Leaf encoding and node hashing for batch commitments
//!
//! Leaves use the packed layout the `BatchRegistry` contract reproduces on
//! chain with `abi.encodePacked(bytes32, bytes32, uint64, uint16)`:
//! - identity hash (32 bytes)
//! - file hash (32 bytes)
//! - eligible-since timestamp (8 bytes, big-endian)
//! - region code (2 bytes, big-endian)
//!
//! The 74-byte preimage goes through a single keccak-256.

use alloy::primitives::keccak256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::Hash256;
use crate::infra::{RegistryError, Result};

/// Length of the packed leaf preimage
pub const LEAF_PREIMAGE_LEN: usize = 32 + 32 + 8 + 2;

// ============================================================================
// Domain Separation Prefixes (DomainSeparated scheme only)
// ============================================================================

/// Prefix byte applied to leaves before they enter the tree
pub const DOMAIN_LEAF_PREFIX: u8 = 0x00;

/// Prefix byte applied to internal node preimages
pub const DOMAIN_NODE_PREFIX: u8 = 0x01;

// ============================================================================
// Binary Encoding Helpers
// ============================================================================

/// Encode a u16 as 2 bytes big-endian
#[inline]
pub fn u16_be(n: u16) -> [u8; 2] {
    n.to_be_bytes()
}

/// Encode a u32 as 4 bytes big-endian
#[inline]
pub fn u32_be(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Encode a u64 as 8 bytes big-endian
#[inline]
pub fn u64_be(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

/// keccak-256 of arbitrary bytes
#[inline]
pub fn keccak(data: &[u8]) -> Hash256 {
    keccak256(data).0
}

/// Interpret a byte slice as a 32-byte digest.
///
/// `field` names the input in the resulting `InvalidInputLength` error.
pub fn bytes32(field: &'static str, bytes: &[u8]) -> Result<Hash256> {
    bytes
        .try_into()
        .map_err(|_| RegistryError::InvalidInputLength {
            field,
            expected: 32,
            actual: bytes.len(),
        })
}

/// Parse a 32-byte digest from hex, with or without a `0x` prefix
pub fn parse_hash256(field: &'static str, s: &str) -> Result<Hash256> {
    let raw = s.trim().strip_prefix("0x").unwrap_or(s.trim());
    let bytes = hex::decode(raw).map_err(|e| RegistryError::InvalidHex {
        field,
        reason: e.to_string(),
    })?;
    bytes32(field, &bytes)
}

// ============================================================================
// Leaf Encoding
// ============================================================================

/// Packed 74-byte preimage of a leaf
pub fn leaf_preimage(
    identity_hash: &Hash256,
    file_hash: &Hash256,
    eligible_since: u64,
    region_code: u16,
) -> [u8; LEAF_PREIMAGE_LEN] {
    let mut out = [0u8; LEAF_PREIMAGE_LEN];
    out[..32].copy_from_slice(identity_hash);
    out[32..64].copy_from_slice(file_hash);
    out[64..72].copy_from_slice(&u64_be(eligible_since));
    out[72..].copy_from_slice(&u16_be(region_code));
    out
}

/// Leaf hash of a record whose digests are already fixed-width
pub fn compute_leaf_hash(
    identity_hash: &Hash256,
    file_hash: &Hash256,
    eligible_since: u64,
    region_code: u16,
) -> Hash256 {
    keccak(&leaf_preimage(
        identity_hash,
        file_hash,
        eligible_since,
        region_code,
    ))
}

/// Encode a record into its leaf hash, validating digest widths.
///
/// Fails with `InvalidInputLength` if either digest is not exactly 32 bytes.
pub fn encode_leaf(
    identity_hash: &[u8],
    file_hash: &[u8],
    eligible_since: u64,
    region_code: u16,
) -> Result<Hash256> {
    let identity = bytes32("identity_hash", identity_hash)?;
    let file = bytes32("file_hash", file_hash)?;
    Ok(compute_leaf_hash(&identity, &file, eligible_since, region_code))
}

// ============================================================================
// Tree Hashing
// ============================================================================

/// Node hashing scheme for Merkle trees.
///
/// `Compat` matches the deployed registry contract; `DomainSeparated` is only
/// valid when the ledger side verifies with the same prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashScheme {
    /// leaf as-is, node = keccak(left || right)
    #[default]
    Compat,
    /// leaf = keccak(0x00 || leaf), node = keccak(0x01 || left || right)
    DomainSeparated,
}

impl HashScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashScheme::Compat => "compat",
            HashScheme::DomainSeparated => "domain_separated",
        }
    }

    /// Map an encoder output to the value stored at the tree's bottom level
    pub fn hash_leaf(&self, leaf: &Hash256) -> Hash256 {
        match self {
            HashScheme::Compat => *leaf,
            HashScheme::DomainSeparated => {
                let mut buf = [0u8; 33];
                buf[0] = DOMAIN_LEAF_PREFIX;
                buf[1..].copy_from_slice(leaf);
                keccak(&buf)
            }
        }
    }

    /// Hash two children into their parent
    pub fn hash_node(&self, left: &Hash256, right: &Hash256) -> Hash256 {
        match self {
            HashScheme::Compat => {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(left);
                buf[32..].copy_from_slice(right);
                keccak(&buf)
            }
            HashScheme::DomainSeparated => {
                let mut buf = [0u8; 65];
                buf[0] = DOMAIN_NODE_PREFIX;
                buf[1..33].copy_from_slice(left);
                buf[33..].copy_from_slice(right);
                keccak(&buf)
            }
        }
    }
}

impl fmt::Display for HashScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashScheme {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "compat" | "" => Ok(HashScheme::Compat),
            "domain_separated" => Ok(HashScheme::DomainSeparated),
            other => Err(RegistryError::Configuration(format!(
                "unknown hash scheme: {other}"
            ))),
        }
    }
}

/// Compat node hash: keccak(left || right)
#[inline]
pub fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    HashScheme::Compat.hash_node(left, right)
}
