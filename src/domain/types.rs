//! Core type definitions for the batch registry
//!
//! Records are identified by a 32-byte identity hash. All digests are
//! keccak-256 outputs and are rendered as `0x`-prefixed hex on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 32-byte digest (keccak-256)
pub type Hash256 = [u8; 32];

/// All-zero digest, used as the root of an empty tree
pub const ZERO_HASH: Hash256 = [0u8; 32];

/// Render a digest as `0x`-prefixed lowercase hex
pub fn to_hex(hash: &Hash256) -> String {
    format!("0x{}", hex::encode(hash))
}

/// Serde module for serializing Hash256 as `0x`-prefixed hex strings
pub mod hash256_hex {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::to_hex(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        decode(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn decode(s: &str) -> Result<[u8; 32], String> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| e.to_string())?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| format!("expected 32 bytes, got {}", b.len()))
    }
}

/// Serde module for serializing `Vec<Hash256>` as a list of hex strings
pub mod hash256_hex_vec {
    use serde::{self, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(hashes: &[[u8; 32]], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded: Vec<String> = hashes.iter().map(super::to_hex).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| super::hash256_hex::decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Lifecycle status of an eligible record.
///
/// PENDING -> ELIGIBLE -> BATCHED -> {SELECTED, REJECTED}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Eligible,
    Batched,
    Selected,
    Rejected,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Eligible => "eligible",
            RecordStatus::Batched => "batched",
            RecordStatus::Selected => "selected",
            RecordStatus::Rejected => "rejected",
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle state machine
    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        matches!(
            (self, next),
            (RecordStatus::Pending, RecordStatus::Eligible)
                | (RecordStatus::Eligible, RecordStatus::Batched)
                | (RecordStatus::Batched, RecordStatus::Selected)
                | (RecordStatus::Batched, RecordStatus::Rejected)
        )
    }

    /// Whether the record has been committed to some batch
    pub fn is_batched(&self) -> bool {
        matches!(
            self,
            RecordStatus::Batched | RecordStatus::Selected | RecordStatus::Rejected
        )
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "eligible" => Ok(RecordStatus::Eligible),
            "batched" => Ok(RecordStatus::Batched),
            "selected" => Ok(RecordStatus::Selected),
            "rejected" => Ok(RecordStatus::Rejected),
            other => Err(format!("unknown record status: {other}")),
        }
    }
}

/// A record owned by the external record store.
///
/// The batching core only reads the hash fields and writes `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibleRecord {
    /// Hash of the record's identity (e.g. hashed national identifier)
    #[serde(with = "hash256_hex")]
    pub identity_hash: Hash256,

    /// Hash of the record's supporting document
    #[serde(with = "hash256_hex")]
    pub file_hash: Hash256,

    /// Region code (positive)
    pub region_code: u16,

    /// Unix timestamp (seconds) since which the record is eligible
    pub eligible_since: u64,

    /// Current lifecycle status
    pub status: RecordStatus,
}

impl EligibleRecord {
    /// Create a record in the ELIGIBLE state
    pub fn new(
        identity_hash: Hash256,
        file_hash: Hash256,
        region_code: u16,
        eligible_since: u64,
    ) -> Self {
        Self {
            identity_hash,
            file_hash,
            region_code,
            eligible_since,
            status: RecordStatus::Eligible,
        }
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = status;
        self
    }

    /// Leaf hash committed for this record
    pub fn leaf_hash(&self) -> Hash256 {
        crate::crypto::compute_leaf_hash(
            &self.identity_hash,
            &self.file_hash,
            self.eligible_since,
            self.region_code,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_state_machine() {
        assert!(RecordStatus::Pending.can_transition_to(RecordStatus::Eligible));
        assert!(RecordStatus::Eligible.can_transition_to(RecordStatus::Batched));
        assert!(RecordStatus::Batched.can_transition_to(RecordStatus::Selected));
        assert!(RecordStatus::Batched.can_transition_to(RecordStatus::Rejected));

        assert!(!RecordStatus::Pending.can_transition_to(RecordStatus::Batched));
        assert!(!RecordStatus::Batched.can_transition_to(RecordStatus::Eligible));
        assert!(!RecordStatus::Selected.can_transition_to(RecordStatus::Rejected));
    }

    #[test]
    fn test_status_round_trip_str() {
        for status in [
            RecordStatus::Pending,
            RecordStatus::Eligible,
            RecordStatus::Batched,
            RecordStatus::Selected,
            RecordStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<RecordStatus>().unwrap(), status);
        }
        assert!("archived".parse::<RecordStatus>().is_err());
    }

    #[test]
    fn test_hash_hex_serde_accepts_unprefixed() {
        let record = EligibleRecord::new([0x11; 32], [0xaa; 32], 16, 1_672_531_200);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json["identity_hash"],
            format!("0x{}", "11".repeat(32)).as_str()
        );

        let mut raw = json.clone();
        raw["file_hash"] = serde_json::Value::String("aa".repeat(32));
        let parsed: EligibleRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed, record);
    }
}
