//! Batch Registry Library
//!
//! Batch commitment and verification engine: groups eligible records into
//! batches, anchors each batch's Merkle root on an append-only ledger,
//! reconciles ledger commit events into local storage, and serves inclusion
//! proofs that verify without trusting the operator.
//!
//! ## Modules
//!
//! - [`domain`] - Records, batches, snapshots, commit events, proofs
//! - [`crypto`] - Leaf encoding and the Merkle tree
//! - [`infra`] - Collaborator traits, SQLite store, errors, retry, shutdown
//! - [`anchor`] - Ledger implementations (EVM, in-memory)
//! - [`batching`] - Batch coordinator and background worker
//! - [`indexer`] - Commit feed, reconciler and chain watcher
//! - [`proof`] - Inclusion proof service
//! - [`config`] - Process configuration
//! - [`telemetry`] - Logging setup

pub mod anchor;
pub mod batching;
pub mod config;
pub mod crypto;
pub mod domain;
pub mod indexer;
pub mod infra;
pub mod migrations;
pub mod proof;
pub mod telemetry;

// Re-export commonly used types
pub use domain::{
    BatchRecord, BatchSnapshot, ChainPosition, CommitEvent, EligibleRecord, Hash256,
    InclusionProof, LeafRecord, ProofResult, RecordStatus,
};

pub use infra::{Ledger, LedgerError, RecordStore, RegistryError, Result};
