//! Ledger implementations
//!
//! - [`EvmLedger`]: `BatchRegistry` contract on an EVM chain via alloy
//! - [`InMemoryLedger`]: process-local commit log with fault injection

mod evm;
mod memory;

pub use evm::{AnchorConfig, EvmLedger};
pub use memory::{InMemoryLedger, SubmitFault};
