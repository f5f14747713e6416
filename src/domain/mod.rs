//! Domain models for the batch registry
//!
//! Records, batches and snapshots on the local side; commit requests and
//! events on the ledger side; inclusion proofs for callers.

mod batch;
mod ledger;
mod proof;
mod types;

pub use batch::*;
pub use ledger::*;
pub use proof::*;
pub use types::*;
