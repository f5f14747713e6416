//! SQLite implementation of the record store
//!
//! Holds records, snapshots, reconciled batches and watcher checkpoints in
//! one database so reconciliation can commit them in a single transaction.

mod record_store;

pub use record_store::*;
