//! Infrastructure layer for the batch registry
//!
//! Contains:
//! - Collaborator traits (ledger, record store)
//! - SQLite record store
//! - Error taxonomy
//! - Retry with backoff for transient failures
//! - Cooperative shutdown

mod error;
mod graceful_shutdown;
mod retry;
pub mod sqlite;
mod traits;

pub use error::*;
pub use graceful_shutdown::{shutdown_signal, ShutdownCoordinator, ShutdownSignal};
pub use retry::{is_retryable_db_error, Retry, RetryConfig};
pub use sqlite::SqliteRecordStore;
pub use traits::*;
