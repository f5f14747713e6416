//! Batch creation and ledger submission

mod coordinator;
mod worker;

pub use coordinator::{
    BatchCoordinator, BatchResult, CoordinatorConfig, LocalState, PendingResolution,
};
pub use worker::{spawn_batch_worker, BatchWorker, BatchWorkerConfig, BatchWorkerMessage};
