//! Batch Worker Service
//!
//! Background task that periodically turns the eligible backlog into
//! batches. On each tick it:
//!
//! 1. Settles OPEN snapshots left behind by earlier timeouts
//! 2. Creates a batch when the backlog reaches the minimum size, or when
//!    the oldest eligible record has waited longer than the maximum wait
//!
//! # Configuration
//!
//! - `BATCH_INTERVAL_SECS` - How often to check the backlog (default: 60)
//! - `BATCH_MIN_SIZE` - Minimum records before batching (default: 1)
//! - `BATCH_MAX_SIZE` - Maximum records per batch (default: 500)
//! - `BATCH_MAX_WAIT_SECS` - Max time to wait before batching (default: 3600)

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::coordinator::{BatchCoordinator, BatchResult, PendingResolution};
use crate::domain::SnapshotState;
use crate::infra::{RecordStore, RegistryError, Result, ShutdownSignal};

/// Configuration for the batch worker
#[derive(Debug, Clone)]
pub struct BatchWorkerConfig {
    /// How often to check the backlog
    pub batch_interval: Duration,
    /// Minimum records before creating a batch
    pub min_batch_size: usize,
    /// Maximum records per batch
    pub max_batch_size: usize,
    /// Maximum time the oldest record waits (even if below min size)
    pub max_wait_time: Duration,
}

impl Default for BatchWorkerConfig {
    fn default() -> Self {
        Self {
            batch_interval: Duration::from_secs(60),
            min_batch_size: 1,
            max_batch_size: 500,
            max_wait_time: Duration::from_secs(3600),
        }
    }
}

impl BatchWorkerConfig {
    /// Load configuration from environment
    pub fn from_env() -> Self {
        let batch_interval = std::env::var("BATCH_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));

        let min_batch_size = std::env::var("BATCH_MIN_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let max_batch_size = std::env::var("BATCH_MAX_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(500);

        let max_wait_time = std::env::var("BATCH_MAX_WAIT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3600));

        Self {
            batch_interval,
            min_batch_size,
            max_batch_size,
            max_wait_time,
        }
    }
}

/// Message types for batch worker control
#[derive(Debug)]
pub enum BatchWorkerMessage {
    /// Batch whatever is selectable now, ignoring thresholds
    ForceBatch,
    /// Shutdown the worker
    Shutdown,
}

/// Batch Worker
///
/// Runs as a background task; control it through [`BatchWorker::control_handle`].
pub struct BatchWorker {
    config: BatchWorkerConfig,
    coordinator: Arc<BatchCoordinator>,
    store: Arc<dyn RecordStore>,
    control_tx: mpsc::Sender<BatchWorkerMessage>,
    control_rx: mpsc::Receiver<BatchWorkerMessage>,
}

impl BatchWorker {
    pub fn new(
        config: BatchWorkerConfig,
        coordinator: Arc<BatchCoordinator>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        Self {
            config,
            coordinator,
            store,
            control_tx,
            control_rx,
        }
    }

    /// Get a sender handle for controlling the worker
    pub fn control_handle(&self) -> mpsc::Sender<BatchWorkerMessage> {
        self.control_tx.clone()
    }

    /// Run until a `Shutdown` message or the shutdown signal
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        info!(
            interval_secs = self.config.batch_interval.as_secs(),
            min_size = self.config.min_batch_size,
            max_size = self.config.max_batch_size,
            "starting batch worker"
        );

        let mut ticker = interval(self.config.batch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    info!("batch worker shutting down");
                    break;
                }
                Some(msg) = self.control_rx.recv() => {
                    match msg {
                        BatchWorkerMessage::ForceBatch => {
                            info!("forcing batch creation");
                            if let Err(e) = self.create_batch().await {
                                error!(error = %e, "error creating forced batch");
                            }
                        }
                        BatchWorkerMessage::Shutdown => {
                            info!("batch worker shutting down");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "error processing backlog");
                    }
                }
            }
        }
    }

    /// One scheduled pass: settle open snapshots, then batch if due
    pub async fn tick(&self) -> Result<Option<BatchResult>> {
        self.resolve_open_snapshots().await?;

        if !self.batch_due().await? {
            return Ok(None);
        }
        self.create_batch().await
    }

    async fn resolve_open_snapshots(&self) -> Result<()> {
        let open = self.store.list_snapshots(Some(SnapshotState::Open)).await?;

        for snapshot in open {
            match self.coordinator.resolve_pending(snapshot.snapshot_id).await {
                Ok(PendingResolution::StillPending) => {
                    debug!(snapshot_id = %snapshot.snapshot_id, "snapshot still pending");
                }
                Ok(resolution) => {
                    info!(
                        snapshot_id = %snapshot.snapshot_id,
                        resolution = ?resolution,
                        "open snapshot settled"
                    );
                }
                Err(e) => {
                    warn!(
                        snapshot_id = %snapshot.snapshot_id,
                        error = %e,
                        "failed to settle open snapshot"
                    );
                }
            }
        }
        Ok(())
    }

    async fn batch_due(&self) -> Result<bool> {
        let backlog = self.store.eligible_backlog().await?;

        if backlog.count == 0 {
            debug!("no eligible records to batch");
            return Ok(false);
        }
        if backlog.count >= self.config.min_batch_size as u64 {
            return Ok(true);
        }

        // Below minimum size: batch anyway once the oldest has waited long enough
        let now = Utc::now().timestamp().max(0) as u64;
        let waited = backlog
            .oldest_eligible_since
            .map(|since| now.saturating_sub(since))
            .unwrap_or(0);
        if waited >= self.config.max_wait_time.as_secs() {
            return Ok(true);
        }

        debug!(
            record_count = backlog.count,
            min_size = self.config.min_batch_size,
            waited_secs = waited,
            "not enough records for batch, waiting"
        );
        Ok(false)
    }

    async fn create_batch(&self) -> Result<Option<BatchResult>> {
        match self
            .coordinator
            .create_batch_from_store(self.config.max_batch_size)
            .await
        {
            Ok(Some(result)) => {
                info!(
                    batch_id = result.batch_id,
                    record_count = result.record_count,
                    local_state = ?result.local_state,
                    "batch committed"
                );
                Ok(Some(result))
            }
            Ok(None) => Ok(None),
            Err(
                e @ (RegistryError::SubmissionPending { .. } | RegistryError::Timeout { .. }),
            ) => {
                // The snapshot stays open and is settled on a later tick
                warn!(error = %e, "batch submission unresolved");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Spawn the batch worker as a background task
pub fn spawn_batch_worker(
    config: BatchWorkerConfig,
    coordinator: Arc<BatchCoordinator>,
    store: Arc<dyn RecordStore>,
    shutdown: ShutdownSignal,
) -> (
    tokio::task::JoinHandle<()>,
    mpsc::Sender<BatchWorkerMessage>,
) {
    let worker = BatchWorker::new(config, coordinator, store);
    let control_handle = worker.control_handle();
    let handle = tokio::spawn(worker.run(shutdown));
    (handle, control_handle)
}
