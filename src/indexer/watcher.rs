//! Chain watcher
//!
//! Single ordered consumer of the commit feed. Each event is reconciled and
//! the checkpoint advanced in one transaction; conflicts are recorded
//! together with the checkpoint, or halt the watcher when configured to.
//!
//! # Configuration
//!
//! - `WATCHER_NAME` - Checkpoint key (default: chain-watcher)
//! - `WATCHER_POLL_INTERVAL_MS` - Delay between polls once caught up (default: 2000)
//! - `WATCHER_PAGE_SIZE` - Events fetched per page (default: 100)
//! - `WATCHER_START_BLOCK` - First block scanned when no checkpoint exists (default: 0)
//! - `WATCHER_HALT_ON_CONFLICT` - Stop instead of recording conflicts (default: false)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

use super::feed::CommitFeed;
use super::reconciler::{ReconcileOutcome, Reconciler};
use crate::domain::{ChainPosition, CommitEvent, ConflictRecord, WatcherCheckpoint};
use crate::infra::{
    Ledger, RecordStore, RegistryError, Result, Retry, RetryConfig, ShutdownSignal,
};

/// Watcher configuration
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Checkpoint name
    pub name: String,
    pub poll_interval: Duration,
    pub page_size: usize,
    /// Scan origin when no checkpoint has been stored
    pub start_block: u64,
    pub halt_on_conflict: bool,
    /// Backoff for feed errors and retryable persistence failures
    pub backoff: RetryConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            name: "chain-watcher".to_string(),
            poll_interval: Duration::from_millis(2000),
            page_size: 100,
            start_block: 0,
            halt_on_conflict: false,
            backoff: RetryConfig::blockchain(),
        }
    }
}

impl WatcherConfig {
    /// Load configuration from environment
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let name = std::env::var("WATCHER_NAME").unwrap_or(defaults.name);

        let poll_interval = std::env::var("WATCHER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let page_size = std::env::var("WATCHER_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.page_size);

        let start_block = std::env::var("WATCHER_START_BLOCK")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.start_block);

        let halt_on_conflict = std::env::var("WATCHER_HALT_ON_CONFLICT")
            .ok()
            .map(|s| s == "true" || s == "1")
            .unwrap_or(defaults.halt_on_conflict);

        Self {
            name,
            poll_interval,
            page_size,
            start_block,
            halt_on_conflict,
            backoff: defaults.backoff,
        }
    }
}

/// Watcher statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatcherStats {
    pub events_processed: u64,
    pub batches_applied: u64,
    pub events_skipped: u64,
    pub conflicts: u64,
    pub persistence_retries: u64,
    pub last_position: Option<ChainPosition>,
}

/// Reconciles ledger commit events into local storage
pub struct ChainWatcher {
    config: WatcherConfig,
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn RecordStore>,
    reconciler: Arc<Reconciler>,
    stats: RwLock<WatcherStats>,
}

impl ChainWatcher {
    pub fn new(
        config: WatcherConfig,
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn RecordStore>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            config,
            ledger,
            store,
            reconciler,
            stats: RwLock::new(WatcherStats::default()),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub async fn stats(&self) -> WatcherStats {
        self.stats.read().await.clone()
    }

    /// Position after which processing resumes: the stored checkpoint, or
    /// just before the configured start block
    pub async fn resume_position(&self) -> Result<Option<ChainPosition>> {
        match self.store.get_checkpoint(&self.config.name).await? {
            Some(checkpoint) => Ok(Some(checkpoint.position)),
            None => Ok(ChainPosition::before_block(self.config.start_block)),
        }
    }

    async fn open_feed(&self) -> Result<CommitFeed> {
        let after = self.resume_position().await?;
        info!(
            watcher = %self.config.name,
            after = ?after,
            "opening commit feed"
        );
        Ok(
            CommitFeed::new(self.ledger.clone(), after, self.config.page_size)
                .with_poll_interval(self.config.poll_interval)
                .with_backoff(self.config.backoff.clone()),
        )
    }

    /// Follow the ledger until shutdown.
    ///
    /// Returns an error on a fatal feed error, a non-retryable persistence
    /// error, or a conflict when `halt_on_conflict` is set.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        let mut feed = self.open_feed().await?;
        info!(watcher = %self.config.name, "chain watcher started");

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                next = feed.next() => next?,
            };
            self.process(&event, &shutdown).await?;
        }

        info!(watcher = %self.config.name, "chain watcher stopped");
        Ok(())
    }

    /// Process every event available now, returning how many were handled
    pub async fn catch_up(&self) -> Result<u64> {
        let mut feed = self.open_feed().await?;
        let shutdown = ShutdownSignal::never();
        let mut handled = 0;

        while let Some(event) = feed.try_next().await? {
            self.process(&event, &shutdown).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Reconcile one event, retrying retryable persistence failures until
    /// it succeeds or shutdown is requested
    #[instrument(skip(self, event, shutdown), fields(batch_id = event.batch_id, position = %event.position))]
    async fn process(&self, event: &CommitEvent, shutdown: &ShutdownSignal) -> Result<()> {
        let checkpoint = WatcherCheckpoint::new(self.config.name.clone(), event.position);
        let mut attempts = 0u32;

        loop {
            match self
                .reconciler
                .reconcile(event, Some(checkpoint.clone()))
                .await
            {
                Ok(outcome) => {
                    let mut stats = self.stats.write().await;
                    stats.events_processed += 1;
                    stats.last_position = Some(event.position);
                    match outcome {
                        ReconcileOutcome::Applied { .. } => stats.batches_applied += 1,
                        ReconcileOutcome::AlreadyReconciled => stats.events_skipped += 1,
                    }
                    return Ok(());
                }
                Err(RegistryError::ReconciliationConflict {
                    batch_id,
                    snapshot_id,
                    reason,
                    detail,
                }) => {
                    error!(
                        batch_id,
                        snapshot_id = ?snapshot_id,
                        reason = %reason,
                        detail = %detail,
                        "reconciliation conflict"
                    );
                    self.stats.write().await.conflicts += 1;

                    if self.config.halt_on_conflict {
                        return Err(RegistryError::conflict(batch_id, snapshot_id, reason, detail));
                    }

                    let conflict = ConflictRecord::from_event(event, snapshot_id, reason, detail);
                    return self.record_conflict(&conflict, checkpoint).await;
                }
                Err(e) if e.is_retryable() => {
                    let delay = self.config.backoff.delay_for_attempt(attempts);
                    attempts = attempts.saturating_add(1);
                    self.stats.write().await.persistence_retries += 1;
                    warn!(
                        error = %e,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "reconciliation failed, retrying the same event"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.wait() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "reconciliation failed, checkpoint not advanced");
                    return Err(e);
                }
            }
        }
    }

    async fn record_conflict(
        &self,
        conflict: &ConflictRecord,
        checkpoint: WatcherCheckpoint,
    ) -> Result<()> {
        let retry = Retry::new(RetryConfig::database());
        retry
            .run_with_predicate(
                "record_conflict",
                || self.store.record_conflict(conflict, Some(checkpoint.clone())),
                |e: &RegistryError| e.is_retryable(),
            )
            .await?;

        self.stats.write().await.last_position = Some(conflict.position);
        Ok(())
    }
}
