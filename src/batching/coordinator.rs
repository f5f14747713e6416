//! Batch coordinator
//!
//! Selects candidates, persists an OPEN snapshot, submits its root to the
//! ledger and reconciles the confirmed commit. Calls are serialised by a
//! single-writer lock.
//!
//! # Configuration
//!
//! - `BATCH_LABEL` - Label carried in commit metadata (default: batch)
//! - `BATCH_REGION_CODE` - Region code submitted with each commit (default: 16)
//! - `BATCH_CONFIRM_TIMEOUT_SECS` - Bound on one submit-and-confirm (default: 120)
//! - `BATCH_MAX_SUBMISSION_ATTEMPTS` - Submissions before giving up (default: 3)
//! - `BATCH_MAX_SIZE` - Upper bound on records per batch (default: 500)

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::crypto::{HashScheme, MerkleTree};
use crate::domain::{
    hash256_hex, to_hex, BatchSnapshot, ChainPosition, CommitEvent, CommitReceipt, CommitRef,
    CommitRequest, EligibleRecord, Hash256, SnapshotMember, SnapshotState, SubmissionOutcome,
};
use crate::indexer::{ReconcileOutcome, Reconciler};
use crate::infra::{
    Ledger, LedgerError, RecordStore, RegistryError, Result, Retry, RetryConfig,
};

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub label: String,
    pub region_code: u16,
    /// Bound on a single submit-and-confirm call
    pub confirmation_timeout: Duration,
    pub max_submission_attempts: u32,
    pub max_batch_size: usize,
    pub scheme: HashScheme,
    /// Delay between resubmissions of a commit the ledger never saw
    pub resubmit_backoff: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            label: "batch".to_string(),
            region_code: 16,
            confirmation_timeout: Duration::from_secs(120),
            max_submission_attempts: 3,
            max_batch_size: 500,
            scheme: HashScheme::Compat,
            resubmit_backoff: RetryConfig::blockchain(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let label = std::env::var("BATCH_LABEL").unwrap_or(defaults.label);

        let region_code = std::env::var("BATCH_REGION_CODE")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|code: &u16| *code > 0)
            .unwrap_or(defaults.region_code);

        let confirmation_timeout = std::env::var("BATCH_CONFIRM_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.confirmation_timeout);

        let max_submission_attempts = std::env::var("BATCH_MAX_SUBMISSION_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_submission_attempts);

        let max_batch_size = std::env::var("BATCH_MAX_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_batch_size);

        Self {
            label,
            region_code,
            confirmation_timeout,
            max_submission_attempts,
            max_batch_size,
            ..defaults
        }
    }

    pub fn with_scheme(mut self, scheme: HashScheme) -> Self {
        self.scheme = scheme;
        self
    }
}

/// State of local storage after a confirmed commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LocalState {
    /// Batch, leaves and status flips were written by this call
    Persisted,
    /// The watcher had already reconciled the commit
    AlreadyReconciled,
    /// Local reconciliation failed; the watcher will repair it from the
    /// ledger event
    Deferred { reason: String },
}

/// A batch confirmed on the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub batch_id: u64,
    #[serde(with = "hash256_hex")]
    pub merkle_root: Hash256,
    pub commit_ref: CommitRef,
    pub record_count: u32,
    pub snapshot_id: Uuid,
    pub position: ChainPosition,
    pub local_state: LocalState,
}

/// Outcome of `resolve_pending`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingResolution {
    Confirmed(BatchResult),
    /// Still known to the ledger but unconfirmed
    StillPending,
    /// The ledger never saw the commit; the snapshot was abandoned
    Abandoned,
    /// The snapshot was not OPEN
    AlreadyClosed(SnapshotState),
}

/// Builds batches and anchors them on the ledger
pub struct BatchCoordinator {
    config: CoordinatorConfig,
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn RecordStore>,
    reconciler: Arc<Reconciler>,
    lock: Mutex<()>,
}

impl BatchCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn RecordStore>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            config,
            ledger,
            store,
            reconciler,
            lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Commit exactly `candidates`, in order, as one batch
    #[instrument(skip(self, candidates), fields(candidates = candidates.len()))]
    pub async fn create_batch(&self, candidates: Vec<EligibleRecord>) -> Result<BatchResult> {
        let _guard = self.lock.lock().await;
        self.commit_candidates(candidates).await
    }

    /// Commit up to `limit` selectable records, oldest first.
    ///
    /// Returns `None` when nothing is selectable.
    #[instrument(skip(self))]
    pub async fn create_batch_from_store(&self, limit: usize) -> Result<Option<BatchResult>> {
        let _guard = self.lock.lock().await;

        let limit = limit.min(self.config.max_batch_size);
        let candidates = self.store.select_eligible(limit).await?;
        if candidates.is_empty() {
            debug!("no eligible records to batch");
            return Ok(None);
        }

        self.commit_candidates(candidates).await.map(Some)
    }

    /// Settle an OPEN snapshot left behind by a timeout or pending result
    #[instrument(skip(self))]
    pub async fn resolve_pending(&self, snapshot_id: Uuid) -> Result<PendingResolution> {
        let _guard = self.lock.lock().await;

        let snapshot = self
            .store
            .get_snapshot(snapshot_id)
            .await?
            .ok_or(RegistryError::SnapshotNotFound(snapshot_id))?;

        if !snapshot.is_open() {
            return Ok(PendingResolution::AlreadyClosed(snapshot.state));
        }

        let request = snapshot.commit_request();
        match self.ledger.submission_outcome(&request).await? {
            SubmissionOutcome::Confirmed(receipt) => {
                info!(batch_id = receipt.batch_id, "pending snapshot confirmed");
                Ok(PendingResolution::Confirmed(
                    self.finish(&request, receipt).await,
                ))
            }
            SubmissionOutcome::Pending => Ok(PendingResolution::StillPending),
            SubmissionOutcome::NotFound => {
                self.store.abandon_snapshot(snapshot_id).await?;
                info!("pending snapshot never landed, abandoned");
                Ok(PendingResolution::Abandoned)
            }
        }
    }

    async fn commit_candidates(&self, candidates: Vec<EligibleRecord>) -> Result<BatchResult> {
        let snapshot = self.build_snapshot(&candidates)?;

        let retry = Retry::new(RetryConfig::database());
        retry
            .run_with_predicate(
                "create_snapshot",
                || self.store.create_snapshot(&snapshot),
                |e: &RegistryError| e.is_retryable(),
            )
            .await?;

        info!(
            snapshot_id = %snapshot.snapshot_id,
            record_count = snapshot.record_count(),
            merkle_root = %to_hex(&snapshot.merkle_root),
            "snapshot persisted, submitting"
        );

        let request = snapshot.commit_request();
        let receipt = self.submit(&request).await?;
        Ok(self.finish(&request, receipt).await)
    }

    fn build_snapshot(&self, candidates: &[EligibleRecord]) -> Result<BatchSnapshot> {
        if candidates.is_empty() {
            return Err(RegistryError::EmptyBatch);
        }
        if candidates.len() > u32::MAX as usize {
            return Err(RegistryError::Internal(format!(
                "batch of {} records exceeds the ledger count width",
                candidates.len()
            )));
        }

        let mut seen = HashSet::with_capacity(candidates.len());
        for candidate in candidates {
            if !seen.insert(candidate.identity_hash) {
                return Err(RegistryError::DuplicateCandidate(to_hex(
                    &candidate.identity_hash,
                )));
            }
        }

        let members: Vec<SnapshotMember> = candidates
            .iter()
            .enumerate()
            .map(|(offset, record)| SnapshotMember::from_record(offset as u32, record))
            .collect();
        let tree = MerkleTree::build_with(
            self.config.scheme,
            members.iter().map(|m| m.leaf_hash).collect(),
        );

        Ok(BatchSnapshot {
            snapshot_id: Uuid::new_v4(),
            label: self.config.label.clone(),
            region_code: self.config.region_code,
            merkle_root: tree.root(),
            members,
            state: SnapshotState::Open,
            created_at: Utc::now(),
        })
    }

    /// Submit until confirmed; on an unknown outcome, ask the ledger before
    /// doing anything else
    async fn submit(&self, request: &CommitRequest) -> Result<CommitReceipt> {
        let snapshot_id = request.snapshot_id;
        let max_attempts = self.config.max_submission_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let sent = tokio::time::timeout(
                self.config.confirmation_timeout,
                self.ledger.submit_commit(request),
            )
            .await;

            let failure = match sent {
                Ok(Ok(receipt)) => return Ok(receipt),
                Ok(Err(LedgerError::SubmissionRejected(reason))) => {
                    warn!(%snapshot_id, reason = %reason, "ledger rejected submission");
                    if let Err(e) = self.store.abandon_snapshot(snapshot_id).await {
                        error!(%snapshot_id, error = %e, "failed to abandon rejected snapshot");
                    }
                    return Err(RegistryError::SubmissionRejected {
                        snapshot_id,
                        reason,
                    });
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "confirmation timeout elapsed".to_string(),
            };

            warn!(
                %snapshot_id,
                attempt,
                error = %failure,
                "submission outcome unknown, querying ledger"
            );

            match self.ledger.submission_outcome(request).await {
                Ok(SubmissionOutcome::Confirmed(receipt)) => {
                    info!(%snapshot_id, batch_id = receipt.batch_id, "submission had landed");
                    return Ok(receipt);
                }
                Ok(SubmissionOutcome::Pending) => {
                    return Err(RegistryError::SubmissionPending { snapshot_id });
                }
                Ok(SubmissionOutcome::NotFound) if attempt < max_attempts => {
                    let delay = self.config.resubmit_backoff.delay_for_attempt(attempt - 1);
                    info!(
                        %snapshot_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "submission not found on ledger, resubmitting"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(SubmissionOutcome::NotFound) => {
                    warn!(%snapshot_id, attempts = attempt, "submission attempts exhausted");
                    return Err(RegistryError::Timeout { snapshot_id });
                }
                Err(e) => {
                    warn!(%snapshot_id, error = %e, "outcome query failed, leaving snapshot open");
                    return Err(RegistryError::Timeout { snapshot_id });
                }
            }
        }
    }

    /// Reconcile a confirmed commit locally; failures are reported, not
    /// returned, since the ledger state is already final
    async fn finish(&self, request: &CommitRequest, receipt: CommitReceipt) -> BatchResult {
        let event = CommitEvent::from_receipt(request, receipt);

        let local_state = match self.reconciler.reconcile(&event, None).await {
            Ok(ReconcileOutcome::Applied { .. }) => LocalState::Persisted,
            Ok(ReconcileOutcome::AlreadyReconciled) => LocalState::AlreadyReconciled,
            Err(e) => {
                error!(
                    batch_id = event.batch_id,
                    snapshot_id = %request.snapshot_id,
                    error = %e,
                    "local reconciliation failed after confirmation; deferring to watcher"
                );
                LocalState::Deferred {
                    reason: e.to_string(),
                }
            }
        };

        BatchResult {
            batch_id: event.batch_id,
            merkle_root: event.merkle_root,
            commit_ref: event.commit_ref,
            record_count: event.record_count,
            snapshot_id: request.snapshot_id,
            position: event.position,
            local_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ApplyOutcome, BatchWrite};
    use crate::infra::{MockLedger, MockRecordStore};
    use std::sync::Mutex as StdMutex;

    fn records(n: u8) -> Vec<EligibleRecord> {
        (1..=n)
            .map(|i| EligibleRecord::new([i; 32], [i + 100; 32], 16, i as u64))
            .collect()
    }

    fn receipt(batch_id: u64) -> CommitReceipt {
        CommitReceipt {
            batch_id,
            commit_ref: CommitRef::new(format!("0x{batch_id:02x}")),
            position: ChainPosition::new(batch_id, 0),
        }
    }

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            confirmation_timeout: Duration::from_secs(5),
            resubmit_backoff: RetryConfig::fast().with_jitter(0.0),
            ..Default::default()
        }
    }

    /// Store that remembers the snapshot it was given and applies writes
    fn recording_store() -> MockRecordStore {
        let saved: Arc<StdMutex<Option<BatchSnapshot>>> = Arc::new(StdMutex::new(None));
        let mut store = MockRecordStore::new();

        let on_create = saved.clone();
        store.expect_create_snapshot().returning(move |s| {
            *on_create.lock().unwrap() = Some(s.clone());
            Ok(())
        });
        let on_get = saved.clone();
        store
            .expect_get_snapshot()
            .returning(move |_| Ok(on_get.lock().unwrap().clone()));
        store.expect_get_batch().returning(|_| Ok(None));
        store
            .expect_apply_batch()
            .returning(|_: &BatchWrite, _| Ok(ApplyOutcome::Applied));
        store
    }

    fn coordinator(ledger: MockLedger, store: MockRecordStore) -> BatchCoordinator {
        let store: Arc<dyn RecordStore> = Arc::new(store);
        let reconciler = Arc::new(Reconciler::new(store.clone(), HashScheme::Compat));
        BatchCoordinator::new(fast_config(), Arc::new(ledger), store, reconciler)
    }

    #[tokio::test]
    async fn test_rejects_empty_and_duplicate_candidates() {
        let coordinator = coordinator(MockLedger::new(), MockRecordStore::new());

        assert!(matches!(
            coordinator.create_batch(vec![]).await,
            Err(RegistryError::EmptyBatch)
        ));

        let mut dup = records(2);
        dup.push(dup[0].clone());
        assert!(matches!(
            coordinator.create_batch(dup).await,
            Err(RegistryError::DuplicateCandidate(_))
        ));
    }

    #[tokio::test]
    async fn test_confirmed_commit_is_persisted() {
        let mut ledger = MockLedger::new();
        ledger
            .expect_submit_commit()
            .withf(|r| r.record_count == 4)
            .times(1)
            .returning(|_| Ok(receipt(1)));

        let coordinator = coordinator(ledger, recording_store());
        let result = coordinator.create_batch(records(4)).await.unwrap();

        assert_eq!(result.batch_id, 1);
        assert_eq!(result.record_count, 4);
        assert_eq!(result.local_state, LocalState::Persisted);
    }

    #[tokio::test]
    async fn test_rejection_abandons_snapshot() {
        let mut ledger = MockLedger::new();
        ledger
            .expect_submit_commit()
            .returning(|_| Err(LedgerError::SubmissionRejected("paused".into())));
        ledger.expect_submission_outcome().never();

        let mut store = MockRecordStore::new();
        store.expect_create_snapshot().returning(|_| Ok(()));
        store.expect_abandon_snapshot().times(1).returning(|_| Ok(()));
        store.expect_apply_batch().never();

        let coordinator = coordinator(ledger, store);
        let err = coordinator.create_batch(records(2)).await.unwrap_err();
        assert!(matches!(err, RegistryError::SubmissionRejected { .. }));
    }

    #[tokio::test]
    async fn test_timeout_then_confirmed_reconciles() {
        let mut ledger = MockLedger::new();
        ledger
            .expect_submit_commit()
            .times(1)
            .returning(|_| Err(LedgerError::Timeout { commit_ref: None }));
        ledger
            .expect_submission_outcome()
            .times(1)
            .returning(|_| Ok(SubmissionOutcome::Confirmed(receipt(3))));

        let coordinator = coordinator(ledger, recording_store());
        let result = coordinator.create_batch(records(3)).await.unwrap();
        assert_eq!(result.batch_id, 3);
        assert_eq!(result.local_state, LocalState::Persisted);
    }

    #[tokio::test]
    async fn test_timeout_then_pending_leaves_snapshot_open() {
        let mut ledger = MockLedger::new();
        ledger
            .expect_submit_commit()
            .times(1)
            .returning(|_| Err(LedgerError::Transport("reset".into())));
        ledger
            .expect_submission_outcome()
            .returning(|_| Ok(SubmissionOutcome::Pending));

        let mut store = MockRecordStore::new();
        store.expect_create_snapshot().returning(|_| Ok(()));
        store.expect_abandon_snapshot().never();
        store.expect_apply_batch().never();

        let coordinator = coordinator(ledger, store);
        let err = coordinator.create_batch(records(2)).await.unwrap_err();
        assert!(matches!(err, RegistryError::SubmissionPending { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_resubmits_then_times_out() {
        let mut ledger = MockLedger::new();
        ledger
            .expect_submit_commit()
            .times(3)
            .returning(|_| Err(LedgerError::Timeout { commit_ref: None }));
        ledger
            .expect_submission_outcome()
            .times(3)
            .returning(|_| Ok(SubmissionOutcome::NotFound));

        let mut store = MockRecordStore::new();
        store.expect_create_snapshot().times(1).returning(|_| Ok(()));
        store.expect_abandon_snapshot().never();

        let coordinator = coordinator(ledger, store);
        let err = coordinator.create_batch(records(2)).await.unwrap_err();
        assert!(matches!(err, RegistryError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_local_failure_after_confirmation_is_deferred() {
        let mut ledger = MockLedger::new();
        ledger
            .expect_submit_commit()
            .returning(|_| Ok(receipt(5)));

        let mut store = MockRecordStore::new();
        store.expect_create_snapshot().returning(|_| Ok(()));
        store.expect_get_batch().returning(|_| Ok(None));
        store
            .expect_get_snapshot()
            .returning(|_| Err(RegistryError::Internal("disk full".into())));

        let coordinator = coordinator(ledger, store);
        let result = coordinator.create_batch(records(1)).await.unwrap();
        assert_eq!(result.batch_id, 5);
        assert!(matches!(result.local_state, LocalState::Deferred { .. }));
    }

    #[tokio::test]
    async fn test_from_store_returns_none_when_empty() {
        let mut store = MockRecordStore::new();
        store
            .expect_select_eligible()
            .withf(|limit| *limit == 500)
            .returning(|_| Ok(vec![]));

        let coordinator = coordinator(MockLedger::new(), store);
        assert_eq!(coordinator.create_batch_from_store(10_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_resolve_pending_not_found_abandons() {
        let snapshot_id = Uuid::new_v4();
        let mut store = MockRecordStore::new();
        store.expect_get_snapshot().returning(move |_| {
            let record = EligibleRecord::new([1; 32], [2; 32], 16, 1);
            let members = vec![SnapshotMember::from_record(0, &record)];
            Ok(Some(BatchSnapshot {
                snapshot_id,
                label: "batch".into(),
                region_code: 16,
                merkle_root: record.leaf_hash(),
                members,
                state: SnapshotState::Open,
                created_at: Utc::now(),
            }))
        });
        store
            .expect_abandon_snapshot()
            .with(mockall::predicate::eq(snapshot_id))
            .times(1)
            .returning(|_| Ok(()));

        let mut ledger = MockLedger::new();
        ledger
            .expect_submission_outcome()
            .returning(|_| Ok(SubmissionOutcome::NotFound));

        let coordinator = coordinator(ledger, store);
        assert_eq!(
            coordinator.resolve_pending(snapshot_id).await.unwrap(),
            PendingResolution::Abandoned
        );
    }
}
