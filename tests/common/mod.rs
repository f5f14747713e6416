//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use batch_registry::anchor::InMemoryLedger;
use batch_registry::batching::{BatchCoordinator, CoordinatorConfig};
use batch_registry::crypto::{HashScheme, MerkleTree};
use batch_registry::domain::{
    BatchSnapshot, EligibleRecord, Hash256, SnapshotMember, SnapshotState,
};
use batch_registry::indexer::{ChainWatcher, Reconciler, WatcherConfig};
use batch_registry::infra::{RecordStore, RetryConfig, SqliteRecordStore};
use batch_registry::proof::ProofService;

/// Region code used by every fixture record
pub const REGION: u16 = 16;

/// Deterministic identity hash
pub fn identity(n: u8) -> Hash256 {
    [n; 32]
}

/// Eligible record `n`; older records have smaller `n`
pub fn record(n: u8) -> EligibleRecord {
    EligibleRecord::new(identity(n), [n ^ 0xff; 32], REGION, 1_700_000_000 + n as u64)
}

/// Records 1..=n
pub fn records(n: u8) -> Vec<EligibleRecord> {
    (1..=n).map(record).collect()
}

/// Coordinator settings with short timeouts and no jitter
pub fn coordinator_config(scheme: HashScheme) -> CoordinatorConfig {
    CoordinatorConfig {
        label: "test-batch".to_string(),
        region_code: REGION,
        confirmation_timeout: Duration::from_millis(300),
        max_submission_attempts: 3,
        max_batch_size: 100,
        scheme,
        resubmit_backoff: RetryConfig::fast().with_jitter(0.0),
    }
}

/// Watcher settings that poll quickly
pub fn watcher_config(name: &str) -> WatcherConfig {
    WatcherConfig {
        name: name.to_string(),
        poll_interval: Duration::from_millis(10),
        page_size: 2,
        start_block: 0,
        halt_on_conflict: false,
        backoff: RetryConfig::fast().with_jitter(0.0),
    }
}

/// An OPEN snapshot over `records`, built outside the coordinator
pub fn snapshot_of(records: &[EligibleRecord], scheme: HashScheme) -> BatchSnapshot {
    let members: Vec<SnapshotMember> = records
        .iter()
        .enumerate()
        .map(|(i, r)| SnapshotMember::from_record(i as u32, r))
        .collect();
    let root = MerkleTree::build_with(scheme, members.iter().map(|m| m.leaf_hash).collect()).root();

    BatchSnapshot {
        snapshot_id: Uuid::new_v4(),
        label: "external".to_string(),
        region_code: REGION,
        merkle_root: root,
        members,
        state: SnapshotState::Open,
        created_at: Utc::now(),
    }
}

/// In-memory store and ledger with every component wired up
pub struct Harness {
    pub scheme: HashScheme,
    pub store: Arc<SqliteRecordStore>,
    pub ledger: Arc<InMemoryLedger>,
    pub reconciler: Arc<Reconciler>,
    pub coordinator: BatchCoordinator,
    pub proofs: ProofService,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_scheme(HashScheme::Compat).await
    }

    pub async fn with_scheme(scheme: HashScheme) -> Self {
        let store = Arc::new(
            SqliteRecordStore::in_memory()
                .await
                .expect("in-memory store"),
        );
        let ledger = Arc::new(InMemoryLedger::new());
        let reconciler = Arc::new(Reconciler::new(store.clone(), scheme));
        let coordinator = BatchCoordinator::new(
            coordinator_config(scheme),
            ledger.clone(),
            store.clone(),
            reconciler.clone(),
        );
        let proofs = ProofService::new(store.clone(), scheme);

        Self {
            scheme,
            store,
            ledger,
            reconciler,
            coordinator,
            proofs,
        }
    }

    /// Harness whose records 1..=n are already inserted
    pub async fn seeded(n: u8) -> Self {
        let harness = Self::new().await;
        harness.seed(&records(n)).await;
        harness
    }

    pub async fn seed(&self, records: &[EligibleRecord]) {
        for r in records {
            self.store.insert_record(r).await.expect("insert record");
        }
    }

    pub fn watcher(&self, config: WatcherConfig) -> ChainWatcher {
        ChainWatcher::new(
            config,
            self.ledger.clone(),
            self.store.clone(),
            self.reconciler.clone(),
        )
    }

    /// Number of batch rows
    pub async fn batch_count(&self) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM batches")
            .fetch_one(self.store.pool())
            .await
            .expect("count batches");
        count
    }
}
