//! End-to-end batch lifecycle against in-memory SQLite and the in-memory
//! ledger: creation, confirmation paths, proofs and integrity checks.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use batch_registry::anchor::SubmitFault;
use batch_registry::batching::{LocalState, PendingResolution};
use batch_registry::crypto::{hash_pair, verify, HashScheme, MerkleTree};
use batch_registry::domain::{ProofResult, RecordStatus, SnapshotState};
use batch_registry::infra::{RecordStore, RegistryError};

use common::{identity, record, records, Harness};

#[tokio::test]
async fn test_four_records_batch_and_prove() {
    let harness = Harness::seeded(4).await;
    let leaves: Vec<_> = records(4).iter().map(|r| r.leaf_hash()).collect();

    let result = harness.coordinator.create_batch(records(4)).await.unwrap();

    let expected_root = hash_pair(
        &hash_pair(&leaves[0], &leaves[1]),
        &hash_pair(&leaves[2], &leaves[3]),
    );
    assert_eq!(result.batch_id, 1);
    assert_eq!(result.record_count, 4);
    assert_eq!(result.merkle_root, expected_root);
    assert_eq!(result.local_state, LocalState::Persisted);

    for (offset, r) in records(4).iter().enumerate() {
        let stored = harness.store.get_record(&r.identity_hash).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Batched);

        let proof = match harness.proofs.get_proof(&r.identity_hash).await.unwrap() {
            ProofResult::Included(proof) => proof,
            ProofResult::NotYetBatched => panic!("record {offset} should be batched"),
        };
        assert_eq!(proof.offset as usize, offset);
        assert_eq!(proof.proof.len(), 2);
        assert_eq!(proof.merkle_root, expected_root);
        assert!(verify(&proof.leaf_hash, &proof.proof, offset, &expected_root));
    }

    let snapshot = harness
        .store
        .get_snapshot(result.snapshot_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.state, SnapshotState::Confirmed { batch_id: 1 });
}

#[tokio::test]
async fn test_odd_batch_duplicates_last_node() {
    let harness = Harness::seeded(3).await;
    let leaves: Vec<_> = records(3).iter().map(|r| r.leaf_hash()).collect();

    let result = harness.coordinator.create_batch(records(3)).await.unwrap();
    assert_eq!(
        result.merkle_root,
        hash_pair(
            &hash_pair(&leaves[0], &leaves[1]),
            &hash_pair(&leaves[2], &leaves[2])
        )
    );

    let proof = harness.proofs.get_proof(&identity(3)).await.unwrap();
    let proof = proof.inclusion().unwrap();
    assert_eq!(proof.proof, vec![leaves[2], hash_pair(&leaves[0], &leaves[1])]);
    assert!(harness.proofs.verify_proof(proof));
}

#[tokio::test]
async fn test_unbatched_record_has_no_proof() {
    let harness = Harness::seeded(1).await;
    assert_eq!(
        harness.proofs.get_proof(&identity(1)).await.unwrap(),
        ProofResult::NotYetBatched
    );
}

#[tokio::test]
async fn test_batch_from_store_takes_oldest_first() {
    let harness = Harness::seeded(5).await;

    let first = harness
        .coordinator
        .create_batch_from_store(3)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.record_count, 3);
    for n in 1..=3 {
        let leaf = harness.store.get_leaf(&identity(n)).await.unwrap().unwrap();
        assert_eq!(leaf.batch_id, first.batch_id);
        assert_eq!(leaf.offset, (n - 1) as u32);
    }

    let second = harness
        .coordinator
        .create_batch_from_store(10)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.record_count, 2);
    assert_ne!(first.batch_id, second.batch_id);

    assert!(harness
        .coordinator
        .create_batch_from_store(10)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_record_is_never_batched_twice() {
    let harness = Harness::seeded(2).await;
    harness.coordinator.create_batch(records(2)).await.unwrap();

    let err = harness
        .coordinator
        .create_batch(vec![record(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::CandidateNotEligible { .. }));
    assert_eq!(harness.ledger.commits().await.len(), 1);
}

#[tokio::test]
async fn test_pending_record_is_not_eligible() {
    let harness = Harness::new().await;
    harness
        .seed(&[record(1).with_status(RecordStatus::Pending)])
        .await;

    let err = harness
        .coordinator
        .create_batch(vec![record(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::CandidateNotEligible { .. }));
    assert!(harness.ledger.commits().await.is_empty());
}

#[tokio::test]
async fn test_rejection_releases_records() {
    let harness = Harness::seeded(2).await;
    harness
        .ledger
        .inject_fault(SubmitFault::Reject("registry paused".into()))
        .await;

    let err = harness.coordinator.create_batch(records(2)).await.unwrap_err();
    let snapshot_id = match err {
        RegistryError::SubmissionRejected { snapshot_id, .. } => snapshot_id,
        other => panic!("expected rejection, got {other}"),
    };

    let snapshot = harness.store.get_snapshot(snapshot_id).await.unwrap().unwrap();
    assert_eq!(snapshot.state, SnapshotState::Abandoned);
    assert_eq!(harness.batch_count().await, 0);
    for r in records(2) {
        let stored = harness.store.get_record(&r.identity_hash).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Eligible);
    }

    // Released records batch normally afterwards
    let result = harness.coordinator.create_batch(records(2)).await.unwrap();
    assert_eq!(result.local_state, LocalState::Persisted);
}

#[tokio::test]
async fn test_timeout_after_landing_is_not_resubmitted() {
    let harness = Harness::seeded(2).await;
    harness
        .ledger
        .inject_fault(SubmitFault::TimeoutAfterLanding)
        .await;

    let result = harness.coordinator.create_batch(records(2)).await.unwrap();

    assert_eq!(result.local_state, LocalState::Persisted);
    assert_eq!(harness.ledger.submissions().await, 1);
    assert_eq!(harness.ledger.commits().await.len(), 1);
}

#[tokio::test]
async fn test_lost_submission_is_resubmitted_once() {
    let harness = Harness::seeded(2).await;
    harness.ledger.inject_fault(SubmitFault::TimeoutLost).await;

    let result = harness.coordinator.create_batch(records(2)).await.unwrap();

    assert_eq!(result.local_state, LocalState::Persisted);
    assert_eq!(harness.ledger.submissions().await, 2);
    assert_eq!(harness.ledger.commits().await.len(), 1);
}

#[tokio::test]
async fn test_hung_submission_hits_confirmation_timeout() {
    let harness = Harness::seeded(1).await;
    harness.ledger.inject_fault(SubmitFault::Hang).await;

    let result = harness.coordinator.create_batch(records(1)).await.unwrap();

    assert_eq!(harness.ledger.submissions().await, 2);
    assert_eq!(result.local_state, LocalState::Persisted);
}

#[tokio::test]
async fn test_exhausted_attempts_leave_snapshot_open() {
    let harness = Harness::seeded(2).await;
    for _ in 0..3 {
        harness.ledger.inject_fault(SubmitFault::TimeoutLost).await;
    }

    let err = harness.coordinator.create_batch(records(2)).await.unwrap_err();
    let snapshot_id = match err {
        RegistryError::Timeout { snapshot_id } => snapshot_id,
        other => panic!("expected timeout, got {other}"),
    };

    let snapshot = harness.store.get_snapshot(snapshot_id).await.unwrap().unwrap();
    assert!(snapshot.is_open());
    // Held records are not selectable while the snapshot is open
    assert!(harness
        .coordinator
        .create_batch_from_store(10)
        .await
        .unwrap()
        .is_none());

    // The ledger never saw it, so resolution abandons and releases
    assert_eq!(
        harness.coordinator.resolve_pending(snapshot_id).await.unwrap(),
        PendingResolution::Abandoned
    );
    assert!(harness
        .coordinator
        .create_batch_from_store(10)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_pending_submission_resolves_without_double_batching() {
    let harness = Harness::seeded(3).await;
    harness.ledger.inject_fault(SubmitFault::TimeoutPending).await;

    let err = harness.coordinator.create_batch(records(3)).await.unwrap_err();
    let snapshot_id = match err {
        RegistryError::SubmissionPending { snapshot_id } => snapshot_id,
        other => panic!("expected pending, got {other}"),
    };
    assert_eq!(
        harness.coordinator.resolve_pending(snapshot_id).await.unwrap(),
        PendingResolution::StillPending
    );

    harness.ledger.land_pending(snapshot_id).await.unwrap();
    let result = match harness.coordinator.resolve_pending(snapshot_id).await.unwrap() {
        PendingResolution::Confirmed(result) => result,
        other => panic!("expected confirmation, got {other:?}"),
    };
    assert_eq!(result.local_state, LocalState::Persisted);

    // The watcher sees the same commit and skips it
    let watcher = harness.watcher(common::watcher_config("pending"));
    assert_eq!(watcher.catch_up().await.unwrap(), 1);
    assert_eq!(watcher.stats().await.events_skipped, 1);
    assert_eq!(harness.batch_count().await, 1);

    assert!(matches!(
        harness.coordinator.resolve_pending(snapshot_id).await.unwrap(),
        PendingResolution::AlreadyClosed(SnapshotState::Confirmed { .. })
    ));
}

#[tokio::test]
async fn test_tampered_leaf_is_integrity_mismatch() {
    let harness = Harness::seeded(4).await;
    harness.coordinator.create_batch(records(4)).await.unwrap();

    sqlx::query("UPDATE leaves SET leaf_hash = ? WHERE identity_hash = ?")
        .bind([0xdeu8; 32].as_slice())
        .bind(identity(2).as_slice())
        .execute(harness.store.pool())
        .await
        .unwrap();

    let err = harness.proofs.get_proof(&identity(1)).await.unwrap_err();
    assert!(matches!(err, RegistryError::IntegrityMismatch { batch_id: 1, .. }));
}

#[tokio::test]
async fn test_domain_separated_scheme_round_trips() {
    let harness = Harness::with_scheme(HashScheme::DomainSeparated).await;
    harness.seed(&records(3)).await;
    let leaves: Vec<_> = records(3).iter().map(|r| r.leaf_hash()).collect();

    let result = harness.coordinator.create_batch(records(3)).await.unwrap();

    assert_ne!(result.merkle_root, MerkleTree::build(leaves.clone()).root());
    assert_eq!(
        result.merkle_root,
        MerkleTree::build_with(HashScheme::DomainSeparated, leaves).root()
    );

    let proof = harness.proofs.get_proof(&identity(2)).await.unwrap();
    let proof = proof.inclusion().unwrap();
    assert!(proof.verify(HashScheme::DomainSeparated));
    assert!(!proof.verify(HashScheme::Compat));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_batches_never_share_records() {
    let harness = Arc::new(Harness::seeded(6).await);

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let harness = harness.clone();
            tokio::spawn(async move { harness.coordinator.create_batch_from_store(6).await })
        })
        .collect();

    let mut created = Vec::new();
    for task in tasks {
        if let Some(result) = task.await.unwrap().unwrap() {
            created.push(result);
        }
    }

    assert_eq!(created.len(), 1);
    assert_eq!(created[0].record_count, 6);
    assert_eq!(harness.batch_count().await, 1);
    assert_eq!(harness.ledger.commits().await.len(), 1);

    let mut seen = HashSet::new();
    for n in 1..=6 {
        let leaf = harness.store.get_leaf(&identity(n)).await.unwrap().unwrap();
        assert_eq!(leaf.batch_id, created[0].batch_id);
        assert!(seen.insert(leaf.offset));
    }
}
