//! In-process ledger with fault injection
//!
//! Appends commits to a local log, one block per commit. Faults queued with
//! `inject_fault` are consumed by subsequent submissions in order.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::crypto::{keccak, u64_be};
use crate::domain::{
    ChainPosition, CommitEvent, CommitPage, CommitReceipt, CommitRef, CommitRequest, Hash256,
    SubmissionOutcome,
};
use crate::infra::{Ledger, LedgerError};

/// Failure mode applied to one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitFault {
    /// Refuse the commit
    Reject(String),
    /// Append the commit but report a timeout
    TimeoutAfterLanding,
    /// Report a timeout; the commit never lands
    TimeoutLost,
    /// Report a timeout; the commit stays pending until `land_pending`
    TimeoutPending,
    /// Fail with a transport error before anything is sent
    Transport(String),
    /// Never return
    Hang,
}

#[derive(Default)]
struct LedgerState {
    commits: Vec<CommitEvent>,
    next_batch_id: u64,
    head: u64,
    faults: VecDeque<SubmitFault>,
    pending: HashMap<Uuid, CommitRequest>,
    fetch_failures: u32,
    submissions: u32,
}

impl LedgerState {
    fn append(
        &mut self,
        merkle_root: Hash256,
        record_count: u32,
        region_code: u16,
        metadata: Vec<u8>,
    ) -> CommitEvent {
        self.head += 1;
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        let mut seed = Vec::with_capacity(16);
        seed.extend_from_slice(&u64_be(self.head));
        seed.extend_from_slice(&u64_be(batch_id));

        let event = CommitEvent {
            batch_id,
            merkle_root,
            record_count,
            region_code,
            metadata,
            commit_ref: CommitRef::new(format!("0x{}", hex::encode(keccak(&seed)))),
            position: ChainPosition::new(self.head, 0),
        };
        self.commits.push(event.clone());
        event
    }

    fn append_request(&mut self, request: &CommitRequest) -> CommitEvent {
        self.append(
            request.merkle_root,
            request.record_count,
            request.region_code,
            request.metadata.clone(),
        )
    }
}

/// `Ledger` implementation backed by process memory
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    /// Ledger whose first batch id is 1
    pub fn new() -> Self {
        Self::with_first_batch_id(1)
    }

    pub fn with_first_batch_id(first: u64) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                next_batch_id: first,
                ..Default::default()
            }),
        }
    }

    /// Queue a fault for the next submission without one
    pub async fn inject_fault(&self, fault: SubmitFault) {
        self.state.lock().await.faults.push_back(fault);
    }

    /// Fail the next `n` calls to `fetch_commits` with a transport error
    pub async fn fail_next_fetches(&self, n: u32) {
        self.state.lock().await.fetch_failures = n;
    }

    /// Land a submission left pending by `SubmitFault::TimeoutPending`
    pub async fn land_pending(&self, snapshot_id: Uuid) -> Option<CommitEvent> {
        let mut state = self.state.lock().await;
        let request = state.pending.remove(&snapshot_id)?;
        Some(state.append_request(&request))
    }

    /// Append a commit that did not go through `submit_commit`
    pub async fn append_external(
        &self,
        merkle_root: Hash256,
        record_count: u32,
        region_code: u16,
        metadata: Vec<u8>,
    ) -> CommitEvent {
        self.state
            .lock()
            .await
            .append(merkle_root, record_count, region_code, metadata)
    }

    /// Every commit on the log, in order
    pub async fn commits(&self) -> Vec<CommitEvent> {
        self.state.lock().await.commits.clone()
    }

    /// Number of `submit_commit` calls received
    pub async fn submissions(&self) -> u32 {
        self.state.lock().await.submissions
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn submit_commit(
        &self,
        request: &CommitRequest,
    ) -> std::result::Result<CommitReceipt, LedgerError> {
        let fault = {
            let mut state = self.state.lock().await;
            state.submissions += 1;
            state.faults.pop_front()
        };

        let mut state = match fault {
            None => self.state.lock().await,
            Some(SubmitFault::Hang) => {
                debug!(snapshot_id = %request.snapshot_id, "submission hangs");
                return std::future::pending().await;
            }
            Some(SubmitFault::Reject(reason)) => {
                return Err(LedgerError::SubmissionRejected(reason));
            }
            Some(SubmitFault::Transport(reason)) => {
                return Err(LedgerError::Transport(reason));
            }
            Some(SubmitFault::TimeoutLost) => {
                return Err(LedgerError::Timeout { commit_ref: None });
            }
            Some(SubmitFault::TimeoutPending) => {
                self.state
                    .lock()
                    .await
                    .pending
                    .insert(request.snapshot_id, request.clone());
                return Err(LedgerError::Timeout { commit_ref: None });
            }
            Some(SubmitFault::TimeoutAfterLanding) => {
                let event = self.state.lock().await.append_request(request);
                return Err(LedgerError::Timeout {
                    commit_ref: Some(event.commit_ref),
                });
            }
        };

        let event = state.append_request(request);
        debug!(batch_id = event.batch_id, snapshot_id = %request.snapshot_id, "commit appended");
        Ok(event.receipt())
    }

    async fn submission_outcome(
        &self,
        request: &CommitRequest,
    ) -> std::result::Result<SubmissionOutcome, LedgerError> {
        let state = self.state.lock().await;

        if let Some(event) = state.commits.iter().find(|c| c.metadata == request.metadata) {
            return Ok(SubmissionOutcome::Confirmed(event.receipt()));
        }
        if state.pending.contains_key(&request.snapshot_id) {
            return Ok(SubmissionOutcome::Pending);
        }
        Ok(SubmissionOutcome::NotFound)
    }

    async fn fetch_commits(
        &self,
        after: Option<ChainPosition>,
        limit: usize,
    ) -> std::result::Result<CommitPage, LedgerError> {
        let mut state = self.state.lock().await;

        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            return Err(LedgerError::Transport("injected fetch failure".into()));
        }

        let events: Vec<CommitEvent> = state
            .commits
            .iter()
            .filter(|c| after.map_or(true, |a| c.position > a))
            .take(limit)
            .cloned()
            .collect();

        let high_water = match events.last() {
            Some(last) if events.len() == limit => Some(last.position),
            _ => Some(ChainPosition::end_of_block(state.head)).max(after),
        };

        Ok(CommitPage { events, high_water })
    }
}
