//! EVM ledger client for the `BatchRegistry` contract
//!
//! Commits go through `commitBatch`; confirmations and the watcher feed are
//! read back from `BatchCommitted` logs.

use std::collections::HashMap;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, FixedBytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy::transports::http::reqwest::Url;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    ChainPosition, CommitEvent, CommitPage, CommitReceipt, CommitRef, CommitRequest, Hash256,
    SubmissionOutcome,
};
use crate::infra::{Ledger, LedgerError, RegistryError, Result};

// Generate contract bindings
sol! {
    #[sol(rpc)]
    interface IBatchRegistry {
        event BatchCommitted(
            uint256 indexed batchId,
            bytes32 merkleRoot,
            address indexed operator,
            uint16 wilaya,
            uint32 batchSize,
            bytes metadata
        );

        function commitBatch(
            bytes32 merkleRoot,
            uint16 wilaya,
            uint32 batchSize,
            bytes metadata
        ) external returns (uint256 batchId);

        function getBatchRoot(uint256 batchId) external view returns (bytes32);
    }
}

/// Ledger connection configuration
#[derive(Debug, Clone)]
pub struct AnchorConfig {
    /// JSON-RPC endpoint
    pub rpc_url: String,
    /// `BatchRegistry` contract address
    pub registry_address: Address,
    /// Operator key used to sign commits
    pub private_key: String,
    pub chain_id: u64,
    /// Blocks a commit must be buried under before it is reported
    pub confirmations: u64,
    /// Maximum block span per log query
    pub log_range: u64,
    /// Upper bound on waiting for a receipt
    pub receipt_timeout: Duration,
}

impl AnchorConfig {
    /// Load configuration from environment variables.
    ///
    /// Returns `None` when the ledger is not configured.
    pub fn from_env() -> Option<Self> {
        let rpc_url = std::env::var("LEDGER_RPC_URL").ok()?;
        let registry_address = std::env::var("BATCH_REGISTRY_ADDRESS")
            .ok()
            .and_then(|s| s.parse().ok())?;
        let private_key = std::env::var("OPERATOR_PRIVATE_KEY").ok()?;
        let chain_id = std::env::var("LEDGER_CHAIN_ID")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(31337);
        let confirmations = std::env::var("LEDGER_CONFIRMATIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);
        let log_range = std::env::var("LEDGER_LOG_RANGE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2_000);

        Some(Self {
            rpc_url,
            registry_address,
            private_key,
            chain_id,
            confirmations,
            log_range,
            receipt_timeout: Duration::from_secs(120),
        })
    }
}

/// `Ledger` implementation over an EVM JSON-RPC endpoint
pub struct EvmLedger {
    config: AnchorConfig,
    url: Url,
    signer: PrivateKeySigner,
    /// Transaction hash of the latest submission per snapshot
    submitted: Mutex<HashMap<Uuid, B256>>,
}

impl EvmLedger {
    pub fn new(config: AnchorConfig) -> Result<Self> {
        let signer: PrivateKeySigner = config
            .private_key
            .parse()
            .map_err(|e| RegistryError::Configuration(format!("invalid private key: {e}")))?;
        let url: Url = config
            .rpc_url
            .parse()
            .map_err(|e| RegistryError::Configuration(format!("invalid RPC URL: {e}")))?;

        Ok(Self {
            config,
            url,
            signer,
            submitted: Mutex::new(HashMap::new()),
        })
    }

    /// Outcome lookup behind `submission_outcome`
    async fn query_outcome(
        &self,
        request: &CommitRequest,
    ) -> std::result::Result<SubmissionOutcome, LedgerError> {
        let provider = ProviderBuilder::new().on_http(self.url.clone());
        let known = self.submitted.lock().await.get(&request.snapshot_id).copied();

        if let Some(tx_hash) = known {
            let receipt = provider
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(transport)?;

            match receipt {
                Some(receipt) if receipt.status() => {
                    let event = receipt.inner.logs().iter().find_map(|log| decode_commit(log).ok());
                    let head = provider.get_block_number().await.map_err(transport)?;
                    let head = self.safe_head(head);
                    return Ok(match event {
                        Some(event) if event.position.block_number <= head => {
                            SubmissionOutcome::Confirmed(event.receipt())
                        }
                        Some(_) => SubmissionOutcome::Pending,
                        None => SubmissionOutcome::NotFound,
                    });
                }
                Some(_) => {
                    debug!(tx = %tx_hash, "submission reverted");
                    return Ok(SubmissionOutcome::NotFound);
                }
                None => {
                    let tx = provider
                        .get_transaction_by_hash(tx_hash)
                        .await
                        .map_err(transport)?;
                    if tx.is_some() {
                        return Ok(SubmissionOutcome::Pending);
                    }
                }
            }
        }

        // Unknown or dropped transaction: the commit may still have landed
        // through an earlier attempt
        let head = provider.get_block_number().await.map_err(transport)?;
        let head = self.safe_head(head);
        let logs = provider
            .get_logs(&self.commit_filter(head.saturating_sub(self.config.log_range), head))
            .await
            .map_err(transport)?;

        match find_by_metadata(&logs, &request.metadata) {
            Some(event) => Ok(SubmissionOutcome::Confirmed(event.receipt())),
            None => Ok(SubmissionOutcome::NotFound),
        }
    }

    /// Drop the tracked transaction once its outcome is final
    async fn settle(&self, snapshot_id: Uuid, outcome: &SubmissionOutcome) {
        if !matches!(outcome, SubmissionOutcome::Pending) {
            self.forget(snapshot_id).await;
        }
    }

    async fn forget(&self, snapshot_id: Uuid) {
        self.submitted.lock().await.remove(&snapshot_id);
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn operator(&self) -> Address {
        self.signer.address()
    }

    /// Root the contract recorded for `batch_id`
    pub async fn onchain_root(&self, batch_id: u64) -> Result<Hash256> {
        let provider = ProviderBuilder::new().on_http(self.url.clone());
        let contract = IBatchRegistry::new(self.config.registry_address, &provider);

        let root = contract
            .getBatchRoot(U256::from(batch_id))
            .call()
            .await
            .map_err(|e| RegistryError::Ledger(transport(e)))?;

        Ok(root._0.0)
    }

    /// Latest block buried under the configured confirmations
    fn safe_head(&self, head: u64) -> u64 {
        head.saturating_sub(self.config.confirmations.saturating_sub(1))
    }

    fn commit_filter(&self, from_block: u64, to_block: u64) -> Filter {
        Filter::new()
            .address(self.config.registry_address)
            .event_signature(IBatchRegistry::BatchCommitted::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block)
    }
}

/// First decodable commit in `logs` carrying `metadata`
fn find_by_metadata(logs: &[Log], metadata: &[u8]) -> Option<CommitEvent> {
    logs.iter().find_map(|log| match decode_commit(log) {
        Ok(event) if event.metadata == metadata => Some(event),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "skipping undecodable BatchCommitted log");
            None
        }
    })
}

fn transport(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Transport(e.to_string())
}

fn classify_send_error(e: alloy::contract::Error) -> LedgerError {
    match e {
        // The node answered with an error object: revert, bad nonce, underpriced
        alloy::contract::Error::TransportError(te) if te.as_error_resp().is_some() => {
            LedgerError::SubmissionRejected(te.to_string())
        }
        alloy::contract::Error::TransportError(te) => LedgerError::Transport(te.to_string()),
        other => LedgerError::SubmissionRejected(other.to_string()),
    }
}

/// Decode a `BatchCommitted` log into a commit event
fn decode_commit(log: &Log) -> std::result::Result<CommitEvent, LedgerError> {
    let decoded = log
        .log_decode::<IBatchRegistry::BatchCommitted>()
        .map_err(|e| LedgerError::Transport(format!("invalid BatchCommitted log: {e}")))?;
    let event = &decoded.inner.data;

    let batch_id = u64::try_from(event.batchId)
        .map_err(|_| LedgerError::Transport(format!("batch id out of range: {}", event.batchId)))?;
    let block_number = log
        .block_number
        .ok_or_else(|| LedgerError::Transport("log without block number".into()))?;
    let log_index = log
        .log_index
        .ok_or_else(|| LedgerError::Transport("log without index".into()))?;
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| LedgerError::Transport("log without transaction hash".into()))?;

    Ok(CommitEvent {
        batch_id,
        merkle_root: event.merkleRoot.0,
        record_count: event.batchSize,
        region_code: event.wilaya,
        metadata: event.metadata.to_vec(),
        commit_ref: CommitRef::new(format!("{tx_hash:#x}")),
        position: ChainPosition::new(block_number, log_index),
    })
}

#[async_trait]
impl Ledger for EvmLedger {
    async fn submit_commit(
        &self,
        request: &CommitRequest,
    ) -> std::result::Result<CommitReceipt, LedgerError> {
        info!(
            snapshot_id = %request.snapshot_id,
            record_count = request.record_count,
            root = %hex::encode(request.merkle_root),
            "submitting batch commit"
        );

        // Create provider with signer and recommended fillers (nonce, gas, chain id)
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(EthereumWallet::from(self.signer.clone()))
            .on_http(self.url.clone());

        let contract = IBatchRegistry::new(self.config.registry_address, &provider);
        let call = contract.commitBatch(
            FixedBytes::from(request.merkle_root),
            request.region_code,
            request.record_count,
            Bytes::from(request.metadata.clone()),
        );

        let pending = call.send().await.map_err(classify_send_error)?;
        let tx_hash = *pending.tx_hash();
        self.submitted
            .lock()
            .await
            .insert(request.snapshot_id, tx_hash);

        let commit_ref = CommitRef::new(format!("{tx_hash:#x}"));
        info!(snapshot_id = %request.snapshot_id, tx = %commit_ref, "transaction sent");

        let receipt = pending
            .with_required_confirmations(self.config.confirmations.max(1))
            .with_timeout(Some(self.config.receipt_timeout))
            .get_receipt()
            .await
            .map_err(|e| {
                warn!(tx = %commit_ref, error = %e, "receipt not observed");
                LedgerError::Timeout {
                    commit_ref: Some(commit_ref.clone()),
                }
            })?;

        self.forget(request.snapshot_id).await;

        if !receipt.status() {
            return Err(LedgerError::SubmissionRejected(format!(
                "transaction {commit_ref} reverted"
            )));
        }

        let event = receipt
            .inner
            .logs()
            .iter()
            .find_map(|log| decode_commit(log).ok())
            .ok_or_else(|| {
                LedgerError::SubmissionRejected(format!(
                    "transaction {commit_ref} emitted no BatchCommitted event"
                ))
            })?;

        info!(
            batch_id = event.batch_id,
            tx = %commit_ref,
            block = event.position.block_number,
            "batch committed"
        );
        Ok(event.receipt())
    }

    async fn submission_outcome(
        &self,
        request: &CommitRequest,
    ) -> std::result::Result<SubmissionOutcome, LedgerError> {
        let outcome = self.query_outcome(request).await?;
        self.settle(request.snapshot_id, &outcome).await;
        Ok(outcome)
    }

    async fn fetch_commits(
        &self,
        after: Option<ChainPosition>,
        limit: usize,
    ) -> std::result::Result<CommitPage, LedgerError> {
        let provider = ProviderBuilder::new().on_http(self.url.clone());
        let head = provider.get_block_number().await.map_err(transport)?;
        let safe_head = self.safe_head(head);

        let from_block = match after {
            // A position at the end of a block resumes at the next block
            Some(p) if p.log_index == u64::MAX => p.block_number.saturating_add(1),
            Some(p) => p.block_number,
            None => 0,
        };
        if from_block > safe_head {
            return Ok(CommitPage {
                events: Vec::new(),
                high_water: after,
            });
        }
        let to_block = safe_head.min(from_block.saturating_add(self.config.log_range));

        let logs = provider
            .get_logs(&self.commit_filter(from_block, to_block))
            .await
            .map_err(transport)?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_commit(log) {
                Ok(event) if after.map_or(true, |a| event.position > a) => events.push(event),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "skipping undecodable BatchCommitted log"),
            }
        }
        events.sort_by_key(|e| e.position);

        let high_water = if events.len() > limit {
            events.truncate(limit);
            events.last().map(|e| e.position)
        } else {
            Some(ChainPosition::end_of_block(to_block))
        };

        debug!(
            from_block,
            to_block,
            events = events.len(),
            "fetched commit events"
        );
        Ok(CommitPage { events, high_water })
    }
}
