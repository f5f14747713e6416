//! SQLite record store
//!
//! Timestamps are RFC 3339 text, digests are 32-byte blobs and ledger
//! integers are stored as SQLite INTEGER (i64).

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::bytes32;
use crate::domain::{
    to_hex, ApplyOutcome, BatchRecord, BatchSnapshot, BatchWrite, ChainPosition, CommitRef,
    ConflictReason, ConflictRecord, EligibleBacklog, EligibleRecord, Hash256, LeafRecord,
    RecordStatus, SnapshotMember, SnapshotState, WatcherCheckpoint,
};
use crate::infra::{RecordStore, RegistryError, Result};

/// Records that may enter a new snapshot: ELIGIBLE, without a leaf, and not
/// held by an OPEN snapshot
const SELECTABLE: &str = r#"
    r.status = 'eligible'
    AND NOT EXISTS (SELECT 1 FROM leaves l WHERE l.identity_hash = r.identity_hash)
    AND NOT EXISTS (
        SELECT 1 FROM snapshot_members m
        JOIN snapshots s ON s.snapshot_id = m.snapshot_id
        WHERE m.identity_hash = r.identity_hash AND s.state = 'open'
    )
"#;

/// SQLite-backed record store
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    /// Create a store over an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) a database at `url`
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        Ok(Self::new(pool))
    }

    /// Private in-memory database with the schema applied
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // One connection that never expires: the database lives in it
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.initialize().await?;
        Ok(store)
    }

    /// Apply migrations
    pub async fn initialize(&self) -> Result<()> {
        crate::migrations::run_sqlite(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(FromRow)]
struct RecordRow {
    identity_hash: Vec<u8>,
    file_hash: Vec<u8>,
    region_code: i64,
    eligible_since: i64,
    status: String,
}

impl TryFrom<RecordRow> for EligibleRecord {
    type Error = RegistryError;

    fn try_from(row: RecordRow) -> Result<Self> {
        Ok(EligibleRecord {
            identity_hash: bytes32("identity_hash", &row.identity_hash)?,
            file_hash: bytes32("file_hash", &row.file_hash)?,
            region_code: region_code(row.region_code)?,
            eligible_since: row.eligible_since as u64,
            status: parse_status(&row.status)?,
        })
    }
}

#[derive(FromRow)]
struct BatchRow {
    batch_id: i64,
    merkle_root: Vec<u8>,
    commit_ref: String,
    record_count: i64,
    region_code: i64,
    snapshot_id: Option<String>,
    block_number: i64,
    log_index: i64,
    created_at: String,
}

impl TryFrom<BatchRow> for BatchRecord {
    type Error = RegistryError;

    fn try_from(row: BatchRow) -> Result<Self> {
        Ok(BatchRecord {
            batch_id: row.batch_id as u64,
            merkle_root: bytes32("merkle_root", &row.merkle_root)?,
            commit_ref: CommitRef::new(row.commit_ref),
            record_count: count(row.record_count)?,
            region_code: region_code(row.region_code)?,
            snapshot_id: row.snapshot_id.as_deref().map(parse_uuid).transpose()?,
            position: ChainPosition::new(row.block_number as u64, row.log_index as u64),
            created_at: parse_time(&row.created_at)?,
        })
    }
}

#[derive(FromRow)]
struct LeafRow {
    identity_hash: Vec<u8>,
    leaf_hash: Vec<u8>,
    batch_id: i64,
    leaf_offset: i64,
}

impl TryFrom<LeafRow> for LeafRecord {
    type Error = RegistryError;

    fn try_from(row: LeafRow) -> Result<Self> {
        Ok(LeafRecord {
            identity_hash: bytes32("identity_hash", &row.identity_hash)?,
            leaf_hash: bytes32("leaf_hash", &row.leaf_hash)?,
            batch_id: row.batch_id as u64,
            offset: count(row.leaf_offset)?,
        })
    }
}

#[derive(FromRow)]
struct SnapshotRow {
    snapshot_id: String,
    label: String,
    region_code: i64,
    merkle_root: Vec<u8>,
    state: String,
    batch_id: Option<i64>,
    created_at: String,
}

#[derive(FromRow)]
struct MemberRow {
    member_offset: i64,
    identity_hash: Vec<u8>,
    file_hash: Vec<u8>,
    eligible_since: i64,
    region_code: i64,
    leaf_hash: Vec<u8>,
}

impl TryFrom<MemberRow> for SnapshotMember {
    type Error = RegistryError;

    fn try_from(row: MemberRow) -> Result<Self> {
        Ok(SnapshotMember {
            offset: count(row.member_offset)?,
            identity_hash: bytes32("identity_hash", &row.identity_hash)?,
            file_hash: bytes32("file_hash", &row.file_hash)?,
            eligible_since: row.eligible_since as u64,
            region_code: region_code(row.region_code)?,
            leaf_hash: bytes32("leaf_hash", &row.leaf_hash)?,
        })
    }
}

#[derive(FromRow)]
struct ConflictRow {
    batch_id: i64,
    snapshot_id: Option<String>,
    reason: String,
    detail: String,
    commit_ref: String,
    block_number: i64,
    log_index: i64,
    created_at: String,
}

impl TryFrom<ConflictRow> for ConflictRecord {
    type Error = RegistryError;

    fn try_from(row: ConflictRow) -> Result<Self> {
        Ok(ConflictRecord {
            batch_id: row.batch_id as u64,
            snapshot_id: row.snapshot_id.as_deref().map(parse_uuid).transpose()?,
            reason: ConflictReason::from_str(&row.reason).map_err(RegistryError::Internal)?,
            detail: row.detail,
            commit_ref: CommitRef::new(row.commit_ref),
            position: ChainPosition::new(row.block_number as u64, row.log_index as u64),
            created_at: parse_time(&row.created_at)?,
        })
    }
}

fn parse_status(s: &str) -> Result<RecordStatus> {
    RecordStatus::from_str(s).map_err(RegistryError::Internal)
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| RegistryError::Internal(format!("invalid uuid {s}: {e}")))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RegistryError::Internal(format!("invalid timestamp {s}: {e}")))
}

fn region_code(value: i64) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| RegistryError::Internal(format!("region code out of range: {value}")))
}

fn count(value: i64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| RegistryError::Internal(format!("count out of range: {value}")))
}

fn snapshot_state(state: &str, batch_id: Option<i64>) -> Result<SnapshotState> {
    match (state, batch_id) {
        ("open", _) => Ok(SnapshotState::Open),
        ("confirmed", Some(id)) => Ok(SnapshotState::Confirmed {
            batch_id: id as u64,
        }),
        ("abandoned", _) => Ok(SnapshotState::Abandoned),
        (other, _) => Err(RegistryError::Internal(format!(
            "invalid snapshot state: {other}"
        ))),
    }
}

// ============================================================================
// Transaction helpers
// ============================================================================

async fn upsert_checkpoint(
    tx: &mut Transaction<'_, Sqlite>,
    checkpoint: &WatcherCheckpoint,
) -> Result<()> {
    let current: Option<(i64, i64)> = sqlx::query_as(
        "SELECT block_number, log_index FROM watcher_checkpoints WHERE name = ?",
    )
    .bind(&checkpoint.name)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some((block, log)) = current {
        let current = ChainPosition::new(block as u64, log as u64);
        if current >= checkpoint.position {
            debug!(
                watcher = %checkpoint.name,
                current = %current,
                requested = %checkpoint.position,
                "checkpoint already at or past position"
            );
            return Ok(());
        }
    }

    sqlx::query(
        r#"
        INSERT INTO watcher_checkpoints (name, block_number, log_index, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (name) DO UPDATE SET
            block_number = excluded.block_number,
            log_index = excluded.log_index,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&checkpoint.name)
    .bind(checkpoint.position.block_number as i64)
    .bind(checkpoint.position.log_index as i64)
    .bind(checkpoint.updated_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Why a record cannot be selected, if it cannot
async fn unselectable_reason(
    tx: &mut Transaction<'_, Sqlite>,
    member: &SnapshotMember,
) -> Result<Option<String>> {
    let row: Option<RecordRow> = sqlx::query_as(
        r#"
        SELECT identity_hash, file_hash, region_code, eligible_since, status
        FROM records WHERE identity_hash = ?
        "#,
    )
    .bind(member.identity_hash.as_slice())
    .fetch_optional(&mut **tx)
    .await?;

    let Some(row) = row else {
        return Ok(Some("record not found".to_string()));
    };
    let record = EligibleRecord::try_from(row)?;

    if record.status != RecordStatus::Eligible {
        return Ok(Some(format!("status is {}", record.status)));
    }
    if record.file_hash != member.file_hash
        || record.eligible_since != member.eligible_since
        || record.region_code != member.region_code
    {
        return Ok(Some("candidate fields differ from stored record".to_string()));
    }

    let leaf: Option<(i64,)> = sqlx::query_as("SELECT batch_id FROM leaves WHERE identity_hash = ?")
        .bind(member.identity_hash.as_slice())
        .fetch_optional(&mut **tx)
        .await?;
    if let Some((batch_id,)) = leaf {
        return Ok(Some(format!("already committed in batch {batch_id}")));
    }

    let held: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT m.snapshot_id FROM snapshot_members m
        JOIN snapshots s ON s.snapshot_id = m.snapshot_id
        WHERE m.identity_hash = ? AND s.state = 'open'
        LIMIT 1
        "#,
    )
    .bind(member.identity_hash.as_slice())
    .fetch_optional(&mut **tx)
    .await?;
    if let Some((snapshot_id,)) = held {
        return Ok(Some(format!("held by open snapshot {snapshot_id}")));
    }

    Ok(None)
}

/// Check that a leaf's record can be flipped to BATCHED
async fn check_batchable(
    tx: &mut Transaction<'_, Sqlite>,
    write: &BatchWrite,
    leaf: &LeafRecord,
) -> Result<()> {
    let conflict = |reason: ConflictReason, detail: String| {
        RegistryError::conflict(write.batch.batch_id, Some(write.snapshot_id), reason, detail)
    };
    let identity = to_hex(&leaf.identity_hash);

    let status: Option<(String,)> =
        sqlx::query_as("SELECT status FROM records WHERE identity_hash = ?")
            .bind(leaf.identity_hash.as_slice())
            .fetch_optional(&mut **tx)
            .await?;

    let status = match status {
        Some((status,)) => parse_status(&status)?,
        None => {
            return Err(conflict(
                ConflictReason::RecordNotEligible,
                format!("record {identity} not found"),
            ))
        }
    };

    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT batch_id FROM leaves WHERE identity_hash = ?")
            .bind(leaf.identity_hash.as_slice())
            .fetch_optional(&mut **tx)
            .await?;
    if let Some((other,)) = existing {
        return Err(conflict(
            ConflictReason::RecordAlreadyBatched,
            format!("record {identity} already committed in batch {other}"),
        ));
    }

    if status.is_batched() {
        return Err(conflict(
            ConflictReason::RecordAlreadyBatched,
            format!("record {identity} has status {status}"),
        ));
    }
    if status != RecordStatus::Eligible {
        return Err(conflict(
            ConflictReason::RecordNotEligible,
            format!("record {identity} has status {status}"),
        ));
    }

    Ok(())
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert_record(&self, record: &EligibleRecord) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO records (
                identity_hash, file_hash, region_code, eligible_since,
                status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.identity_hash.as_slice())
        .bind(record.file_hash.as_slice())
        .bind(record.region_code as i64)
        .bind(record.eligible_since as i64)
        .bind(record.status.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_record(&self, identity_hash: &Hash256) -> Result<Option<EligibleRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(
            r#"
            SELECT identity_hash, file_hash, region_code, eligible_since, status
            FROM records WHERE identity_hash = ?
            "#,
        )
        .bind(identity_hash.as_slice())
        .fetch_optional(&self.pool)
        .await?;

        row.map(EligibleRecord::try_from).transpose()
    }

    async fn transition_status(
        &self,
        identity_hash: &Hash256,
        to: RecordStatus,
    ) -> Result<RecordStatus> {
        let identity = to_hex(identity_hash);
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM records WHERE identity_hash = ?")
                .bind(identity_hash.as_slice())
                .fetch_optional(&mut *tx)
                .await?;
        let from = match current {
            Some((status,)) => parse_status(&status)?,
            None => return Err(RegistryError::RecordNotFound(identity)),
        };

        // ELIGIBLE -> BATCHED only happens through reconciliation
        if !from.can_transition_to(to) || to == RecordStatus::Batched {
            return Err(RegistryError::InvalidStatusTransition { identity, from, to });
        }

        sqlx::query(
            "UPDATE records SET status = ?, updated_at = ? WHERE identity_hash = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(identity_hash.as_slice())
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(identity = %identity, from = %from, to = %to, "record status changed");
        Ok(from)
    }

    async fn select_eligible(&self, limit: usize) -> Result<Vec<EligibleRecord>> {
        let sql = format!(
            r#"
            SELECT r.identity_hash, r.file_hash, r.region_code, r.eligible_since, r.status
            FROM records r
            WHERE {SELECTABLE}
            ORDER BY r.eligible_since ASC, r.identity_hash ASC
            LIMIT ?
            "#
        );

        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(limit.min(i64::MAX as usize) as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(EligibleRecord::try_from).collect()
    }

    async fn eligible_backlog(&self) -> Result<EligibleBacklog> {
        let sql = format!(
            "SELECT COUNT(*), MIN(r.eligible_since) FROM records r WHERE {SELECTABLE}"
        );
        let (count, oldest): (i64, Option<i64>) =
            sqlx::query_as(&sql).fetch_one(&self.pool).await?;

        Ok(EligibleBacklog {
            count: count as u64,
            oldest_eligible_since: oldest.map(|t| t as u64),
        })
    }

    async fn create_snapshot(&self, snapshot: &BatchSnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for member in &snapshot.members {
            if let Some(reason) = unselectable_reason(&mut tx, member).await? {
                return Err(RegistryError::CandidateNotEligible {
                    identity: to_hex(&member.identity_hash),
                    reason,
                });
            }
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO snapshots (
                snapshot_id, label, region_code, merkle_root, record_count,
                state, batch_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 'open', NULL, ?, ?)
            "#,
        )
        .bind(snapshot.snapshot_id.to_string())
        .bind(&snapshot.label)
        .bind(snapshot.region_code as i64)
        .bind(snapshot.merkle_root.as_slice())
        .bind(snapshot.record_count() as i64)
        .bind(snapshot.created_at.to_rfc3339())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        for member in &snapshot.members {
            sqlx::query(
                r#"
                INSERT INTO snapshot_members (
                    snapshot_id, member_offset, identity_hash, file_hash,
                    eligible_since, region_code, leaf_hash
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(snapshot.snapshot_id.to_string())
            .bind(member.offset as i64)
            .bind(member.identity_hash.as_slice())
            .bind(member.file_hash.as_slice())
            .bind(member.eligible_since as i64)
            .bind(member.region_code as i64)
            .bind(member.leaf_hash.as_slice())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            snapshot_id = %snapshot.snapshot_id,
            members = snapshot.members.len(),
            "snapshot persisted"
        );
        Ok(())
    }

    async fn get_snapshot(&self, snapshot_id: Uuid) -> Result<Option<BatchSnapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT snapshot_id, label, region_code, merkle_root, state, batch_id, created_at
            FROM snapshots WHERE snapshot_id = ?
            "#,
        )
        .bind(snapshot_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let members: Vec<MemberRow> = sqlx::query_as(
            r#"
            SELECT member_offset, identity_hash, file_hash, eligible_since, region_code, leaf_hash
            FROM snapshot_members
            WHERE snapshot_id = ?
            ORDER BY member_offset ASC
            "#,
        )
        .bind(snapshot_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(BatchSnapshot {
            snapshot_id: parse_uuid(&row.snapshot_id)?,
            label: row.label,
            region_code: region_code(row.region_code)?,
            merkle_root: bytes32("merkle_root", &row.merkle_root)?,
            members: members
                .into_iter()
                .map(SnapshotMember::try_from)
                .collect::<Result<Vec<_>>>()?,
            state: snapshot_state(&row.state, row.batch_id)?,
            created_at: parse_time(&row.created_at)?,
        }))
    }

    async fn abandon_snapshot(&self, snapshot_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String, Option<i64>)> =
            sqlx::query_as("SELECT state, batch_id FROM snapshots WHERE snapshot_id = ?")
                .bind(snapshot_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;

        let state = match row {
            Some((state, batch_id)) => snapshot_state(&state, batch_id)?,
            None => return Err(RegistryError::SnapshotNotFound(snapshot_id)),
        };

        match state {
            SnapshotState::Open => {
                sqlx::query(
                    "UPDATE snapshots SET state = 'abandoned', updated_at = ? WHERE snapshot_id = ?",
                )
                .bind(Utc::now().to_rfc3339())
                .bind(snapshot_id.to_string())
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                info!(snapshot_id = %snapshot_id, "snapshot abandoned");
                Ok(())
            }
            SnapshotState::Abandoned => Ok(()),
            SnapshotState::Confirmed { batch_id } => Err(RegistryError::Internal(format!(
                "snapshot {snapshot_id} already confirmed in batch {batch_id}"
            ))),
        }
    }

    async fn list_snapshots(&self, state: Option<SnapshotState>) -> Result<Vec<BatchSnapshot>> {
        let ids: Vec<(String,)> = match state {
            Some(state) => {
                sqlx::query_as(
                    "SELECT snapshot_id FROM snapshots WHERE state = ? ORDER BY created_at ASC",
                )
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT snapshot_id FROM snapshots ORDER BY created_at ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut snapshots = Vec::with_capacity(ids.len());
        for (id,) in ids {
            if let Some(snapshot) = self.get_snapshot(parse_uuid(&id)?).await? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    async fn apply_batch(
        &self,
        write: &BatchWrite,
        checkpoint: Option<WatcherCheckpoint>,
    ) -> Result<ApplyOutcome> {
        let batch = &write.batch;
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT batch_id FROM batches WHERE batch_id = ?")
                .bind(batch.batch_id as i64)
                .fetch_optional(&mut *tx)
                .await?;

        if existing.is_some() {
            if let Some(checkpoint) = &checkpoint {
                upsert_checkpoint(&mut tx, checkpoint).await?;
            }
            tx.commit().await?;
            debug!(batch_id = batch.batch_id, "batch already applied");
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let snapshot: Option<(String, Option<i64>)> =
            sqlx::query_as("SELECT state, batch_id FROM snapshots WHERE snapshot_id = ?")
                .bind(write.snapshot_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;

        match snapshot {
            None => {
                return Err(RegistryError::conflict(
                    batch.batch_id,
                    Some(write.snapshot_id),
                    ConflictReason::UnknownSnapshot,
                    format!("snapshot {} not found", write.snapshot_id),
                ))
            }
            Some((state, batch_id)) => match snapshot_state(&state, batch_id)? {
                SnapshotState::Confirmed { batch_id: other } => {
                    return Err(RegistryError::conflict(
                        batch.batch_id,
                        Some(write.snapshot_id),
                        ConflictReason::SnapshotConsumed,
                        format!("snapshot already confirmed in batch {other}"),
                    ))
                }
                SnapshotState::Abandoned => {
                    warn!(
                        batch_id = batch.batch_id,
                        snapshot_id = %write.snapshot_id,
                        "commit landed for abandoned snapshot, reconciling"
                    );
                }
                SnapshotState::Open => {}
            },
        }

        for leaf in &write.leaves {
            check_batchable(&mut tx, write, leaf).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO batches (
                batch_id, merkle_root, commit_ref, record_count, region_code,
                snapshot_id, block_number, log_index, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(batch.batch_id as i64)
        .bind(batch.merkle_root.as_slice())
        .bind(batch.commit_ref.as_str())
        .bind(batch.record_count as i64)
        .bind(batch.region_code as i64)
        .bind(batch.snapshot_id.map(|id| id.to_string()))
        .bind(batch.position.block_number as i64)
        .bind(batch.position.log_index as i64)
        .bind(batch.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let now = Utc::now().to_rfc3339();
        for leaf in &write.leaves {
            sqlx::query(
                r#"
                INSERT INTO leaves (identity_hash, leaf_hash, batch_id, leaf_offset)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(leaf.identity_hash.as_slice())
            .bind(leaf.leaf_hash.as_slice())
            .bind(leaf.batch_id as i64)
            .bind(leaf.offset as i64)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE records SET status = 'batched', updated_at = ?
                WHERE identity_hash = ? AND status = 'eligible'
                "#,
            )
            .bind(&now)
            .bind(leaf.identity_hash.as_slice())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE snapshots SET state = 'confirmed', batch_id = ?, updated_at = ?
            WHERE snapshot_id = ?
            "#,
        )
        .bind(batch.batch_id as i64)
        .bind(&now)
        .bind(write.snapshot_id.to_string())
        .execute(&mut *tx)
        .await?;

        if let Some(checkpoint) = &checkpoint {
            upsert_checkpoint(&mut tx, checkpoint).await?;
        }

        tx.commit().await?;

        info!(
            batch_id = batch.batch_id,
            snapshot_id = %write.snapshot_id,
            leaves = write.leaves.len(),
            "batch applied"
        );
        Ok(ApplyOutcome::Applied)
    }

    async fn record_conflict(
        &self,
        conflict: &ConflictRecord,
        checkpoint: Option<WatcherCheckpoint>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO reconciliation_conflicts (
                batch_id, snapshot_id, reason, detail, commit_ref,
                block_number, log_index, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (block_number, log_index) DO NOTHING
            "#,
        )
        .bind(conflict.batch_id as i64)
        .bind(conflict.snapshot_id.map(|id| id.to_string()))
        .bind(conflict.reason.as_str())
        .bind(&conflict.detail)
        .bind(conflict.commit_ref.as_str())
        .bind(conflict.position.block_number as i64)
        .bind(conflict.position.log_index as i64)
        .bind(conflict.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        if let Some(checkpoint) = &checkpoint {
            upsert_checkpoint(&mut tx, checkpoint).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let rows: Vec<ConflictRow> = sqlx::query_as(
            r#"
            SELECT batch_id, snapshot_id, reason, detail, commit_ref,
                   block_number, log_index, created_at
            FROM reconciliation_conflicts
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConflictRecord::try_from).collect()
    }

    async fn advance_checkpoint(&self, checkpoint: &WatcherCheckpoint) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_checkpoint(&mut tx, checkpoint).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_checkpoint(&self, name: &str) -> Result<Option<WatcherCheckpoint>> {
        let row: Option<(i64, i64, String)> = sqlx::query_as(
            "SELECT block_number, log_index, updated_at FROM watcher_checkpoints WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(block, log, updated_at)| {
            Ok(WatcherCheckpoint {
                name: name.to_string(),
                position: ChainPosition::new(block as u64, log as u64),
                updated_at: parse_time(&updated_at)?,
            })
        })
        .transpose()
    }

    async fn get_batch(&self, batch_id: u64) -> Result<Option<BatchRecord>> {
        let row: Option<BatchRow> = sqlx::query_as(
            r#"
            SELECT batch_id, merkle_root, commit_ref, record_count, region_code,
                   snapshot_id, block_number, log_index, created_at
            FROM batches WHERE batch_id = ?
            "#,
        )
        .bind(batch_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BatchRecord::try_from).transpose()
    }

    async fn get_leaf(&self, identity_hash: &Hash256) -> Result<Option<LeafRecord>> {
        let row: Option<LeafRow> = sqlx::query_as(
            "SELECT identity_hash, leaf_hash, batch_id, leaf_offset FROM leaves WHERE identity_hash = ?",
        )
        .bind(identity_hash.as_slice())
        .fetch_optional(&self.pool)
        .await?;

        row.map(LeafRecord::try_from).transpose()
    }

    async fn get_batch_leaves(&self, batch_id: u64) -> Result<Vec<LeafRecord>> {
        let rows: Vec<LeafRow> = sqlx::query_as(
            r#"
            SELECT identity_hash, leaf_hash, batch_id, leaf_offset
            FROM leaves WHERE batch_id = ?
            ORDER BY leaf_offset ASC
            "#,
        )
        .bind(batch_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LeafRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MerkleTree;

    fn record(n: u8, since: u64) -> EligibleRecord {
        EligibleRecord::new([n; 32], [n.wrapping_add(100); 32], 16, since)
    }

    fn snapshot_of(records: &[EligibleRecord]) -> BatchSnapshot {
        let members: Vec<SnapshotMember> = records
            .iter()
            .enumerate()
            .map(|(i, r)| SnapshotMember::from_record(i as u32, r))
            .collect();
        let root = MerkleTree::build(members.iter().map(|m| m.leaf_hash).collect()).root();
        BatchSnapshot {
            snapshot_id: Uuid::new_v4(),
            label: "test".into(),
            region_code: 16,
            merkle_root: root,
            members,
            state: SnapshotState::Open,
            created_at: Utc::now(),
        }
    }

    fn write_for(snapshot: &BatchSnapshot, batch_id: u64) -> BatchWrite {
        BatchWrite {
            batch: BatchRecord {
                batch_id,
                merkle_root: snapshot.merkle_root,
                commit_ref: CommitRef::new(format!("0xtx{batch_id}")),
                record_count: snapshot.record_count(),
                region_code: snapshot.region_code,
                snapshot_id: Some(snapshot.snapshot_id),
                position: ChainPosition::new(batch_id, 0),
                created_at: Utc::now(),
            },
            leaves: snapshot
                .members
                .iter()
                .map(|m| LeafRecord {
                    identity_hash: m.identity_hash,
                    leaf_hash: m.leaf_hash,
                    batch_id,
                    offset: m.offset,
                })
                .collect(),
            snapshot_id: snapshot.snapshot_id,
        }
    }

    async fn seeded(records: &[EligibleRecord]) -> SqliteRecordStore {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        for r in records {
            store.insert_record(r).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_select_orders_by_eligible_since_then_identity() {
        let store = seeded(&[record(3, 200), record(2, 100), record(1, 200)]).await;

        let selected = store.select_eligible(10).await.unwrap();
        let ids: Vec<u8> = selected.iter().map(|r| r.identity_hash[0]).collect();
        assert_eq!(ids, vec![2, 1, 3]);

        assert_eq!(store.select_eligible(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_records_not_selected() {
        let store = seeded(&[record(1, 1)]).await;
        store
            .insert_record(&record(2, 1).with_status(RecordStatus::Pending))
            .await
            .unwrap();

        let selected = store.select_eligible(10).await.unwrap();
        assert_eq!(selected.len(), 1);

        store
            .transition_status(&[2; 32], RecordStatus::Eligible)
            .await
            .unwrap();
        assert_eq!(store.select_eligible(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_transition_validation() {
        let store = seeded(&[record(1, 1)]).await;

        let err = store
            .transition_status(&[1; 32], RecordStatus::Selected)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidStatusTransition { .. }));

        // Batching is reserved for reconciliation
        let err = store
            .transition_status(&[1; 32], RecordStatus::Batched)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidStatusTransition { .. }));

        let err = store
            .transition_status(&[9; 32], RecordStatus::Eligible)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn test_open_snapshot_holds_records() {
        let records = [record(1, 1), record(2, 2), record(3, 3)];
        let store = seeded(&records).await;

        let snapshot = snapshot_of(&records[..2]);
        store.create_snapshot(&snapshot).await.unwrap();

        let selectable = store.select_eligible(10).await.unwrap();
        assert_eq!(selectable, vec![records[2].clone()]);
        assert_eq!(store.eligible_backlog().await.unwrap().count, 1);

        // A second snapshot over a held record is refused
        let err = store
            .create_snapshot(&snapshot_of(&records[1..]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::CandidateNotEligible { .. }));

        // Abandoning releases the records
        store.abandon_snapshot(snapshot.snapshot_id).await.unwrap();
        assert_eq!(store.select_eligible(10).await.unwrap().len(), 3);

        let loaded = store.get_snapshot(snapshot.snapshot_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, SnapshotState::Abandoned);
        assert_eq!(loaded.members, snapshot.members);
    }

    #[tokio::test]
    async fn test_snapshot_rejects_altered_candidate() {
        let store = seeded(&[record(1, 1)]).await;
        let mut altered = record(1, 1);
        altered.eligible_since = 99;

        let err = store
            .create_snapshot(&snapshot_of(&[altered]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::CandidateNotEligible { .. }));
    }

    #[tokio::test]
    async fn test_apply_batch_is_atomic_and_idempotent() {
        let records = [record(1, 1), record(2, 2)];
        let store = seeded(&records).await;
        let snapshot = snapshot_of(&records);
        store.create_snapshot(&snapshot).await.unwrap();

        let write = write_for(&snapshot, 7);
        let checkpoint = WatcherCheckpoint::new("main", ChainPosition::new(7, 0));
        assert_eq!(
            store.apply_batch(&write, Some(checkpoint.clone())).await.unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(
            store.apply_batch(&write, Some(checkpoint)).await.unwrap(),
            ApplyOutcome::AlreadyApplied
        );

        let batch = store.get_batch(7).await.unwrap().unwrap();
        assert_eq!(batch.merkle_root, snapshot.merkle_root);
        assert_eq!(store.get_batch_leaves(7).await.unwrap().len(), 2);
        assert_eq!(
            store.get_record(&[1; 32]).await.unwrap().unwrap().status,
            RecordStatus::Batched
        );
        assert_eq!(
            store.get_snapshot(snapshot.snapshot_id).await.unwrap().unwrap().state,
            SnapshotState::Confirmed { batch_id: 7 }
        );
        assert_eq!(
            store.get_checkpoint("main").await.unwrap().unwrap().position,
            ChainPosition::new(7, 0)
        );
    }

    #[tokio::test]
    async fn test_apply_batch_conflict_writes_nothing() {
        let records = [record(1, 1), record(2, 2)];
        let store = seeded(&records).await;
        let first = snapshot_of(&records[..1]);
        store.create_snapshot(&first).await.unwrap();
        store.apply_batch(&write_for(&first, 1), None).await.unwrap();

        // A write whose leaves include an already batched record
        let overlapping = snapshot_of(&records);
        let second = snapshot_of(&records[1..]);
        store.create_snapshot(&second).await.unwrap();
        let mut write = write_for(&overlapping, 2);
        write.snapshot_id = second.snapshot_id;

        let err = store
            .apply_batch(&write, Some(WatcherCheckpoint::new("main", ChainPosition::new(2, 0))))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::ReconciliationConflict {
                reason: ConflictReason::RecordAlreadyBatched,
                ..
            }
        ));

        assert!(store.get_batch(2).await.unwrap().is_none());
        assert!(store.get_leaf(&[2; 32]).await.unwrap().is_none());
        assert!(store.get_checkpoint("main").await.unwrap().is_none());
        assert_eq!(
            store.get_record(&[2; 32]).await.unwrap().unwrap().status,
            RecordStatus::Eligible
        );
    }

    #[tokio::test]
    async fn test_unknown_snapshot_conflict() {
        let records = [record(1, 1)];
        let store = seeded(&records).await;
        let snapshot = snapshot_of(&records);

        let err = store
            .apply_batch(&write_for(&snapshot, 1), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::ReconciliationConflict {
                reason: ConflictReason::UnknownSnapshot,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_never_moves_backwards() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        store
            .advance_checkpoint(&WatcherCheckpoint::new("w", ChainPosition::new(10, 2)))
            .await
            .unwrap();
        store
            .advance_checkpoint(&WatcherCheckpoint::new("w", ChainPosition::new(9, 5)))
            .await
            .unwrap();

        let checkpoint = store.get_checkpoint("w").await.unwrap().unwrap();
        assert_eq!(checkpoint.position, ChainPosition::new(10, 2));
        assert!(store.get_checkpoint("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflicts_recorded_once_per_position() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let conflict = ConflictRecord {
            batch_id: 3,
            snapshot_id: None,
            reason: ConflictReason::InvalidMetadata,
            detail: "foreign commit".into(),
            commit_ref: CommitRef::new("0xabc"),
            position: ChainPosition::new(5, 1),
            created_at: Utc::now(),
        };

        store.record_conflict(&conflict, None).await.unwrap();
        store
            .record_conflict(&conflict, Some(WatcherCheckpoint::new("w", conflict.position)))
            .await
            .unwrap();

        let conflicts = store.list_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].reason, ConflictReason::InvalidMetadata);
        assert_eq!(
            store.get_checkpoint("w").await.unwrap().unwrap().position,
            conflict.position
        );
    }
}
