//! On-device durable store persisted in SQLite.
//!
//! `LocalStore` owns two tables:
//!
//! - `mutations`: the pending-write queue (plus synced rows kept for audit
//!   until the retention policy prunes them). FIFO order is the autoincrement
//!   `seq` column, never the wall clock.
//! - `records`: cached read snapshots, one row per record per collection.
//!
//! A queue row that no longer decodes is moved to status `quarantined` the
//! first time it is read, so it cannot hold up the rows queued behind it.
//!
//! The database runs in WAL mode with `synchronous = FULL`, so a mutation is on
//! disk once `enqueue_mutation` returns. Queue operations are additionally
//! serialized by an async mutex so that a quota check and the insert that
//! follows it cannot interleave with another writer.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tillsync_core::{
    FailureKind, MutationId, MutationRecord, MutationStatus, Record, RecordId, RecordOrigin,
    RemoteId, SyncError,
};
use tokio::sync::Mutex;

const SQLITE_CORRUPT: i32 = 11;
const SQLITE_FULL: i32 = 13;
const SQLITE_NOTADB: i32 = 26;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS mutations (
        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
        local_id        TEXT NOT NULL UNIQUE,
        collection      TEXT NOT NULL,
        payload         TEXT NOT NULL,
        status          TEXT NOT NULL,
        created_at      INTEGER NOT NULL,
        remote_id       TEXT NULL,
        attempts        INTEGER NOT NULL DEFAULT 0,
        last_error      TEXT NULL,
        failure         TEXT NULL,
        next_attempt_at INTEGER NULL,
        synced_at       INTEGER NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_mutations_status_seq ON mutations (status, seq)",
    r#"
    CREATE TABLE IF NOT EXISTS records (
        collection  TEXT NOT NULL,
        record_id   TEXT NOT NULL,
        remote_id   TEXT NULL,
        mutation_id TEXT NULL,
        data        TEXT NOT NULL,
        position    INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL,
        cached_at   INTEGER NOT NULL,
        PRIMARY KEY (collection, record_id)
    )
    "#,
];

const MUTATION_COLUMNS: &str = "local_id, collection, payload, status, created_at, remote_id, \
     attempts, last_error, failure, next_attempt_at, synced_at";

/// Local storage failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("local storage is full: {0}")]
    Full(String),
    #[error("local data is corrupt: {0}")]
    Corruption(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("local database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corruption(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let primary = db
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| code & 0xff);
                match primary {
                    Some(SQLITE_FULL) => StoreError::Full(db.message().to_string()),
                    Some(SQLITE_CORRUPT) | Some(SQLITE_NOTADB) => {
                        StoreError::Corruption(db.message().to_string())
                    }
                    _ => StoreError::Database(err.to_string()),
                }
            }
            sqlx::Error::Io(io) if io.kind() == std::io::ErrorKind::StorageFull => {
                StoreError::Full(io.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corruption(err.to_string())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            StoreError::Full(err.to_string())
        } else {
            StoreError::Database(err.to_string())
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Full(msg) => SyncError::StorageFull(msg),
            StoreError::Corruption(msg) => SyncError::StorageCorruption(msg),
            StoreError::NotFound(what) => SyncError::NotFound(what),
            StoreError::Database(msg) => SyncError::Storage(msg),
        }
    }
}

/// A queue row that could not be decoded, as far as it can still be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantinedMutation {
    pub seq: i64,
    pub local_id: Option<String>,
    pub collection: Option<String>,
    pub reason: Option<String>,
}

/// SQLite-backed store of mutations and cached snapshots.
///
/// Cheap to clone; clones share the pool and the queue lock.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    queue_lock: Arc<Mutex<()>>,
    max_pending: Option<usize>,
    path: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let pool = open_pool(&path, SCHEMA).await?;
        tracing::debug!(path = %path.display(), "local store opened");
        Ok(Self {
            pool,
            queue_lock: Arc::new(Mutex::new(())),
            max_pending: None,
            path,
        })
    }

    /// Cap the number of pending mutations; further enqueues fail with `Full`.
    pub fn with_max_pending(mut self, max_pending: Option<usize>) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ----- cached snapshots -----

    /// Persist one record into a collection snapshot.
    pub async fn put(&self, collection: &str, record: &Record) -> Result<RecordId, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO records (collection, record_id, remote_id, mutation_id, data, position, updated_at, cached_at)
            VALUES (
                ?1, ?2, ?3, ?4, ?5,
                (SELECT COALESCE(MAX(position), -1) + 1 FROM records WHERE collection = ?1),
                ?6, ?7
            )
            ON CONFLICT (collection, record_id) DO UPDATE SET
                remote_id   = excluded.remote_id,
                mutation_id = excluded.mutation_id,
                data        = excluded.data,
                updated_at = excluded.updated_at,
                cached_at  = excluded.cached_at
            "#,
        )
        .bind(collection)
        .bind(record.id.to_string())
        .bind(record.remote_id.as_ref().map(RemoteId::as_str))
        .bind(record.mutation_id.map(|id| id.to_string()))
        .bind(record.payload.to_string())
        .bind(record.updated_at.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(record.id)
    }

    /// The cached snapshot of a collection, in snapshot order.
    pub async fn get_all(&self, collection: &str) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT record_id, remote_id, mutation_id, data, updated_at
            FROM records
            WHERE collection = ?1
            ORDER BY position ASC
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Replace a collection snapshot wholesale, keeping the given order.
    pub async fn replace_snapshot(&self, collection: &str, records: &[Record]) -> Result<(), StoreError> {
        let cached_at = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM records WHERE collection = ?1")
            .bind(collection)
            .execute(&mut *tx)
            .await?;

        for (position, record) in records.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO records (collection, record_id, remote_id, mutation_id, data, position, updated_at, cached_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(collection)
            .bind(record.id.to_string())
            .bind(record.remote_id.as_ref().map(RemoteId::as_str))
            .bind(record.mutation_id.map(|id| id.to_string()))
            .bind(record.payload.to_string())
            .bind(position as i64)
            .bind(record.updated_at.timestamp_millis())
            .bind(cached_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(collection, count = records.len(), "snapshot replaced");
        Ok(())
    }

    pub async fn clear_snapshot(&self, collection: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM records WHERE collection = ?1")
            .bind(collection)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----- mutation queue -----

    /// Append a pending mutation. Durable once this returns.
    pub async fn enqueue_mutation(&self, mutation: &MutationRecord) -> Result<MutationId, StoreError> {
        let _guard = self.queue_lock.lock().await;

        if let Some(max) = self.max_pending {
            let pending = self.count_pending().await?;
            if pending >= max {
                return Err(StoreError::Full(format!(
                    "pending mutation quota of {max} reached"
                )));
            }
        }

        self.insert_mutation(mutation).await?;
        tracing::debug!(local_id = %mutation.id, collection = %mutation.collection, "mutation enqueued");
        Ok(mutation.id)
    }

    /// Persist a mutation that was written to the remote store directly.
    pub async fn record_synced(
        &self,
        mutation: &MutationRecord,
        remote_id: &RemoteId,
    ) -> Result<MutationId, StoreError> {
        let mut synced = mutation.clone();
        synced.status = MutationStatus::Synced;
        synced.remote_id = Some(remote_id.clone());
        synced.synced_at = Some(Utc::now());
        synced.next_attempt_at = None;

        let _guard = self.queue_lock.lock().await;
        self.insert_mutation(&synced).await?;
        Ok(synced.id)
    }

    /// All pending mutations in FIFO order.
    ///
    /// Undecodable rows are quarantined and left out.
    pub async fn list_pending_mutations(&self) -> Result<Vec<MutationRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT seq, {MUTATION_COLUMNS} FROM mutations WHERE status = 'pending' ORDER BY seq ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        self.decode_queue_rows(&rows).await
    }

    /// Pending mutations excluded from automatic retries.
    pub async fn list_stuck(&self, max_attempts: u32) -> Result<Vec<MutationRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT seq, {MUTATION_COLUMNS} FROM mutations \
             WHERE status = 'pending' AND (failure = 'permanent' OR attempts >= ?1) \
             ORDER BY seq ASC"
        ))
        .bind(i64::from(max_attempts))
        .fetch_all(&self.pool)
        .await?;

        self.decode_queue_rows(&rows).await
    }

    /// Queue rows taken out of the queue because they no longer decode.
    pub async fn list_quarantined(&self) -> Result<Vec<QuarantinedMutation>, StoreError> {
        let rows = sqlx::query(
            "SELECT seq, local_id, collection, last_error FROM mutations \
             WHERE status = 'quarantined' ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<QuarantinedMutation, StoreError> {
                Ok(QuarantinedMutation {
                    seq: row.try_get("seq")?,
                    local_id: row.try_get::<Option<String>, _>("local_id").unwrap_or_default(),
                    collection: row.try_get::<Option<String>, _>("collection").unwrap_or_default(),
                    reason: row.try_get::<Option<String>, _>("last_error").unwrap_or_default(),
                })
            })
            .collect()
    }

    pub async fn get_mutation(&self, id: MutationId) -> Result<MutationRecord, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MUTATION_COLUMNS} FROM mutations WHERE local_id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_mutation(&row),
            None => Err(StoreError::NotFound(format!("mutation {id}"))),
        }
    }

    pub async fn pending_count(&self) -> Result<usize, StoreError> {
        self.count_pending().await
    }

    /// Transition a mutation to `synced`. A second call is a no-op.
    pub async fn mark_synced(&self, id: MutationId, remote_id: &RemoteId) -> Result<(), StoreError> {
        let _guard = self.queue_lock.lock().await;

        let result = sqlx::query(
            r#"
            UPDATE mutations
            SET status = 'synced',
                remote_id = ?2,
                synced_at = ?3,
                next_attempt_at = NULL
            WHERE local_id = ?1
              AND status = 'pending'
            "#,
        )
        .bind(id.to_string())
        .bind(remote_id.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if !self.mutation_exists(id).await? {
                return Err(StoreError::NotFound(format!("mutation {id}")));
            }
            tracing::debug!(local_id = %id, "mutation already synced");
        }
        Ok(())
    }

    /// Count a failed attempt and schedule the next one.
    ///
    /// Returns the attempt count after the update.
    pub async fn record_failure(
        &self,
        id: MutationId,
        error: &str,
        kind: FailureKind,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<u32, StoreError> {
        let _guard = self.queue_lock.lock().await;

        let row = sqlx::query(
            r#"
            UPDATE mutations
            SET attempts = attempts + 1,
                last_error = ?2,
                failure = ?3,
                next_attempt_at = ?4
            WHERE local_id = ?1
              AND status = 'pending'
            RETURNING attempts
            "#,
        )
        .bind(id.to_string())
        .bind(error)
        .bind(kind.as_str())
        .bind(next_attempt_at.map(|at| at.timestamp_millis()))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => attempts_from(row.try_get::<i64, _>("attempts")?),
            None => Err(StoreError::NotFound(format!("pending mutation {id}"))),
        }
    }

    /// Clear the failure state of a pending mutation so drains pick it up again.
    ///
    /// Returns `false` when the mutation is already synced.
    pub async fn reset_attempts(&self, id: MutationId) -> Result<bool, StoreError> {
        let _guard = self.queue_lock.lock().await;

        let result = sqlx::query(
            r#"
            UPDATE mutations
            SET attempts = 0,
                last_error = NULL,
                failure = NULL,
                next_attempt_at = NULL
            WHERE local_id = ?1
              AND status = 'pending'
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if !self.mutation_exists(id).await? {
                return Err(StoreError::NotFound(format!("mutation {id}")));
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Delete synced mutations synced before `older_than`. Returns the count.
    pub async fn prune_synced(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let _guard = self.queue_lock.lock().await;

        let result = sqlx::query(
            r#"
            DELETE FROM mutations
            WHERE status = 'synced'
              AND synced_at IS NOT NULL
              AND synced_at < ?1
            "#,
        )
        .bind(older_than.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn decode_queue_rows(&self, rows: &[SqliteRow]) -> Result<Vec<MutationRecord>, StoreError> {
        let mut mutations = Vec::with_capacity(rows.len());
        for row in rows {
            match row_to_mutation(row) {
                Ok(mutation) => mutations.push(mutation),
                Err(err) if err.is_corruption() => {
                    let seq: i64 = row.try_get("seq")?;
                    tracing::error!(seq, error = %err, "undecodable mutation moved out of the queue");
                    self.quarantine(seq, &err.to_string()).await?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(mutations)
    }

    async fn quarantine(&self, seq: i64, reason: &str) -> Result<(), StoreError> {
        let _guard = self.queue_lock.lock().await;
        sqlx::query(
            "UPDATE mutations SET status = 'quarantined', last_error = ?2 \
             WHERE seq = ?1 AND status = 'pending'",
        )
        .bind(seq)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_mutation(&self, mutation: &MutationRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO mutations (
                local_id,
                collection,
                payload,
                status,
                created_at,
                remote_id,
                attempts,
                last_error,
                failure,
                next_attempt_at,
                synced_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(mutation.id.to_string())
        .bind(&mutation.collection)
        .bind(mutation.payload.to_string())
        .bind(mutation.status.as_str())
        .bind(mutation.created_at.timestamp_millis())
        .bind(mutation.remote_id.as_ref().map(RemoteId::as_str))
        .bind(i64::from(mutation.attempts))
        .bind(mutation.last_error.as_deref())
        .bind(mutation.failure.map(|f| f.as_str()))
        .bind(mutation.next_attempt_at.map(|at| at.timestamp_millis()))
        .bind(mutation.synced_at.map(|at| at.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_pending(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mutations WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn mutation_exists(&self, id: MutationId) -> Result<bool, StoreError> {
        let found = sqlx::query("SELECT 1 FROM mutations WHERE local_id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

/// Open a single-connection SQLite pool at `path` (WAL, `synchronous = FULL`)
/// and apply `schema`.
pub(crate) async fn open_pool(path: &Path, schema: &[&str]) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    for statement in schema {
        sqlx::query(statement).execute(&pool).await?;
    }
    Ok(pool)
}

fn row_to_mutation(row: &SqliteRow) -> Result<MutationRecord, StoreError> {
    let local_id: String = row.try_get("local_id")?;
    let payload: String = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    let failure: Option<String> = row.try_get("failure")?;
    let remote_id: Option<String> = row.try_get("remote_id")?;

    Ok(MutationRecord {
        id: MutationId::from_str(&local_id)
            .map_err(|_| StoreError::Corruption(format!("invalid mutation id '{local_id}'")))?,
        collection: row.try_get("collection")?,
        payload: parse_json(&payload, "mutation payload")?,
        status: MutationStatus::parse(&status)
            .ok_or_else(|| StoreError::Corruption(format!("invalid mutation status '{status}'")))?,
        created_at: timestamp(row.try_get("created_at")?)?,
        remote_id: remote_id.map(RemoteId::from),
        attempts: attempts_from(row.try_get("attempts")?)?,
        last_error: row.try_get("last_error")?,
        failure: match failure {
            Some(kind) => Some(
                FailureKind::parse(&kind)
                    .ok_or_else(|| StoreError::Corruption(format!("invalid failure kind '{kind}'")))?,
            ),
            None => None,
        },
        next_attempt_at: optional_timestamp(row.try_get("next_attempt_at")?)?,
        synced_at: optional_timestamp(row.try_get("synced_at")?)?,
    })
}

fn row_to_record(row: &SqliteRow) -> Result<Record, StoreError> {
    let record_id: String = row.try_get("record_id")?;
    let data: String = row.try_get("data")?;
    let remote_id: Option<String> = row.try_get("remote_id")?;
    let mutation_id: Option<String> = row.try_get("mutation_id")?;

    Ok(Record {
        id: RecordId::from_str(&record_id)
            .map_err(|_| StoreError::Corruption(format!("invalid record id '{record_id}'")))?,
        remote_id: remote_id.map(RemoteId::from),
        mutation_id: match mutation_id {
            Some(raw) => Some(
                MutationId::from_str(&raw)
                    .map_err(|_| StoreError::Corruption(format!("invalid mutation id '{raw}'")))?,
            ),
            None => None,
        },
        payload: parse_json(&data, "cached record")?,
        updated_at: timestamp(row.try_get("updated_at")?)?,
        origin: RecordOrigin::Remote,
    })
}

fn parse_json(raw: &str, what: &str) -> Result<Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corruption(format!("{what}: {e}")))
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corruption(format!("timestamp out of range: {millis}")))
}

fn optional_timestamp(millis: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    millis.map(timestamp).transpose()
}

fn attempts_from(raw: i64) -> Result<u32, StoreError> {
    u32::try_from(raw).map_err(|_| StoreError::Corruption(format!("invalid attempt count {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_store(dir: &tempfile::TempDir) -> LocalStore {
        LocalStore::open(dir.path().join("store.db")).await.unwrap()
    }

    fn sale(total: i64) -> MutationRecord {
        MutationRecord::new("sales", json!({ "total": total }))
    }

    #[tokio::test]
    async fn pending_mutations_come_back_in_enqueue_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let ids: Vec<MutationId> = {
            let mut ids = Vec::new();
            for total in [10, 20, 30] {
                ids.push(store.enqueue_mutation(&sale(total)).await.unwrap());
            }
            ids
        };

        let pending = store.list_pending_mutations().await.unwrap();
        assert_eq!(pending.iter().map(|m| m.id).collect::<Vec<_>>(), ids);
        assert_eq!(pending[1].payload, json!({ "total": 20 }));
        assert!(pending.iter().all(MutationRecord::is_pending));
    }

    #[tokio::test]
    async fn mark_synced_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let id = store.enqueue_mutation(&sale(5)).await.unwrap();

        store.mark_synced(id, &RemoteId::new("r-1")).await.unwrap();
        store.mark_synced(id, &RemoteId::new("r-2")).await.unwrap();

        let stored = store.get_mutation(id).await.unwrap();
        assert_eq!(stored.status, MutationStatus::Synced);
        assert_eq!(stored.remote_id, Some(RemoteId::new("r-1")));
        assert!(stored.synced_at.is_some());
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_synced_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let err = store
            .mark_synced(MutationId::new(), &RemoteId::new("r"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = open_store(&dir).await;
        let id = first.enqueue_mutation(&sale(42)).await.unwrap();
        first.close().await;

        let reopened = open_store(&dir).await;
        let pending = reopened.list_pending_mutations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].payload, json!({ "total": 42 }));
    }

    #[tokio::test]
    async fn quota_reports_storage_full() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await.with_max_pending(Some(1));

        store.enqueue_mutation(&sale(1)).await.unwrap();
        let err = store.enqueue_mutation(&sale(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::Full(_)));
        assert!(matches!(SyncError::from(err), SyncError::StorageFull(_)));
    }

    #[tokio::test]
    async fn failures_accumulate_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let id = store.enqueue_mutation(&sale(1)).await.unwrap();

        let later = Utc::now() + chrono::Duration::minutes(1);
        assert_eq!(
            store
                .record_failure(id, "timeout", FailureKind::Transient, Some(later))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .record_failure(id, "422 invalid", FailureKind::Permanent, None)
                .await
                .unwrap(),
            2
        );

        let stuck = store.list_stuck(5).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].last_error.as_deref(), Some("422 invalid"));
        assert_eq!(stuck[0].failure, Some(FailureKind::Permanent));

        assert!(store.reset_attempts(id).await.unwrap());
        let reset = store.get_mutation(id).await.unwrap();
        assert_eq!(reset.attempts, 0);
        assert_eq!(reset.failure, None);
        assert!(store.list_stuck(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prune_only_removes_old_synced_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let synced = store.enqueue_mutation(&sale(1)).await.unwrap();
        let pending = store.enqueue_mutation(&sale(2)).await.unwrap();
        store.mark_synced(synced, &RemoteId::new("r-1")).await.unwrap();

        assert_eq!(store.prune_synced(Utc::now() - chrono::Duration::days(1)).await.unwrap(), 0);
        assert_eq!(
            store.prune_synced(Utc::now() + chrono::Duration::seconds(1)).await.unwrap(),
            1
        );
        assert!(matches!(store.get_mutation(synced).await, Err(StoreError::NotFound(_))));
        assert!(store.get_mutation(pending).await.is_ok());
    }

    #[tokio::test]
    async fn snapshot_put_replace_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let first = Record::new(json!({ "sku": "A" }));
        let id = store.put("products", &first).await.unwrap();
        assert_eq!(id, first.id);
        store.put("products", &Record::new(json!({ "sku": "B" }))).await.unwrap();

        let all = store.get_all("products").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].payload, json!({ "sku": "A" }));

        let fresh = vec![
            Record::new(json!({ "sku": "Z" })).with_remote_id(RemoteId::new("r-9")),
            Record::new(json!({ "sku": "Y" })),
        ];
        store.replace_snapshot("products", &fresh).await.unwrap();
        let all = store.get_all("products").await.unwrap();
        assert_eq!(
            all.iter().map(|r| r.payload["sku"].clone()).collect::<Vec<_>>(),
            vec![json!("Z"), json!("Y")]
        );
        assert_eq!(all[0].remote_id, Some(RemoteId::new("r-9")));

        store.clear_snapshot("products").await.unwrap();
        assert!(store.get_all("products").await.unwrap().is_empty());
        assert!(store.get_all("sales").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_snapshot_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.put("products", &Record::new(json!({ "sku": "A" }))).await.unwrap();

        sqlx::query("UPDATE records SET data = '{not json' WHERE collection = 'products'")
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store.get_all("products").await.unwrap_err();
        assert!(err.is_corruption());
        assert!(matches!(SyncError::from(err), SyncError::StorageCorruption(_)));
    }

    #[tokio::test]
    async fn undecodable_queue_row_is_quarantined_without_blocking_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let bad = store.enqueue_mutation(&sale(1)).await.unwrap();
        let good = store.enqueue_mutation(&sale(2)).await.unwrap();

        sqlx::query("UPDATE mutations SET payload = '{1: 2}' WHERE local_id = ?1")
            .bind(bad.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        let pending = store.list_pending_mutations().await.unwrap();
        assert_eq!(pending.iter().map(|m| m.id).collect::<Vec<_>>(), vec![good]);
        assert_eq!(store.pending_count().await.unwrap(), 1);

        let quarantined = store.list_quarantined().await.unwrap();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].local_id, Some(bad.to_string()));
        assert_eq!(quarantined[0].collection.as_deref(), Some("sales"));
        assert!(quarantined[0]
            .reason
            .as_deref()
            .unwrap_or_default()
            .contains("mutation payload"));

        // Already moved aside: a second read finds nothing new to quarantine.
        assert_eq!(store.list_pending_mutations().await.unwrap().len(), 1);
        assert_eq!(store.list_quarantined().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_keeps_the_writing_mutation_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let key = MutationId::new();
        let record = Record::new(json!({ "sku": "B" }))
            .with_remote_id(RemoteId::new("products-1"))
            .with_mutation_id(key);

        store.replace_snapshot("products", &[record]).await.unwrap();

        let cached = store.get_all("products").await.unwrap();
        assert_eq!(cached[0].mutation_id, Some(key));
    }
}
