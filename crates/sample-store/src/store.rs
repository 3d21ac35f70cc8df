//! Store Implementation

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::eviction::EvictionPolicy;
use crate::sample::{RemovalOrder, Sample, StoredRecord};
use crate::StoreError;

const SCHEMA_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS samples (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        time_synced INTEGER,
        priority INTEGER NOT NULL,
        payload_type TEXT NOT NULL,
        payload BLOB NOT NULL,
        location TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_samples_priority_age
        ON samples(priority, timestamp_ms);
    CREATE INDEX IF NOT EXISTS idx_samples_age
        ON samples(timestamp_ms);
";

const SELECT_COLUMNS: &str =
    "id, device_id, timestamp_ms, time_synced, priority, payload_type, payload, location";

/// Store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Soft cap on database size in bytes (default 10 MiB).
    pub max_size_bytes: u64,
    /// Open attempts before the store is reported unavailable.
    pub open_retries: u32,
    /// Fixed delay between open attempts.
    pub open_retry_delay_ms: u64,
    /// Rows per SELECT/DELETE sub-batch, bounding statement placeholders.
    pub chunk_size: usize,
    /// How long a connection waits on a lock held by another one.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("samples.db"),
            max_size_bytes: 10 * 1024 * 1024,
            open_retries: 5,
            open_retry_delay_ms: 500,
            chunk_size: 200,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Durable sample log.
///
/// Every operation opens the database, runs one transaction, and closes it
/// again, so a process suspension between commands never holds a connection
/// open. Producers and the transfer cycle share the store across threads;
/// the per-operation connections coordinate through SQLite's own locking.
pub struct SampleStore {
    config: StoreConfig,
    /// Current size cap; `set_max_size` updates it for subsequent opens.
    max_size_bytes: AtomicU64,
}

impl SampleStore {
    pub fn new(config: StoreConfig) -> Self {
        info!(
            path = %config.path.display(),
            max_size_bytes = config.max_size_bytes,
            "sample store configured"
        );
        let max_size_bytes = AtomicU64::new(config.max_size_bytes);
        Self {
            config,
            max_size_bytes,
        }
    }

    /// Insert a batch transactionally: either every sample is durably stored
    /// or none is, and on failure the caller retains the samples.
    pub fn insert_batch(&self, samples: &[Sample]) -> Result<(), StoreError> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO samples
                    (device_id, timestamp_ms, time_synced, priority, payload_type, payload, location)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for sample in samples {
                stmt.execute(params![
                    sample.device_id,
                    sample.timestamp_ms,
                    sample.time_synced,
                    sample.priority,
                    sample.payload.type_tag,
                    sample.payload.data,
                    sample.location,
                ])
                .map_err(classify)?;
            }
        }
        tx.commit().map_err(classify)?;
        debug!(count = samples.len(), "sample batch inserted");
        Ok(())
    }

    /// Remove and return at most `count` records in the requested order.
    ///
    /// The whole batch runs in one enclosing transaction, internally chunked
    /// to `chunk_size` rows per SELECT/DELETE pair so no statement exceeds
    /// the engine's placeholder limit. A returned row is guaranteed deleted
    /// in the same transaction, so it can never be handed out twice.
    pub fn remove_batch(
        &self,
        count: usize,
        order: RemovalOrder,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut removed: Vec<StoredRecord> = Vec::new();
        while removed.len() < count {
            let chunk = (count - removed.len()).min(self.config.chunk_size);
            let records = select_records(&tx, order.sql(), chunk)?;
            if records.is_empty() {
                break;
            }
            let ids: Vec<i64> = records.iter().map(|record| record.row_id).collect();
            delete_by_ids(&tx, &ids)?;
            removed.extend(records);
        }
        tx.commit()?;
        debug!(count = removed.len(), ?order, "sample batch removed");
        Ok(removed)
    }

    /// Delete up to `count` records in the given eviction order, returning
    /// how many were deleted. Same transaction and chunking rules as
    /// `remove_batch`.
    pub(crate) fn delete_batch(
        &self,
        count: usize,
        policy: EvictionPolicy,
    ) -> Result<u64, StoreError> {
        if count == 0 {
            return Ok(0);
        }
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut deleted: u64 = 0;
        while (deleted as usize) < count {
            let chunk = (count - deleted as usize).min(self.config.chunk_size);
            let ids = select_ids(&tx, policy.sql(), chunk)?;
            if ids.is_empty() {
                break;
            }
            delete_by_ids(&tx, &ids)?;
            deleted += ids.len() as u64;
        }
        tx.commit()?;
        Ok(deleted)
    }

    pub fn record_count(&self) -> Result<u64, StoreError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Whether the database has grown to its page cap. Inserts may still
    /// succeed while pages freed by eviction remain on the freelist.
    pub fn is_at_capacity(&self) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let max_pages: i64 = conn.query_row("PRAGMA max_page_count", [], |row| row.get(0))?;
        Ok(page_count >= max_pages)
    }

    /// Update the soft size cap. Returns the value the engine actually kept;
    /// it clamps to at least the pages already in use.
    pub fn set_max_size(&self, bytes: u64) -> Result<u64, StoreError> {
        let conn = self.open()?;
        let actual = apply_size_cap(&conn, bytes)?;
        self.max_size_bytes.store(actual, Ordering::Release);
        info!(requested = bytes, actual, "store size cap updated");
        Ok(actual)
    }

    /// The size cap as currently enforced by the engine.
    pub fn max_size(&self) -> Result<u64, StoreError> {
        let conn = self.open()?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        let max_pages: i64 = conn.query_row("PRAGMA max_page_count", [], |row| row.get(0))?;
        Ok((page_size * max_pages) as u64)
    }

    /// Open with retry and fixed backoff; a full database is surfaced
    /// immediately, never retried.
    fn open(&self) -> Result<Connection, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_open() {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    if attempt >= self.config.open_retries.max(1) {
                        return Err(StoreError::Unavailable {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    warn!(attempt, error = %err, "sample store open failed, retrying");
                    std::thread::sleep(Duration::from_millis(self.config.open_retry_delay_ms));
                }
            }
        }
    }

    fn try_open(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open(&self.config.path)?;
        conn.busy_timeout(Duration::from_millis(self.config.busy_timeout_ms))?;
        conn.execute_batch(SCHEMA_SQL)?;
        // Cap applied after schema creation so a tiny cap can never brick a
        // fresh database; the engine clamps to the pages already in use.
        apply_size_cap(&conn, self.max_size_bytes.load(Ordering::Acquire))?;
        Ok(conn)
    }
}

fn apply_size_cap(conn: &Connection, bytes: u64) -> Result<u64, rusqlite::Error> {
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    let pages = (bytes as i64 / page_size).max(1);
    let kept: i64 = conn.query_row(&format!("PRAGMA max_page_count = {pages}"), [], |row| {
        row.get(0)
    })?;
    Ok((kept * page_size) as u64)
}

fn classify(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _) if code.code == rusqlite::ErrorCode::DiskFull => {
            StoreError::Full
        }
        _ => StoreError::Database(err),
    }
}

fn select_records(
    tx: &Transaction<'_>,
    order_sql: &str,
    limit: usize,
) -> Result<Vec<StoredRecord>, StoreError> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM samples ORDER BY {order_sql} LIMIT ?1");
    let mut stmt = tx.prepare(&sql)?;
    let records = stmt
        .query_map(params![limit as i64], |row| {
            Ok(StoredRecord {
                row_id: row.get(0)?,
                device_id: row.get(1)?,
                timestamp_ms: row.get(2)?,
                time_synced: row.get(3)?,
                priority: row.get(4)?,
                payload: crate::sample::SamplePayload {
                    type_tag: row.get(5)?,
                    data: row.get(6)?,
                },
                location: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

fn select_ids(tx: &Transaction<'_>, order_sql: &str, limit: usize) -> Result<Vec<i64>, StoreError> {
    let sql = format!("SELECT id FROM samples ORDER BY {order_sql} LIMIT ?1");
    let mut stmt = tx.prepare(&sql)?;
    let ids = stmt
        .query_map(params![limit as i64], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn delete_by_ids(tx: &Transaction<'_>, ids: &[i64]) -> Result<(), StoreError> {
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("DELETE FROM samples WHERE id IN ({placeholders})");
    let deleted = tx.execute(&sql, rusqlite::params_from_iter(ids.iter()))?;
    if deleted != ids.len() {
        warn!(expected = ids.len(), deleted, "delete removed fewer rows than selected");
    }
    Ok(())
}
