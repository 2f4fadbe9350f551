// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite storage backend for the operation log.
//!
//! Three conceptual records live in three tables:
//!
//! ```sql
//! CREATE TABLE ops (
//!   seq INTEGER PRIMARY KEY AUTOINCREMENT,  -- never reused
//!   op_id TEXT NOT NULL UNIQUE,
//!   op TEXT NOT NULL,                       -- Operation as JSON
//!   applied_at INTEGER NOT NULL,
//!   source TEXT NOT NULL,                   -- local | remote
//!   application_status TEXT NOT NULL,       -- applied | pending | failed | rejected
//!   retry_count INTEGER NOT NULL DEFAULT 0,
//!   synced_at INTEGER,
//!   rejected_at INTEGER
//! );
//! CREATE TABLE state_cache (slot TEXT PRIMARY KEY, snapshot TEXT NOT NULL);  -- current | backup
//! CREATE TABLE engine_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);     -- vector_clock, compaction_counter, last_server_seq
//! ```
//!
//! A local append inserts the entry, replaces the vector clock and bumps the
//! compaction counter inside one transaction. `SQLITE_FULL` surfaces as
//! [`StorageError::QuotaExceeded`]; busy/locked errors are retried.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::{EntryPredicate, LogStore, StorageError};
use crate::operation::{
    now_millis, ApplicationStatus, OpSource, Operation, OperationLogEntry, StateCache,
};
use crate::resilience::retry::{retry, retry_if, RetryConfig};
use crate::vector_clock::VectorClock;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const SLOT_CURRENT: &str = "current";
const SLOT_BACKUP: &str = "backup";
const META_VECTOR_CLOCK: &str = "vector_clock";
const META_COMPACTION_COUNTER: &str = "compaction_counter";
const META_LAST_SERVER_SEQ: &str = "last_server_seq";

const SELECT_ENTRY: &str = "SELECT seq, op, applied_at, source, application_status, retry_count, synced_at, rejected_at FROM ops";

// SQLite primary result codes
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";
const SQLITE_FULL: &str = "13";

fn map_sql_error(context: &str, e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &e {
        let code = db.code();
        let primary = code.as_deref().map(|c| {
            // Extended codes carry the primary code in the low byte
            c.parse::<i64>().map(|n| (n & 0xff).to_string()).unwrap_or_else(|_| c.to_string())
        });
        match primary.as_deref() {
            Some(SQLITE_FULL) => return StorageError::QuotaExceeded(format!("{context}: {e}")),
            Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => {
                return StorageError::Busy(format!("{context}: {e}"))
            }
            _ => {}
        }
    }
    let msg = e.to_string();
    if msg.contains("database or disk is full") {
        StorageError::QuotaExceeded(format!("{context}: {msg}"))
    } else if msg.contains("database is locked") {
        StorageError::Busy(format!("{context}: {msg}"))
    } else {
        StorageError::Backend(format!("{context}: {msg}"))
    }
}

fn encode<T: serde::Serialize>(id: &str, value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Corruption {
        id: id.to_string(),
        reason: format!("encode failed: {e}"),
    })
}

fn decode<T: serde::de::DeserializeOwned>(id: &str, raw: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::Corruption {
        id: id.to_string(),
        reason: format!("decode failed: {e}"),
    })
}

fn text(row: &AnyRow, col: &str) -> Result<String, StorageError> {
    row.try_get::<String, _>(col)
        .or_else(|_| row.try_get::<Vec<u8>, _>(col).map(|b| String::from_utf8_lossy(&b).into_owned()))
        .map_err(|e| StorageError::Backend(format!("column {col}: {e}")))
}

fn row_to_entry(row: &AnyRow) -> Result<OperationLogEntry, StorageError> {
    let seq: i64 = row
        .try_get("seq")
        .map_err(|e| StorageError::Backend(format!("column seq: {e}")))?;
    let id = format!("ops#{seq}");
    let op: Operation = decode(&id, &text(row, "op")?)?;
    let source_raw = text(row, "source")?;
    let status_raw = text(row, "application_status")?;

    Ok(OperationLogEntry {
        seq: seq as u64,
        op,
        applied_at: row.try_get("applied_at").map_err(|e| StorageError::Corruption {
            id: id.clone(),
            reason: format!("applied_at: {e}"),
        })?,
        source: OpSource::parse(&source_raw).ok_or_else(|| StorageError::Corruption {
            id: id.clone(),
            reason: format!("unknown source '{source_raw}'"),
        })?,
        application_status: ApplicationStatus::parse(&status_raw).ok_or_else(|| {
            StorageError::Corruption {
                id: id.clone(),
                reason: format!("unknown status '{status_raw}'"),
            }
        })?,
        retry_count: row
            .try_get::<i64, _>("retry_count")
            .map_err(|e| StorageError::Corruption {
                id: id.clone(),
                reason: format!("retry_count: {e}"),
            })? as u32,
        synced_at: row.try_get::<Option<i64>, _>("synced_at").ok().flatten(),
        rejected_at: row.try_get::<Option<i64>, _>("rejected_at").ok().flatten(),
    })
}

pub struct SqliteLogStore {
    pool: AnyPool,
}

impl SqliteLogStore {
    /// Open (or create) the database with startup-mode retry.
    ///
    /// `connection_string` is a sqlx SQLite URL such as
    /// `sqlite:///tmp/oplog.db?mode=rwc` or `sqlite::memory:`.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        // Each in-memory connection is its own database
        let max_connections = if connection_string.contains(":memory:") { 1 } else { 5 };

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .connect(connection_string)
                .await
                .map_err(|e| map_sql_error("connect", e))
        })
        .await?;

        let store = Self { pool };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        info!(url = %connection_string, "Operation log store opened");
        Ok(store)
    }

    /// Open a file-backed store at `path`.
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        Self::new(&format!("sqlite://{}?mode=rwc", path.as_ref().display())).await
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sql_error("enable WAL mode", e))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sql_error("set synchronous mode", e))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS ops (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                op_id TEXT NOT NULL UNIQUE,
                op TEXT NOT NULL,
                applied_at INTEGER NOT NULL,
                source TEXT NOT NULL,
                application_status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                synced_at INTEGER,
                rejected_at INTEGER
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_ops_status ON ops (source, application_status)",
            "CREATE TABLE IF NOT EXISTS state_cache (slot TEXT PRIMARY KEY, snapshot TEXT NOT NULL)",
            "CREATE TABLE IF NOT EXISTS engine_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        ];

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_sql_error("init schema", e))
            })
            .await?;
        }
        Ok(())
    }

    async fn insert_entry(
        conn: &mut sqlx::AnyConnection,
        op: &Operation,
        source: OpSource,
        status: ApplicationStatus,
    ) -> Result<u64, StorageError> {
        let now = now_millis();
        let synced_at = (source == OpSource::Remote).then_some(now);
        let row = sqlx::query(
            "INSERT INTO ops (op_id, op, applied_at, source, application_status, retry_count, synced_at) \
             VALUES (?, ?, ?, ?, ?, 0, ?) RETURNING seq",
        )
        .bind(&op.id)
        .bind(encode(&op.id, op)?)
        .bind(now)
        .bind(source.as_str())
        .bind(status.as_str())
        .bind(synced_at)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sql_error("append", e))?;
        let seq: i64 = row
            .try_get("seq")
            .map_err(|e| StorageError::Backend(format!("column seq: {e}")))?;
        Ok(seq as u64)
    }

    async fn put_meta(
        conn: &mut sqlx::AnyConnection,
        key: &str,
        value: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO engine_meta (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sql_error("put meta", e))?;
        Ok(())
    }

    async fn bump_counter(conn: &mut sqlx::AnyConnection) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO engine_meta (key, value) VALUES (?, '1') \
             ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)",
        )
        .bind(META_COMPACTION_COUNTER)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sql_error("bump compaction counter", e))?;
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT value FROM engine_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sql_error("get meta", e))?;
        row.map(|r| text(&r, "value")).transpose()
    }

    async fn load_slot(&self, slot: &str) -> Result<Option<StateCache>, StorageError> {
        let row = sqlx::query("SELECT snapshot FROM state_cache WHERE slot = ?")
            .bind(slot)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sql_error("load snapshot", e))?;
        match row {
            Some(r) => Ok(Some(decode(slot, &text(&r, "snapshot")?)?)),
            None => Ok(None),
        }
    }

    async fn query_entries(&self, sql: &str) -> Result<Vec<OperationLogEntry>, StorageError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sql_error("query entries", e))?;
        rows.iter().map(row_to_entry).collect()
    }
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn append(
        &self,
        op: &Operation,
        source: OpSource,
        status: ApplicationStatus,
    ) -> Result<u64, StorageError> {
        retry_if("sql_append", &RetryConfig::query(), StorageError::is_transient, || async {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| map_sql_error("acquire", e))?;
            Self::insert_entry(&mut conn, op, source, status).await
        })
        .await
    }

    async fn append_batch(
        &self,
        ops: &[Operation],
        source: OpSource,
        status: ApplicationStatus,
    ) -> Result<Vec<u64>, StorageError> {
        retry_if("sql_append_batch", &RetryConfig::query(), StorageError::is_transient, || async {
            let mut tx = self.pool.begin().await.map_err(|e| map_sql_error("begin", e))?;
            let mut seqs = Vec::with_capacity(ops.len());
            for op in ops {
                seqs.push(Self::insert_entry(&mut tx, op, source, status).await?);
            }
            tx.commit().await.map_err(|e| map_sql_error("commit", e))?;
            Ok(seqs)
        })
        .await
    }

    async fn append_with_clock_update(&self, op: &Operation) -> Result<u64, StorageError> {
        let clock_json = encode(META_VECTOR_CLOCK, &op.vector_clock)?;
        retry_if("sql_append_local", &RetryConfig::query(), StorageError::is_transient, || async {
            let mut tx = self.pool.begin().await.map_err(|e| map_sql_error("begin", e))?;
            let seq =
                Self::insert_entry(&mut tx, op, OpSource::Local, ApplicationStatus::Applied).await?;
            Self::put_meta(&mut tx, META_VECTOR_CLOCK, &clock_json).await?;
            Self::bump_counter(&mut tx).await?;
            tx.commit().await.map_err(|e| map_sql_error("commit", e))?;
            Ok(seq)
        })
        .await
    }

    async fn get_op_by_id(&self, id: &str) -> Result<Option<OperationLogEntry>, StorageError> {
        let row = sqlx::query(&format!("{SELECT_ENTRY} WHERE op_id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sql_error("get op", e))?;
        row.as_ref().map(row_to_entry).transpose()
    }

    async fn get_ops_after_seq(&self, after: u64) -> Result<Vec<OperationLogEntry>, StorageError> {
        let rows = sqlx::query(&format!("{SELECT_ENTRY} WHERE seq > ? ORDER BY seq ASC"))
            .bind(after as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sql_error("get ops after seq", e))?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn get_last_seq(&self) -> Result<u64, StorageError> {
        // sqlite_sequence survives deletes, MAX(seq) would not
        let row = sqlx::query("SELECT seq FROM sqlite_sequence WHERE name = 'ops'")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sql_error("last seq", e))?;
        Ok(row
            .and_then(|r| r.try_get::<i64, _>("seq").ok())
            .unwrap_or(0) as u64)
    }

    async fn get_pending_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StorageError> {
        self.query_entries(&format!(
            "{SELECT_ENTRY} WHERE source = 'remote' AND application_status = 'pending' ORDER BY seq"
        ))
        .await
    }

    async fn get_failed_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StorageError> {
        self.query_entries(&format!(
            "{SELECT_ENTRY} WHERE source = 'remote' AND application_status = 'failed' ORDER BY seq"
        ))
        .await
    }

    async fn get_unsynced(&self) -> Result<Vec<OperationLogEntry>, StorageError> {
        self.query_entries(&format!(
            "{SELECT_ENTRY} WHERE synced_at IS NULL AND rejected_at IS NULL ORDER BY seq"
        ))
        .await
    }

    async fn mark_applied(&self, seqs: &[u64]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sql_error("begin", e))?;
        for seq in seqs {
            sqlx::query("UPDATE ops SET application_status = 'applied' WHERE seq = ?")
                .bind(*seq as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sql_error("mark applied", e))?;
        }
        tx.commit().await.map_err(|e| map_sql_error("commit", e))
    }

    async fn mark_failed(&self, op_ids: &[String], max_retries: Option<u32>) -> Result<(), StorageError> {
        let max = max_retries.map_or(i64::MAX, i64::from);
        let now = now_millis();
        let mut tx = self.pool.begin().await.map_err(|e| map_sql_error("begin", e))?;
        for id in op_ids {
            sqlx::query(
                "UPDATE ops SET \
                 application_status = CASE WHEN retry_count + 1 >= ? THEN 'rejected' ELSE 'failed' END, \
                 rejected_at = CASE WHEN retry_count + 1 >= ? THEN ? ELSE rejected_at END, \
                 retry_count = retry_count + 1 \
                 WHERE op_id = ?",
            )
            .bind(max)
            .bind(max)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sql_error("mark failed", e))?;
        }
        tx.commit().await.map_err(|e| map_sql_error("commit", e))
    }

    async fn mark_rejected(&self, op_ids: &[String]) -> Result<(), StorageError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await.map_err(|e| map_sql_error("begin", e))?;
        for id in op_ids {
            sqlx::query("UPDATE ops SET application_status = 'rejected', rejected_at = ? WHERE op_id = ?")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sql_error("mark rejected", e))?;
        }
        tx.commit().await.map_err(|e| map_sql_error("commit", e))
    }

    async fn mark_synced(&self, seqs: &[u64]) -> Result<(), StorageError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await.map_err(|e| map_sql_error("begin", e))?;
        for seq in seqs {
            sqlx::query("UPDATE ops SET synced_at = ? WHERE seq = ?")
                .bind(now)
                .bind(*seq as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sql_error("mark synced", e))?;
        }
        tx.commit().await.map_err(|e| map_sql_error("commit", e))
    }

    async fn delete_ops_where(&self, predicate: EntryPredicate<'_>) -> Result<usize, StorageError> {
        let entries = self.query_entries(&format!("{SELECT_ENTRY} ORDER BY seq")).await?;
        let doomed: Vec<u64> = entries
            .iter()
            .filter(|e| predicate(e))
            .map(|e| e.seq)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(|e| map_sql_error("begin", e))?;
        for seq in &doomed {
            sqlx::query("DELETE FROM ops WHERE seq = ?")
                .bind(*seq as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sql_error("delete op", e))?;
        }
        tx.commit().await.map_err(|e| map_sql_error("commit", e))?;
        debug!(deleted = doomed.len(), "Deleted log entries");
        Ok(doomed.len())
    }

    async fn save_state_cache(&self, cache: &StateCache) -> Result<(), StorageError> {
        let json = encode(SLOT_CURRENT, cache)?;
        retry_if("sql_save_snapshot", &RetryConfig::query(), StorageError::is_transient, || async {
            sqlx::query(
                "INSERT INTO state_cache (slot, snapshot) VALUES (?, ?) \
                 ON CONFLICT(slot) DO UPDATE SET snapshot = excluded.snapshot",
            )
            .bind(SLOT_CURRENT)
            .bind(&json)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sql_error("save snapshot", e))?;
            Ok(())
        })
        .await
    }

    async fn load_state_cache(&self) -> Result<Option<StateCache>, StorageError> {
        self.load_slot(SLOT_CURRENT).await
    }

    async fn save_state_cache_backup(&self) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO state_cache (slot, snapshot) \
             SELECT ?, snapshot FROM state_cache WHERE slot = ? \
             ON CONFLICT(slot) DO UPDATE SET snapshot = excluded.snapshot",
        )
        .bind(SLOT_BACKUP)
        .bind(SLOT_CURRENT)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sql_error("save backup", e))?;
        Ok(())
    }

    async fn has_state_cache_backup(&self) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM state_cache WHERE slot = ?")
            .bind(SLOT_BACKUP)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sql_error("has backup", e))?;
        let count: i64 = row.try_get("cnt").unwrap_or(0);
        Ok(count > 0)
    }

    async fn restore_state_cache_from_backup(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sql_error("begin", e))?;
        let row = sqlx::query("SELECT snapshot FROM state_cache WHERE slot = ?")
            .bind(SLOT_BACKUP)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sql_error("read backup", e))?
            .ok_or(StorageError::NotFound)?;
        let snapshot = text(&row, "snapshot")?;

        sqlx::query(
            "INSERT INTO state_cache (slot, snapshot) VALUES (?, ?) \
             ON CONFLICT(slot) DO UPDATE SET snapshot = excluded.snapshot",
        )
        .bind(SLOT_CURRENT)
        .bind(&snapshot)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sql_error("restore backup", e))?;
        sqlx::query("DELETE FROM state_cache WHERE slot = ?")
            .bind(SLOT_BACKUP)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sql_error("clear backup", e))?;
        tx.commit().await.map_err(|e| map_sql_error("commit", e))
    }

    async fn clear_state_cache_backup(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM state_cache WHERE slot = ?")
            .bind(SLOT_BACKUP)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sql_error("clear backup", e))?;
        Ok(())
    }

    async fn get_vector_clock(&self) -> Result<Option<VectorClock>, StorageError> {
        match self.get_meta(META_VECTOR_CLOCK).await? {
            Some(raw) => Ok(Some(decode(META_VECTOR_CLOCK, &raw)?)),
            None => Ok(None),
        }
    }

    async fn set_vector_clock(&self, clock: &VectorClock) -> Result<(), StorageError> {
        let json = encode(META_VECTOR_CLOCK, clock)?;
        let mut conn = self.pool.acquire().await.map_err(|e| map_sql_error("acquire", e))?;
        Self::put_meta(&mut conn, META_VECTOR_CLOCK, &json).await
    }

    async fn get_compaction_counter(&self) -> Result<u64, StorageError> {
        Ok(self
            .get_meta(META_COMPACTION_COUNTER)
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0))
    }

    async fn increment_compaction_counter(&self) -> Result<u64, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(|e| map_sql_error("acquire", e))?;
        Self::bump_counter(&mut conn).await?;
        drop(conn);
        self.get_compaction_counter().await
    }

    async fn reset_compaction_counter(&self) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await.map_err(|e| map_sql_error("acquire", e))?;
        Self::put_meta(&mut conn, META_COMPACTION_COUNTER, "0").await
    }

    async fn get_last_server_seq(&self) -> Result<u64, StorageError> {
        match self.get_meta(META_LAST_SERVER_SEQ).await? {
            Some(raw) => raw.parse::<u64>().map_err(|e| StorageError::Corruption {
                id: META_LAST_SERVER_SEQ.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(0),
        }
    }

    async fn set_last_server_seq(&self, seq: u64) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await.map_err(|e| map_sql_error("acquire", e))?;
        Self::put_meta(&mut conn, META_LAST_SERVER_SEQ, &seq.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OpType;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_store() -> (SqliteLogStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteLogStore::open(dir.path().join("oplog.db")).await.unwrap();
        (store, dir)
    }

    fn op(client: &str, counter: u64, entity: &str) -> Operation {
        let clock: VectorClock = [(client, counter)].into_iter().collect();
        Operation::new("[Task] Update", OpType::Update, "TASK", json!({"id": entity}), client, clock)
            .with_entity_id(entity)
    }

    #[tokio::test]
    async fn test_local_append_is_atomic_with_clock_and_counter() {
        let (store, _dir) = open_store().await;
        let o = op("A", 7, "t1");

        let seq = store.append_with_clock_update(&o).await.unwrap();

        assert_eq!(seq, 1);
        assert_eq!(store.get_vector_clock().await.unwrap(), Some(o.vector_clock.clone()));
        assert_eq!(store.get_compaction_counter().await.unwrap(), 1);
        let entry = store.get_op_by_id(&o.id).await.unwrap().unwrap();
        assert_eq!(entry.op, o);
        assert_eq!(entry.source, OpSource::Local);
        assert!(entry.is_unsynced());
    }

    #[tokio::test]
    async fn test_last_seq_survives_deletes() {
        let (store, _dir) = open_store().await;
        for i in 1..=3 {
            store.append_with_clock_update(&op("A", i, "t1")).await.unwrap();
        }
        store.delete_ops_where(&|_| true).await.unwrap();

        assert_eq!(store.get_last_seq().await.unwrap(), 3);
        let next = store.append_with_clock_update(&op("A", 4, "t1")).await.unwrap();
        assert_eq!(next, 4);
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (store, _dir) = open_store().await;
        let pending = op("B", 1, "t1");
        let failing = op("B", 2, "t2");
        let seqs = store
            .append_batch(&[pending.clone(), failing.clone()], OpSource::Remote, ApplicationStatus::Pending)
            .await
            .unwrap();
        assert_eq!(store.get_pending_remote_ops().await.unwrap().len(), 2);

        store.mark_applied(&seqs[..1]).await.unwrap();
        store.mark_failed(&[failing.id.clone()], Some(2)).await.unwrap();
        let failed = store.get_failed_remote_ops().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 1);

        store.mark_failed(&[failing.id.clone()], Some(2)).await.unwrap();
        assert!(store.get_failed_remote_ops().await.unwrap().is_empty());
        let entry = store.get_op_by_id(&failing.id).await.unwrap().unwrap();
        assert_eq!(entry.application_status, ApplicationStatus::Rejected);
    }

    #[tokio::test]
    async fn test_unsynced_excludes_synced_and_rejected() {
        let (store, _dir) = open_store().await;
        let a = op("A", 1, "t1");
        let b = op("A", 2, "t2");
        let c = op("A", 3, "t3");
        let seq_a = store.append_with_clock_update(&a).await.unwrap();
        store.append_with_clock_update(&b).await.unwrap();
        store.append_with_clock_update(&c).await.unwrap();

        store.mark_synced(&[seq_a]).await.unwrap();
        store.mark_rejected(&[b.id.clone()]).await.unwrap();

        let unsynced = store.get_unsynced().await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].op.id, c.id);
    }

    #[tokio::test]
    async fn test_snapshot_and_backup_slots() {
        let (store, _dir) = open_store().await;
        assert!(store.load_state_cache().await.unwrap().is_none());

        let first = StateCache::new(json!({"task": {"ids": []}}), 5, [("A", 5)].into_iter().collect());
        store.save_state_cache(&first).await.unwrap();
        store.save_state_cache_backup().await.unwrap();
        assert!(store.has_state_cache_backup().await.unwrap());

        let second = StateCache::new(json!({"task": {"ids": ["t1"]}}), 9, VectorClock::new());
        store.save_state_cache(&second).await.unwrap();
        assert_eq!(store.load_state_cache().await.unwrap(), Some(second));

        store.restore_state_cache_from_backup().await.unwrap();
        assert_eq!(store.load_state_cache().await.unwrap(), Some(first));
        assert!(!store.has_state_cache_backup().await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oplog.db");
        let o = op("A", 1, "t1");
        {
            let store = SqliteLogStore::open(&path).await.unwrap();
            store.append_with_clock_update(&o).await.unwrap();
            store.set_last_server_seq(42).await.unwrap();
            store
                .save_state_cache(&StateCache::new(json!({"task": {}}), 1, o.vector_clock.clone()))
                .await
                .unwrap();
        }

        let store = SqliteLogStore::open(&path).await.unwrap();
        assert_eq!(store.get_last_seq().await.unwrap(), 1);
        assert_eq!(store.get_vector_clock().await.unwrap(), Some(o.vector_clock));
        assert_eq!(store.get_compaction_counter().await.unwrap(), 1);
        assert_eq!(store.get_last_server_seq().await.unwrap(), 42);
        assert!(store.load_state_cache().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_undecodable_applied_at_is_an_error_not_zero() {
        let (store, _dir) = open_store().await;
        let o = op("A", 1, "t1");
        store.append_with_clock_update(&o).await.unwrap();
        sqlx::query("UPDATE ops SET applied_at = 'yesterday'")
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(store.get_op_by_id(&o.id).await.is_err());
        assert!(store.get_ops_after_seq(0).await.is_err());
    }

    #[tokio::test]
    async fn test_last_server_seq_defaults_to_zero() {
        let (store, _dir) = open_store().await;
        assert_eq!(store.get_last_server_seq().await.unwrap(), 0);
        store.set_last_server_seq(7).await.unwrap();
        store.set_last_server_seq(9).await.unwrap();
        assert_eq!(store.get_last_server_seq().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_counter_reset() {
        let (store, _dir) = open_store().await;
        assert_eq!(store.increment_compaction_counter().await.unwrap(), 1);
        assert_eq!(store.increment_compaction_counter().await.unwrap(), 2);
        store.reset_compaction_counter().await.unwrap();
        assert_eq!(store.get_compaction_counter().await.unwrap(), 0);
    }
}
