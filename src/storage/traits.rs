use async_trait::async_trait;
use thiserror::Error;

use crate::operation::{ApplicationStatus, OpSource, Operation, OperationLogEntry, StateCache};
use crate::vector_clock::VectorClock;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// Database locked by another writer; worth retrying.
    #[error("Storage busy: {0}")]
    Busy(String),
    /// The backing store ran out of space.
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Data corruption detected for '{id}': {reason}")]
    Corruption { id: String, reason: String },
}

impl StorageError {
    #[must_use]
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }

    /// Transient failures that a short retry may clear.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

/// Predicate used by [`LogStore::delete_ops_where`].
pub type EntryPredicate<'a> = &'a (dyn Fn(&OperationLogEntry) -> bool + Send + Sync);

/// Persistent owner of the operation log, the snapshot slot (plus its backup)
/// and the vector-clock slot.
///
/// Sequence numbers are strictly increasing and never reused, even after
/// compaction deletes entries.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append an entry without touching the stored vector clock.
    ///
    /// Remote entries are recorded as already synced.
    async fn append(
        &self,
        op: &Operation,
        source: OpSource,
        status: ApplicationStatus,
    ) -> Result<u64, StorageError>;

    /// Append several entries in order. Default falls back to sequential appends.
    async fn append_batch(
        &self,
        ops: &[Operation],
        source: OpSource,
        status: ApplicationStatus,
    ) -> Result<Vec<u64>, StorageError> {
        let mut seqs = Vec::with_capacity(ops.len());
        for op in ops {
            seqs.push(self.append(op, source, status).await?);
        }
        Ok(seqs)
    }

    /// Append a local, applied entry and store `op.vector_clock` as the current
    /// clock in one transaction. Also bumps the persisted compaction counter.
    async fn append_with_clock_update(&self, op: &Operation) -> Result<u64, StorageError>;

    async fn get_op_by_id(&self, id: &str) -> Result<Option<OperationLogEntry>, StorageError>;

    /// All entries with `seq > after`, ascending.
    async fn get_ops_after_seq(&self, after: u64) -> Result<Vec<OperationLogEntry>, StorageError>;

    /// Highest sequence number ever assigned (0 when nothing was appended).
    async fn get_last_seq(&self) -> Result<u64, StorageError>;

    async fn get_pending_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StorageError>;

    async fn get_failed_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StorageError>;

    /// Entries neither synced nor rejected, ascending.
    async fn get_unsynced(&self) -> Result<Vec<OperationLogEntry>, StorageError>;

    /// Drop operations whose id is already in the log.
    async fn filter_new_ops(&self, ops: Vec<Operation>) -> Result<Vec<Operation>, StorageError> {
        let mut fresh = Vec::with_capacity(ops.len());
        for op in ops {
            if self.get_op_by_id(&op.id).await?.is_none() {
                fresh.push(op);
            }
        }
        Ok(fresh)
    }

    async fn mark_applied(&self, seqs: &[u64]) -> Result<(), StorageError>;

    /// Increment the retry counter; entries reaching `max_retries` become rejected.
    async fn mark_failed(&self, op_ids: &[String], max_retries: Option<u32>) -> Result<(), StorageError>;

    async fn mark_rejected(&self, op_ids: &[String]) -> Result<(), StorageError>;

    async fn mark_synced(&self, seqs: &[u64]) -> Result<(), StorageError>;

    /// Delete every entry matching `predicate`. Returns the number deleted.
    async fn delete_ops_where(&self, predicate: EntryPredicate<'_>) -> Result<usize, StorageError>;

    async fn save_state_cache(&self, cache: &StateCache) -> Result<(), StorageError>;

    async fn load_state_cache(&self) -> Result<Option<StateCache>, StorageError>;

    /// Copy the current snapshot into the backup slot (no-op without a snapshot).
    async fn save_state_cache_backup(&self) -> Result<(), StorageError>;

    async fn has_state_cache_backup(&self) -> Result<bool, StorageError>;

    /// Move the backup back into the current slot and clear the backup.
    async fn restore_state_cache_from_backup(&self) -> Result<(), StorageError>;

    async fn clear_state_cache_backup(&self) -> Result<(), StorageError>;

    async fn get_vector_clock(&self) -> Result<Option<VectorClock>, StorageError>;

    async fn set_vector_clock(&self, clock: &VectorClock) -> Result<(), StorageError>;

    /// Merge the clocks of `ops` into the stored clock.
    async fn merge_clocks(&self, ops: &[Operation]) -> Result<VectorClock, StorageError> {
        let mut clock = self.get_vector_clock().await?.unwrap_or_default();
        for op in ops {
            clock.merge(&op.vector_clock);
        }
        self.set_vector_clock(&clock).await?;
        Ok(clock)
    }

    async fn get_compaction_counter(&self) -> Result<u64, StorageError>;

    async fn increment_compaction_counter(&self) -> Result<u64, StorageError>;

    async fn reset_compaction_counter(&self) -> Result<(), StorageError>;

    /// Highest sync-server sequence whose operations were downloaded and applied.
    async fn get_last_server_seq(&self) -> Result<u64, StorageError>;

    async fn set_last_server_seq(&self, seq: u64) -> Result<(), StorageError>;
}
