use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::traits::{EntryPredicate, LogStore, StorageError};
use crate::operation::{
    now_millis, ApplicationStatus, OpSource, Operation, OperationLogEntry, StateCache,
};
use crate::vector_clock::VectorClock;

#[derive(Default)]
struct Inner {
    entries: BTreeMap<u64, OperationLogEntry>,
    by_id: HashMap<String, u64>,
    last_seq: u64,
    state_cache: Option<StateCache>,
    backup: Option<StateCache>,
    vector_clock: Option<VectorClock>,
    compaction_counter: u64,
    last_server_seq: u64,
}

impl Inner {
    fn push(&mut self, op: &Operation, source: OpSource, status: ApplicationStatus) -> u64 {
        self.last_seq += 1;
        let seq = self.last_seq;
        let now = now_millis();
        let entry = OperationLogEntry {
            seq,
            op: op.clone(),
            applied_at: now,
            source,
            application_status: status,
            retry_count: 0,
            synced_at: (source == OpSource::Remote).then_some(now),
            rejected_at: None,
        };
        self.by_id.insert(op.id.clone(), seq);
        self.entries.insert(seq, entry);
        seq
    }

    fn entry_by_id_mut(&mut self, id: &str) -> Option<&mut OperationLogEntry> {
        let seq = *self.by_id.get(id)?;
        self.entries.get_mut(&seq)
    }

    fn collect(&self, pred: impl Fn(&OperationLogEntry) -> bool) -> Vec<OperationLogEntry> {
        self.entries.values().filter(|e| pred(e)).cloned().collect()
    }
}

/// Operation log kept entirely in memory.
///
/// Every trait call takes one short lock, so multi-record writes such as
/// [`LogStore::append_with_clock_update`] are atomic.
pub struct InMemoryLogStore {
    inner: Mutex<Inner>,
}

impl InMemoryLogStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Number of entries currently in the log
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Rewrite an entry's append time. Lets callers age entries for retention checks.
    pub fn set_applied_at(&self, seq: u64, applied_at: i64) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&seq) {
            entry.applied_at = applied_at;
        }
    }
}

impl Default for InMemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(
        &self,
        op: &Operation,
        source: OpSource,
        status: ApplicationStatus,
    ) -> Result<u64, StorageError> {
        Ok(self.inner.lock().push(op, source, status))
    }

    async fn append_with_clock_update(&self, op: &Operation) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock();
        let seq = inner.push(op, OpSource::Local, ApplicationStatus::Applied);
        inner.vector_clock = Some(op.vector_clock.clone());
        inner.compaction_counter += 1;
        Ok(seq)
    }

    async fn get_op_by_id(&self, id: &str) -> Result<Option<OperationLogEntry>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .by_id
            .get(id)
            .and_then(|seq| inner.entries.get(seq))
            .cloned())
    }

    async fn get_ops_after_seq(&self, after: u64) -> Result<Vec<OperationLogEntry>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .range(after.saturating_add(1)..)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn get_last_seq(&self) -> Result<u64, StorageError> {
        Ok(self.inner.lock().last_seq)
    }

    async fn get_pending_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StorageError> {
        Ok(self.inner.lock().collect(|e| {
            e.source == OpSource::Remote && e.application_status == ApplicationStatus::Pending
        }))
    }

    async fn get_failed_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StorageError> {
        Ok(self.inner.lock().collect(|e| {
            e.source == OpSource::Remote && e.application_status == ApplicationStatus::Failed
        }))
    }

    async fn get_unsynced(&self) -> Result<Vec<OperationLogEntry>, StorageError> {
        Ok(self.inner.lock().collect(OperationLogEntry::is_unsynced))
    }

    async fn mark_applied(&self, seqs: &[u64]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        for seq in seqs {
            if let Some(entry) = inner.entries.get_mut(seq) {
                entry.application_status = ApplicationStatus::Applied;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, op_ids: &[String], max_retries: Option<u32>) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let now = now_millis();
        for id in op_ids {
            if let Some(entry) = inner.entry_by_id_mut(id) {
                entry.retry_count += 1;
                if max_retries.is_some_and(|max| entry.retry_count >= max) {
                    entry.application_status = ApplicationStatus::Rejected;
                    entry.rejected_at = Some(now);
                } else {
                    entry.application_status = ApplicationStatus::Failed;
                }
            }
        }
        Ok(())
    }

    async fn mark_rejected(&self, op_ids: &[String]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let now = now_millis();
        for id in op_ids {
            if let Some(entry) = inner.entry_by_id_mut(id) {
                entry.application_status = ApplicationStatus::Rejected;
                entry.rejected_at = Some(now);
            }
        }
        Ok(())
    }

    async fn mark_synced(&self, seqs: &[u64]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let now = now_millis();
        for seq in seqs {
            if let Some(entry) = inner.entries.get_mut(seq) {
                entry.synced_at = Some(now);
            }
        }
        Ok(())
    }

    async fn delete_ops_where(&self, predicate: EntryPredicate<'_>) -> Result<usize, StorageError> {
        let mut inner = self.inner.lock();
        let doomed: Vec<(u64, String)> = inner
            .entries
            .values()
            .filter(|e| predicate(e))
            .map(|e| (e.seq, e.op.id.clone()))
            .collect();
        for (seq, id) in &doomed {
            inner.entries.remove(seq);
            inner.by_id.remove(id);
        }
        Ok(doomed.len())
    }

    async fn save_state_cache(&self, cache: &StateCache) -> Result<(), StorageError> {
        self.inner.lock().state_cache = Some(cache.clone());
        Ok(())
    }

    async fn load_state_cache(&self) -> Result<Option<StateCache>, StorageError> {
        Ok(self.inner.lock().state_cache.clone())
    }

    async fn save_state_cache_backup(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if let Some(current) = inner.state_cache.clone() {
            inner.backup = Some(current);
        }
        Ok(())
    }

    async fn has_state_cache_backup(&self) -> Result<bool, StorageError> {
        Ok(self.inner.lock().backup.is_some())
    }

    async fn restore_state_cache_from_backup(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let backup = inner.backup.take().ok_or(StorageError::NotFound)?;
        inner.state_cache = Some(backup);
        Ok(())
    }

    async fn clear_state_cache_backup(&self) -> Result<(), StorageError> {
        self.inner.lock().backup = None;
        Ok(())
    }

    async fn get_vector_clock(&self) -> Result<Option<VectorClock>, StorageError> {
        Ok(self.inner.lock().vector_clock.clone())
    }

    async fn set_vector_clock(&self, clock: &VectorClock) -> Result<(), StorageError> {
        self.inner.lock().vector_clock = Some(clock.clone());
        Ok(())
    }

    async fn merge_clocks(&self, ops: &[Operation]) -> Result<VectorClock, StorageError> {
        let mut inner = self.inner.lock();
        let mut clock = inner.vector_clock.clone().unwrap_or_default();
        for op in ops {
            clock.merge(&op.vector_clock);
        }
        inner.vector_clock = Some(clock.clone());
        Ok(clock)
    }

    async fn get_compaction_counter(&self) -> Result<u64, StorageError> {
        Ok(self.inner.lock().compaction_counter)
    }

    async fn increment_compaction_counter(&self) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock();
        inner.compaction_counter += 1;
        Ok(inner.compaction_counter)
    }

    async fn reset_compaction_counter(&self) -> Result<(), StorageError> {
        self.inner.lock().compaction_counter = 0;
        Ok(())
    }

    async fn get_last_server_seq(&self) -> Result<u64, StorageError> {
        Ok(self.inner.lock().last_server_seq)
    }

    async fn set_last_server_seq(&self, seq: u64) -> Result<(), StorageError> {
        self.inner.lock().last_server_seq = seq;
        Ok(())
    }
}
