//! Log compaction: fold old history into a snapshot and delete it.
//!
//! A compaction run, under the operation-log lock:
//!
//! 1. snapshots the current application state with the current clock and the
//!    last assigned sequence number,
//! 2. resets the compaction counter,
//! 3. deletes entries that are synced, older than the retention window and
//!    not newer than the captured sequence number.
//!
//! Unsynced entries always survive, so nothing that still has to reach the
//! server is lost. Emergency compaction (storage full) uses a shorter
//! retention window and reports failure as `false` instead of an error.
//!
//! # Retention
//!
//! - **Regular** (default 7 days): runs every `compaction_threshold` local appends
//! - **Emergency** (default 1 day): runs when an append hits the storage quota

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::OpLogConfig;
use crate::error::{OpLogError, Result};
use crate::host::{AppStateHost, UserNotice, UserNotifier};
use crate::operation::{now_millis, StateCache};
use crate::resilience::lock::{LockService, OPERATION_LOG};
use crate::storage::LogStore;

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub retention: Duration,
    pub emergency_retention: Duration,
    /// Local appends between automatic runs
    pub threshold: u64,
    /// Consecutive failures before the user is notified
    pub max_consecutive_failures: u32,
    /// Runs slower than this are logged
    pub slow_threshold: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self::from(&OpLogConfig::default())
    }
}

impl From<&OpLogConfig> for CompactionConfig {
    fn from(config: &OpLogConfig) -> Self {
        Self {
            retention: Duration::from_millis(config.compaction_retention_ms),
            emergency_retention: Duration::from_millis(config.emergency_retention_ms),
            threshold: config.compaction_threshold,
            max_consecutive_failures: config.max_compaction_failures,
            slow_threshold: config.slow_compaction(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionKind {
    Regular,
    Emergency,
}

impl CompactionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Emergency => "emergency",
        }
    }
}

/// Result of a compaction run.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub kind: CompactionKind,
    /// Log entries deleted
    pub deleted: usize,
    /// `lastAppliedOpSeq` of the snapshot written by this run
    pub snapshot_seq: u64,
    pub duration: Duration,
}

pub struct Compactor {
    store: Arc<dyn LogStore>,
    host: Arc<dyn AppStateHost>,
    locks: Arc<LockService>,
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(
        store: Arc<dyn LogStore>,
        host: Arc<dyn AppStateHost>,
        locks: Arc<LockService>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            store,
            host,
            locks,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Regular compaction. Errors propagate to the caller.
    pub async fn compact(&self) -> Result<CompactionResult> {
        self.run(CompactionKind::Regular).await
    }

    /// Compaction with the short retention window. Never errors.
    pub async fn emergency_compact(&self) -> bool {
        match self.run(CompactionKind::Emergency).await {
            Ok(result) => {
                info!(deleted = result.deleted, "Emergency compaction freed log entries");
                true
            }
            Err(e) => {
                error!(error = %e, "Emergency compaction failed");
                false
            }
        }
    }

    async fn run(&self, kind: CompactionKind) -> Result<CompactionResult> {
        let started = Instant::now();
        let _guard = self.locks.acquire(OPERATION_LOG).await;

        let state = self
            .host
            .current_state()
            .await
            .map_err(|e| OpLogError::Host(e.0))?;
        let clock = self.store.get_vector_clock().await?.unwrap_or_default();
        let last_seq = self.store.get_last_seq().await?;

        self.store
            .save_state_cache(&StateCache::new(state, last_seq, clock))
            .await?;
        self.store.reset_compaction_counter().await?;

        let retention = match kind {
            CompactionKind::Regular => self.config.retention,
            CompactionKind::Emergency => self.config.emergency_retention,
        };
        let cutoff = now_millis() - retention.as_millis() as i64;

        // Entries appended after the snapshot was taken are never deleted
        let deleted = self
            .store
            .delete_ops_where(&move |e| {
                e.synced_at.is_some() && e.applied_at < cutoff && e.seq <= last_seq
            })
            .await?;

        let duration = started.elapsed();
        crate::metrics::record_compaction(kind.as_str(), deleted, duration);
        if duration > self.config.slow_threshold {
            warn!(kind = kind.as_str(), ?duration, deleted, "Slow compaction");
        } else {
            debug!(kind = kind.as_str(), ?duration, deleted, snapshot_seq = last_seq, "Compaction complete");
        }

        Ok(CompactionResult {
            kind,
            deleted,
            snapshot_seq: last_seq,
            duration,
        })
    }
}

/// Counts local appends and starts a background compaction past the threshold.
///
/// The in-memory counter is initialised lazily from the persisted one so the
/// cadence survives restarts.
pub struct CompactionTrigger {
    compactor: Arc<Compactor>,
    store: Arc<dyn LogStore>,
    notifier: Arc<dyn UserNotifier>,
    counter: tokio::sync::Mutex<Option<u64>>,
    in_flight: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl CompactionTrigger {
    pub fn new(
        compactor: Arc<Compactor>,
        store: Arc<dyn LogStore>,
        notifier: Arc<dyn UserNotifier>,
    ) -> Self {
        Self {
            compactor,
            store,
            notifier,
            counter: tokio::sync::Mutex::new(None),
            in_flight: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Call after every successful local append.
    pub async fn record_append(self: &Arc<Self>) {
        let mut counter = self.counter.lock().await;
        let next = match *counter {
            Some(n) => n + 1,
            // The persisted counter already includes this append
            None => match self.store.get_compaction_counter().await {
                Ok(n) => n.max(1),
                Err(e) => {
                    warn!(error = %e, "Could not read persisted compaction counter");
                    1
                }
            },
        };
        *counter = Some(next);
        drop(counter);

        if next >= self.compactor.config().threshold && !self.in_flight.swap(true, Ordering::AcqRel) {
            info!(appends = next, "Compaction threshold reached");
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_compaction().await;
            });
        }
    }

    async fn run_compaction(&self) {
        match self.compactor.compact().await {
            Ok(_) => {
                *self.counter.lock().await = Some(0);
                self.consecutive_failures.store(0, Ordering::Release);
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                error!(error = %e, consecutive_failures = failures, "Compaction failed");
                // Once per failure streak
                if failures == self.compactor.config().max_consecutive_failures {
                    self.notifier.notify(UserNotice::CompactionFailed {
                        consecutive_failures: failures,
                    });
                }
            }
        }
        self.in_flight.store(false, Ordering::Release);
    }

    /// Appends counted since the last compaction (None before the first append).
    pub async fn appends_since_compaction(&self) -> Option<u64> {
        *self.counter.lock().await
    }

    #[must_use]
    pub fn is_compacting(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ApplyError, HostError, TracingNotifier};
    use crate::operation::{ApplicationStatus, OpSource, OpType, Operation};
    use crate::storage::InMemoryLogStore;
    use crate::vector_clock::VectorClock;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct FixedState;

    #[async_trait]
    impl AppStateHost for FixedState {
        async fn current_state(&self) -> std::result::Result<Value, HostError> {
            Ok(json!({"task": {"ids": ["t1"]}, "project": {}, "globalConfig": {}}))
        }
        async fn publish_state(&self, _: Value) -> std::result::Result<(), HostError> {
            Ok(())
        }
        async fn apply_operations(&self, _: &[Operation]) -> std::result::Result<(), ApplyError> {
            Ok(())
        }
    }

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn op(n: u64) -> Operation {
        Operation::new("[Task] Update", OpType::Update, "TASK", json!({"id": "t1"}), "A", [("A", n)].into_iter().collect())
            .with_entity_id("t1")
    }

    fn compactor(store: Arc<InMemoryLogStore>) -> Compactor {
        Compactor::new(store, Arc::new(FixedState), Arc::new(LockService::new()), CompactionConfig::default())
    }

    #[tokio::test]
    async fn test_compaction_keeps_unsynced_and_recent() {
        let store = Arc::new(InMemoryLogStore::new());
        let old_synced = store.append_with_clock_update(&op(1)).await.unwrap();
        let old_unsynced = store.append_with_clock_update(&op(2)).await.unwrap();
        let recent_synced = store.append_with_clock_update(&op(3)).await.unwrap();
        store.mark_synced(&[old_synced, recent_synced]).await.unwrap();
        let ten_days_ago = now_millis() - 10 * DAY_MS;
        store.set_applied_at(old_synced, ten_days_ago);
        store.set_applied_at(old_unsynced, ten_days_ago);

        let result = compactor(store.clone()).compact().await.unwrap();

        assert_eq!(result.deleted, 1);
        assert_eq!(result.snapshot_seq, 3);
        let remaining: Vec<u64> = store.get_ops_after_seq(0).await.unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(remaining, vec![old_unsynced, recent_synced]);
    }

    #[tokio::test]
    async fn test_compaction_writes_snapshot_and_resets_counter() {
        let store = Arc::new(InMemoryLogStore::new());
        store.append_with_clock_update(&op(1)).await.unwrap();
        store.append_with_clock_update(&op(2)).await.unwrap();
        assert_eq!(store.get_compaction_counter().await.unwrap(), 2);

        compactor(store.clone()).compact().await.unwrap();

        let snapshot = store.load_state_cache().await.unwrap().unwrap();
        assert_eq!(snapshot.last_applied_op_seq, 2);
        assert_eq!(snapshot.vector_clock.get("A"), 2);
        assert_eq!(snapshot.state["task"]["ids"], json!(["t1"]));
        assert_eq!(store.get_compaction_counter().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_emergency_uses_shorter_retention() {
        let store = Arc::new(InMemoryLogStore::new());
        let seq = store.append(&op(1), OpSource::Remote, ApplicationStatus::Applied).await.unwrap();
        store.set_applied_at(seq, now_millis() - 2 * DAY_MS);
        let c = compactor(store.clone());

        c.compact().await.unwrap();
        assert_eq!(store.len(), 1);

        assert!(c.emergency_compact().await);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_trigger_fires_at_threshold() {
        let store = Arc::new(InMemoryLogStore::new());
        let config = CompactionConfig {
            threshold: 3,
            ..CompactionConfig::default()
        };
        let compactor = Arc::new(Compactor::new(
            store.clone(),
            Arc::new(FixedState),
            Arc::new(LockService::new()),
            config,
        ));
        let trigger = Arc::new(CompactionTrigger::new(compactor, store.clone(), Arc::new(TracingNotifier)));

        for n in 1..=3 {
            store.append_with_clock_update(&op(n)).await.unwrap();
            trigger.record_append().await;
        }

        for _ in 0..100 {
            if store.load_state_cache().await.unwrap().is_some() && !trigger.is_compacting() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.load_state_cache().await.unwrap().is_some());
        assert_eq!(trigger.appends_since_compaction().await, Some(0));
    }

    #[tokio::test]
    async fn test_trigger_initialises_from_persisted_counter() {
        let store = Arc::new(InMemoryLogStore::new());
        for _ in 0..7 {
            store.increment_compaction_counter().await.unwrap();
        }
        let trigger = Arc::new(CompactionTrigger::new(
            Arc::new(compactor(store.clone())),
            store.clone(),
            Arc::new(TracingNotifier),
        ));

        trigger.record_append().await;
        assert_eq!(trigger.appends_since_compaction().await, Some(7));
        trigger.record_append().await;
        assert_eq!(trigger.appends_since_compaction().await, Some(8));
    }
}
