// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exchanging operations with the sync server.
//!
//! Every endpoint call goes through a circuit breaker and the shared retry
//! helper. Downloaded operations are persisted as `remote` + `pending` before
//! they are applied, so a crash mid-apply is picked up by pending-operation
//! recovery on the next start. The download cursor lives in the store and
//! only moves after the operations behind it are in the log.
//!
//! ```text
//! download_and_apply:
//!   download pages ─► drop known ids ─► migrate ─► drop ops superseded by a full-state import
//!        ─► detect conflicts ─► append (pending) ─► bulk apply (sync window open)
//!        ─► mark applied / failed ─► merge clocks ─► persist cursor
//!
//! upload_pending:
//!   unsynced local ops ─► upload ─► mark synced / rejected
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{OpLogError, Result};
use crate::host::AppStateHost;
use crate::hydration_state::HydrationState;
use crate::operation::{ApplicationStatus, OpSource, Operation, StateCache};
use crate::resilience::{retry_if, CircuitBreaker, CircuitConfig, CircuitError, LockService, RetryConfig, OPERATION_LOG};
use crate::schema::SchemaMigrator;
use crate::storage::LogStore;
use crate::vector_clock::{ClockComparison, VectorClock};

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Network failure, timeout or 5xx; worth retrying
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    /// The server refused the request
    #[error("remote refused request: {0}")]
    Refused(String),
}

impl RemoteError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DownloadPage {
    pub ops: Vec<Operation>,
    /// Highest server sequence number covered by this page
    pub latest_seq: u64,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UploadReceipt {
    /// Ids the server stored
    pub accepted: Vec<String>,
    /// Ids the server refused for good
    pub rejected: Vec<String>,
}

/// The sync server.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn get_last_server_seq(&self) -> std::result::Result<u64, RemoteError>;

    async fn download_ops(&self, after_seq: u64) -> std::result::Result<DownloadPage, RemoteError>;

    async fn upload_ops(&self, ops: &[Operation]) -> std::result::Result<UploadReceipt, RemoteError>;

    async fn upload_snapshot(&self, snapshot: &StateCache) -> std::result::Result<(), RemoteError>;
}

/// A remote operation concurrent with an unsynced local one on the same entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub entity_type: String,
    pub entity_id: String,
    pub local_op_id: String,
    pub remote_op_id: String,
    pub local_clock: VectorClock,
    pub remote_clock: VectorClock,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadOutcome {
    /// New operations (after dropping already known ids)
    pub received: usize,
    /// Retired by migration or superseded by a full-state import
    pub dropped: usize,
    pub applied: usize,
    pub failed: usize,
    /// Reported for the resolution layer; the operations are applied regardless
    pub conflicts: Vec<Conflict>,
    pub server_seq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadOutcome {
    pub uploaded: usize,
    pub accepted: usize,
    pub rejected: usize,
}

pub struct RemoteSync {
    endpoint: Arc<dyn RemoteEndpoint>,
    store: Arc<dyn LogStore>,
    host: Arc<dyn AppStateHost>,
    locks: Arc<LockService>,
    migrator: SchemaMigrator,
    circuit: CircuitBreaker,
    retry: RetryConfig,
}

impl RemoteSync {
    pub fn new(
        endpoint: Arc<dyn RemoteEndpoint>,
        store: Arc<dyn LogStore>,
        host: Arc<dyn AppStateHost>,
        locks: Arc<LockService>,
        migrator: SchemaMigrator,
    ) -> Self {
        Self::with_policies(
            endpoint,
            store,
            host,
            locks,
            migrator,
            CircuitConfig::default(),
            RetryConfig::remote(),
        )
    }

    pub fn with_policies(
        endpoint: Arc<dyn RemoteEndpoint>,
        store: Arc<dyn LogStore>,
        host: Arc<dyn AppStateHost>,
        locks: Arc<LockService>,
        migrator: SchemaMigrator,
        circuit: CircuitConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            endpoint,
            store,
            host,
            locks,
            migrator,
            circuit: CircuitBreaker::new("remote", circuit),
            retry,
        }
    }

    #[must_use]
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Highest server seq already downloaded and stored.
    pub async fn cursor(&self) -> Result<u64> {
        Ok(self.store.get_last_server_seq().await?)
    }

    async fn call<T, F, Fut>(&self, name: &'static str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let result = self
            .circuit
            .call(|| retry_if(name, &self.retry, RemoteError::is_transient, &f))
            .await;
        match result {
            Ok(value) => {
                crate::metrics::record_remote_call(name, "success");
                Ok(value)
            }
            Err(CircuitError::Rejected) => {
                crate::metrics::record_remote_call(name, "rejected");
                Err(OpLogError::CircuitOpen)
            }
            Err(CircuitError::Inner(e)) => {
                crate::metrics::record_remote_call(name, "failure");
                Err(OpLogError::Remote(e.to_string()))
            }
        }
    }

    async fn download_new_ops(&self) -> Result<(Vec<Operation>, u64)> {
        let mut cursor = self.cursor().await?;
        let server_seq = self.call("get_last_server_seq", || self.endpoint.get_last_server_seq()).await?;
        if server_seq <= cursor {
            return Ok((Vec::new(), cursor));
        }

        let mut ops = Vec::new();
        loop {
            let after = cursor;
            let page = self.call("download_ops", || self.endpoint.download_ops(after)).await?;
            let progressed = page.latest_seq > cursor;
            debug!(after, received = page.ops.len(), latest_seq = page.latest_seq, "Downloaded page");
            ops.extend(page.ops);
            cursor = cursor.max(page.latest_seq);
            if !page.has_more {
                break;
            }
            if !progressed {
                warn!(cursor, "Server reported more pages without advancing; stopping download");
                break;
            }
        }
        Ok((ops, cursor))
    }

    /// The most recent full-state operation, downloaded or already in the log.
    async fn latest_full_state(&self, downloaded: &[Operation]) -> Result<Option<Operation>> {
        if let Some(op) = downloaded.iter().rev().find(|op| op.is_full_state()) {
            return Ok(Some(op.clone()));
        }
        let entries = self.store.get_ops_after_seq(0).await?;
        Ok(entries.into_iter().rev().map(|e| e.op).find(Operation::is_full_state))
    }

    async fn detect_conflicts(&self, remote_ops: &[Operation]) -> Result<Vec<Conflict>> {
        let unsynced = self.store.get_unsynced().await?;
        let mut local_by_entity: HashMap<(&str, &str), Vec<&Operation>> = HashMap::new();
        for entry in unsynced.iter().filter(|e| e.source == OpSource::Local) {
            if let Some(id) = entry.op.entity_id.as_deref() {
                local_by_entity
                    .entry((entry.op.entity_type.as_str(), id))
                    .or_default()
                    .push(&entry.op);
            }
        }

        let mut conflicts = Vec::new();
        for remote in remote_ops {
            let Some(id) = remote.entity_id.as_deref() else {
                continue;
            };
            let Some(locals) = local_by_entity.get(&(remote.entity_type.as_str(), id)) else {
                continue;
            };
            conflicts.extend(
                locals
                    .iter()
                    .filter(|local| local.vector_clock.is_concurrent_with(&remote.vector_clock))
                    .map(|local| Conflict {
                        entity_type: remote.entity_type.clone(),
                        entity_id: id.to_string(),
                        local_op_id: local.id.clone(),
                        remote_op_id: remote.id.clone(),
                        local_clock: local.vector_clock.clone(),
                        remote_clock: remote.vector_clock.clone(),
                    }),
            );
        }
        Ok(conflicts)
    }

    /// Download operations newer than the cursor and apply them.
    pub async fn download_and_apply(&self, hydration: &HydrationState) -> Result<DownloadOutcome> {
        let (downloaded, server_seq) = self.download_new_ops().await?;
        let ops = self.store.filter_new_ops(downloaded).await?;
        let received = ops.len();
        let (ops, retired) = self.migrator.migrate_operations(ops)?;
        let import = self.latest_full_state(&ops).await?;
        let (ops, superseded) = drop_superseded_by_import(ops, import.as_ref());
        if superseded > 0 {
            info!(superseded, "Dropped remote operations made obsolete by a full-state import");
        }

        let mut outcome = DownloadOutcome {
            received,
            dropped: retired + superseded,
            server_seq,
            ..DownloadOutcome::default()
        };
        if ops.is_empty() {
            self.store.set_last_server_seq(server_seq).await?;
            return Ok(outcome);
        }

        outcome.conflicts = self.detect_conflicts(&ops).await?;
        if !outcome.conflicts.is_empty() {
            crate::metrics::record_conflicts(outcome.conflicts.len());
            warn!(count = outcome.conflicts.len(), "Remote operations conflict with unsynced local ones");
        }

        let seqs = {
            let _guard = self.locks.acquire(OPERATION_LOG).await;
            self.store
                .append_batch(&ops, OpSource::Remote, ApplicationStatus::Pending)
                .await?
        };

        let applied_count = {
            let _window = hydration.applying_guard();
            match self.host.apply_operations(&ops).await {
                Ok(()) => ops.len(),
                Err(e) => {
                    warn!(error = %e, "Applying remote operations failed part-way");
                    e.op_id
                        .as_deref()
                        .and_then(|id| ops.iter().position(|op| op.id == id))
                        .unwrap_or(0)
                }
            }
        };

        let (applied_ops, failed_ops) = ops.split_at(applied_count);
        if !applied_ops.is_empty() {
            self.store.mark_applied(&seqs[..applied_count]).await?;
            let _guard = self.locks.acquire(OPERATION_LOG).await;
            self.store.merge_clocks(applied_ops).await?;
        }
        if !failed_ops.is_empty() {
            let ids: Vec<String> = failed_ops.iter().map(|op| op.id.clone()).collect();
            self.store.mark_failed(&ids, None).await?;
        }

        outcome.applied = applied_ops.len();
        outcome.failed = failed_ops.len();
        crate::metrics::record_remote_ops_applied(outcome.applied, outcome.failed);
        self.store.set_last_server_seq(server_seq).await?;
        info!(
            received = outcome.received,
            dropped = outcome.dropped,
            applied = outcome.applied,
            failed = outcome.failed,
            server_seq,
            "Applied remote operations"
        );
        Ok(outcome)
    }

    /// Upload unsynced local operations.
    pub async fn upload_pending(&self) -> Result<UploadOutcome> {
        let pending: Vec<_> = self
            .store
            .get_unsynced()
            .await?
            .into_iter()
            .filter(|e| e.source == OpSource::Local)
            .collect();
        if pending.is_empty() {
            return Ok(UploadOutcome::default());
        }

        let ops: Vec<Operation> = pending.iter().map(|e| e.op.clone()).collect();
        let receipt = self.call("upload_ops", || self.endpoint.upload_ops(&ops)).await?;

        let seq_by_id: HashMap<&str, u64> = pending.iter().map(|e| (e.op.id.as_str(), e.seq)).collect();
        let synced: Vec<u64> = receipt
            .accepted
            .iter()
            .filter_map(|id| seq_by_id.get(id.as_str()).copied())
            .collect();
        if !synced.is_empty() {
            self.store.mark_synced(&synced).await?;
        }
        if !receipt.rejected.is_empty() {
            warn!(count = receipt.rejected.len(), ids = ?receipt.rejected, "Server rejected operations");
            self.store.mark_rejected(&receipt.rejected).await?;
        }

        debug!(uploaded = ops.len(), accepted = synced.len(), "Uploaded local operations");
        Ok(UploadOutcome {
            uploaded: ops.len(),
            accepted: synced.len(),
            rejected: receipt.rejected.len(),
        })
    }

    /// Push the stored snapshot. Returns false when there is none.
    pub async fn upload_snapshot(&self) -> Result<bool> {
        let Some(snapshot) = self.store.load_state_cache().await? else {
            return Ok(false);
        };
        self.call("upload_snapshot", || self.endpoint.upload_snapshot(&snapshot)).await?;
        info!(last_applied_op_seq = snapshot.last_applied_op_seq, "Uploaded snapshot");
        Ok(true)
    }
}

/// Keep `import` itself and the operations authored with knowledge of it.
///
/// Anything causally before or concurrent with the import was either folded
/// into it or was written against state the import replaced.
fn drop_superseded_by_import(ops: Vec<Operation>, import: Option<&Operation>) -> (Vec<Operation>, usize) {
    let Some(import) = import else {
        return (ops, 0);
    };
    let total = ops.len();
    let kept: Vec<Operation> = ops
        .into_iter()
        .filter(|op| {
            op.id == import.id || op.vector_clock.compare(&import.vector_clock) == ClockComparison::Greater
        })
        .collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ApplyError, HostError};
    use crate::operation::{OpType, ENTITY_TYPE_ALL};
    use crate::schema::SchemaMigration;
    use crate::storage::InMemoryLogStore;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeServer {
        ops: Mutex<Vec<Operation>>,
        uploaded: Mutex<Vec<Operation>>,
        reject_ids: Vec<String>,
    }

    #[async_trait]
    impl RemoteEndpoint for FakeServer {
        async fn get_last_server_seq(&self) -> std::result::Result<u64, RemoteError> {
            Ok(self.ops.lock().len() as u64)
        }
        async fn download_ops(&self, after_seq: u64) -> std::result::Result<DownloadPage, RemoteError> {
            let ops = self.ops.lock();
            let start = after_seq as usize;
            let end = (start + 2).min(ops.len());
            Ok(DownloadPage {
                ops: ops[start..end].to_vec(),
                latest_seq: end as u64,
                has_more: end < ops.len(),
            })
        }
        async fn upload_ops(&self, ops: &[Operation]) -> std::result::Result<UploadReceipt, RemoteError> {
            self.uploaded.lock().extend_from_slice(ops);
            let (rejected, accepted): (Vec<_>, Vec<_>) =
                ops.iter().map(|o| o.id.clone()).partition(|id| self.reject_ids.contains(id));
            Ok(UploadReceipt { accepted, rejected })
        }
        async fn upload_snapshot(&self, _: &StateCache) -> std::result::Result<(), RemoteError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Host {
        applied: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl AppStateHost for Host {
        async fn current_state(&self) -> std::result::Result<Value, HostError> {
            Ok(json!({}))
        }
        async fn publish_state(&self, _: Value) -> std::result::Result<(), HostError> {
            Ok(())
        }
        async fn apply_operations(&self, ops: &[Operation]) -> std::result::Result<(), ApplyError> {
            for op in ops {
                if self.fail_on.as_deref() == Some(op.id.as_str()) {
                    return Err(ApplyError {
                        op_id: Some(op.id.clone()),
                        message: "missing parent".into(),
                    });
                }
                self.applied.lock().push(op.id.clone());
            }
            Ok(())
        }
    }

    fn remote_op(client: &str, n: u64, entity: &str) -> Operation {
        Operation::new("[Task] Update", OpType::Update, "TASK", json!({"id": entity}), client, [(client, n)].into_iter().collect())
            .with_entity_id(entity)
    }

    fn sync(server: Arc<FakeServer>, store: Arc<InMemoryLogStore>, host: Arc<Host>) -> RemoteSync {
        sync_with_migrator(server, store, host, SchemaMigrator::new().unwrap())
    }

    fn sync_with_migrator(
        server: Arc<FakeServer>,
        store: Arc<InMemoryLogStore>,
        host: Arc<Host>,
        migrator: SchemaMigrator,
    ) -> RemoteSync {
        RemoteSync::with_policies(
            server,
            store,
            host,
            Arc::new(LockService::new()),
            migrator,
            CircuitConfig::test(),
            RetryConfig::test(),
        )
    }

    /// v1 -> v2: "[Task] Archive" is retired, everything else is renamed.
    fn retiring_migrator() -> SchemaMigrator {
        fn keep_state(state: Value) -> std::result::Result<Value, String> {
            Ok(state)
        }
        fn retire_archive(mut op: Operation) -> std::result::Result<Option<Operation>, String> {
            if op.action_type == "[Task] Archive" {
                return Ok(None);
            }
            op.action_type = op.action_type.replace("[Task]", "[Tasks]");
            Ok(Some(op))
        }
        SchemaMigrator::with_migrations(
            2,
            1,
            vec![SchemaMigration {
                from_version: 1,
                to_version: 2,
                description: "retire archive action",
                requires_operation_migration: true,
                migrate_state: keep_state,
                migrate_operation: Some(retire_archive),
            }],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_download_pages_applies_and_merges_clocks() {
        let server = Arc::new(FakeServer::default());
        server.ops.lock().extend((1..=5).map(|n| remote_op("B", n, "t1")));
        let store = Arc::new(InMemoryLogStore::new());
        let host = Arc::new(Host::default());
        let hydration = HydrationState::new(Duration::ZERO, 10);
        let rs = sync(server, store.clone(), host.clone());

        let outcome = rs.download_and_apply(&hydration).await.unwrap();

        assert_eq!(outcome.received, 5);
        assert_eq!(outcome.applied, 5);
        assert_eq!(outcome.server_seq, 5);
        assert_eq!(host.applied.lock().len(), 5);
        assert_eq!(store.get_vector_clock().await.unwrap().unwrap().get("B"), 5);
        assert!(store.get_pending_remote_ops().await.unwrap().is_empty());
        assert!(!hydration.is_applying_remote_ops());

        let again = rs.download_and_apply(&hydration).await.unwrap();
        assert_eq!(again.received, 0);
    }

    #[tokio::test]
    async fn test_cursor_survives_restart_after_log_is_compacted() {
        let server = Arc::new(FakeServer::default());
        server.ops.lock().extend((1..=3).map(|n| remote_op("B", n, "t1")));
        let store = Arc::new(InMemoryLogStore::new());
        let hydration = HydrationState::new(Duration::ZERO, 10);

        let first = sync(server.clone(), store.clone(), Arc::default());
        assert_eq!(first.download_and_apply(&hydration).await.unwrap().applied, 3);
        assert_eq!(first.cursor().await.unwrap(), 3);
        store.delete_ops_where(&|_| true).await.unwrap();

        let host = Arc::new(Host::default());
        let restarted = sync(server, store.clone(), host.clone());
        let outcome = restarted.download_and_apply(&hydration).await.unwrap();

        assert_eq!((outcome.received, outcome.applied), (0, 0));
        assert!(host.applied.lock().is_empty());
        assert!(store.get_ops_after_seq(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_downloaded_ops_are_migrated_and_retired_ones_dropped() {
        let server = Arc::new(FakeServer::default());
        let mut archive = remote_op("B", 1, "t1");
        archive.action_type = "[Task] Archive".into();
        let update = remote_op("B", 2, "t2");
        server.ops.lock().extend([archive, update.clone()]);
        let store = Arc::new(InMemoryLogStore::new());
        let host = Arc::new(Host::default());

        let outcome = sync_with_migrator(server, store.clone(), host.clone(), retiring_migrator())
            .download_and_apply(&HydrationState::new(Duration::ZERO, 10))
            .await
            .unwrap();

        assert_eq!((outcome.received, outcome.dropped, outcome.applied), (2, 1, 1));
        assert_eq!(*host.applied.lock(), vec![update.id.clone()]);
        let stored = store.get_op_by_id(&update.id).await.unwrap().unwrap();
        assert_eq!(stored.op.schema_version, 2);
        assert_eq!(stored.op.action_type, "[Tasks] Update");
    }

    #[tokio::test]
    async fn test_ops_superseded_by_local_import_are_dropped() {
        let store = Arc::new(InMemoryLogStore::new());
        let import = Operation::new(
            "[All] Load All Data",
            OpType::SyncImport,
            ENTITY_TYPE_ALL,
            json!({"task": {}}),
            "A",
            [("A", 3), ("B", 1)].into_iter().collect(),
        );
        store
            .append(&import, OpSource::Remote, ApplicationStatus::Applied)
            .await
            .unwrap();

        let stale = remote_op("B", 1, "t1");
        let concurrent = remote_op("C", 1, "t2");
        let mut after = remote_op("B", 2, "t3");
        after.vector_clock = [("A", 3), ("B", 2)].into_iter().collect();
        let server = Arc::new(FakeServer::default());
        server.ops.lock().extend([stale, concurrent, after.clone()]);
        let host = Arc::new(Host::default());

        let outcome = sync(server, store, host.clone())
            .download_and_apply(&HydrationState::new(Duration::ZERO, 10))
            .await
            .unwrap();

        assert_eq!((outcome.received, outcome.dropped, outcome.applied), (3, 2, 1));
        assert_eq!(*host.applied.lock(), vec![after.id]);
    }

    #[test]
    fn test_downloaded_import_supersedes_earlier_ops_in_the_same_batch() {
        let before = remote_op("B", 1, "t1");
        let import = Operation::new(
            "[All] Load All Data",
            OpType::SyncImport,
            ENTITY_TYPE_ALL,
            json!({}),
            "C",
            [("C", 1)].into_iter().collect(),
        );
        let (kept, dropped) = drop_superseded_by_import(vec![before, import.clone()], Some(&import));
        assert_eq!(dropped, 1);
        assert_eq!(kept, vec![import]);
        assert_eq!(drop_superseded_by_import(Vec::new(), None), (Vec::new(), 0));
    }

    #[tokio::test]
    async fn test_failing_op_and_followers_are_marked_failed() {
        let server = Arc::new(FakeServer::default());
        let ops: Vec<_> = (1..=3).map(|n| remote_op("B", n, "t1")).collect();
        let poisoned = ops[1].id.clone();
        server.ops.lock().extend(ops);
        let store = Arc::new(InMemoryLogStore::new());
        let host = Arc::new(Host {
            fail_on: Some(poisoned),
            ..Host::default()
        });

        let outcome = sync(server, store.clone(), host)
            .download_and_apply(&HydrationState::new(Duration::ZERO, 10))
            .await
            .unwrap();

        assert_eq!((outcome.applied, outcome.failed), (1, 2));
        assert_eq!(store.get_failed_remote_ops().await.unwrap().len(), 2);
        assert_eq!(store.get_vector_clock().await.unwrap().unwrap().get("B"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_edit_is_reported_as_conflict() {
        let server = Arc::new(FakeServer::default());
        server.ops.lock().push(remote_op("B", 1, "t1"));
        let store = Arc::new(InMemoryLogStore::new());
        store.append_with_clock_update(&remote_op("A", 1, "t1")).await.unwrap();
        store.append_with_clock_update(&remote_op("A", 2, "t2")).await.unwrap();

        let outcome = sync(server, store, Arc::default())
            .download_and_apply(&HydrationState::new(Duration::ZERO, 10))
            .await
            .unwrap();

        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].entity_id, "t1");
    }

    #[tokio::test]
    async fn test_upload_marks_synced_and_rejected() {
        let store = Arc::new(InMemoryLogStore::new());
        let good = remote_op("A", 1, "t1");
        let bad = remote_op("A", 2, "t2");
        store.append_with_clock_update(&good).await.unwrap();
        store.append_with_clock_update(&bad).await.unwrap();
        let server = Arc::new(FakeServer {
            reject_ids: vec![bad.id.clone()],
            ..FakeServer::default()
        });

        let outcome = sync(server.clone(), store.clone(), Arc::default()).upload_pending().await.unwrap();

        assert_eq!(outcome, UploadOutcome { uploaded: 2, accepted: 1, rejected: 1 });
        assert!(store.get_unsynced().await.unwrap().is_empty());
        assert_eq!(
            store.get_op_by_id(&bad.id).await.unwrap().unwrap().application_status,
            ApplicationStatus::Rejected
        );
    }
}
