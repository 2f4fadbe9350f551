// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Disaster recovery and log hygiene.
//!
//! - **Legacy import**: when the log cannot produce a state, usable data from
//!   a [`ModelDataSource`] is wrapped in one `Batch` operation, appended,
//!   snapshotted and published.
//! - **Pending remote operations** left behind by a crash mid-apply are either
//!   rejected (older than the expiry window) or marked applied so replay
//!   picks them up.
//! - **Corrupt operations**: unsynced operations without a usable entity id
//!   are rejected before they reach the server.
//! - **Failed remote operations** are retried after hydration.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::OpLogConfig;
use crate::error::{OpLogError, Result};
use crate::host::{reconcile_remote_clock, AppStateHost, CachedClientId, ModelDataSource, RemoteClockView};
use crate::hydration_state::HydrationState;
use crate::operation::{
    now_millis, OpType, Operation, StateCache, ACTION_RECOVERY_DATA_IMPORT, ENTITY_TYPE_RECOVERY,
};
use crate::resilience::lock::{LockService, OPERATION_LOG};
use crate::storage::LogStore;

/// Entity id carried by recovery imports (they cover every entity).
const RECOVERY_ENTITY_ID: &str = "*";

/// Whether a state holds anything worth importing.
///
/// Usable means: any task id, a project beyond the default one, or a
/// non-empty global configuration.
pub fn has_usable_data(state: &Value) -> bool {
    let ids_len = |pointer: &str| state.pointer(pointer).and_then(Value::as_array).map_or(0, Vec::len);

    ids_len("/task/ids") > 0
        || ids_len("/project/ids") > 1
        || state
            .get("globalConfig")
            .and_then(Value::as_object)
            .is_some_and(|c| !c.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Legacy data was imported as the operation at `seq`
    Recovered { seq: u64 },
    /// Nothing usable was found; the application starts empty
    NoUsableData,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingRecovery {
    pub applied: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct RecoveryService {
    store: Arc<dyn LogStore>,
    host: Arc<dyn AppStateHost>,
    locks: Arc<LockService>,
    client_id: Arc<CachedClientId>,
    legacy: Option<Arc<dyn ModelDataSource>>,
    remote_clock: Option<Arc<dyn RemoteClockView>>,
    pending_op_expiry_ms: u64,
    max_retry_attempts: u32,
}

impl RecoveryService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn LogStore>,
        host: Arc<dyn AppStateHost>,
        locks: Arc<LockService>,
        client_id: Arc<CachedClientId>,
        legacy: Option<Arc<dyn ModelDataSource>>,
        remote_clock: Option<Arc<dyn RemoteClockView>>,
        config: &OpLogConfig,
    ) -> Self {
        Self {
            store,
            host,
            locks,
            client_id,
            legacy,
            remote_clock,
            pending_op_expiry_ms: config.pending_op_expiry_ms,
            max_retry_attempts: config.max_conflict_retry_attempts,
        }
    }

    /// Last resort after hydration failed: import legacy data if there is any.
    pub async fn attempt_recovery(&self) -> Result<RecoveryOutcome> {
        warn!("Attempting disaster recovery from legacy data");
        match self.load_legacy().await? {
            Some(state) if has_usable_data(&state) => {
                let seq = self.recover_from_legacy_data(state).await?;
                Ok(RecoveryOutcome::Recovered { seq })
            }
            _ => {
                warn!("No usable legacy data; starting with empty state. Resync or restore a backup.");
                crate::metrics::record_recovery("empty");
                Ok(RecoveryOutcome::NoUsableData)
            }
        }
    }

    /// Fresh-install path: import legacy data once if present. Returns whether it did.
    pub async fn migrate_legacy_if_present(&self) -> Result<bool> {
        match self.load_legacy().await? {
            Some(state) if has_usable_data(&state) => {
                info!("Found legacy data on a fresh log; importing");
                self.recover_from_legacy_data(state).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn load_legacy(&self) -> Result<Option<Value>> {
        let Some(source) = &self.legacy else {
            return Ok(None);
        };
        source.load_all_models().await.map_err(|e| OpLogError::Host(e.0))
    }

    /// Append `state` as one recovery operation, snapshot it and publish it.
    pub async fn recover_from_legacy_data(&self, state: Value) -> Result<u64> {
        let client_id = self.client_id.get().await?;

        let (op, seq) = {
            let _guard = self.locks.acquire(OPERATION_LOG).await;
            let mut clock = self.store.get_vector_clock().await?.unwrap_or_default();
            clock.increment(&client_id);
            let op = Operation::new(
                ACTION_RECOVERY_DATA_IMPORT,
                OpType::Batch,
                ENTITY_TYPE_RECOVERY,
                state.clone(),
                client_id,
                clock,
            )
            .with_entity_id(RECOVERY_ENTITY_ID);
            let seq = self.store.append_with_clock_update(&op).await?;
            self.store
                .save_state_cache(&StateCache::new(state.clone(), seq, op.vector_clock.clone()))
                .await?;
            (op, seq)
        };

        self.host
            .publish_state(state)
            .await
            .map_err(|e| OpLogError::Host(e.0))?;
        reconcile_remote_clock(self.remote_clock.as_deref(), &op.vector_clock).await;

        info!(seq, op_id = %op.id, "Recovered state from legacy data");
        crate::metrics::record_recovery("legacy_import");
        Ok(seq)
    }

    /// Resolve remote operations a crash left in `pending`.
    pub async fn recover_pending_remote_ops(&self) -> Result<PendingRecovery> {
        let pending = self.store.get_pending_remote_ops().await?;
        if pending.is_empty() {
            return Ok(PendingRecovery::default());
        }

        let cutoff = now_millis() - self.pending_op_expiry_ms as i64;
        let (expired, fresh): (Vec<_>, Vec<_>) = pending.into_iter().partition(|e| e.applied_at < cutoff);

        let expired_ids: Vec<String> = expired.iter().map(|e| e.op.id.clone()).collect();
        let fresh_seqs: Vec<u64> = fresh.iter().map(|e| e.seq).collect();

        if !expired_ids.is_empty() {
            warn!(count = expired_ids.len(), "Rejecting stale pending remote operations");
            self.store.mark_rejected(&expired_ids).await?;
        }
        if !fresh_seqs.is_empty() {
            info!(count = fresh_seqs.len(), "Marking interrupted remote operations applied for replay");
            self.store.mark_applied(&fresh_seqs).await?;
        }
        crate::metrics::record_recovery("pending_ops");

        Ok(PendingRecovery {
            applied: fresh_seqs.len(),
            rejected: expired_ids.len(),
        })
    }

    /// Reject unsynced operations that lack a usable entity id.
    pub async fn cleanup_corrupt_ops(&self) -> Result<usize> {
        let corrupt: Vec<String> = self
            .store
            .get_unsynced()
            .await?
            .into_iter()
            .filter(|e| !e.op.targets_all() && !e.op.has_valid_entity_id())
            .map(|e| e.op.id)
            .collect();

        if corrupt.is_empty() {
            return Ok(0);
        }
        warn!(count = corrupt.len(), ids = ?corrupt, "Rejecting operations without an entity id");
        self.store.mark_rejected(&corrupt).await?;
        crate::metrics::record_recovery("corrupt_ops");
        Ok(corrupt.len())
    }

    /// Apply remote operations that failed earlier, one at a time.
    pub async fn retry_failed_remote_ops(&self, hydration: &HydrationState) -> Result<RetryReport> {
        let failed = self.store.get_failed_remote_ops().await?;
        if failed.is_empty() {
            return Ok(RetryReport::default());
        }
        info!(count = failed.len(), "Retrying failed remote operations");

        let mut report = RetryReport {
            attempted: failed.len(),
            ..RetryReport::default()
        };
        let mut applied = Vec::new();
        {
            let _window = hydration.applying_guard();
            for entry in failed {
                match self.host.apply_operation(&entry.op).await {
                    Ok(()) => {
                        self.store.mark_applied(&[entry.seq]).await?;
                        applied.push(entry.op);
                        report.succeeded += 1;
                    }
                    Err(e) => {
                        debug!(op_id = %entry.op.id, retries = entry.retry_count, error = %e, "Remote operation still failing");
                        self.store
                            .mark_failed(&[entry.op.id.clone()], Some(self.max_retry_attempts))
                            .await?;
                        report.failed += 1;
                    }
                }
            }
        }

        if !applied.is_empty() {
            let _guard = self.locks.acquire(OPERATION_LOG).await;
            self.store.merge_clocks(&applied).await?;
        }
        if report.failed > 0 {
            error!(failed = report.failed, "Some remote operations still cannot be applied");
        }
        Ok(report)
    }
}
