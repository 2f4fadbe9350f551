//! Hydration: rebuilding application state from snapshot and log at startup.
//!
//! This module contains the startup sequence, remote-sync hydration and the
//! recovery fallback.

use serde_json::Value;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{OpLogError, Result};
use crate::host::{reconcile_remote_clock, UserNotice};
use crate::operation::{
    ApplicationStatus, OpSource, OpType, Operation, OperationLogEntry, PersistentCommand,
    ACTION_REPAIR_STATE, ENTITY_TYPE_ALL,
};
use crate::recovery::{RecoveryOutcome, RetryReport};
use crate::resilience::OPERATION_LOG;
use crate::snapshot::{migrate_snapshot_with_backup, save_current_state_as_snapshot, snapshot_issues};

use super::{EngineState, HydrationReport, OpLogEngine};

impl OpLogEngine {
    /// Rebuild application state from the log. Call once at startup.
    ///
    /// Startup flow:
    /// 1. Resolve pending remote operations, reject corrupt ones, restore an
    ///    interrupted migration backup
    /// 2. Load the snapshot (none: full replay, or legacy import on an empty log)
    /// 3. Migrate it if its schema is behind (backup protected)
    /// 4. Validate its structure; broken snapshots go to recovery
    /// 5. Repair only if it was migrated or written by another schema
    /// 6. Restore its vector clock into the store
    /// 7. Publish its state
    /// 8. Replay the tail (or load a trailing full-state operation directly)
    /// 9. Reconcile the remote clock view and retry failed remote operations
    ///
    /// Any error runs disaster recovery. If that fails too the engine enters
    /// [`EngineState::Failed`] and the user is told to reload.
    #[tracing::instrument(skip(self))]
    pub async fn hydrate_store(&self) -> Result<HydrationReport> {
        let started = Instant::now();
        info!("Hydrating state from operation log");
        self.set_state(EngineState::Hydrating);

        let mut report = match self.run_hydration().await {
            Ok(report) => report,
            Err(cause) => {
                error!(error = %cause, "Hydration failed; attempting recovery");
                self.set_state(EngineState::Recovering);
                match self.recovery.attempt_recovery().await {
                    Ok(outcome) => {
                        info!(?outcome, "Recovered after failed hydration");
                        HydrationReport {
                            recovered: true,
                            fresh_install: outcome == RecoveryOutcome::NoUsableData,
                            ..HydrationReport::default()
                        }
                    }
                    Err(recovery) => {
                        error!(error = %recovery, "Recovery failed");
                        self.set_state(EngineState::Failed);
                        let err = OpLogError::HydrationFailed {
                            cause: cause.to_string(),
                            recovery: recovery.to_string(),
                        };
                        self.notifier.notify(UserNotice::HydrationFailed {
                            error: err.to_string(),
                        });
                        crate::metrics::record_hydration("failed", started.elapsed());
                        return Err(err);
                    }
                }
            }
        };

        self.set_state(EngineState::Ready);
        report.drained = self.drain_deferred().await;

        let outcome = if report.recovered { "recovered" } else { "success" };
        crate::metrics::record_hydration(outcome, started.elapsed());
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            snapshot = report.snapshot_loaded,
            replayed = report.replayed,
            full_state = report.loaded_full_state_op,
            "Hydration complete"
        );
        Ok(report)
    }

    async fn run_hydration(&self) -> Result<HydrationReport> {
        let mut report = HydrationReport::default();

        // ========== PHASE 1: Log hygiene ==========
        self.recovery.recover_pending_remote_ops().await?;
        self.recovery.cleanup_corrupt_ops().await?;
        if self.store.has_state_cache_backup().await? {
            warn!("Found a snapshot backup from an interrupted migration; restoring it");
            self.store.restore_state_cache_from_backup().await?;
        }

        // ========== PHASE 2: Load snapshot ==========
        let Some(mut snapshot) = self.store.load_state_cache().await? else {
            self.hydrate_without_snapshot(&mut report).await?;
            if !report.fresh_install && !report.recovered {
                self.finish_hydration().await;
            }
            return Ok(report);
        };
        report.snapshot_loaded = true;
        debug!(
            last_applied_op_seq = snapshot.last_applied_op_seq,
            schema_version = snapshot.schema_version,
            "Loaded snapshot"
        );

        // ========== PHASE 3: Migrate snapshot ==========
        if self.migrator.needs_migration(&snapshot) {
            snapshot = migrate_snapshot_with_backup(self.store.as_ref(), &self.migrator, snapshot).await?;
            report.migrated = true;
        }

        // ========== PHASE 4: Validate snapshot structure ==========
        let issues = snapshot_issues(&snapshot, &self.config.core_state_sections);
        if !issues.is_empty() {
            return Err(OpLogError::InvalidSnapshot(issues.join("; ")));
        }

        // ========== PHASE 5: Repair unless trusted ==========
        // A snapshot at the current version was validated when it was saved
        let trusted = !report.migrated && snapshot.schema_version == self.migrator.current_version();
        let state = if trusted {
            snapshot.state
        } else {
            self.validate_and_repair(snapshot.state, "snapshot").await
        };

        // ========== PHASE 6: Restore vector clock ==========
        {
            let _guard = self.locks.acquire(OPERATION_LOG).await;
            let mut clock = self.store.get_vector_clock().await?.unwrap_or_default();
            clock.merge(&snapshot.vector_clock);
            self.store.set_vector_clock(&clock).await?;
        }

        // ========== PHASE 7: Publish snapshot state ==========
        self.publish(state).await?;

        // ========== PHASE 8: Replay tail ==========
        let tail = self.store.get_ops_after_seq(snapshot.last_applied_op_seq).await?;
        self.replay_tail(tail, false, &mut report).await?;

        // ========== PHASE 9: Reconcile and retry ==========
        self.finish_hydration().await;
        Ok(report)
    }

    /// No snapshot: replay the whole log, or on an empty log import legacy data once.
    async fn hydrate_without_snapshot(&self, report: &mut HydrationReport) -> Result<()> {
        let log = self.store.get_ops_after_seq(0).await?;
        if log.is_empty() {
            if self.recovery.migrate_legacy_if_present().await? {
                report.recovered = true;
            } else {
                info!("Fresh install; nothing to hydrate");
                report.fresh_install = true;
            }
            return Ok(());
        }

        info!(entries = log.len(), "No snapshot; replaying the full log");
        self.replay_tail(log, true, report).await
    }

    /// Replay `tail` on top of the published state.
    ///
    /// Remote entries that never applied (failed, rejected) are skipped; failed
    /// ones are retried separately.
    async fn replay_tail(
        &self,
        tail: Vec<OperationLogEntry>,
        always_snapshot: bool,
        report: &mut HydrationReport,
    ) -> Result<()> {
        let ops: Vec<Operation> = tail
            .into_iter()
            .filter(|e| e.source == OpSource::Local || e.application_status == ApplicationStatus::Applied)
            .map(|e| e.op)
            .collect();
        let Some(last) = ops.last() else {
            return Ok(());
        };

        if last.is_full_state() {
            return self.load_full_state_op(last.clone(), report).await;
        }

        let total = ops.len();
        let (ops, dropped) = self.migrator.migrate_operations(ops)?;
        report.dropped = dropped;
        if dropped > 0 {
            info!(dropped, "Migration retired tail operations");
        }
        if ops.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        {
            // One bulk update; observers never see a partially replayed state
            let _window = self.hydration.applying_guard();
            self.host
                .apply_operations(&ops)
                .await
                .map_err(|e| OpLogError::Host(e.to_string()))?;
        }
        {
            let _guard = self.locks.acquire(OPERATION_LOG).await;
            self.store.merge_clocks(&ops).await?;
        }
        report.replayed = ops.len();
        crate::metrics::record_replay(ops.len(), dropped, started.elapsed());
        debug!(replayed = ops.len(), total, "Replayed tail operations");

        // Validate before snapshotting so the snapshot holds the repaired state
        let current = self.host.current_state().await.map_err(|e| OpLogError::Host(e.0))?;
        let checked = self.validate_and_repair(current.clone(), "replayed state").await;
        if checked != current {
            self.publish(checked).await?;
        }

        if always_snapshot || report.replayed > self.config.snapshot_after_replay_threshold {
            report.snapshot_saved = save_current_state_as_snapshot(self.store.as_ref(), self.host.as_ref()).await;
        }
        Ok(())
    }

    /// The tail ends in a full-state operation: adopt its state directly.
    async fn load_full_state_op(&self, op: Operation, report: &mut HydrationReport) -> Result<()> {
        info!(op_type = %op.op_type, op_id = %op.id, "Tail ends in a full-state operation; loading it directly");

        // Merge before publishing: anything authored during publish must see this clock
        {
            let _guard = self.locks.acquire(OPERATION_LOG).await;
            self.store.merge_clocks(std::slice::from_ref(&op)).await?;
        }

        let state = op
            .full_state()
            .cloned()
            .ok_or_else(|| OpLogError::InvalidSnapshot(format!("full-state operation {} has no state", op.id)))?;
        let state = self.validate_and_repair(state, "full-state operation").await;
        self.publish(state).await?;

        report.loaded_full_state_op = true;
        report.snapshot_saved = save_current_state_as_snapshot(self.store.as_ref(), self.host.as_ref()).await;
        Ok(())
    }

    async fn finish_hydration(&self) {
        match self.store.get_vector_clock().await {
            Ok(Some(clock)) => reconcile_remote_clock(self.remote_clock.as_deref(), &clock).await,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not read vector clock for remote reconciliation"),
        }

        if let Err(e) = self.retry_failed_ops_inner().await {
            warn!(error = %e, "Retrying failed remote operations after hydration failed");
        }
    }

    pub(super) async fn retry_failed_ops_inner(&self) -> Result<RetryReport> {
        self.recovery.retry_failed_remote_ops(&self.hydration).await
    }

    async fn publish(&self, state: Value) -> Result<()> {
        self.host.publish_state(state).await.map_err(|e| OpLogError::Host(e.0))
    }

    /// Validate `state`; return the repaired version if the validator fixed it.
    pub(super) async fn validate_and_repair(&self, state: Value, context: &str) -> Value {
        let check = self.validator.validate_and_repair(&state);
        if check.is_valid() {
            return state;
        }
        warn!(context, issues = ?check.issues, "State failed validation");
        let Some(repaired) = check.repaired else {
            return state;
        };

        self.notifier.notify(UserNotice::StateRepaired {
            issues: check.issues,
        });
        if self.config.emit_repair_operations {
            let cmd = PersistentCommand::new(ACTION_REPAIR_STATE, OpType::Repair, ENTITY_TYPE_ALL, repaired.clone());
            if let Err(e) = self.writer.write_operation(&cmd, Vec::new()).await {
                warn!(error = %e, "Failed to persist repair operation");
            }
        }
        repaired
    }

    /// Merge a downloaded remote state and persist it as a `SyncImport`.
    ///
    /// Commands deferred while the state was published are persisted afterwards.
    #[tracing::instrument(skip(self, remote_data))]
    pub async fn hydrate_from_remote_sync(&self, remote_data: Option<Value>) -> Result<Operation> {
        let op = self
            .sync_hydrator
            .hydrate_from_remote_sync(remote_data, &self.hydration)
            .await?;
        self.drain_deferred().await;
        Ok(op)
    }

    /// Retry remote operations that failed to apply earlier.
    pub async fn retry_failed_remote_ops(&self) -> Result<RetryReport> {
        let report = self.retry_failed_ops_inner().await?;
        self.drain_deferred().await;
        Ok(report)
    }
}
