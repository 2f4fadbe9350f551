// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persisting captured commands as causally clocked operations.
//!
//! Every local write runs "read clock, increment, validate, append" under the
//! [`OPERATION_LOG`] lock, so own-client counters and sequence numbers both
//! strictly increase.
//!
//! # Storage quota
//!
//! When an append fails because storage is full the writer takes the
//! [`QUOTA_EXCEEDED`] lock, runs one emergency compaction and retries the
//! append exactly once. A flag guards the retry path: a quota error raised
//! while the flag is set aborts instead of compacting again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::compaction::{CompactionTrigger, Compactor};
use crate::error::{OpLogError, Result};
use crate::host::{CachedClientId, UserNotice, UserNotifier};
use crate::operation::{EntityChange, MultiEntityPayload, Operation, PersistentCommand};
use crate::resilience::lock::{LockService, OPERATION_LOG, QUOTA_EXCEEDED};
use crate::storage::LogStore;
use crate::validation::validate_operation_payload;

/// Progress is logged every this many local writes.
const PROGRESS_LOG_INTERVAL: u64 = 50;

pub struct OperationWriter {
    store: Arc<dyn LogStore>,
    locks: Arc<LockService>,
    client_id: Arc<CachedClientId>,
    compactor: Arc<Compactor>,
    trigger: Arc<CompactionTrigger>,
    notifier: Arc<dyn UserNotifier>,
    core_sections: Vec<String>,
    handling_quota: AtomicBool,
    written: AtomicU64,
}

impl OperationWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn LogStore>,
        locks: Arc<LockService>,
        client_id: Arc<CachedClientId>,
        compactor: Arc<Compactor>,
        trigger: Arc<CompactionTrigger>,
        notifier: Arc<dyn UserNotifier>,
        core_sections: Vec<String>,
    ) -> Self {
        Self {
            store,
            locks,
            client_id,
            compactor,
            trigger,
            notifier,
            core_sections,
            handling_quota: AtomicBool::new(false),
            written: AtomicU64::new(0),
        }
    }

    /// Persist one command with the entity changes captured for it.
    pub async fn write_operation(
        &self,
        cmd: &PersistentCommand,
        entity_changes: Vec<EntityChange>,
    ) -> Result<Operation> {
        match self.persist(cmd, &entity_changes).await {
            Ok(op) => Ok(op),
            Err(e) if e.is_quota_exceeded() => self.handle_quota_exceeded(cmd, &entity_changes, e).await,
            Err(e @ OpLogError::InvalidOperation { .. }) => Err(e),
            Err(e) => {
                error!(action = %cmd.action_type, error = %e, "Failed to persist operation");
                crate::metrics::record_append_error("backend");
                self.notifier.notify(UserNotice::PersistFailed {
                    action_type: cmd.action_type.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Local writes since startup.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    fn build_operation(
        &self,
        cmd: &PersistentCommand,
        entity_changes: &[EntityChange],
        client_id: String,
        clock: crate::vector_clock::VectorClock,
    ) -> Operation {
        // Full-state payloads are stored bare so replay can publish them directly
        let payload = if cmd.op_type.is_full_state() {
            cmd.payload.clone()
        } else {
            MultiEntityPayload {
                action_payload: cmd.payload.clone(),
                entity_changes: entity_changes.to_vec(),
            }
            .into_value()
        };

        let mut op = Operation::new(
            cmd.action_type.clone(),
            cmd.op_type,
            cmd.entity_type.clone(),
            payload,
            client_id,
            clock,
        );
        // Multi-entity commands are keyed by their first id
        op.entity_id = cmd
            .entity_id
            .clone()
            .or_else(|| cmd.entity_ids.as_ref().and_then(|ids| ids.first().cloned()));
        op.entity_ids = cmd.entity_ids.clone();
        op
    }

    async fn persist(&self, cmd: &PersistentCommand, entity_changes: &[EntityChange]) -> Result<Operation> {
        let client_id = self.client_id.get().await?;

        let (op, seq) = {
            let _guard = self.locks.acquire(OPERATION_LOG).await;

            let mut clock = self.store.get_vector_clock().await?.unwrap_or_default();
            clock.increment(&client_id);
            let op = self.build_operation(cmd, entity_changes, client_id, clock);

            let validation = validate_operation_payload(&op, &self.core_sections);
            if !validation.is_valid() {
                error!(
                    action = %op.action_type,
                    op_type = %op.op_type,
                    errors = ?validation.errors,
                    "Refusing to persist invalid operation"
                );
                crate::metrics::record_append_error("invalid");
                self.notifier.notify(UserNotice::InvalidOperationPayload {
                    action_type: op.action_type.clone(),
                    errors: validation.errors.clone(),
                });
                return Err(OpLogError::InvalidOperation {
                    action_type: op.action_type,
                    errors: validation.errors,
                });
            }
            for warning in &validation.warnings {
                debug!(action = %op.action_type, warning = %warning, "Operation payload warning");
            }

            let seq = self.store.append_with_clock_update(&op).await?;
            (op, seq)
        };

        self.trigger.record_append().await;

        crate::metrics::record_operation_written("local");
        let written = self.written.fetch_add(1, Ordering::Relaxed) + 1;
        if written % PROGRESS_LOG_INTERVAL == 0 {
            info!(written, seq, "Persisted local operations");
        } else {
            debug!(seq, action = %op.action_type, clock = %op.vector_clock, "Persisted operation");
        }
        Ok(op)
    }

    async fn handle_quota_exceeded(
        &self,
        cmd: &PersistentCommand,
        entity_changes: &[EntityChange],
        original: OpLogError,
    ) -> Result<Operation> {
        crate::metrics::record_append_error("quota");

        if self.handling_quota.load(Ordering::Acquire) {
            error!(action = %cmd.action_type, "Storage quota exceeded while already recovering; aborting");
            self.notifier.notify(UserNotice::StorageQuotaExceeded);
            return Err(OpLogError::QuotaExceeded(original.to_string()));
        }

        let _quota_guard = self.locks.acquire(QUOTA_EXCEEDED).await;
        warn!(action = %cmd.action_type, error = %original, "Storage quota exceeded; running emergency compaction");

        self.handling_quota.store(true, Ordering::Release);
        let retried = if self.compactor.emergency_compact().await {
            self.persist(cmd, entity_changes).await
        } else {
            Err(original)
        };
        self.handling_quota.store(false, Ordering::Release);

        match retried {
            Ok(op) => {
                info!(action = %cmd.action_type, "Operation persisted after emergency compaction");
                crate::metrics::record_quota_recovery(true);
                self.notifier.notify(UserNotice::StorageRecoveredAfterCompaction);
                Ok(op)
            }
            Err(e @ OpLogError::InvalidOperation { .. }) => Err(e),
            Err(e) => {
                error!(action = %cmd.action_type, error = %e, "Storage still full after emergency compaction");
                crate::metrics::record_quota_recovery(false);
                self.notifier.notify(UserNotice::StorageQuotaExceeded);
                Err(OpLogError::QuotaExceeded(e.to_string()))
            }
        }
    }
}
