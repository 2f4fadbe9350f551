//! Command dispatch, the sync window and remote exchange.

use serde_json::Value;
use tracing::{error, info, instrument};

use crate::capture::{capture_command, CaptureContext, CaptureOutcome};
use crate::error::{OpLogError, Result};
use crate::operation::PersistentCommand;

use super::{DispatchOutcome, OpLogEngine, SyncReport};

impl OpLogEngine {
    /// Capture and persist one command.
    ///
    /// `before` and `after` are the application state around the command; they
    /// feed the registered entity-change extractors.
    ///
    /// While remote operations are being applied the command is buffered and
    /// persisted, with a fresh clock, once application finishes.
    pub async fn dispatch(
        &self,
        cmd: PersistentCommand,
        before: &Value,
        after: &Value,
    ) -> Result<DispatchOutcome> {
        let changes = {
            let _gate = self.dispatch_gate.lock();
            let ctx = CaptureContext {
                hydration: &self.hydration,
                queue: &self.queue,
                extractors: &self.extractors,
            };
            match capture_command(&ctx, &cmd, before, after) {
                CaptureOutcome::Skipped => return Ok(DispatchOutcome::Skipped),
                CaptureOutcome::Deferred => return Ok(DispatchOutcome::Deferred),
                CaptureOutcome::Enqueued => self.queue.dequeue().unwrap_or_default(),
            }
        };

        let op = self.writer.write_operation(&cmd, changes).await?;
        Ok(DispatchOutcome::Persisted(op))
    }

    /// Open the sync window for an external remote-application pass.
    pub fn start_applying_remote_ops(&self) {
        self.hydration.start_applying_remote_ops();
    }

    /// Close the window and persist the commands buffered meanwhile. Returns how many were persisted.
    pub async fn finish_applying_remote_ops(&self) -> usize {
        self.hydration.end_applying_remote_ops();
        self.drain_deferred().await
    }

    /// Persist buffered commands in arrival order with fresh clocks.
    ///
    /// A failing command is logged and skipped; the rest still go through.
    pub(super) async fn drain_deferred(&self) -> usize {
        let pending = self.hydration.deferred_len();
        if pending == 0 {
            return 0;
        }
        info!(count = pending, "Persisting commands deferred during remote application");

        let mut persisted = 0;
        while let Some(captured) = self.hydration.next_deferred() {
            match self
                .writer
                .write_operation(&captured.command, captured.entity_changes)
                .await
            {
                Ok(_) => persisted += 1,
                Err(e) => error!(
                    action = %captured.command.action_type,
                    error = %e,
                    "Failed to persist deferred command"
                ),
            }
        }
        persisted
    }

    /// Download and apply remote operations, persist deferred commands, then upload.
    #[instrument(skip(self))]
    pub async fn sync_with_remote(&self) -> Result<SyncReport> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| OpLogError::Remote("no remote endpoint configured".into()))?;

        let download = remote.download_and_apply(&self.hydration).await?;
        let drained = self.drain_deferred().await;
        let upload = remote.upload_pending().await?;

        info!(
            received = download.received,
            conflicts = download.conflicts.len(),
            drained,
            uploaded = upload.uploaded,
            "Sync round complete"
        );
        Ok(SyncReport {
            download,
            drained,
            upload,
        })
    }

    /// Push the current snapshot to the server. Returns false when there is none.
    pub async fn upload_snapshot(&self) -> Result<bool> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| OpLogError::Remote("no remote endpoint configured".into()))?;
        remote.upload_snapshot().await
    }
}
