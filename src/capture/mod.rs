//! Turning dispatched commands into queued entity changes.
//!
//! Capture runs synchronously with the dispatch, before any `.await`, so the
//! queue order is the dispatch order. Persisting happens afterwards in
//! [`writer::OperationWriter`], which dequeues one slot per command.
//!
//! ```text
//! command ─► capture_command ─┬─ remote ─────────────► Skipped
//!                             ├─ applying remote ops ► deferred buffer
//!                             ├─ buffer not drained ─► deferred buffer
//!                             └─ otherwise ──────────► capture queue ─► writer
//! ```

pub mod queue;
pub mod writer;

use serde_json::Value;
use tracing::debug;

use crate::hydration_state::{CapturedCommand, HydrationState};
use crate::operation::PersistentCommand;

pub use queue::{section_delta_extractor, ChangeExtractor, ChangeExtractors, OperationCaptureQueue};
pub use writer::OperationWriter;

/// Collaborators a capture needs, passed in explicitly.
#[derive(Clone, Copy)]
pub struct CaptureContext<'a> {
    pub hydration: &'a HydrationState,
    pub queue: &'a OperationCaptureQueue,
    pub extractors: &'a ChangeExtractors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Queued for the writer
    Enqueued,
    /// Buffered until remote application ends
    Deferred,
    /// Remote command, already persisted by the merge path
    Skipped,
}

/// Capture one persistent command given the state before and after it ran.
pub fn capture_command(
    ctx: &CaptureContext<'_>,
    cmd: &PersistentCommand,
    before: &Value,
    after: &Value,
) -> CaptureOutcome {
    if cmd.is_remote {
        return CaptureOutcome::Skipped;
    }

    let changes = ctx.extractors.extract(cmd, before, after);

    match ctx.hydration.defer_if_blocked(CapturedCommand::new(cmd.clone(), changes)) {
        None => {
            debug!(action = %cmd.action_type, "Deferring command behind remote application");
            CaptureOutcome::Deferred
        }
        Some(captured) => {
            ctx.queue.enqueue(captured.entity_changes);
            CaptureOutcome::Enqueued
        }
    }
}
