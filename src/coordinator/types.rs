//! Public types for the engine facade.

use crate::operation::Operation;
use crate::remote::{DownloadOutcome, UploadOutcome};

/// Engine lifecycle state.
///
/// Use [`super::OpLogEngine::state()`] to check the current state or
/// [`super::OpLogEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, not hydrated yet
    Created,
    /// Reconstructing state from snapshot and log
    Hydrating,
    /// Hydration failed; importing legacy data
    Recovering,
    /// State reconstructed; commands are persisted
    Ready,
    /// Hydration and recovery both failed; only a reload helps
    Failed,
}

impl EngineState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Hydrating => "Hydrating",
            Self::Recovering => "Recovering",
            Self::Ready => "Ready",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a call to [`super::OpLogEngine::hydrate_store()`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HydrationReport {
    pub snapshot_loaded: bool,
    /// The snapshot was migrated to the current schema
    pub migrated: bool,
    /// Tail operations replayed in the bulk apply
    pub replayed: usize,
    /// Tail operations retired by migration
    pub dropped: usize,
    /// The tail ended in a full-state operation that was loaded directly
    pub loaded_full_state_op: bool,
    pub snapshot_saved: bool,
    /// Hydration failed and recovery ran instead
    pub recovered: bool,
    /// Nothing to hydrate: no snapshot, no log, no legacy data
    pub fresh_install: bool,
    /// Deferred commands persisted at the end
    pub drained: usize,
}

/// Result of dispatching one command.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Persisted(Operation),
    /// Buffered until remote application ends
    Deferred,
    /// Remote command; nothing to persist
    Skipped,
}

/// Result of one [`super::OpLogEngine::sync_with_remote()`] round.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub download: DownloadOutcome,
    /// Deferred commands persisted between download and upload
    pub drained: usize,
    pub upload: UploadOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Ready), "Ready");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_default_report_is_empty() {
        let report = HydrationReport::default();
        assert!(!report.snapshot_loaded && !report.recovered);
        assert_eq!(report.replayed, 0);
    }
}
