//! Contracts with the embedding application.
//!
//! The engine never owns application state. It reads the current assembled
//! state, publishes reconstructed state, and asks the application to apply
//! operations, all through [`AppStateHost`]. The other traits here supply
//! client identity, legacy data, the remote sync subsystem's clock view and a
//! channel for user-facing notices.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::error::{OpLogError, Result};
use crate::operation::Operation;
use crate::vector_clock::VectorClock;

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HostError(pub String);

/// Applying operations to application state failed.
#[derive(Debug, Clone, Error)]
#[error("failed to apply operation {}: {message}", op_id.as_deref().unwrap_or("<batch>"))]
pub struct ApplyError {
    /// First operation that could not be applied, if known
    pub op_id: Option<String>,
    pub message: String,
}

/// The application whose state the log reconstructs.
#[async_trait]
pub trait AppStateHost: Send + Sync {
    /// The current fully assembled state (used for snapshots).
    async fn current_state(&self) -> std::result::Result<Value, HostError>;

    /// Replace the whole application state.
    async fn publish_state(&self, state: Value) -> std::result::Result<(), HostError>;

    /// Apply operations in order as one atomic update. Observers must never see
    /// a partially applied batch.
    async fn apply_operations(&self, ops: &[Operation]) -> std::result::Result<(), ApplyError>;

    async fn apply_operation(&self, op: &Operation) -> std::result::Result<(), ApplyError> {
        self.apply_operations(std::slice::from_ref(op)).await
    }
}

#[async_trait]
pub trait ClientIdProvider: Send + Sync {
    async fn load_client_id(&self) -> std::result::Result<Option<String>, HostError>;
}

/// A fixed client id.
pub struct StaticClientId(pub String);

#[async_trait]
impl ClientIdProvider for StaticClientId {
    async fn load_client_id(&self) -> std::result::Result<Option<String>, HostError> {
        Ok(Some(self.0.clone()))
    }
}

/// Loads the client id once and caches it for the process lifetime.
pub struct CachedClientId {
    provider: Arc<dyn ClientIdProvider>,
    cell: OnceCell<String>,
}

impl CachedClientId {
    pub fn new(provider: Arc<dyn ClientIdProvider>) -> Self {
        Self {
            provider,
            cell: OnceCell::new(),
        }
    }

    pub async fn get(&self) -> Result<String> {
        self.cell
            .get_or_try_init(|| async {
                match self.provider.load_client_id().await {
                    Ok(Some(id)) if !id.is_empty() => Ok(id),
                    Ok(_) => Err(OpLogError::MissingClientId),
                    Err(e) => {
                        warn!(error = %e, "Client id provider failed");
                        Err(OpLogError::MissingClientId)
                    }
                }
            })
            .await
            .cloned()
    }
}

/// Data persisted outside the log: legacy model storage and local archives.
#[async_trait]
pub trait ModelDataSource: Send + Sync {
    /// Everything the source holds as one state-shaped object, or `None`.
    async fn load_all_models(&self) -> std::result::Result<Option<Value>, HostError>;
}

#[derive(Debug, Clone, Error)]
pub enum ClockSyncError {
    /// The remote sync subsystem has not initialised yet.
    #[error("remote sync not ready")]
    NotReady,
    #[error("{0}")]
    Failed(String),
}

/// The remote sync subsystem's view of vector clocks.
#[async_trait]
pub trait RemoteClockView: Send + Sync {
    /// Last clock the server reported, if any.
    async fn last_known_remote_clock(&self) -> std::result::Result<Option<VectorClock>, ClockSyncError>;

    /// Tell the remote sync subsystem about the local clock. Idempotent.
    async fn sync_vector_clock(&self, clock: &VectorClock) -> std::result::Result<(), ClockSyncError>;
}

/// Push `clock` to the remote clock view if there is one.
///
/// "Not ready" is expected early in startup and only logged.
pub async fn reconcile_remote_clock(view: Option<&dyn RemoteClockView>, clock: &VectorClock) {
    let Some(view) = view else {
        return;
    };
    match view.sync_vector_clock(clock).await {
        Ok(()) => debug!(clock = %clock, "Reconciled remote clock view"),
        Err(ClockSyncError::NotReady) => debug!("Remote sync not ready; skipping clock reconciliation"),
        Err(e) => warn!(error = %e, "Failed to reconcile remote clock view"),
    }
}

/// Something the user should see.
#[derive(Debug, Clone, PartialEq)]
pub enum UserNotice {
    InvalidOperationPayload { action_type: String, errors: Vec<String> },
    PersistFailed { action_type: String, error: String },
    StorageQuotaExceeded,
    StorageRecoveredAfterCompaction,
    CompactionFailed { consecutive_failures: u32 },
    StateRepaired { issues: Vec<String> },
    HydrationFailed { error: String },
}

impl UserNotice {
    /// Whether the notice should offer a reload action.
    #[must_use]
    pub fn offers_reload(&self) -> bool {
        matches!(
            self,
            Self::InvalidOperationPayload { .. }
                | Self::PersistFailed { .. }
                | Self::StorageQuotaExceeded
                | Self::HydrationFailed { .. }
        )
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::StorageRecoveredAfterCompaction | Self::StateRepaired { .. })
    }
}

impl std::fmt::Display for UserNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidOperationPayload { action_type, .. } => {
                write!(f, "Could not save change '{action_type}'. Please reload.")
            }
            Self::PersistFailed { action_type, .. } => {
                write!(f, "Saving '{action_type}' failed. Please reload.")
            }
            Self::StorageQuotaExceeded => {
                write!(f, "Storage is full. Free up space or reload to continue saving changes.")
            }
            Self::StorageRecoveredAfterCompaction => {
                write!(f, "Storage was full; old history was cleaned up and your change was saved.")
            }
            Self::CompactionFailed { consecutive_failures } => write!(
                f,
                "Cleaning up history failed {consecutive_failures} times in a row. Storage may fill up."
            ),
            Self::StateRepaired { issues } => {
                write!(f, "Repaired {} problem(s) in your data.", issues.len())
            }
            Self::HydrationFailed { .. } => {
                write!(f, "Your data could not be loaded. Please reload the application.")
            }
        }
    }
}

pub trait UserNotifier: Send + Sync {
    fn notify(&self, notice: UserNotice);
}

/// Logs notices instead of showing them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl UserNotifier for TracingNotifier {
    fn notify(&self, notice: UserNotice) {
        if notice.is_error() {
            error!(reload = notice.offers_reload(), notice = ?notice, "{notice}");
        } else {
            info!(notice = ?notice, "{notice}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        id: Option<String>,
    }

    #[async_trait]
    impl ClientIdProvider for CountingProvider {
        async fn load_client_id(&self) -> std::result::Result<Option<String>, HostError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.id.clone())
        }
    }

    #[tokio::test]
    async fn test_client_id_loaded_once() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            id: Some("client-a".into()),
        });
        let cached = CachedClientId::new(provider.clone());

        assert_eq!(cached.get().await.unwrap(), "client-a");
        assert_eq!(cached.get().await.unwrap(), "client-a");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_client_id() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            id: None,
        });
        let cached = CachedClientId::new(provider);
        let err = cached.get().await.unwrap_err();
        assert!(matches!(err, OpLogError::MissingClientId));
        assert_eq!(err.to_string(), "Failed to load clientId");
    }

    #[test]
    fn test_notice_reload_policy() {
        assert!(UserNotice::StorageQuotaExceeded.offers_reload());
        assert!(!UserNotice::StorageRecoveredAfterCompaction.offers_reload());
        assert!(!UserNotice::StorageRecoveredAfterCompaction.is_error());
        assert!(UserNotice::HydrationFailed { error: "x".into() }.offers_reload());
    }
}
