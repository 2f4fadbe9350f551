// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the operation log engine.
//!
//! | Error Type | Retryable | User-facing | Description |
//! |------------|-----------|-------------|-------------|
//! | `Storage` | busy only | No | Local store failure |
//! | `QuotaExceeded` | No | Yes | Out of space even after emergency compaction |
//! | `InvalidOperation` | No | Yes | Operation payload failed structural validation |
//! | `InvalidSnapshot` | No | No | Snapshot shape is broken; recovery takes over |
//! | `Migration` | No | No | A schema migration step failed (backup restored) |
//! | `MigrationRestoreFailed` | No | Yes | Migration failed and restoring the backup failed too |
//! | `UnsupportedSchemaVersion` | No | No | Data older than the supported floor |
//! | `MigrationRegistry` | No | No | Migration chain misconfigured (startup check) |
//! | `MissingClientId` | No | No | Client identity could not be loaded |
//! | `Host` | No | No | The application rejected a publish or apply |
//! | `Remote` | Yes | No | Remote endpoint failure |
//! | `CircuitOpen` | Yes | No | Remote circuit breaker is open |
//! | `HydrationFailed` | No | Yes | Hydration failed and recovery failed too |
//!
//! Use [`OpLogError::is_retryable()`] to decide on backoff and
//! [`OpLogError::requires_user_action()`] to decide whether to interrupt the user.

use thiserror::Error;

use crate::storage::StorageError;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, OpLogError>;

#[derive(Error, Debug)]
pub enum OpLogError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Storage is full and emergency compaction did not free enough space.
    ///
    /// The user has to free space or reload.
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The operation built from a command failed structural validation.
    ///
    /// Nothing was persisted. In-memory state already moved on, so it stays
    /// ahead of the log until the next full resync.
    #[error("Invalid operation payload for '{action_type}': {}", errors.join("; "))]
    InvalidOperation {
        action_type: String,
        errors: Vec<String>,
    },

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// A migration step failed. The pre-migration backup was restored.
    #[error("Migration from v{from} to v{to} failed: {message}")]
    Migration { from: u32, to: u32, message: String },

    /// A migration failed and restoring the backup failed as well.
    ///
    /// The snapshot slot may now hold a partially migrated state.
    #[error("Migration failed ({migration}) and backup restore failed ({restore})")]
    MigrationRestoreFailed { migration: String, restore: String },

    #[error("Schema version {version} is older than the minimum supported version {minimum}")]
    UnsupportedSchemaVersion { version: u32, minimum: u32 },

    #[error("Invalid migration registry: {0}")]
    MigrationRegistry(String),

    #[error("Failed to load clientId")]
    MissingClientId,

    #[error("Host application error: {0}")]
    Host(String),

    #[error("Remote endpoint error: {0}")]
    Remote(String),

    #[error("Remote circuit breaker open")]
    CircuitOpen,

    /// Hydration failed and recovery failed too. Only a reload helps.
    #[error("Hydration failed ({cause}); recovery failed ({recovery})")]
    HydrationFailed { cause: String, recovery: String },
}

impl OpLogError {
    /// Transient errors worth retrying with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::Remote(_) | Self::CircuitOpen => true,
            Self::QuotaExceeded(_)
            | Self::InvalidOperation { .. }
            | Self::InvalidSnapshot(_)
            | Self::Migration { .. }
            | Self::MigrationRestoreFailed { .. }
            | Self::UnsupportedSchemaVersion { .. }
            | Self::MigrationRegistry(_)
            | Self::MissingClientId
            | Self::Host(_)
            | Self::HydrationFailed { .. } => false,
        }
    }

    /// Errors the user must see and act on (reload or free space).
    #[must_use]
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded(_)
                | Self::InvalidOperation { .. }
                | Self::MigrationRestoreFailed { .. }
                | Self::HydrationFailed { .. }
        )
    }

    /// Only a reload helps.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HydrationFailed { .. })
    }

    /// Quota exhaustion, whether raised by the store or after recovery gave up.
    #[must_use]
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            Self::QuotaExceeded(_) => true,
            Self::Storage(e) => e.is_quota_exceeded(),
            _ => false,
        }
    }
}
