//! Configuration for the operation log engine.
//!
//! # Example
//!
//! ```
//! use oplog_engine::OpLogConfig;
//!
//! // Minimal config (uses defaults)
//! let config = OpLogConfig::default();
//! assert_eq!(config.compaction_threshold, 500);
//!
//! // Tuned config
//! let config = OpLogConfig {
//!     db_path: Some("/var/lib/app/oplog.db".into()),
//!     compaction_threshold: 200,
//!     post_sync_cooldown_ms: 500,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;
use std::time::Duration;

const HOUR_MS: u64 = 60 * 60 * 1000;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Engine configuration. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct OpLogConfig {
    /// SQLite file backing the log (None = caller supplies a store)
    #[serde(default)]
    pub db_path: Option<String>,

    /// Local appends between automatic compactions
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: u64,

    /// Synced entries younger than this survive regular compaction
    #[serde(default = "default_compaction_retention_ms")]
    pub compaction_retention_ms: u64,

    /// Shorter retention used when storage is full
    #[serde(default = "default_emergency_retention_ms")]
    pub emergency_retention_ms: u64,

    /// Consecutive failed compactions before the user is told
    #[serde(default = "default_max_compaction_failures")]
    pub max_compaction_failures: u32,

    /// Compactions slower than this are logged
    #[serde(default = "default_slow_compaction_ms")]
    pub slow_compaction_ms: u64,

    /// Remote operations stuck in `pending` longer than this are rejected at startup
    #[serde(default = "default_pending_op_expiry_ms")]
    pub pending_op_expiry_ms: u64,

    /// Failed remote operations are rejected after this many retries
    #[serde(default = "default_max_conflict_retry_attempts")]
    pub max_conflict_retry_attempts: u32,

    /// Sync window stays open this long after remote application ends
    #[serde(default = "default_post_sync_cooldown_ms")]
    pub post_sync_cooldown_ms: u64,

    /// Deferred command buffer size that triggers a warning
    #[serde(default = "default_deferred_warn_threshold")]
    pub deferred_warn_threshold: usize,

    /// Capture queue size that triggers a warning
    #[serde(default = "default_capture_queue_warn_threshold")]
    pub capture_queue_warn_threshold: usize,

    /// Replaying more tail operations than this saves a fresh snapshot
    #[serde(default = "default_snapshot_after_replay_threshold")]
    pub snapshot_after_replay_threshold: usize,

    /// Persist a `Repair` operation when hydration repairs state
    #[serde(default)]
    pub emit_repair_operations: bool,

    /// Top-level state sections a valid snapshot must contain
    #[serde(default = "default_core_state_sections")]
    pub core_state_sections: Vec<String>,

    /// JSON pointers nulled in remote payloads before they are merged
    #[serde(default = "default_local_only_fields")]
    pub local_only_fields: Vec<String>,
}

fn default_compaction_threshold() -> u64 { 500 }
fn default_compaction_retention_ms() -> u64 { 7 * DAY_MS }
fn default_emergency_retention_ms() -> u64 { DAY_MS }
fn default_max_compaction_failures() -> u32 { 3 }
fn default_slow_compaction_ms() -> u64 { 3000 }
fn default_pending_op_expiry_ms() -> u64 { 24 * HOUR_MS }
fn default_max_conflict_retry_attempts() -> u32 { 5 }
fn default_post_sync_cooldown_ms() -> u64 { 2000 }
fn default_deferred_warn_threshold() -> usize { 10 }
fn default_capture_queue_warn_threshold() -> usize { 50 }
fn default_snapshot_after_replay_threshold() -> usize { 10 }
fn default_core_state_sections() -> Vec<String> {
    vec!["task".into(), "project".into(), "globalConfig".into()]
}
fn default_local_only_fields() -> Vec<String> {
    vec!["/globalConfig/sync/syncProvider".into()]
}

impl Default for OpLogConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            compaction_threshold: default_compaction_threshold(),
            compaction_retention_ms: default_compaction_retention_ms(),
            emergency_retention_ms: default_emergency_retention_ms(),
            max_compaction_failures: default_max_compaction_failures(),
            slow_compaction_ms: default_slow_compaction_ms(),
            pending_op_expiry_ms: default_pending_op_expiry_ms(),
            max_conflict_retry_attempts: default_max_conflict_retry_attempts(),
            post_sync_cooldown_ms: default_post_sync_cooldown_ms(),
            deferred_warn_threshold: default_deferred_warn_threshold(),
            capture_queue_warn_threshold: default_capture_queue_warn_threshold(),
            snapshot_after_replay_threshold: default_snapshot_after_replay_threshold(),
            emit_repair_operations: false,
            core_state_sections: default_core_state_sections(),
            local_only_fields: default_local_only_fields(),
        }
    }
}

impl OpLogConfig {
    #[must_use]
    pub fn post_sync_cooldown(&self) -> Duration {
        Duration::from_millis(self.post_sync_cooldown_ms)
    }

    #[must_use]
    pub fn slow_compaction(&self) -> Duration {
        Duration::from_millis(self.slow_compaction_ms)
    }
}
