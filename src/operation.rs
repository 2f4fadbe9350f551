//! Operation data model.
//!
//! An [`Operation`] is an immutable record of one causal state change. The
//! log stores each one wrapped in an [`OperationLogEntry`] carrying its local
//! sequence number and application status. A [`StateCache`] is a snapshot of
//! the application state after replaying the log up to a given sequence.
//!
//! # Example
//!
//! ```
//! use oplog_engine::{Operation, OpType, VectorClock};
//! use serde_json::json;
//!
//! let mut clock = VectorClock::new();
//! clock.increment("client-a");
//!
//! let op = Operation::new(
//!     "[Task] Add task",
//!     OpType::Create,
//!     "TASK",
//!     json!({"task": {"id": "t1", "title": "Write docs"}}),
//!     "client-a",
//!     clock,
//! )
//! .with_entity_id("t1");
//!
//! assert!(op.has_valid_entity_id());
//! assert!(!op.is_full_state());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::CURRENT_SCHEMA_VERSION;
use crate::vector_clock::VectorClock;

/// Entity type marking an operation that covers the whole application state.
pub const ENTITY_TYPE_ALL: &str = "ALL";

/// Entity type of the operation synthesized by disaster recovery.
pub const ENTITY_TYPE_RECOVERY: &str = "RECOVERY";

/// Action type of a remote full-state import.
pub const ACTION_LOAD_ALL_DATA: &str = "[SP_ALL] Load(import) all data";

/// Action type of the disaster recovery import.
pub const ACTION_RECOVERY_DATA_IMPORT: &str = "[Recovery] Data import";

/// Action type of a state repair.
pub const ACTION_REPAIR_STATE: &str = "[Repair] Auto-repair state";

/// Key under which legacy full-state payloads nest the application state.
const APP_DATA_COMPLETE_KEY: &str = "appDataComplete";

/// Current wall-clock time in epoch millis.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Time-sortable unique operation id (UUIDv7).
pub fn new_operation_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Kind of state change an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    #[serde(rename = "CRT")]
    Create,
    #[serde(rename = "UPD")]
    Update,
    #[serde(rename = "DEL")]
    Delete,
    #[serde(rename = "BATCH")]
    Batch,
    #[serde(rename = "SYNC_IMPORT")]
    SyncImport,
    #[serde(rename = "BACKUP_IMPORT")]
    BackupImport,
    #[serde(rename = "REPAIR")]
    Repair,
}

impl OpType {
    /// Full-state operations carry an entire application state as payload.
    #[must_use]
    pub fn is_full_state(self) -> bool {
        matches!(self, Self::SyncImport | Self::BackupImport | Self::Repair)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CRT",
            Self::Update => "UPD",
            Self::Delete => "DEL",
            Self::Batch => "BATCH",
            Self::SyncImport => "SYNC_IMPORT",
            Self::BackupImport => "BACKUP_IMPORT",
            Self::Repair => "REPAIR",
        }
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, causally clocked state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Time-sortable unique id
    pub id: String,
    /// Name of the command that produced this operation
    pub action_type: String,
    pub op_type: OpType,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_ids: Option<Vec<String>>,
    pub payload: Value,
    /// Client that authored the operation
    pub client_id: String,
    /// Causal history at authoring time
    pub vector_clock: VectorClock,
    /// Wall-clock creation time (epoch millis). Diagnostics only.
    pub timestamp: i64,
    pub schema_version: u32,
}

impl Operation {
    /// Create an operation at the current schema version with a fresh id.
    pub fn new(
        action_type: impl Into<String>,
        op_type: OpType,
        entity_type: impl Into<String>,
        payload: Value,
        client_id: impl Into<String>,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            id: new_operation_id(),
            action_type: action_type.into(),
            op_type,
            entity_type: entity_type.into(),
            entity_id: None,
            entity_ids: None,
            payload,
            client_id: client_id.into(),
            vector_clock,
            timestamp: now_millis(),
            schema_version: CURRENT_SCHEMA_VERSION,
        }
    }

    #[must_use]
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    #[must_use]
    pub fn with_entity_ids(mut self, entity_ids: Vec<String>) -> Self {
        self.entity_ids = Some(entity_ids);
        self
    }

    /// True for `SyncImport`, `BackupImport` and `Repair`.
    #[must_use]
    pub fn is_full_state(&self) -> bool {
        self.op_type.is_full_state()
    }

    /// True when the operation targets every entity (`entityType = ALL`).
    #[must_use]
    pub fn targets_all(&self) -> bool {
        self.entity_type == ENTITY_TYPE_ALL
    }

    /// A non-empty `entityId` is present.
    #[must_use]
    pub fn has_valid_entity_id(&self) -> bool {
        self.entity_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// The application state carried by a full-state operation.
    ///
    /// Accepts both a bare state object and the legacy
    /// `{"appDataComplete": state}` wrapper.
    #[must_use]
    pub fn full_state(&self) -> Option<&Value> {
        extract_full_state(&self.payload)
    }
}

/// Unwrap a full-state payload (bare object or `appDataComplete` wrapper).
pub fn extract_full_state(payload: &Value) -> Option<&Value> {
    let obj = payload.as_object()?;
    match obj.get(APP_DATA_COMPLETE_KEY) {
        Some(inner) if inner.is_object() => Some(inner),
        _ => Some(payload),
    }
}

/// Where an operation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpSource {
    Local,
    Remote,
}

impl OpSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

/// Application status of a logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Applied,
    /// Remote operation persisted but not yet applied to state
    Pending,
    /// Remote operation whose application failed; retried later
    Failed,
    /// Permanently given up on
    Rejected,
}

impl ApplicationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(Self::Applied),
            "pending" => Some(Self::Pending),
            "failed" => Some(Self::Failed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A stored operation plus local log metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLogEntry {
    /// Monotonic position in the local log
    pub seq: u64,
    pub op: Operation,
    /// When the entry was appended (epoch millis)
    pub applied_at: i64,
    pub source: OpSource,
    pub application_status: ApplicationStatus,
    #[serde(default)]
    pub retry_count: u32,
    /// Set once the server acknowledged the operation
    #[serde(default)]
    pub synced_at: Option<i64>,
    #[serde(default)]
    pub rejected_at: Option<i64>,
}

impl OperationLogEntry {
    /// Neither acknowledged by the server nor rejected.
    #[must_use]
    pub fn is_unsynced(&self) -> bool {
        self.synced_at.is_none() && self.rejected_at.is_none()
    }
}

/// Snapshot of the application state at a known log position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateCache {
    pub state: Value,
    pub last_applied_op_seq: u64,
    pub vector_clock: VectorClock,
    /// When the snapshot was taken (epoch millis)
    pub compacted_at: i64,
    pub schema_version: u32,
}

impl StateCache {
    /// Snapshot at the current schema version, stamped now.
    pub fn new(state: Value, last_applied_op_seq: u64, vector_clock: VectorClock) -> Self {
        Self {
            state,
            last_applied_op_seq,
            vector_clock,
            compacted_at: now_millis(),
            schema_version: CURRENT_SCHEMA_VERSION,
        }
    }
}

/// Explicit before/after delta of one entity, extracted at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChange {
    pub entity_type: String,
    pub entity_id: String,
    pub op_type: OpType,
    pub changes: Value,
}

/// Payload shape of locally captured operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiEntityPayload {
    pub action_payload: Value,
    #[serde(default)]
    pub entity_changes: Vec<EntityChange>,
}

impl MultiEntityPayload {
    /// True if `payload` has the multi-entity shape (both keys present).
    pub fn is_shape(payload: &Value) -> bool {
        payload
            .as_object()
            .is_some_and(|o| o.contains_key("actionPayload") && o.contains_key("entityChanges"))
    }

    pub fn into_value(self) -> Value {
        serde_json::json!({
            "actionPayload": self.action_payload,
            "entityChanges": self.entity_changes,
        })
    }
}

/// A command dispatched by the application that must become an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentCommand {
    pub action_type: String,
    pub op_type: OpType,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub entity_ids: Option<Vec<String>>,
    pub payload: Value,
    /// Already persisted by the remote merge path; never captured.
    pub is_remote: bool,
}

impl PersistentCommand {
    pub fn new(
        action_type: impl Into<String>,
        op_type: OpType,
        entity_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            op_type,
            entity_type: entity_type.into(),
            entity_id: None,
            entity_ids: None,
            payload,
            is_remote: false,
        }
    }

    #[must_use]
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    #[must_use]
    pub fn with_entity_ids(mut self, entity_ids: Vec<String>) -> Self {
        self.entity_ids = Some(entity_ids);
        self
    }

    #[must_use]
    pub fn remote(mut self) -> Self {
        self.is_remote = true;
        self
    }
}
