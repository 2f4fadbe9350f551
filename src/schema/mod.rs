// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Schema migration for snapshots and operations.
//!
//! Every snapshot and operation carries the schema version it was written
//! under. The [`SchemaMigrator`] upgrades older data through a linear chain of
//! [`SchemaMigration`] steps, one per version bump.
//!
//! # Example
//!
//! ```
//! use oplog_engine::schema::{SchemaMigration, SchemaMigrator};
//! use serde_json::Value;
//!
//! fn rename_tags(mut state: Value) -> Result<Value, String> {
//!     if let Some(tags) = state.as_object_mut().and_then(|o| o.remove("tags")) {
//!         state["tag"] = tags;
//!     }
//!     Ok(state)
//! }
//!
//! let migrator = SchemaMigrator::with_migrations(2, 1, vec![SchemaMigration {
//!     from_version: 1,
//!     to_version: 2,
//!     description: "rename tags section",
//!     requires_operation_migration: false,
//!     migrate_state: rename_tags,
//!     migrate_operation: None,
//! }])
//! .unwrap();
//!
//! assert_eq!(migrator.current_version(), 2);
//! ```
//!
//! # Design
//!
//! - **Linear chain**: step `n` migrates from version `n` to `n + 1`
//! - **Dropping operations**: an operation migration may return `None` for retired features
//! - **Fail fast**: a step flagged as payload-breaking without an operation migration is
//!   rejected when the migrator is built, not when data first hits it
//! - **Floor**: data older than the minimum supported version is refused

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{OpLogError, Result};
use crate::operation::{Operation, StateCache};

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Oldest schema version this build can still migrate.
pub const MIN_SUPPORTED_SCHEMA_VERSION: u32 = 1;

pub type StateMigrationFn = fn(Value) -> std::result::Result<Value, String>;

/// Returns `Ok(None)` to drop the operation.
pub type OperationMigrationFn = fn(Operation) -> std::result::Result<Option<Operation>, String>;

/// One version bump.
#[derive(Clone)]
pub struct SchemaMigration {
    pub from_version: u32,
    pub to_version: u32,
    pub description: &'static str,
    /// The payload shape of operations changes in this step
    pub requires_operation_migration: bool,
    pub migrate_state: StateMigrationFn,
    pub migrate_operation: Option<OperationMigrationFn>,
}

impl std::fmt::Debug for SchemaMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaMigration")
            .field("from_version", &self.from_version)
            .field("to_version", &self.to_version)
            .field("description", &self.description)
            .field("requires_operation_migration", &self.requires_operation_migration)
            .field("has_operation_migration", &self.migrate_operation.is_some())
            .finish()
    }
}

/// Migrations shipped with this build, oldest first.
fn builtin_migrations() -> Vec<SchemaMigration> {
    Vec::new()
}

/// Anything stamped with a schema version.
pub trait Versioned {
    fn schema_version(&self) -> u32;
}

impl Versioned for StateCache {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

impl Versioned for Operation {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

#[derive(Debug, Clone)]
pub struct SchemaMigrator {
    current: u32,
    min_supported: u32,
    migrations: Vec<SchemaMigration>,
}

impl Default for SchemaMigrator {
    fn default() -> Self {
        Self {
            current: CURRENT_SCHEMA_VERSION,
            min_supported: MIN_SUPPORTED_SCHEMA_VERSION,
            migrations: builtin_migrations(),
        }
    }
}

impl SchemaMigrator {
    /// Migrator for this build's schema, validated.
    pub fn new() -> Result<Self> {
        let migrator = Self::default();
        migrator.validate()?;
        Ok(migrator)
    }

    /// Custom chain (tests, embedders with their own schema history).
    pub fn with_migrations(
        current: u32,
        min_supported: u32,
        mut migrations: Vec<SchemaMigration>,
    ) -> Result<Self> {
        migrations.sort_by_key(|m| m.from_version);
        let migrator = Self {
            current,
            min_supported,
            migrations,
        };
        migrator.validate()?;
        Ok(migrator)
    }

    fn validate(&self) -> Result<()> {
        if self.min_supported > self.current {
            return Err(OpLogError::MigrationRegistry(format!(
                "minimum supported version {} is newer than current {}",
                self.min_supported, self.current
            )));
        }

        let mut expected = self.min_supported;
        for m in &self.migrations {
            if m.to_version != m.from_version + 1 {
                return Err(OpLogError::MigrationRegistry(format!(
                    "migration '{}' must step exactly one version (v{} -> v{})",
                    m.description, m.from_version, m.to_version
                )));
            }
            if m.from_version < self.min_supported {
                // Steps below the floor are unreachable
                continue;
            }
            if m.from_version != expected {
                return Err(OpLogError::MigrationRegistry(format!(
                    "gap in migration chain: expected a step from v{expected}, found v{}",
                    m.from_version
                )));
            }
            if m.requires_operation_migration && m.migrate_operation.is_none() {
                return Err(OpLogError::MigrationRegistry(format!(
                    "migration '{}' (v{} -> v{}) changes operation payloads but declares no operation migration",
                    m.description, m.from_version, m.to_version
                )));
            }
            expected = m.to_version;
        }

        if expected != self.current {
            return Err(OpLogError::MigrationRegistry(format!(
                "migration chain ends at v{expected}, current version is v{}",
                self.current
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn current_version(&self) -> u32 {
        self.current
    }

    #[must_use]
    pub fn min_supported_version(&self) -> u32 {
        self.min_supported
    }

    #[must_use]
    pub fn needs_migration(&self, item: &impl Versioned) -> bool {
        item.schema_version() < self.current
    }

    fn ensure_supported(&self, version: u32) -> Result<()> {
        if version < self.min_supported {
            return Err(OpLogError::UnsupportedSchemaVersion {
                version,
                minimum: self.min_supported,
            });
        }
        Ok(())
    }

    fn steps_from(&self, version: u32) -> impl Iterator<Item = &SchemaMigration> {
        let current = self.current;
        self.migrations
            .iter()
            .filter(move |m| m.from_version >= version && m.to_version <= current)
    }

    /// Upgrade a snapshot to the current version. All-or-nothing.
    pub fn migrate_state(&self, mut cache: StateCache) -> Result<StateCache> {
        let from = cache.schema_version;
        self.ensure_supported(from)?;
        if from > self.current {
            warn!(version = from, current = self.current, "Snapshot written by a newer schema, leaving as is");
            return Ok(cache);
        }
        if from == self.current {
            return Ok(cache);
        }

        let mut state = cache.state;
        for step in self.steps_from(from) {
            debug!(from = step.from_version, to = step.to_version, step = step.description, "Migrating state");
            state = (step.migrate_state)(state).map_err(|message| OpLogError::Migration {
                from: step.from_version,
                to: step.to_version,
                message,
            })?;
        }

        info!(from, to = self.current, "Snapshot migrated");
        crate::metrics::record_migration("state", "success");
        cache.state = state;
        cache.schema_version = self.current;
        Ok(cache)
    }

    /// Upgrade one operation. `Ok(None)` means a step retired it.
    pub fn migrate_operation(&self, mut op: Operation) -> Result<Option<Operation>> {
        let from = op.schema_version;
        self.ensure_supported(from)?;
        if from >= self.current {
            return Ok(Some(op));
        }

        for step in self.steps_from(from) {
            if let Some(migrate) = step.migrate_operation {
                match migrate(op).map_err(|message| OpLogError::Migration {
                    from: step.from_version,
                    to: step.to_version,
                    message,
                })? {
                    Some(next) => op = next,
                    None => {
                        debug!(step = step.description, "Operation dropped by migration");
                        crate::metrics::record_migration("operation", "dropped");
                        return Ok(None);
                    }
                }
            }
            op.schema_version = step.to_version;
        }
        Ok(Some(op))
    }

    /// Migrate a batch, dropping retired operations. Returns the survivors and
    /// how many were dropped.
    pub fn migrate_operations(&self, ops: Vec<Operation>) -> Result<(Vec<Operation>, usize)> {
        let total = ops.len();
        let mut out = Vec::with_capacity(total);
        for op in ops {
            if let Some(migrated) = self.migrate_operation(op)? {
                out.push(migrated);
            }
        }
        let dropped = total - out.len();
        Ok((out, dropped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OpType;
    use crate::vector_clock::VectorClock;
    use serde_json::json;

    fn add_version_marker(mut state: Value) -> std::result::Result<Value, String> {
        state["migratedToV2"] = json!(true);
        Ok(state)
    }

    fn fail_state(_: Value) -> std::result::Result<Value, String> {
        Err("cannot migrate".into())
    }

    fn identity_state(state: Value) -> std::result::Result<Value, String> {
        Ok(state)
    }

    fn drop_legacy_ops(op: Operation) -> std::result::Result<Option<Operation>, String> {
        if op.entity_type == "LEGACY" {
            Ok(None)
        } else {
            Ok(Some(op))
        }
    }

    fn step(from: u32, requires_op: bool, op_fn: Option<OperationMigrationFn>) -> SchemaMigration {
        SchemaMigration {
            from_version: from,
            to_version: from + 1,
            description: "test step",
            requires_operation_migration: requires_op,
            migrate_state: add_version_marker,
            migrate_operation: op_fn,
        }
    }

    fn op_at(version: u32, entity_type: &str) -> Operation {
        let mut op = Operation::new("x", OpType::Update, entity_type, json!({}), "A", VectorClock::new())
            .with_entity_id("e1");
        op.schema_version = version;
        op
    }

    #[test]
    fn test_builtin_registry_is_valid() {
        let migrator = SchemaMigrator::new().unwrap();
        assert_eq!(migrator.current_version(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_rejects_breaking_step_without_operation_migration() {
        let err = SchemaMigrator::with_migrations(2, 1, vec![step(1, true, None)]).unwrap_err();
        assert!(matches!(err, OpLogError::MigrationRegistry(_)));
    }

    #[test]
    fn test_rejects_gap_in_chain() {
        let err = SchemaMigrator::with_migrations(3, 1, vec![step(2, false, None)]).unwrap_err();
        assert!(matches!(err, OpLogError::MigrationRegistry(_)));
    }

    #[test]
    fn test_rejects_chain_not_reaching_current() {
        let err = SchemaMigrator::with_migrations(3, 1, vec![step(1, false, None)]).unwrap_err();
        assert!(matches!(err, OpLogError::MigrationRegistry(_)));
    }

    #[test]
    fn test_needs_migration() {
        let migrator = SchemaMigrator::with_migrations(2, 1, vec![step(1, false, None)]).unwrap();
        let mut cache = StateCache::new(json!({}), 0, VectorClock::new());
        cache.schema_version = 1;
        assert!(migrator.needs_migration(&cache));
        cache.schema_version = 2;
        assert!(!migrator.needs_migration(&cache));
    }

    #[test]
    fn test_migrate_state_runs_chain() {
        let migrator = SchemaMigrator::with_migrations(2, 1, vec![step(1, false, None)]).unwrap();
        let mut cache = StateCache::new(json!({"task": {}}), 3, VectorClock::new());
        cache.schema_version = 1;

        let migrated = migrator.migrate_state(cache).unwrap();
        assert_eq!(migrated.schema_version, 2);
        assert_eq!(migrated.state["migratedToV2"], json!(true));
        assert_eq!(migrated.last_applied_op_seq, 3);
    }

    #[test]
    fn test_migrate_state_failure_reports_step() {
        let mut failing = step(1, false, None);
        failing.migrate_state = fail_state;
        let migrator = SchemaMigrator::with_migrations(2, 1, vec![failing]).unwrap();
        let mut cache = StateCache::new(json!({}), 0, VectorClock::new());
        cache.schema_version = 1;

        let err = migrator.migrate_state(cache).unwrap_err();
        assert!(matches!(err, OpLogError::Migration { from: 1, to: 2, .. }));
    }

    #[test]
    fn test_rejects_versions_below_floor() {
        let mut second = step(2, false, None);
        second.migrate_state = identity_state;
        let migrator = SchemaMigrator::with_migrations(3, 2, vec![step(1, false, None), second]).unwrap();

        let err = migrator.migrate_operation(op_at(1, "TASK")).unwrap_err();
        assert!(matches!(err, OpLogError::UnsupportedSchemaVersion { version: 1, minimum: 2 }));
    }

    #[test]
    fn test_operation_migration_can_drop() {
        let migrator =
            SchemaMigrator::with_migrations(2, 1, vec![step(1, true, Some(drop_legacy_ops))]).unwrap();

        let (kept, dropped) = migrator
            .migrate_operations(vec![op_at(1, "TASK"), op_at(1, "LEGACY"), op_at(2, "LEGACY")])
            .unwrap();

        assert_eq!(dropped, 1);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|op| op.schema_version == 2));
    }

    #[test]
    fn test_migrate_operation_is_noop_at_current() {
        let migrator =
            SchemaMigrator::with_migrations(2, 1, vec![step(1, true, Some(drop_legacy_ops))]).unwrap();
        let op = op_at(2, "TASK");
        assert_eq!(migrator.migrate_operation(op.clone()).unwrap(), Some(op));
    }
}
