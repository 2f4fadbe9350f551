//! Snapshot helpers shared by hydration, recovery and remote-sync hydration.

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{OpLogError, Result};
use crate::host::AppStateHost;
use crate::operation::StateCache;
use crate::schema::SchemaMigrator;
use crate::storage::LogStore;

/// Structural problems with a loaded snapshot. Empty means usable.
pub fn snapshot_issues(cache: &StateCache, core_sections: &[String]) -> Vec<String> {
    let Some(state) = cache.state.as_object() else {
        return vec!["snapshot state is not an object".to_string()];
    };
    core_sections
        .iter()
        .filter(|s| !state.get(s.as_str()).is_some_and(Value::is_object))
        .map(|s| format!("snapshot is missing core section '{s}'"))
        .collect()
}

#[must_use]
pub fn is_valid_snapshot(cache: &StateCache, core_sections: &[String]) -> bool {
    snapshot_issues(cache, core_sections).is_empty()
}

/// Snapshot the host's current state at the log's current position.
///
/// Failure is logged and reported as `false`; the log still holds everything.
pub async fn save_current_state_as_snapshot(store: &dyn LogStore, host: &dyn AppStateHost) -> bool {
    let result: Result<u64> = async {
        let state = host.current_state().await.map_err(|e| OpLogError::Host(e.0))?;
        let last_seq = store.get_last_seq().await?;
        let clock = store.get_vector_clock().await?.unwrap_or_default();
        store.save_state_cache(&StateCache::new(state, last_seq, clock)).await?;
        Ok(last_seq)
    }
    .await;

    match result {
        Ok(seq) => {
            debug!(last_applied_op_seq = seq, "Saved state snapshot");
            true
        }
        Err(e) => {
            warn!(error = %e, "Failed to save state snapshot");
            false
        }
    }
}

/// Migrate `cache` to the current schema version, all or nothing.
///
/// The stored snapshot is backed up first. On failure the backup is restored
/// and the migration error returned; if the restore fails too the result is
/// [`OpLogError::MigrationRestoreFailed`].
pub async fn migrate_snapshot_with_backup(
    store: &dyn LogStore,
    migrator: &SchemaMigrator,
    cache: StateCache,
) -> Result<StateCache> {
    let from = cache.schema_version;
    store.save_state_cache_backup().await?;

    let migrated = match migrator.migrate_state(cache) {
        Ok(migrated) => match store.save_state_cache(&migrated).await {
            Ok(()) => Ok(migrated),
            Err(e) => Err(OpLogError::from(e)),
        },
        Err(e) => Err(e),
    };

    match migrated {
        Ok(migrated) => {
            if let Err(e) = store.clear_state_cache_backup().await {
                warn!(error = %e, "Failed to clear snapshot backup after migration");
            }
            info!(from, to = migrated.schema_version, "Migrated snapshot");
            Ok(migrated)
        }
        Err(migration_error) => {
            error!(from, error = %migration_error, "Snapshot migration failed; restoring backup");
            match store.restore_state_cache_from_backup().await {
                Ok(()) => Err(migration_error),
                Err(restore_error) => {
                    error!(error = %restore_error, "Restoring snapshot backup failed");
                    Err(OpLogError::MigrationRestoreFailed {
                        migration: migration_error.to_string(),
                        restore: restore_error.to_string(),
                    })
                }
            }
        }
    }
}
