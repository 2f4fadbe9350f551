//! Turning a downloaded remote state into a local `SyncImport`.
//!
//! The import's clock is the merge of the local clock and the last clock the
//! remote sync subsystem knows, incremented for this client. It therefore
//! dominates everything either side has seen, and operations authored after
//! it descend from it instead of racing it on the server.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{OpLogError, Result};
use crate::host::{
    reconcile_remote_clock, AppStateHost, CachedClientId, ClockSyncError, RemoteClockView, UserNotice,
    UserNotifier,
};
use crate::hydration_state::HydrationState;
use crate::operation::{
    ApplicationStatus, OpSource, OpType, Operation, StateCache, ACTION_LOAD_ALL_DATA, ENTITY_TYPE_ALL,
};
use crate::resilience::lock::{LockService, OPERATION_LOG};
use crate::storage::LogStore;
use crate::validation::{validate_operation_payload, StateValidator};
use crate::vector_clock::VectorClock;

/// Null every field at `pointers` that exists in `state`.
pub fn strip_local_only_fields(state: &mut Value, pointers: &[String]) {
    for pointer in pointers {
        if let Some(field) = state.pointer_mut(pointer) {
            *field = Value::Null;
        }
    }
}

/// Copy the values at `pointers` from `local` into `target`, creating parents as needed.
fn restore_local_only_fields(target: &mut Value, local: &Value, pointers: &[String]) {
    for pointer in pointers {
        let Some(value) = local.pointer(pointer) else {
            continue;
        };
        let Some((parents, field)) = pointer.rsplit_once('/') else {
            continue;
        };
        if let Some(parent) = object_at_path(target, parents) {
            parent.insert(field.to_string(), value.clone());
        }
    }
}

fn object_at_path<'a>(mut node: &'a mut Value, path: &str) -> Option<&'a mut Map<String, Value>> {
    for segment in path.split('/').skip(1) {
        node = node
            .as_object_mut()?
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    node.as_object_mut()
}

pub struct SyncHydrator {
    store: Arc<dyn LogStore>,
    host: Arc<dyn AppStateHost>,
    locks: Arc<LockService>,
    client_id: Arc<CachedClientId>,
    remote_clock: Option<Arc<dyn RemoteClockView>>,
    validator: Arc<dyn StateValidator>,
    notifier: Arc<dyn UserNotifier>,
    core_sections: Vec<String>,
    local_only_fields: Vec<String>,
}

impl SyncHydrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn LogStore>,
        host: Arc<dyn AppStateHost>,
        locks: Arc<LockService>,
        client_id: Arc<CachedClientId>,
        remote_clock: Option<Arc<dyn RemoteClockView>>,
        validator: Arc<dyn StateValidator>,
        notifier: Arc<dyn UserNotifier>,
        core_sections: Vec<String>,
        local_only_fields: Vec<String>,
    ) -> Self {
        Self {
            store,
            host,
            locks,
            client_id,
            remote_clock,
            validator,
            notifier,
            core_sections,
            local_only_fields,
        }
    }

    async fn last_known_remote_clock(&self) -> VectorClock {
        let Some(view) = &self.remote_clock else {
            return VectorClock::new();
        };
        match view.last_known_remote_clock().await {
            Ok(clock) => clock.unwrap_or_default(),
            Err(ClockSyncError::NotReady) => {
                debug!("Remote sync not ready; importing with the local clock only");
                VectorClock::new()
            }
            Err(e) => {
                warn!(error = %e, "Could not read the remote clock; importing with the local clock only");
                VectorClock::new()
            }
        }
    }

    /// Merge `remote_data` sections over the current state and persist it as a `SyncImport`.
    ///
    /// With `None` the current state is re-imported as is.
    #[instrument(skip_all)]
    pub async fn hydrate_from_remote_sync(
        &self,
        remote_data: Option<Value>,
        hydration: &HydrationState,
    ) -> Result<Operation> {
        let local = self.host.current_state().await.map_err(|e| OpLogError::Host(e.0))?;
        let mut state = local.clone();
        if let Some(mut remote) = remote_data {
            strip_local_only_fields(&mut remote, &self.local_only_fields);
            match (state.as_object_mut(), remote) {
                (Some(base), Value::Object(sections)) => base.extend(sections),
                (_, remote) => state = remote,
            }
        }

        // The snapshot and the host get the repaired state with local-only
        // fields kept; the operation payload carries them nulled
        let check = self.validator.validate_and_repair(&state);
        let issues = match check.repaired {
            Some(repaired) if !check.issues.is_empty() => {
                warn!(issues = ?check.issues, "Repaired state imported from remote sync");
                state = repaired;
                check.issues
            }
            _ => Vec::new(),
        };
        let mut published = state.clone();
        restore_local_only_fields(&mut published, &local, &self.local_only_fields);

        let client_id = self.client_id.get().await?;
        let remote_clock = self.last_known_remote_clock().await;

        let (op, seq) = {
            let _guard = self.locks.acquire(OPERATION_LOG).await;

            let local_clock = self.store.get_vector_clock().await?.unwrap_or_default();
            let mut clock = local_clock.merged(&remote_clock);
            clock.increment(&client_id);

            let mut payload = state;
            strip_local_only_fields(&mut payload, &self.local_only_fields);
            let op = Operation::new(
                ACTION_LOAD_ALL_DATA,
                OpType::SyncImport,
                ENTITY_TYPE_ALL,
                payload,
                client_id,
                clock,
            );

            let validation = validate_operation_payload(&op, &self.core_sections);
            if !validation.is_valid() {
                self.notifier.notify(UserNotice::InvalidOperationPayload {
                    action_type: op.action_type.clone(),
                    errors: validation.errors.clone(),
                });
                return Err(OpLogError::InvalidOperation {
                    action_type: op.action_type,
                    errors: validation.errors,
                });
            }

            // Remote appends leave the stored clock alone, so set it explicitly
            let seq = self
                .store
                .append(&op, OpSource::Remote, ApplicationStatus::Applied)
                .await?;
            self.store
                .save_state_cache(&StateCache::new(published.clone(), seq, op.vector_clock.clone()))
                .await?;
            self.store.set_vector_clock(&op.vector_clock).await?;
            (op, seq)
        };
        crate::metrics::record_operation_written("remote");
        if !issues.is_empty() {
            self.notifier.notify(UserNotice::StateRepaired { issues });
        }

        {
            let _window = hydration.applying_guard();
            self.host
                .publish_state(published)
                .await
                .map_err(|e| OpLogError::Host(e.0))?;
        }

        reconcile_remote_clock(self.remote_clock.as_deref(), &op.vector_clock).await;
        info!(seq, clock = %op.vector_clock, "Hydrated from remote sync");
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pointers() -> Vec<String> {
        vec!["/globalConfig/sync/syncProvider".into()]
    }

    #[test]
    fn test_strip_nulls_existing_fields_only() {
        let mut state = json!({"globalConfig": {"sync": {"syncProvider": "WebDAV", "isEnabled": true}}});
        strip_local_only_fields(&mut state, &pointers());
        assert_eq!(state["globalConfig"]["sync"]["syncProvider"], Value::Null);
        assert_eq!(state["globalConfig"]["sync"]["isEnabled"], true);

        let mut bare = json!({"task": {}});
        strip_local_only_fields(&mut bare, &pointers());
        assert_eq!(bare, json!({"task": {}}));
    }

    #[test]
    fn test_restore_creates_missing_parents() {
        let local = json!({"globalConfig": {"sync": {"syncProvider": "Dropbox"}}});
        let mut target = json!({"globalConfig": {}});
        restore_local_only_fields(&mut target, &local, &pointers());
        assert_eq!(target["globalConfig"]["sync"]["syncProvider"], "Dropbox");
    }
}
