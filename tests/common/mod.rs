//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

use oplog_engine::operation::{MultiEntityPayload, ENTITY_TYPE_RECOVERY};
use oplog_engine::{
    AppStateHost, ApplyError, ClockSyncError, HostError, LogStore, ModelDataSource, OpType, Operation,
    PersistentCommand, RemoteClockView, UserNotice, UserNotifier, VectorClock,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("oplog_engine=debug")
        .with_test_writer()
        .try_init();
}

/// Empty state with every core section present.
pub fn base_state() -> Value {
    json!({ "task": {}, "project": {}, "globalConfig": {} })
}

pub fn task_cmd(id: &str, title: &str) -> PersistentCommand {
    PersistentCommand::new("[Task] Add", OpType::Create, "TASK", json!({ "id": id, "title": title }))
        .with_entity_id(id)
}

/// A locally captured task creation, shaped the way the writer stores it.
pub fn task_op(id: &str, client: &str, clock: VectorClock) -> Operation {
    let payload = MultiEntityPayload {
        action_payload: json!({ "id": id, "title": format!("task {id}") }),
        entity_changes: Vec::new(),
    }
    .into_value();
    Operation::new("[Task] Add", OpType::Create, "TASK", payload, client, clock).with_entity_id(id)
}

pub fn clock(entries: &[(&str, u64)]) -> VectorClock {
    let mut clock = VectorClock::new();
    for (client, count) in entries {
        for _ in 0..*count {
            clock.increment(client);
        }
    }
    clock
}

/// Applies task operations to a JSON state the way a reducer would.
pub fn reduce(state: &mut Value, op: &Operation) {
    if op.is_full_state() {
        if let Some(full) = op.full_state() {
            *state = full.clone();
        }
        return;
    }
    if op.entity_type == ENTITY_TYPE_RECOVERY {
        *state = op.payload.clone();
        return;
    }

    let data = if MultiEntityPayload::is_shape(&op.payload) {
        op.payload["actionPayload"].clone()
    } else {
        op.payload.clone()
    };
    let Some(id) = op.entity_id.clone() else {
        return;
    };
    let section = op.entity_type.to_lowercase();
    let Some(root) = state.as_object_mut() else {
        return;
    };
    let entities = root.entry(section).or_insert_with(|| json!({}));
    let Some(entities) = entities.as_object_mut() else {
        return;
    };
    match op.op_type {
        OpType::Delete => {
            entities.remove(&id);
        }
        _ => {
            entities.insert(id, data);
        }
    }
}

/// Application stand-in: a JSON state, a reducer, and a record of every publish.
pub struct ReducerHost {
    state: Mutex<Value>,
    publishes: Mutex<Vec<Value>>,
    /// Stored vector clock observed at each publish
    clocks_at_publish: Mutex<Vec<Option<VectorClock>>>,
    store: Mutex<Option<Arc<dyn LogStore>>>,
    apply_calls: Mutex<usize>,
    /// Operations with this action type fail to apply
    fail_action: Mutex<Option<String>>,
}

impl ReducerHost {
    pub fn new(state: Value) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            publishes: Mutex::new(Vec::new()),
            clocks_at_publish: Mutex::new(Vec::new()),
            store: Mutex::new(None),
            apply_calls: Mutex::new(0),
            fail_action: Mutex::new(None),
        })
    }

    /// Record the store's clock on every publish.
    pub fn observe_store(&self, store: Arc<dyn LogStore>) {
        *self.store.lock() = Some(store);
    }

    pub fn fail_action(&self, action_type: &str) {
        *self.fail_action.lock() = Some(action_type.to_string());
    }

    pub fn state(&self) -> Value {
        self.state.lock().clone()
    }

    pub fn set_state(&self, state: Value) {
        *self.state.lock() = state;
    }

    pub fn publishes(&self) -> Vec<Value> {
        self.publishes.lock().clone()
    }

    pub fn clocks_at_publish(&self) -> Vec<Option<VectorClock>> {
        self.clocks_at_publish.lock().clone()
    }

    pub fn apply_calls(&self) -> usize {
        *self.apply_calls.lock()
    }

    pub fn task_count(&self) -> usize {
        self.state.lock()["task"].as_object().map_or(0, |t| t.len())
    }
}

#[async_trait]
impl AppStateHost for ReducerHost {
    async fn current_state(&self) -> Result<Value, HostError> {
        Ok(self.state.lock().clone())
    }

    async fn publish_state(&self, state: Value) -> Result<(), HostError> {
        let store = self.store.lock().clone();
        let clock = match store {
            Some(store) => store.get_vector_clock().await.map_err(|e| HostError(e.to_string()))?,
            None => None,
        };
        self.clocks_at_publish.lock().push(clock);
        self.publishes.lock().push(state.clone());
        *self.state.lock() = state;
        Ok(())
    }

    async fn apply_operations(&self, ops: &[Operation]) -> Result<(), ApplyError> {
        *self.apply_calls.lock() += 1;
        let fail_action = self.fail_action.lock().clone();
        let mut next = self.state.lock().clone();
        for op in ops {
            if fail_action.as_deref() == Some(op.action_type.as_str()) {
                // Everything before the failing op stays applied
                *self.state.lock() = next;
                return Err(ApplyError {
                    op_id: Some(op.id.clone()),
                    message: "reducer rejected operation".into(),
                });
            }
            reduce(&mut next, op);
        }
        *self.state.lock() = next;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<UserNotice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<UserNotice> {
        self.notices.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&UserNotice) -> bool) -> usize {
        self.notices.lock().iter().filter(|n| pred(n)).count()
    }
}

impl UserNotifier for RecordingNotifier {
    fn notify(&self, notice: UserNotice) {
        self.notices.lock().push(notice);
    }
}

/// Legacy model storage holding a fixed state.
pub struct LegacySource(pub Option<Value>);

#[async_trait]
impl ModelDataSource for LegacySource {
    async fn load_all_models(&self) -> Result<Option<Value>, HostError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
pub struct FakeRemoteClock {
    pub known: Mutex<Option<VectorClock>>,
    pub synced: Mutex<Vec<VectorClock>>,
}

#[async_trait]
impl RemoteClockView for FakeRemoteClock {
    async fn last_known_remote_clock(&self) -> Result<Option<VectorClock>, ClockSyncError> {
        Ok(self.known.lock().clone())
    }

    async fn sync_vector_clock(&self, clock: &VectorClock) -> Result<(), ClockSyncError> {
        self.synced.lock().push(clock.clone());
        Ok(())
    }
}
