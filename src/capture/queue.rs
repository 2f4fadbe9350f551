//! FIFO hand-off between command capture and the writer, plus entity-change extraction.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::operation::{EntityChange, OpType, PersistentCommand};

/// Entity changes waiting to be persisted, one slot per captured command.
///
/// The writer dequeues exactly once per command, so slots line up 1:1 with
/// commands in dispatch order.
pub struct OperationCaptureQueue {
    slots: Mutex<VecDeque<Vec<EntityChange>>>,
    warn_threshold: usize,
    warned: AtomicBool,
}

impl OperationCaptureQueue {
    pub fn new(warn_threshold: usize) -> Self {
        Self {
            slots: Mutex::new(VecDeque::new()),
            warn_threshold,
            warned: AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, changes: Vec<EntityChange>) {
        let len = {
            let mut slots = self.slots.lock();
            slots.push_back(changes);
            slots.len()
        };
        if len > self.warn_threshold && !self.warned.swap(true, Ordering::AcqRel) {
            warn!(queued = len, threshold = self.warn_threshold, "Capture queue is backing up");
        }
    }

    pub fn dequeue(&self) -> Option<Vec<EntityChange>> {
        let (next, len) = {
            let mut slots = self.slots.lock();
            let next = slots.pop_front();
            (next, slots.len())
        };
        if len <= self.warn_threshold && self.warned.swap(false, Ordering::AcqRel) {
            info!(queued = len, "Capture queue drained below threshold");
        }
        next
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// Computes explicit entity changes from the state before and after a command.
pub type ChangeExtractor =
    Arc<dyn Fn(&PersistentCommand, &Value, &Value) -> Vec<EntityChange> + Send + Sync>;

/// Extractors by action type. Commands without one carry no entity changes.
#[derive(Default, Clone)]
pub struct ChangeExtractors {
    by_action: HashMap<String, ChangeExtractor>,
}

impl ChangeExtractors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action_type: impl Into<String>, extractor: ChangeExtractor) {
        self.by_action.insert(action_type.into(), extractor);
    }

    #[must_use]
    pub fn with(mut self, action_type: impl Into<String>, extractor: ChangeExtractor) -> Self {
        self.register(action_type, extractor);
        self
    }

    pub fn extract(&self, cmd: &PersistentCommand, before: &Value, after: &Value) -> Vec<EntityChange> {
        self.by_action
            .get(&cmd.action_type)
            .map(|extract| extract(cmd, before, after))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_action.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_action.is_empty()
    }
}

/// Extractor that diffs the keyed object at `pointer` (e.g. `/timeTracking/project`).
///
/// Every key whose value changed yields one change of `entity_type` with
/// `{"before": .., "after": ..}`; added keys are creates, removed keys deletes.
pub fn section_delta_extractor(pointer: impl Into<String>, entity_type: impl Into<String>) -> ChangeExtractor {
    let pointer = pointer.into();
    let entity_type = entity_type.into();
    Arc::new(move |_cmd, before, after| {
        let empty = serde_json::Map::new();
        let before = before.pointer(&pointer).and_then(Value::as_object).unwrap_or(&empty);
        let after = after.pointer(&pointer).and_then(Value::as_object).unwrap_or(&empty);

        let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        keys.into_iter()
            .filter_map(|key| {
                let (b, a) = (before.get(key), after.get(key));
                let op_type = match (b, a) {
                    (None, Some(_)) => OpType::Create,
                    (Some(_), None) => OpType::Delete,
                    (Some(b), Some(a)) if b != a => OpType::Update,
                    _ => return None,
                };
                Some(EntityChange {
                    entity_type: entity_type.clone(),
                    entity_id: key.clone(),
                    op_type,
                    changes: json!({ "before": b, "after": a }),
                })
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(id: &str) -> EntityChange {
        EntityChange {
            entity_type: "TASK".into(),
            entity_id: id.into(),
            op_type: OpType::Update,
            changes: json!({}),
        }
    }

    #[test]
    fn test_queue_is_fifo() {
        let queue = OperationCaptureQueue::new(10);
        queue.enqueue(vec![change("a")]);
        queue.enqueue(vec![]);
        queue.enqueue(vec![change("c")]);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue().unwrap()[0].entity_id, "a");
        assert!(queue.dequeue().unwrap().is_empty());
        assert_eq!(queue.dequeue().unwrap()[0].entity_id, "c");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_queue_warning_rearms_after_drain() {
        let queue = OperationCaptureQueue::new(1);
        queue.enqueue(vec![]);
        queue.enqueue(vec![]);
        assert!(queue.warned.load(Ordering::Acquire));
        queue.dequeue();
        assert!(!queue.warned.load(Ordering::Acquire));
    }

    #[test]
    fn test_section_delta_extractor() {
        let extract = section_delta_extractor("/timeTracking/project", "TIME_TRACKING");
        let cmd = PersistentCommand::new("[TimeTracking] Sync", OpType::Update, "TIME_TRACKING", json!({}));
        let before = json!({"timeTracking": {"project": {"p1": {"s": 1}, "p2": {"s": 2}}}});
        let after = json!({"timeTracking": {"project": {"p1": {"s": 5}, "p2": {"s": 2}, "p3": {"s": 0}}}});

        let changes = extract(&cmd, &before, &after);

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].entity_id, "p1");
        assert_eq!(changes[0].op_type, OpType::Update);
        assert_eq!(changes[0].changes["after"]["s"], 5);
        assert_eq!(changes[1].entity_id, "p3");
        assert_eq!(changes[1].op_type, OpType::Create);
    }

    #[test]
    fn test_unregistered_action_has_no_changes() {
        let extractors = ChangeExtractors::new()
            .with("[TimeTracking] Sync", section_delta_extractor("/timeTracking", "TIME_TRACKING"));
        let cmd = PersistentCommand::new("[Task] Update", OpType::Update, "TASK", json!({}));
        assert!(extractors.extract(&cmd, &json!({}), &json!({"timeTracking": {"a": 1}})).is_empty());
    }
}
