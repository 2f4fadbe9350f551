//! Structural validation of operation payloads and application state.
//!
//! Operations are validated right before they are appended; an invalid one is
//! never persisted. Warnings flag unusual but acceptable shapes and do not
//! block the write.

use serde_json::{Map, Value};

use crate::operation::{extract_full_state, MultiEntityPayload, OpType, Operation};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

/// Check that `op.payload` has a shape its `op_type` can replay.
///
/// `core_sections` are the top-level state sections a full-state import must
/// contain at least one of.
pub fn validate_operation_payload(op: &Operation, core_sections: &[String]) -> ValidationResult {
    let mut result = ValidationResult::default();

    let Some(obj) = op.payload.as_object() else {
        result.error(format!(
            "payload must be an object, got {}",
            json_kind(&op.payload)
        ));
        return result;
    };

    // Repair payloads are produced by the engine itself
    if op.op_type == OpType::Repair {
        return result;
    }

    let action_payload = if MultiEntityPayload::is_shape(&op.payload) {
        validate_multi_entity(obj, &mut result);
        match obj.get("actionPayload").and_then(Value::as_object) {
            Some(inner) => inner,
            None => return result,
        }
    } else {
        obj
    };

    match op.op_type {
        OpType::Create => validate_create(action_payload, &mut result),
        OpType::Update => validate_update(op, action_payload, &mut result),
        OpType::Delete => validate_delete(op, action_payload, &mut result),
        OpType::Batch => {
            if action_payload.is_empty() {
                result.error("batch payload must not be empty");
            }
        }
        OpType::SyncImport | OpType::BackupImport => {
            validate_full_state(&op.payload, core_sections, &mut result)
        }
        OpType::Repair => {}
    }

    result
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn validate_multi_entity(obj: &Map<String, Value>, result: &mut ValidationResult) {
    match obj.get("actionPayload") {
        Some(Value::Object(_)) => {}
        Some(other) => result.error(format!(
            "actionPayload must be an object, got {}",
            json_kind(other)
        )),
        None => result.error("actionPayload is missing"),
    }

    let Some(changes) = obj.get("entityChanges").and_then(Value::as_array) else {
        result.error("entityChanges must be an array");
        return;
    };

    for (i, change) in changes.iter().enumerate() {
        let Some(change) = change.as_object() else {
            result.error(format!("entityChanges[{i}] must be an object"));
            continue;
        };
        let non_empty_str = |key: &str| {
            change
                .get(key)
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty())
        };
        if !non_empty_str("entityType") {
            result.error(format!("entityChanges[{i}] is missing entityType"));
        }
        if !non_empty_str("entityId") {
            result.error(format!("entityChanges[{i}] is missing entityId"));
        }
        let op_type = change
            .get("opType")
            .and_then(|v| serde_json::from_value::<OpType>(v.clone()).ok());
        match op_type {
            None => result.error(format!("entityChanges[{i}] has no valid opType")),
            Some(OpType::Create) if change.get("changes").map_or(true, Value::is_null) => {
                result.error(format!("entityChanges[{i}] creates an entity without data"))
            }
            Some(_) => {}
        }
    }
}

/// First object-valued field of the payload, which by convention holds the entity.
fn find_entity(payload: &Map<String, Value>) -> Option<&Map<String, Value>> {
    payload.values().find_map(Value::as_object)
}

fn validate_create(payload: &Map<String, Value>, result: &mut ValidationResult) {
    if payload.contains_key("id") {
        return;
    }
    match find_entity(payload) {
        Some(entity) if entity.contains_key("id") => {}
        Some(_) => result.error("created entity has no id"),
        None => result.warn("create payload contains no entity object"),
    }
}

fn validate_update(op: &Operation, payload: &Map<String, Value>, result: &mut ValidationResult) {
    let has_target = payload.contains_key("id")
        || payload.values().any(|v| match v {
            Value::Object(o) => o.contains_key("id") || o.contains_key("changes"),
            Value::Array(_) => true,
            _ => false,
        });
    if !has_target && !op.has_valid_entity_id() && op.entity_ids.is_none() {
        result.warn("update payload does not identify the updated entity");
    }
}

fn validate_delete(op: &Operation, payload: &Map<String, Value>, result: &mut ValidationResult) {
    if let Some(ids) = &op.entity_ids {
        if ids.iter().any(String::is_empty) {
            result.error("entityIds contains an empty id");
        }
        return;
    }
    if op.has_valid_entity_id() {
        return;
    }
    let names_ids = payload
        .iter()
        .any(|(k, v)| (k == "id" && v.is_string()) || (k.ends_with("Ids") && v.is_array()) || k == "ids");
    if !names_ids {
        result.warn("delete payload does not name the deleted entities");
    }
}

fn validate_full_state(payload: &Value, core_sections: &[String], result: &mut ValidationResult) {
    let Some(state) = extract_full_state(payload).and_then(Value::as_object) else {
        result.error("full-state payload must be an object");
        return;
    };
    if !core_sections.is_empty() && !core_sections.iter().any(|s| state.contains_key(s)) {
        result.error(format!(
            "full-state payload contains none of the expected sections ({})",
            core_sections.join(", ")
        ));
    }
}

/// Outcome of checking (and possibly repairing) a whole application state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateCheck {
    pub issues: Vec<String>,
    /// Replacement state when the validator could fix the issues
    pub repaired: Option<Value>,
}

impl StateCheck {
    #[must_use]
    pub fn valid() -> Self {
        Self {
            issues: Vec::new(),
            repaired: None,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Validates reconstructed application state before it is published.
pub trait StateValidator: Send + Sync {
    fn validate_and_repair(&self, state: &Value) -> StateCheck;
}

/// Checks that every core section is present and an object. Repairs by
/// inserting empty sections.
pub struct CoreSectionsValidator {
    sections: Vec<String>,
}

impl CoreSectionsValidator {
    pub fn new(sections: Vec<String>) -> Self {
        Self { sections }
    }
}

impl StateValidator for CoreSectionsValidator {
    fn validate_and_repair(&self, state: &Value) -> StateCheck {
        let Some(obj) = state.as_object() else {
            return StateCheck {
                issues: vec![format!("state must be an object, got {}", json_kind(state))],
                repaired: None,
            };
        };

        let issues: Vec<String> = self
            .sections
            .iter()
            .filter(|s| !obj.get(s.as_str()).is_some_and(Value::is_object))
            .map(|s| format!("section '{s}' is missing or not an object"))
            .collect();
        if issues.is_empty() {
            return StateCheck::valid();
        }

        let mut repaired = obj.clone();
        for section in &self.sections {
            if !repaired.get(section.as_str()).is_some_and(Value::is_object) {
                repaired.insert(section.clone(), Value::Object(Map::new()));
            }
        }
        StateCheck {
            issues,
            repaired: Some(Value::Object(repaired)),
        }
    }
}
