// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-field merge rules.
//!
//! Every rule is idempotent and commutative: applying the same fragments
//! again, or in another order, yields the same document. Rules that compare
//! fragments use the per-field [`StreamOrder`] kept in each object's
//! `_orders` map. Last-writer-wins fields are decided by that order alone;
//! state lattices fall back to the value when rank and order both tie.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use serde_json::{Map, Value};

use crate::model::StreamOrder;
use crate::persistence::compare_values;

/// Bookkeeping key holding the stream order of each field.
pub const ORDERS_FIELD: &str = "_orders";

/// Object kinds with their own rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeScope {
    /// Process or decision definition document.
    Definition,
    /// Process instance document.
    ProcessInstance,
    /// Entry of `flowNodes`.
    FlowNode,
    /// Entry of `incidents`.
    Incident,
    /// Entry of `variables`.
    Variable,
    /// Entry of `userTasks`.
    UserTask,
    /// Entry of `userTasks[].assignments`.
    Assignment,
    /// Tenant document.
    Tenant,
}

/// How a field combines an incoming value with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Set once, never changed.
    Identity,
    /// Highest stream order wins; nulls never overwrite.
    NonNull,
    /// Highest stream order wins, nulls included.
    LatestByOrder,
    /// Monotonic state: terminal states outrank non-terminal ones regardless of order.
    StateLattice,
    /// Logical OR; once true, stays true.
    TrueOnly,
    /// List of objects merged by `id`, never duplicated.
    Collection(MergeScope),
    /// Computed after merging (definition soft delete); only initialized here.
    Derived,
}

static RULES: LazyLock<HashMap<(MergeScope, &'static str), MergeRule>> = LazyLock::new(|| {
    use MergeRule::*;
    use MergeScope as S;

    let table: &[(MergeScope, &str, MergeRule)] = &[
        (S::Definition, "id", Identity),
        (S::Definition, "key", NonNull),
        (S::Definition, "version", NonNull),
        (S::Definition, "tenantId", NonNull),
        (S::Definition, "name", NonNull),
        (S::Definition, "deploymentTime", NonNull),
        (S::Definition, "xml", NonNull),
        (S::Definition, "deleted", Derived),
        (S::ProcessInstance, "id", Identity),
        (S::ProcessInstance, "processDefinitionKey", NonNull),
        (S::ProcessInstance, "processDefinitionId", NonNull),
        (S::ProcessInstance, "processDefinitionVersion", NonNull),
        (S::ProcessInstance, "businessKey", NonNull),
        (S::ProcessInstance, "tenantId", NonNull),
        (S::ProcessInstance, "state", StateLattice),
        (S::ProcessInstance, "startDate", NonNull),
        (S::ProcessInstance, "endDate", NonNull),
        (S::ProcessInstance, "duration", NonNull),
        (S::ProcessInstance, "canceled", TrueOnly),
        (S::ProcessInstance, "flowNodes", Collection(S::FlowNode)),
        (S::ProcessInstance, "incidents", Collection(S::Incident)),
        (S::ProcessInstance, "variables", Collection(S::Variable)),
        (S::ProcessInstance, "userTasks", Collection(S::UserTask)),
        (S::FlowNode, "id", Identity),
        (S::FlowNode, "state", StateLattice),
        (S::FlowNode, "canceled", TrueOnly),
        (S::Incident, "id", Identity),
        (S::Incident, "message", LatestByOrder),
        (S::Incident, "state", StateLattice),
        (S::Variable, "id", Identity),
        (S::Variable, "type", LatestByOrder),
        (S::Variable, "value", LatestByOrder),
        (S::UserTask, "id", Identity),
        (S::UserTask, "state", StateLattice),
        (S::UserTask, "assignee", LatestByOrder),
        (S::UserTask, "canceled", TrueOnly),
        (S::UserTask, "assignments", Collection(S::Assignment)),
        (S::Assignment, "id", Identity),
        (S::Tenant, "id", Identity),
        (S::Tenant, "name", LatestByOrder),
    ];

    table
        .iter()
        .map(|(scope, field, rule)| ((*scope, *field), *rule))
        .collect()
});

/// Rule for a field; unlisted fields use [`MergeRule::NonNull`].
pub fn rule_for(scope: MergeScope, field: &str) -> MergeRule {
    RULES
        .get(&(scope, field))
        .copied()
        .unwrap_or(MergeRule::NonNull)
}

/// Lattice rank of a state value within a scope.
pub fn state_rank(scope: MergeScope, state: &str) -> u8 {
    match (scope, state) {
        (MergeScope::Incident, "DELETED") => 2,
        (MergeScope::Incident, "RESOLVED") => 1,
        (MergeScope::Incident, _) => 0,
        (
            _,
            "COMPLETED" | "CANCELED" | "CANCELLED" | "TERMINATED" | "EXTERNALLY_TERMINATED"
            | "INTERNALLY_TERMINATED",
        ) => 1,
        _ => 0,
    }
}

/// Merge `incoming` into `existing` at stream order `order`.
pub fn merge_object(
    scope: MergeScope,
    existing: &Map<String, Value>,
    incoming: &Map<String, Value>,
    order: &StreamOrder,
) -> Map<String, Value> {
    let mut merged = existing.clone();
    let mut orders = match existing.get(ORDERS_FIELD) {
        Some(Value::Object(orders)) => orders.clone(),
        _ => Map::new(),
    };

    for (field, value) in incoming {
        if field == ORDERS_FIELD {
            continue;
        }
        let current = merged.get(field);
        let current_order = orders.get(field).and_then(StreamOrder::from_value);
        let newer = is_newer(order, current_order.as_ref());

        let replacement = match rule_for(scope, field) {
            MergeRule::Identity | MergeRule::Derived => match current {
                None | Some(Value::Null) => Some(value.clone()),
                Some(_) => None,
            },
            MergeRule::NonNull => match current {
                _ if value.is_null() => None,
                None | Some(Value::Null) => Some(value.clone()),
                Some(_) => newer.then(|| value.clone()),
            },
            MergeRule::LatestByOrder => match current {
                None => Some(value.clone()),
                Some(_) => newer.then(|| value.clone()),
            },
            MergeRule::StateLattice => match current {
                _ if value.is_null() => None,
                None | Some(Value::Null) => Some(value.clone()),
                Some(current) => {
                    let ord = rank(scope, value)
                        .cmp(&rank(scope, current))
                        .then_with(|| match &current_order {
                            Some(current_order) => order.cmp(current_order),
                            None => Ordering::Greater,
                        })
                        .then_with(|| compare_values(value, current));
                    (ord == Ordering::Greater).then(|| value.clone())
                }
            },
            MergeRule::TrueOnly => {
                let was = current.and_then(Value::as_bool).unwrap_or(false);
                let now = was || value.as_bool().unwrap_or(false);
                match current {
                    Some(Value::Bool(b)) if *b == now => None,
                    _ => Some(Value::Bool(now)),
                }
            }
            MergeRule::Collection(child) => {
                let merged_list = merge_collection(child, current, value, order);
                (current != Some(&merged_list)).then_some(merged_list)
            }
        };

        if let Some(replacement) = replacement {
            merged.insert(field.clone(), replacement);
            if tracks_order(rule_for(scope, field)) {
                orders.insert(field.clone(), order.to_value());
            }
        }
    }

    if !orders.is_empty() {
        merged.insert(ORDERS_FIELD.to_string(), Value::Object(orders));
    }
    merged
}

fn tracks_order(rule: MergeRule) -> bool {
    matches!(
        rule,
        MergeRule::NonNull | MergeRule::LatestByOrder | MergeRule::StateLattice
    )
}

fn is_newer(order: &StreamOrder, current: Option<&StreamOrder>) -> bool {
    current.is_none_or(|current| order > current)
}

fn rank(scope: MergeScope, value: &Value) -> u8 {
    value.as_str().map(|s| state_rank(scope, s)).unwrap_or(0)
}

fn entry_key(entry: &Value) -> String {
    match entry.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => entry.to_string(),
    }
}

/// Merge two lists of objects by `id`. The result is ordered by id.
pub fn merge_collection(
    scope: MergeScope,
    existing: Option<&Value>,
    incoming: &Value,
    order: &StreamOrder,
) -> Value {
    let mut entries: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    if let Some(Value::Array(items)) = existing {
        for item in items {
            if let Value::Object(object) = item {
                entries.insert(entry_key(item), object.clone());
            }
        }
    }

    if let Value::Array(items) = incoming {
        for item in items {
            let Value::Object(object) = item else {
                continue;
            };
            let key = entry_key(item);
            let base = entries.remove(&key).unwrap_or_default();
            entries.insert(key, merge_object(scope, &base, object, order));
        }
    }

    Value::Array(entries.into_values().map(Value::Object).collect())
}

/// Strip bookkeeping fields, recursively. Used when comparing or exposing documents.
pub fn without_orders(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() != ORDERS_FIELD)
                .map(|(k, v)| (k.clone(), without_orders(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(without_orders).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn apply(scope: MergeScope, steps: &[(Value, i64)]) -> Value {
        let mut doc = Map::new();
        for (fields, order) in steps {
            doc = merge_object(scope, &doc, &obj(fields.clone()), &StreamOrder::from(*order));
        }
        without_orders(&Value::Object(doc))
    }

    #[test]
    fn test_unlisted_field_defaults_to_non_null() {
        assert_eq!(rule_for(MergeScope::FlowNode, "activityType"), MergeRule::NonNull);
        assert_eq!(rule_for(MergeScope::ProcessInstance, "canceled"), MergeRule::TrueOnly);
    }

    #[test]
    fn test_terminal_state_never_overwritten_by_running() {
        let forward = apply(
            MergeScope::ProcessInstance,
            &[(json!({"state": "ACTIVE"}), 1), (json!({"state": "COMPLETED"}), 2)],
        );
        let late_running = apply(
            MergeScope::ProcessInstance,
            &[(json!({"state": "COMPLETED"}), 2), (json!({"state": "ACTIVE"}), 3)],
        );
        assert_eq!(forward["state"], "COMPLETED");
        assert_eq!(late_running["state"], "COMPLETED");
    }

    #[test]
    fn test_incident_deleted_outranks_resolved() {
        let doc = apply(
            MergeScope::Incident,
            &[(json!({"state": "DELETED"}), 1), (json!({"state": "RESOLVED"}), 5)],
        );
        assert_eq!(doc["state"], "DELETED");
    }

    #[test]
    fn test_running_fragment_never_nulls_end_date() {
        let doc = apply(
            MergeScope::ProcessInstance,
            &[
                (json!({"endDate": "2024-01-02T00:00:00Z"}), 5),
                (json!({"endDate": null}), 9),
            ],
        );
        assert_eq!(doc["endDate"], "2024-01-02T00:00:00Z");
    }

    #[test]
    fn test_canceled_only_turns_true() {
        let doc = apply(
            MergeScope::FlowNode,
            &[(json!({"canceled": true}), 1), (json!({"canceled": false}), 2)],
        );
        assert_eq!(doc["canceled"], true);

        let doc = apply(MergeScope::FlowNode, &[(json!({"canceled": false}), 1)]);
        assert_eq!(doc["canceled"], false);
    }

    #[test]
    fn test_latest_by_order_allows_null() {
        let doc = apply(
            MergeScope::UserTask,
            &[(json!({"assignee": "kermit"}), 1), (json!({"assignee": null}), 2)],
        );
        assert_eq!(doc["assignee"], Value::Null);

        let doc = apply(
            MergeScope::UserTask,
            &[(json!({"assignee": null}), 2), (json!({"assignee": "kermit"}), 1)],
        );
        assert_eq!(doc["assignee"], Value::Null);
    }

    #[test]
    fn test_merge_is_idempotent_and_order_independent() {
        let steps = [
            (json!({"id": "pi", "state": "ACTIVE", "flowNodes": [{"id": "a", "state": "ACTIVE"}]}), 1),
            (json!({"id": "pi", "flowNodes": [{"id": "a", "state": "COMPLETED", "endDate": "x"}]}), 2),
            (json!({"id": "pi", "flowNodes": [{"id": "b", "state": "ACTIVE"}], "canceled": true}), 3),
        ];
        let forward = apply(MergeScope::ProcessInstance, &steps);

        let mut reversed = steps.to_vec();
        reversed.reverse();
        let backward = apply(MergeScope::ProcessInstance, &reversed);

        let mut twice = steps.to_vec();
        twice.extend(steps.iter().cloned());
        let repeated = apply(MergeScope::ProcessInstance, &twice);

        assert_eq!(forward, backward);
        assert_eq!(forward, repeated);
        assert_eq!(forward["flowNodes"].as_array().unwrap().len(), 2);
        assert_eq!(forward["flowNodes"][0]["state"], "COMPLETED");
    }

    #[test]
    fn test_redelivery_leaves_document_unchanged() {
        let fields = obj(json!({"id": "pi", "state": "ACTIVE", "variables": [{"id": "x", "value": 1}]}));
        let order = StreamOrder::new(7, "pi");
        let once = merge_object(MergeScope::ProcessInstance, &Map::new(), &fields, &order);
        let twice = merge_object(MergeScope::ProcessInstance, &once, &fields, &order);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_same_instant_updates_apply_in_id_order() {
        let at = 1_700_000_000_000_000_000;
        let first = StreamOrder::new(at, "vu-1");
        let second = StreamOrder::new(at, "vu-2");
        let high = json!([{"id": "v", "value": 100}]);
        let low = json!([{"id": "v", "value": 5}]);

        let forward = merge_collection(MergeScope::Variable, None, &high, &first);
        let forward = merge_collection(MergeScope::Variable, Some(&forward), &low, &second);
        assert_eq!(without_orders(&forward)[0]["value"], 5);

        let backward = merge_collection(MergeScope::Variable, None, &low, &second);
        let backward = merge_collection(MergeScope::Variable, Some(&backward), &high, &first);
        assert_eq!(forward, backward);
    }
}
