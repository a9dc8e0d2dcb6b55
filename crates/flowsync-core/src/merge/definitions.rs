// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Definition soft delete.
//!
//! A definition's slot is `(key, version, tenantId)`. When several definition
//! documents share a slot (the same model redeployed under a new id), the one
//! with the latest `deploymentTime` survives and the others are marked
//! `deleted`. Ties are broken by id so every replica picks the same winner.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::persistence::{DocumentQuery, Filter};

/// Slot identity of a definition body, `None` when it has no key.
pub fn slot_of(body: &Value) -> Option<(String, String, String)> {
    let key = body.get("key")?.as_str()?.to_string();
    let version = match body.get("version") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let tenant = match body.get("tenantId") {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    };
    Some((key, version, tenant))
}

/// Deployment instant of a definition body.
///
/// Accepts RFC 3339 and the engine's `+hhmm` offset form; anything else is
/// treated as unknown and loses to any parsed time.
pub fn deployment_time(body: &Value) -> Option<DateTime<Utc>> {
    let raw = body.get("deploymentTime")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

fn deployed_later(a: (&str, &Value), b: (&str, &Value)) -> Ordering {
    deployment_time(a.1)
        .cmp(&deployment_time(b.1))
        .then_with(|| a.0.cmp(b.0))
}

/// Mark every definition but the latest deployed one per slot as deleted.
///
/// Returns the ids whose `deleted` flag changed.
pub fn resolve_soft_deletes<'a, I>(docs: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, &'a mut Value)>,
{
    let mut slots: HashMap<(String, String, String), Vec<(&'a str, &'a mut Value)>> =
        HashMap::new();
    for (id, body) in docs {
        if let Some(slot) = slot_of(body) {
            slots.entry(slot).or_default().push((id, body));
        }
    }

    let mut changed = Vec::new();
    for (_, members) in slots {
        let Some(winner) = members
            .iter()
            .max_by(|a, b| deployed_later((a.0, &*a.1), (b.0, &*b.1)))
            .map(|(id, _)| *id)
        else {
            continue;
        };

        for (id, body) in members {
            let deleted = id != winner;
            if body.get("deleted").and_then(Value::as_bool) != Some(deleted)
                && let Value::Object(map) = body
            {
                map.insert("deleted".to_string(), Value::Bool(deleted));
                changed.push(id.to_string());
            }
        }
    }
    changed.sort();
    changed
}

/// Query for every stored definition sharing one of `keys`.
pub fn same_key_query(keys: Vec<String>) -> DocumentQuery {
    DocumentQuery::new().filter(Filter::FieldIn {
        field: "key".to_string(),
        values: keys.into_iter().map(Value::String).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(id: &str, version: i64, tenant: Option<&str>, deployed: &str) -> (String, Value) {
        (
            id.to_string(),
            json!({
                "id": id,
                "key": "order",
                "version": version,
                "tenantId": tenant,
                "deploymentTime": deployed,
                "deleted": false
            }),
        )
    }

    fn resolve(docs: &mut [(String, Value)]) -> Vec<String> {
        resolve_soft_deletes(docs.iter_mut().map(|(id, body)| (id.as_str(), body)))
    }

    #[test]
    fn test_latest_deployment_wins_per_slot() {
        let mut docs = vec![
            def("d1", 1, None, "2024-01-01T00:00:00Z"),
            def("d2", 1, None, "2024-02-01T00:00:00Z"),
            def("d3", 2, None, "2023-01-01T00:00:00Z"),
            def("d4", 1, Some("t1"), "2022-01-01T00:00:00Z"),
        ];
        let changed = resolve(&mut docs);
        assert_eq!(changed, vec!["d1".to_string()]);

        let deleted: Vec<bool> = docs.iter().map(|(_, b)| b["deleted"].as_bool().unwrap()).collect();
        assert_eq!(deleted, vec![true, false, false, false]);
    }

    #[test]
    fn test_multiple_redeployments_keep_exactly_one() {
        let mut docs = vec![
            def("a", 1, None, "2024-01-01T00:00:00Z"),
            def("b", 1, None, "2024-01-03T00:00:00Z"),
            def("c", 1, None, "2024-01-02T00:00:00Z"),
        ];
        resolve(&mut docs);
        let survivors: Vec<&str> = docs
            .iter()
            .filter(|(_, b)| b["deleted"] == false)
            .map(|(id, _)| id.as_str())
            .collect();
        assert_eq!(survivors, vec!["b"]);
    }

    #[test]
    fn test_resurrects_winner_and_is_stable() {
        let mut docs = vec![
            def("old", 1, None, "2024-01-01T00:00:00Z"),
            def("new", 1, None, "2024-01-02T00:00:00Z"),
        ];
        docs[1].1["deleted"] = json!(true);
        let changed = resolve(&mut docs);
        assert_eq!(changed, vec!["new".to_string(), "old".to_string()]);
        assert!(resolve(&mut docs).is_empty());
    }

    fn survivors(docs: &[(String, Value)]) -> Vec<&str> {
        docs.iter()
            .filter(|(_, b)| b["deleted"] == false)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    #[test]
    fn test_fractional_seconds_deploy_later() {
        let mut docs = vec![
            def("d-1", 1, None, "2024-01-01T00:00:00Z"),
            def("d-2", 1, None, "2024-01-01T00:00:00.500Z"),
        ];
        resolve(&mut docs);
        assert_eq!(survivors(&docs), vec!["d-2"]);
    }

    #[test]
    fn test_offsets_compare_as_instants() {
        // 10:00+02:00 is 08:00Z, an hour before d-2.
        let mut docs = vec![
            def("d-1", 1, None, "2024-01-01T10:00:00+02:00"),
            def("d-2", 1, None, "2024-01-01T09:00:00Z"),
        ];
        resolve(&mut docs);
        assert_eq!(survivors(&docs), vec!["d-2"]);

        let mut docs = vec![
            def("d-1", 1, None, "2024-01-01T10:00:00.000+0200"),
            def("d-2", 1, None, "2024-01-01T07:30:00.000+0000"),
        ];
        resolve(&mut docs);
        assert_eq!(survivors(&docs), vec!["d-1"]);
    }

    #[test]
    fn test_unparseable_time_loses_and_ties_fall_back_to_id() {
        let mut docs = vec![
            def("d-1", 1, None, "2024-01-01T00:00:00Z"),
            def("d-9", 1, None, "yesterday"),
        ];
        resolve(&mut docs);
        assert_eq!(survivors(&docs), vec!["d-1"]);

        let mut docs = vec![
            def("d-b", 1, None, "2024-01-01T00:00:00Z"),
            def("d-a", 1, None, "2024-01-01T01:00:00+01:00"),
        ];
        resolve(&mut docs);
        assert_eq!(survivors(&docs), vec!["d-b"]);
    }

    #[test]
    fn test_slot_of_normalizes_version_and_tenant() {
        assert_eq!(
            slot_of(&json!({"key": "k", "version": 3})),
            Some(("k".into(), "3".into(), String::new()))
        );
        assert_eq!(slot_of(&json!({"version": 3})), None);
    }
}
