// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Raw upstream records to document fragments. Pure, no I/O.
//!
//! | Entity type | Group | Document id | Fields |
//! |-------------|-------|-------------|--------|
//! | process/decision definition | `process-definition` / `decision-definition` | definition id | key, version, tenantId, name, deploymentTime, xml, deleted |
//! | process instance | `process-instance-<key>` | instance id | scalars and `state` |
//! | activity | `process-instance-<key>` | instance id | `flowNodes[]` |
//! | incident | `process-instance-<key>` | instance id | `incidents[]` |
//! | variable | `process-instance-<key>` | instance id | `variables[]` |
//! | user task | `process-instance-<key>` | instance id | `userTasks[]` with `assignments[]` |
//! | tenant | `tenant` | tenant id | name |

use serde_json::{Map, Value};
use thiserror::Error;

use crate::fetcher::FetchPage;
use crate::merge::MergeScope;
use crate::model::{EntityType, SourceRecord, StreamOrder};

/// Group of process definition documents.
pub const PROCESS_DEFINITION_GROUP: &str = "process-definition";
/// Group of decision definition documents.
pub const DECISION_DEFINITION_GROUP: &str = "decision-definition";
/// Group of tenant documents.
pub const TENANT_GROUP: &str = "tenant";
/// Prefix of the per-definition-key instance groups.
pub const PROCESS_INSTANCE_GROUP_PREFIX: &str = "process-instance-";

/// Group holding the instances of one process definition key.
pub fn process_instance_group(definition_key: &str) -> String {
    format!("{}{}", PROCESS_INSTANCE_GROUP_PREFIX, definition_key.to_lowercase())
}

/// Malformed upstream record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TransformError {
    /// A required payload field is absent or null.
    #[error("{entity_type} record '{record_id}' is missing '{field}'")]
    MissingField {
        /// Stream of the record.
        entity_type: EntityType,
        /// Upstream id.
        record_id: String,
        /// Missing field.
        field: &'static str,
    },

    /// A payload field has the wrong JSON type.
    #[error("{entity_type} record '{record_id}' has invalid '{field}': expected {expected}")]
    InvalidField {
        /// Stream of the record.
        entity_type: EntityType,
        /// Upstream id.
        record_id: String,
        /// Offending field.
        field: &'static str,
        /// Expected shape.
        expected: &'static str,
    },
}

/// Per data source transform settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformContext {
    /// Tenant assigned to records that carry none.
    pub default_tenant_id: Option<String>,
}

/// Partial document state derived from one upstream record.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Target group.
    pub group: String,
    /// Target document id.
    pub document_id: String,
    /// Merge scope of the document root.
    pub scope: MergeScope,
    /// Intra-stream order used by last-writer-wins rules.
    pub order: StreamOrder,
    /// Fields to merge into the document.
    pub fields: Map<String, Value>,
}

/// Transform every record of a page, in page order.
pub fn transform_page(page: &FetchPage, ctx: &TransformContext) -> Result<Vec<Fragment>, TransformError> {
    page.records
        .iter()
        .map(|record| transform_record(page.entity_type, record, ctx))
        .collect()
}

/// Transform one record.
pub fn transform_record(
    entity_type: EntityType,
    record: &SourceRecord,
    ctx: &TransformContext,
) -> Result<Fragment, TransformError> {
    let reader = PayloadReader {
        entity_type,
        record,
    };
    match entity_type {
        EntityType::ProcessDefinition => definition(&reader, ctx, PROCESS_DEFINITION_GROUP),
        EntityType::DecisionDefinition => definition(&reader, ctx, DECISION_DEFINITION_GROUP),
        EntityType::ProcessInstance => process_instance(&reader, ctx),
        EntityType::Activity => {
            let mut entry = Map::new();
            entry.insert("id".into(), Value::String(record.id.clone()));
            reader.copy(&mut entry, &["activityId", "activityType", "startDate", "endDate"]);
            reader.copy_state(&mut entry)?;
            reader.copy_flag(&mut entry, "canceled")?;
            instance_child(&reader, ctx, "flowNodes", entry)
        }
        EntityType::Incident => {
            let mut entry = Map::new();
            entry.insert("id".into(), Value::String(record.id.clone()));
            reader.copy(
                &mut entry,
                &["incidentType", "message", "activityId", "createTime", "endTime"],
            );
            reader.copy_state(&mut entry)?;
            instance_child(&reader, ctx, "incidents", entry)
        }
        EntityType::Variable => {
            let name = reader.require_str("name")?;
            let id = reader.optional_str("variableId")?.unwrap_or_else(|| name.clone());
            let mut entry = Map::new();
            entry.insert("id".into(), Value::String(id));
            entry.insert("name".into(), Value::String(name));
            reader.copy(&mut entry, &["type"]);
            entry.insert(
                "value".into(),
                record.payload.get("value").cloned().unwrap_or(Value::Null),
            );
            instance_child(&reader, ctx, "variables", entry)
        }
        EntityType::UserTask => {
            let id = reader
                .optional_str("userTaskId")?
                .unwrap_or_else(|| record.id.clone());
            let mut entry = Map::new();
            entry.insert("id".into(), Value::String(id));
            reader.copy(&mut entry, &["name", "activityId", "assignee", "startDate", "endDate"]);
            reader.copy_state(&mut entry)?;
            reader.copy_flag(&mut entry, "canceled")?;
            match record.payload.get("assignment") {
                None | Some(Value::Null) => {}
                Some(Value::Object(assignment)) => {
                    let mut assignment = assignment.clone();
                    assignment.insert("id".into(), Value::String(record.id.clone()));
                    entry.insert(
                        "assignments".into(),
                        Value::Array(vec![Value::Object(assignment)]),
                    );
                }
                Some(_) => return Err(reader.invalid("assignment", "an object")),
            }
            instance_child(&reader, ctx, "userTasks", entry)
        }
        EntityType::Tenant => {
            let mut fields = Map::new();
            fields.insert("id".into(), Value::String(record.id.clone()));
            reader.copy(&mut fields, &["name"]);
            Ok(Fragment {
                group: TENANT_GROUP.to_string(),
                document_id: record.id.clone(),
                scope: MergeScope::Tenant,
                order: record.stream_order(),
                fields,
            })
        }
    }
}

fn tenant_of(reader: &PayloadReader<'_>, ctx: &TransformContext) -> Result<Value, TransformError> {
    let tenant = match &reader.record.tenant_id {
        Some(tenant) => Some(tenant.clone()),
        None => reader.optional_str("tenantId")?,
    };
    Ok(tenant
        .or_else(|| ctx.default_tenant_id.clone())
        .map(Value::String)
        .unwrap_or(Value::Null))
}

fn definition(
    reader: &PayloadReader<'_>,
    ctx: &TransformContext,
    group: &str,
) -> Result<Fragment, TransformError> {
    let record = reader.record;
    let key = reader.require_str("key")?;
    let version = reader.require("version")?;
    if !(version.is_number() || version.is_string()) {
        return Err(reader.invalid("version", "a number or string"));
    }

    let mut fields = Map::new();
    fields.insert("id".into(), Value::String(record.id.clone()));
    fields.insert("key".into(), Value::String(key));
    fields.insert("version".into(), version.clone());
    fields.insert("tenantId".into(), tenant_of(reader, ctx)?);
    reader.copy(&mut fields, &["name", "xml"]);

    let deployment_time = match record.payload.get("deploymentTime") {
        Some(value) if !value.is_null() => value.clone(),
        _ => record
            .timestamp
            .map(|ts| Value::String(ts.to_rfc3339()))
            .unwrap_or(Value::Null),
    };
    fields.insert("deploymentTime".into(), deployment_time);
    fields.insert("deleted".into(), Value::Bool(false));

    Ok(Fragment {
        group: group.to_string(),
        document_id: record.id.clone(),
        scope: MergeScope::Definition,
        order: record.stream_order(),
        fields,
    })
}

fn process_instance(
    reader: &PayloadReader<'_>,
    ctx: &TransformContext,
) -> Result<Fragment, TransformError> {
    let record = reader.record;
    let key = reader.require_str("processDefinitionKey")?;

    let mut fields = Map::new();
    fields.insert("id".into(), Value::String(record.id.clone()));
    fields.insert("processDefinitionKey".into(), Value::String(key.clone()));
    fields.insert("tenantId".into(), tenant_of(reader, ctx)?);
    reader.copy(
        &mut fields,
        &[
            "processDefinitionId",
            "processDefinitionVersion",
            "businessKey",
            "startDate",
            "endDate",
            "duration",
        ],
    );
    reader.copy_state(&mut fields)?;
    reader.copy_flag(&mut fields, "canceled")?;

    Ok(Fragment {
        group: process_instance_group(&key),
        document_id: record.id.clone(),
        scope: MergeScope::ProcessInstance,
        order: record.stream_order(),
        fields,
    })
}

fn instance_child(
    reader: &PayloadReader<'_>,
    ctx: &TransformContext,
    collection: &str,
    entry: Map<String, Value>,
) -> Result<Fragment, TransformError> {
    let instance_id = reader.require_str("processInstanceId")?;
    let key = reader.require_str("processDefinitionKey")?;

    let mut fields = Map::new();
    fields.insert("id".into(), Value::String(instance_id.clone()));
    fields.insert("processDefinitionKey".into(), Value::String(key.clone()));
    fields.insert("tenantId".into(), tenant_of(reader, ctx)?);
    fields.insert(collection.into(), Value::Array(vec![Value::Object(entry)]));

    Ok(Fragment {
        group: process_instance_group(&key),
        document_id: instance_id,
        scope: MergeScope::ProcessInstance,
        order: reader.record.stream_order(),
        fields,
    })
}

struct PayloadReader<'a> {
    entity_type: EntityType,
    record: &'a SourceRecord,
}

impl PayloadReader<'_> {
    fn missing(&self, field: &'static str) -> TransformError {
        TransformError::MissingField {
            entity_type: self.entity_type,
            record_id: self.record.id.clone(),
            field,
        }
    }

    fn invalid(&self, field: &'static str, expected: &'static str) -> TransformError {
        TransformError::InvalidField {
            entity_type: self.entity_type,
            record_id: self.record.id.clone(),
            field,
            expected,
        }
    }

    fn require(&self, field: &'static str) -> Result<&Value, TransformError> {
        match self.record.payload.get(field) {
            Some(value) if !value.is_null() => Ok(value),
            _ => Err(self.missing(field)),
        }
    }

    fn require_str(&self, field: &'static str) -> Result<String, TransformError> {
        self.optional_str(field)?.ok_or_else(|| self.missing(field))
    }

    fn optional_str(&self, field: &'static str) -> Result<Option<String>, TransformError> {
        match self.record.payload.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(self.invalid(field, "a string")),
        }
    }

    /// Copy present fields verbatim; absent fields stay absent.
    fn copy(&self, target: &mut Map<String, Value>, fields: &[&str]) {
        for field in fields {
            if let Some(value) = self.record.payload.get(*field) {
                target.insert((*field).to_string(), value.clone());
            }
        }
    }

    fn copy_state(&self, target: &mut Map<String, Value>) -> Result<(), TransformError> {
        if let Some(state) = self.optional_str("state")? {
            target.insert("state".into(), Value::String(state.to_uppercase()));
        }
        Ok(())
    }

    fn copy_flag(&self, target: &mut Map<String, Value>, field: &'static str) -> Result<(), TransformError> {
        match self.record.payload.get(field) {
            None | Some(Value::Null) => Ok(()),
            Some(Value::Bool(b)) => {
                target.insert(field.to_string(), Value::Bool(*b));
                Ok(())
            }
            Some(_) => Err(self.invalid(field, "a boolean")),
        }
    }
}
