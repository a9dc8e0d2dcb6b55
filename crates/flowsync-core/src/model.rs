// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared vocabulary: entity types, data source identity and raw records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upstream entity stream imported by one mediator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    /// Deployed process definitions.
    ProcessDefinition,
    /// Deployed decision definitions.
    DecisionDefinition,
    /// Process instance lifecycle records.
    ProcessInstance,
    /// Flow node (activity) instances.
    Activity,
    /// Incidents raised on process instances.
    Incident,
    /// Process variable updates.
    Variable,
    /// User task lifecycle and assignment records.
    UserTask,
    /// Tenants known to the upstream source.
    Tenant,
}

impl EntityType {
    /// Every entity type, in the order mediators are scheduled.
    pub const ALL: [EntityType; 8] = [
        EntityType::Tenant,
        EntityType::ProcessDefinition,
        EntityType::DecisionDefinition,
        EntityType::ProcessInstance,
        EntityType::Activity,
        EntityType::Incident,
        EntityType::Variable,
        EntityType::UserTask,
    ];

    /// Stable string form used in checkpoint ids, file names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessDefinition => "process-definition",
            Self::DecisionDefinition => "decision-definition",
            Self::ProcessInstance => "process-instance",
            Self::Activity => "activity",
            Self::Incident => "incident",
            Self::Variable => "variable",
            Self::UserTask => "user-task",
            Self::Tenant => "tenant",
        }
    }

    /// Whether this stream produces definition documents.
    pub fn is_definition(&self) -> bool {
        matches!(self, Self::ProcessDefinition | Self::DecisionDefinition)
    }

    /// Definition headers are paged first; their model details are looked up by id.
    pub fn needs_detail_lookup(&self) -> bool {
        self.is_definition()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| format!("unknown entity type '{}'", s))
    }
}

/// Identifier of a configured data source (engine alias or log partition).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataSourceId(pub String);

impl DataSourceId {
    /// Create a new data source identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the inner string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataSourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DataSourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// How a data source exposes its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// BPM engine history paged by timestamp cursor.
    Engine,
    /// Exported event log addressed by position and sequence.
    Log,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine => f.write_str("engine"),
            Self::Log => f.write_str("log"),
        }
    }
}

/// One raw upstream record as delivered by a source adapter.
///
/// Engine sources fill `timestamp`; log sources fill `position` and, once the
/// exporter assigns them, `sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    /// Upstream record id, unique within its entity stream.
    pub id: String,
    /// Cursor timestamp for engine sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Log position for log sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    /// Log sequence, present only on newer exports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
    /// Tenant the record belongs to, if the source is multi-tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Entity-specific body.
    #[serde(default)]
    pub payload: Value,
}

impl SourceRecord {
    /// Engine-style record keyed by timestamp.
    pub fn at_time(id: impl Into<String>, timestamp: DateTime<Utc>, payload: Value) -> Self {
        Self {
            id: id.into(),
            timestamp: Some(timestamp),
            position: None,
            sequence: None,
            tenant_id: None,
            payload,
        }
    }

    /// Log-style record keyed by position and optional sequence.
    pub fn at_position(
        id: impl Into<String>,
        position: i64,
        sequence: Option<i64>,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp: None,
            position: Some(position),
            sequence,
            tenant_id: None,
            payload,
        }
    }

    /// Attach a tenant id.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Intra-stream order used by last-writer-wins merge rules.
    ///
    /// Log records order by position; engine records by timestamp at full
    /// precision. Both break ties by record id.
    pub fn stream_order(&self) -> StreamOrder {
        let at = match (self.position, self.timestamp) {
            (Some(position), _) => position,
            (None, Some(ts)) => ts
                .timestamp_nanos_opt()
                .unwrap_or_else(|| ts.timestamp_micros().saturating_mul(1_000)),
            (None, None) => 0,
        };
        StreamOrder::new(at, self.id.clone())
    }
}

/// Place of a record in its entity stream: `(at, id)`, compared in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamOrder {
    /// Log position, or engine timestamp in nanoseconds since the epoch.
    pub at: i64,
    /// Record id.
    pub id: String,
}

impl StreamOrder {
    /// Order of record `id` at `at`.
    pub fn new(at: i64, id: impl Into<String>) -> Self {
        Self { at, id: id.into() }
    }

    /// Stored form, `[at, id]`.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![Value::from(self.at), Value::String(self.id.clone())])
    }

    /// Read the stored form back.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value.as_array()?.as_slice() {
            [at, id] => Some(Self::new(at.as_i64()?, id.as_str()?)),
            _ => None,
        }
    }
}

impl From<i64> for StreamOrder {
    fn from(at: i64) -> Self {
        Self::new(at, "")
    }
}
