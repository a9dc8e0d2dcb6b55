// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed document store.

use std::path::Path;

use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use super::{
    BulkItemResult, BulkResponse, DEFAULT_MAX_CLAUSE_COUNT, DocumentQuery, DocumentStore,
    DocumentWrite, Filter, ItemOutcome, StoreError, StoredDocument, check_clause_limit,
    next_version,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    version: i64,
    body: String,
}

impl DocumentRow {
    fn into_document(self) -> Result<StoredDocument, StoreError> {
        Ok(StoredDocument {
            id: self.id,
            version: stored_version(self.version),
            body: serde_json::from_str(&self.body)?,
        })
    }
}

/// Versions are non-negative; a corrupt negative value reads as zero.
fn stored_version(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

fn column_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

/// SQLite-backed document store.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
    max_clause_count: usize,
}

impl SqliteDocumentStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool, max_clause_count: usize) -> Self {
        Self {
            pool,
            max_clause_count,
        }
    }

    /// Connect to a SQLite URL and run migrations.
    ///
    /// In-memory URLs get a single connection so every query sees the same database.
    pub async fn connect(url: &str, max_clause_count: usize) -> Result<Self, StoreError> {
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self::new(pool, max_clause_count))
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// ```ignore
    /// let store = SqliteDocumentStore::from_path(".data/flowsync.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, DEFAULT_MAX_CLAUSE_COUNT).await
    }

    /// Override the clause limit enforced by searches.
    pub fn with_max_clause_count(mut self, max_clause_count: usize) -> Self {
        self.max_clause_count = max_clause_count;
        self
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn json_path(field: &str) -> String {
    format!("$.{}", field)
}

fn push_field(builder: &mut QueryBuilder<'_, Sqlite>, field: &str) {
    builder.push("json_extract(body, ");
    builder.push_bind(json_path(field));
    builder.push(")");
}

fn push_value(builder: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Bool(b) => {
            builder.push_bind(i64::from(*b));
        }
        Value::Number(n) => match n.as_i64() {
            Some(i) => {
                builder.push_bind(i);
            }
            None => {
                builder.push_bind(n.as_f64().unwrap_or_default());
            }
        },
        Value::String(s) => {
            builder.push_bind(s.clone());
        }
        other => {
            builder.push_bind(other.to_string());
        }
    }
}

fn push_value_list(builder: &mut QueryBuilder<'_, Sqlite>, values: &[&Value]) {
    builder.push("(");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        push_value(builder, value);
    }
    builder.push(")");
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &Filter) {
    match filter {
        Filter::Ids(ids) => {
            if ids.is_empty() {
                builder.push("0");
                return;
            }
            builder.push("id IN (");
            for (i, id) in ids.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push_bind(id.clone());
            }
            builder.push(")");
        }
        Filter::FieldIn { field, values } => {
            let (nulls, present): (Vec<&Value>, Vec<&Value>) =
                values.iter().partition(|v| v.is_null());
            if present.is_empty() && nulls.is_empty() {
                builder.push("0");
                return;
            }
            builder.push("(");
            if !present.is_empty() {
                push_field(builder, field);
                builder.push(" IN ");
                push_value_list(builder, &present);
            }
            if !nulls.is_empty() {
                if !present.is_empty() {
                    builder.push(" OR ");
                }
                push_field(builder, field);
                builder.push(" IS NULL");
            }
            builder.push(")");
        }
        Filter::FieldNotIn { field, values } => {
            let present: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
            if present.is_empty() {
                builder.push("1");
                return;
            }
            builder.push("(");
            push_field(builder, field);
            builder.push(" IS NULL OR ");
            push_field(builder, field);
            builder.push(" NOT IN ");
            push_value_list(builder, &present);
            builder.push(")");
        }
        Filter::FieldEquals { field, value } => {
            push_field(builder, field);
            if value.is_null() {
                builder.push(" IS NULL");
            } else {
                builder.push(" = ");
                push_value(builder, value);
            }
        }
    }
}

#[async_trait::async_trait]
impl DocumentStore for SqliteDocumentStore {
    fn max_clause_count(&self) -> usize {
        self.max_clause_count
    }

    async fn ensure_group(&self, group: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO document_groups (name, created_at)
            VALUES (?, CURRENT_TIMESTAMP)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(group)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn group_exists(&self, group: &str) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_groups WHERE name = ?")
            .bind(group)
            .fetch_one(&self.pool)
            .await?;

        Ok(count > 0)
    }

    async fn list_groups(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT name FROM document_groups
            WHERE substr(name, 1, length(?)) = ?
            ORDER BY name
            "#,
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(names)
    }

    async fn search(
        &self,
        group: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        check_clause_limit(query, self.max_clause_count)?;

        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT id, version, body FROM documents WHERE grp = ");
        builder.push_bind(group.to_string());
        for filter in &query.filters {
            builder.push(" AND ");
            push_filter(&mut builder, filter);
        }

        match &query.sort {
            Some(sort) => {
                builder.push(" ORDER BY ");
                push_field(&mut builder, &sort.field);
                builder.push(if sort.descending { " DESC" } else { " ASC" });
                builder.push(", id ASC");
            }
            None => {
                builder.push(" ORDER BY id ASC");
            }
        }

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = builder
            .build_query_as::<DocumentRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(DocumentRow::into_document).collect()
    }

    async fn bulk_upsert(
        &self,
        group: &str,
        writes: Vec<DocumentWrite>,
    ) -> Result<BulkResponse, StoreError> {
        if !self.group_exists(group).await? {
            return Err(StoreError::GroupNotFound(group.to_string()));
        }

        let mut tx = self.pool.begin().await?;
        let mut items = Vec::with_capacity(writes.len());

        for write in writes {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT version FROM documents WHERE grp = ? AND id = ?")
                    .bind(group)
                    .bind(&write.id)
                    .fetch_optional(&mut *tx)
                    .await?;

            let outcome = match next_version(write.expected_version, current.map(stored_version)) {
                Ok(version) => {
                    let body = serde_json::to_string(&write.body)?;
                    sqlx::query(
                        r#"
                        INSERT INTO documents (grp, id, version, body, updated_at)
                        VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
                        ON CONFLICT(grp, id) DO UPDATE SET
                            version = excluded.version,
                            body = excluded.body,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(group)
                    .bind(&write.id)
                    .bind(column_version(version))
                    .bind(body)
                    .execute(&mut *tx)
                    .await?;
                    ItemOutcome::Written { version }
                }
                Err(outcome) => outcome,
            };

            items.push(BulkItemResult {
                id: write.id,
                outcome,
            });
        }

        tx.commit().await?;
        debug!(group = %group, items = items.len(), "Bulk upsert committed");

        Ok(BulkResponse { items })
    }
}
