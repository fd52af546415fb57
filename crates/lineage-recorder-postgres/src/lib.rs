//! PostgreSQL implementation of the lineage status recorder.
//!
//! Stores the append-only status log and the message dependency graph that
//! the status recording stage produces.
//!
//! # Features
//!
//! - Append-only status history per message
//! - Idempotent dependency edges (`ON CONFLICT DO NOTHING`)
//! - Transitive status updates over the dependency graph with a recursive CTE
//! - Configurable schema
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE message_statuses (
//!     id BIGSERIAL PRIMARY KEY,
//!     message_type TEXT NOT NULL,
//!     message_id TEXT NOT NULL,
//!     status TEXT NOT NULL,
//!     caused_by TEXT[] NOT NULL DEFAULT '{}',
//!     data JSONB,
//!     occurred_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_message_statuses_message ON message_statuses (message_id, occurred_at);
//!
//! CREATE TABLE message_dependencies (
//!     dependent_id TEXT NOT NULL,
//!     parent_id TEXT NOT NULL,
//!     recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (dependent_id, parent_id)
//! );
//!
//! CREATE INDEX idx_message_dependencies_parent ON message_dependencies (parent_id);
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use lineage_recorder_postgres::PgStatusRecorder;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let recorder = PgStatusRecorder::new(pool);
//! recorder.migrate().await?;
//!
//! let commands = BusBuilder::new("commands")
//!     .recorder(Arc::new(recorder))
//!     .handlers(handlers)
//!     .build_command_bus();
//! ```

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lineage::{Dependency, MessageStatus, MessageType, StatusRecord, StatusRecorder};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// PostgreSQL status recorder.
#[derive(Clone)]
pub struct PgStatusRecorder {
    pool: PgPool,
    statuses: String,
    dependencies: String,
}

impl PgStatusRecorder {
    /// Create a recorder using tables in the connection's search path.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            statuses: "message_statuses".to_string(),
            dependencies: "message_dependencies".to_string(),
        }
    }

    /// Create a recorder whose tables live in `schema`.
    pub fn with_schema(pool: PgPool, schema: &str) -> Self {
        let schema = quote_ident(schema);
        Self {
            pool,
            statuses: format!("{schema}.message_statuses"),
            dependencies: format!("{schema}.message_dependencies"),
        }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        let schema = self.statuses.rsplit_once('.').map(|(schema, _)| schema);
        let mut statements = Vec::new();
        if let Some(schema) = schema {
            statements.push(format!("CREATE SCHEMA IF NOT EXISTS {schema}"));
        }
        statements.push(format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                message_type TEXT NOT NULL,
                message_id TEXT NOT NULL,
                status TEXT NOT NULL,
                caused_by TEXT[] NOT NULL DEFAULT '{{}}',
                data JSONB,
                occurred_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.statuses
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_message_statuses_message ON {} (message_id, occurred_at)",
            self.statuses
        ));
        statements.push(format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                dependent_id TEXT NOT NULL,
                parent_id TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (dependent_id, parent_id)
            )
            "#,
            self.dependencies
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_message_dependencies_parent ON {} (parent_id)",
            self.dependencies
        ));

        let mut tx = self.pool.begin().await?;
        for statement in &statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        tracing::info!(table = %self.statuses, "status recorder schema ready");
        Ok(())
    }
}

#[async_trait]
impl StatusRecorder for PgStatusRecorder {
    async fn record_status(&self, record: StatusRecord) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (message_type, message_id, status, caused_by, data, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            self.statuses
        );

        sqlx::query(&sql)
            .bind(record.message_type.as_str())
            .bind(&record.message_id)
            .bind(record.status.as_str())
            .bind(&record.caused_by)
            .bind(&record.data)
            .bind(record.occurred_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Redelivered messages report the same edges again; duplicates are
    /// ignored.
    async fn record_dependency(&self, dependency: Dependency) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (dependent_id, parent_id, recorded_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (dependent_id, parent_id) DO NOTHING
            "#,
            self.dependencies
        );

        sqlx::query(&sql)
            .bind(&dependency.dependent_id)
            .bind(&dependency.parent_id)
            .bind(dependency.recorded_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Append `status` for every transitive dependent of `parent_id`.
    ///
    /// Each new row copies the message type and causes of the dependent's
    /// latest status. Dependents with no status history are skipped.
    async fn update_dependent_statuses(
        &self,
        parent_id: &str,
        status: MessageStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let sql = format!(
            r#"
            WITH RECURSIVE dependents AS (
                SELECT dependent_id
                FROM {deps}
                WHERE parent_id = $1
                UNION
                SELECT d.dependent_id
                FROM {deps} d
                JOIN dependents ON d.parent_id = dependents.dependent_id
            ),
            latest AS (
                SELECT DISTINCT ON (s.message_id) s.message_type, s.message_id, s.caused_by
                FROM {statuses} s
                JOIN dependents ON s.message_id = dependents.dependent_id
                ORDER BY s.message_id, s.occurred_at DESC, s.id DESC
            )
            INSERT INTO {statuses} (message_type, message_id, status, caused_by, data, occurred_at)
            SELECT message_type, message_id, $2, caused_by, $3, NOW()
            FROM latest
            "#,
            deps = self.dependencies,
            statuses = self.statuses,
        );

        let data = reason.map(|reason| serde_json::json!({ "reason": reason }));
        let result = sqlx::query(&sql)
            .bind(parent_id)
            .bind(status.as_str())
            .bind(data)
            .execute(&self.pool)
            .await?;

        tracing::info!(
            parent_id,
            status = %status,
            updated = result.rows_affected(),
            "updated dependent statuses"
        );
        Ok(())
    }
}

/// History queries.
impl PgStatusRecorder {
    /// Every status recorded for a message, oldest first.
    pub async fn history(&self, message_id: &str) -> Result<Vec<StatusRecord>> {
        let sql = format!(
            r#"
            SELECT message_type, message_id, status, caused_by, data, occurred_at
            FROM {}
            WHERE message_id = $1
            ORDER BY occurred_at ASC, id ASC
            "#,
            self.statuses
        );

        let rows = sqlx::query(&sql)
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(status_record).collect()
    }

    pub async fn latest_status(&self, message_id: &str) -> Result<Option<MessageStatus>> {
        let sql = format!(
            r#"
            SELECT status
            FROM {}
            WHERE message_id = $1
            ORDER BY occurred_at DESC, id DESC
            LIMIT 1
            "#,
            self.statuses
        );

        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row.get::<String, _>("status").parse::<MessageStatus>())
            .transpose()
    }

    /// Direct parents of a message.
    pub async fn parents(&self, message_id: &str) -> Result<Vec<String>> {
        let sql = format!(
            r#"
            SELECT parent_id
            FROM {}
            WHERE dependent_id = $1
            ORDER BY recorded_at ASC
            "#,
            self.dependencies
        );

        let rows = sqlx::query(&sql)
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(|row| row.get("parent_id")).collect())
    }

    /// Every message caused by `message_id`, directly or transitively.
    pub async fn dependents(&self, message_id: &str) -> Result<Vec<String>> {
        let sql = format!(
            r#"
            WITH RECURSIVE dependents AS (
                SELECT dependent_id
                FROM {deps}
                WHERE parent_id = $1
                UNION
                SELECT d.dependent_id
                FROM {deps} d
                JOIN dependents ON d.parent_id = dependents.dependent_id
            )
            SELECT dependent_id FROM dependents ORDER BY dependent_id
            "#,
            deps = self.dependencies,
        );

        let rows = sqlx::query(&sql)
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(|row| row.get("dependent_id")).collect())
    }

    /// Number of messages per latest status.
    pub async fn status_counts(&self) -> Result<HashMap<MessageStatus, i64>> {
        let sql = format!(
            r#"
            SELECT status, COUNT(*) AS messages
            FROM (
                SELECT DISTINCT ON (message_id) status
                FROM {}
                ORDER BY message_id, occurred_at DESC, id DESC
            ) latest
            GROUP BY status
            "#,
            self.statuses
        );

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                let status: MessageStatus = row.get::<String, _>("status").parse()?;
                let messages: i64 = row.get("messages");
                Ok((status, messages))
            })
            .collect()
    }

    /// Delete status history and edges older than `older_than`.
    ///
    /// Returns the number of status rows removed.
    pub async fn cleanup_before(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let statuses = sqlx::query(&format!(
            "DELETE FROM {} WHERE occurred_at < $1",
            self.statuses
        ))
        .bind(older_than)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "DELETE FROM {} WHERE recorded_at < $1",
            self.dependencies
        ))
        .bind(older_than)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(statuses.rows_affected())
    }
}

fn status_record(row: &PgRow) -> Result<StatusRecord> {
    let message_type: MessageType = row.get::<String, _>("message_type").parse()?;
    let status: MessageStatus = row.get::<String, _>("status").parse()?;

    let mut record = StatusRecord::new(
        message_type,
        row.get::<String, _>("message_id"),
        status,
        row.get("caused_by"),
    )
    .occurred_at(row.get("occurred_at"));
    record.data = row.get("data");
    Ok(record)
}

/// `my schema` -> `"my schema"`, doubling embedded quotes.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
