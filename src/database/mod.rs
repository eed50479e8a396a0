//! # Database Operations
//!
//! Direct storage access that bypasses the queue client: the orphan sweep and
//! the dashboard's read-only projections.
//!
//! ## Key Components
//!
//! - [`JobStore`] - the storage collaborator seam (mocked in tests)
//! - [`PgJobStore`] - Postgres implementation; each operation opens its own
//!   short-lived connection and closes it when done
//! - [`sql`] - schema-qualified statement text

pub mod sql;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{Connection, FromRow, PgConnection, Row};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::constants::ORPHAN_OUTPUT_MESSAGE;
use crate::error::{JobError, Result};
use crate::messaging::JobInfo;

/// Per-queue job counts shown on the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct QueueStats {
    pub name: String,
    pub queued_count: i64,
    pub active_count: i64,
    pub deferred_count: i64,
    pub total_count: i64,
}

/// Storage collaborator used outside the shared queue client
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Move active jobs older than `stale_after` to retry/failed; returns the count
    async fn reclaim_orphans(&self, stale_after: Duration) -> Result<u64>;

    async fn queue_stats(&self, queue_names: &[String]) -> Result<Vec<QueueStats>>;

    /// Newest-first page of jobs across `queue_names`
    async fn recent_jobs(
        &self,
        queue_names: &[String],
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobInfo>>;

    async fn count_jobs(&self, queue_names: &[String]) -> Result<i64>;
}

/// Postgres-backed [`JobStore`]
#[derive(Debug, Clone)]
pub struct PgJobStore {
    connection_string: String,
    schema: String,
}

impl PgJobStore {
    pub fn new(connection_string: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            schema: schema.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    async fn connect(&self, operation: &str) -> Result<PgConnection> {
        PgConnection::connect(&self.connection_string)
            .await
            .map_err(|e| JobError::database(operation, e.to_string()))
    }

    /// Close the per-operation connection, logging rather than masking the
    /// operation's own result
    async fn release(conn: PgConnection, operation: &str) {
        if let Err(e) = conn.close().await {
            debug!(operation = operation, error = %e, "Failed to close storage connection");
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn reclaim_orphans(&self, stale_after: Duration) -> Result<u64> {
        let started = Instant::now();
        let mut conn = self.connect("reclaim_orphans").await?;

        let result = sqlx::query(&sql::reclaim_orphans(&self.schema))
            .bind(stale_after.as_secs() as i64)
            .bind(ORPHAN_OUTPUT_MESSAGE)
            .fetch_one(&mut conn)
            .await
            .and_then(|row| row.try_get::<i64, _>("count"));
        Self::release(conn, "reclaim_orphans").await;

        let count = result.map_err(|e| JobError::database("reclaim_orphans", e.to_string()))?;
        debug!(
            count = count,
            duration_ms = started.elapsed().as_millis() as u64,
            "💾 Orphan sweep query finished"
        );
        Ok(count.max(0) as u64)
    }

    async fn queue_stats(&self, queue_names: &[String]) -> Result<Vec<QueueStats>> {
        let mut conn = self.connect("queue_stats").await?;
        let result = sqlx::query_as::<_, QueueStats>(&sql::queue_stats(&self.schema))
            .bind(queue_names)
            .fetch_all(&mut conn)
            .await;
        Self::release(conn, "queue_stats").await;

        result.map_err(|e| JobError::database("queue_stats", e.to_string()))
    }

    async fn recent_jobs(
        &self,
        queue_names: &[String],
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobInfo>> {
        let mut conn = self.connect("recent_jobs").await?;
        let result = sqlx::query(&sql::recent_jobs(&self.schema))
            .bind(queue_names)
            .bind(limit)
            .bind(offset)
            .fetch_all(&mut conn)
            .await;
        Self::release(conn, "recent_jobs").await;

        let rows = result.map_err(|e| JobError::database("recent_jobs", e.to_string()))?;
        rows.iter().map(job_info_from_row).collect()
    }

    async fn count_jobs(&self, queue_names: &[String]) -> Result<i64> {
        let mut conn = self.connect("count_jobs").await?;
        let result = sqlx::query(&sql::count_jobs(&self.schema))
            .bind(queue_names)
            .fetch_one(&mut conn)
            .await
            .and_then(|row| row.try_get::<i64, _>("count"));
        Self::release(conn, "count_jobs").await;

        result.map_err(|e| JobError::database("count_jobs", e.to_string()))
    }
}

/// Map a row selected with the job info column list
pub(crate) fn job_info_from_row(row: &sqlx::postgres::PgRow) -> Result<JobInfo> {
    let state: String = row.try_get("state")?;
    Ok(JobInfo {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        state: state.parse()?,
        data: row
            .try_get::<Option<serde_json::Value>, _>("data")?
            .unwrap_or(serde_json::Value::Null),
        created_on: row.try_get("created_on")?,
        started_on: row.try_get("started_on")?,
        completed_on: row.try_get("completed_on")?,
        retry_count: row.try_get("retry_count")?,
        retry_limit: row.try_get("retry_limit")?,
        singleton_key: row.try_get("singleton_key")?,
        output: row.try_get("output")?,
    })
}
