//! # Queue Message Types
//!
//! Data exchanged with the durable queue engine: delivered jobs, job records
//! returned by lookups, and the option structs accepted by the client.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{JobError, Result};

/// A job leased to a worker for processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: Value,
    /// Attempts already made before this delivery
    pub retry_count: i32,
    /// The job stays retryable while `retry_count < retry_limit`
    pub retry_limit: i32,
    /// Seconds the handler may run before the attempt is considered expired
    pub expire_in_seconds: Option<i64>,
}

impl Job {
    pub fn new(id: impl Into<String>, name: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            data,
            retry_count: 0,
            retry_limit: 0,
            expire_in_seconds: None,
        }
    }

    pub fn with_retries(mut self, retry_count: i32, retry_limit: i32) -> Self {
        self.retry_count = retry_count;
        self.retry_limit = retry_limit;
        self
    }

    /// True when a failure of this attempt is terminal
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.retry_limit
    }
}

/// Lifecycle states of a job, ordered as the engine orders them
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Retry,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Retry => "retry",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "retry" => Ok(Self::Retry),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(JobError::serialization(format!("unknown job state: {other}"))),
        }
    }
}

/// Full job record as returned by lookups and the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub state: JobState,
    pub data: Value,
    pub created_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub retry_limit: i32,
    pub singleton_key: Option<String>,
    pub output: Option<Value>,
}

/// Queue as stored by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: String,
    pub retry_limit: Option<i32>,
    pub retry_delay: Option<i32>,
    pub expire_seconds: Option<i32>,
    pub created_on: Option<DateTime<Utc>>,
}

/// Explicit queue policy overrides; unset fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueUpdate {
    pub expire_in_seconds: Option<i32>,
    pub retry_limit: Option<i32>,
    pub retry_delay: Option<i32>,
}

impl QueueUpdate {
    pub fn is_empty(&self) -> bool {
        self.expire_in_seconds.is_none() && self.retry_limit.is_none() && self.retry_delay.is_none()
    }
}

/// Per-enqueue overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendOptions {
    pub priority: Option<i32>,
    pub start_after_seconds: Option<i64>,
    pub singleton_key: Option<String>,
    pub retry_limit: Option<i32>,
    pub retry_delay: Option<i32>,
    pub retry_backoff: Option<bool>,
    pub expire_in_seconds: Option<i64>,
}

/// Delivery options for a queue worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOptions {
    pub batch_size: usize,
    /// Independent in-process delivery loops; `None` leaves the engine default
    pub local_concurrency: Option<usize>,
}

impl Default for WorkOptions {
    fn default() -> Self {
        Self {
            batch_size: crate::constants::DEFAULT_BATCH_SIZE,
            local_concurrency: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub id: Option<String>,
}

impl JobFilter {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self { id: Some(id.into()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOptions {
    /// Let in-flight deliveries finish before the connection closes
    pub graceful: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self { graceful: true }
    }
}

/// Callback handed every delivered batch; an error fails the whole batch
pub type BatchHandler = Arc<dyn Fn(Vec<Job>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Observer for errors raised by a live client
pub type ErrorCallback = Arc<dyn Fn(&JobError) + Send + Sync>;
