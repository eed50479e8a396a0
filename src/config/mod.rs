//! # Job System Configuration
//!
//! Programmatic configuration for a job system instance: connection, schema,
//! typed queue policies, recurring schedules, and engine tuning.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_jobs::config::{JobSystemConfig, QueueConfig};
//! use tasker_jobs::Queue;
//!
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct Report { id: i64 }
//! const REPORTS: Queue<Report> = Queue::new("reports");
//!
//! let config = JobSystemConfig::new("postgres://localhost/app")
//!     .schema("jobs")
//!     .queue(&REPORTS, QueueConfig::new().batch_size(10).retry_limit(5))
//!     .schedule("reports", "0 * * * *");
//! ```
//!
//! File and environment based settings live in [`loader`].

pub mod loader;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::constants::{client, DEFAULT_BATCH_SIZE, DEFAULT_SCHEMA, MAX_IDENTIFIER_LENGTH};
use crate::error::{JobError, Result};
use crate::messaging::ErrorCallback;
use crate::registry::{
    erase_failure_callback, FailedJob, FailureCallback, Queue, QueueDefinition, QueueRegistry,
};

pub use loader::{ConfigLoader, JobSettings};

/// Per-queue delivery and retry policy, tagged with the queue's payload type
pub struct QueueConfig<T = serde_json::Value> {
    batch_size: Option<usize>,
    expire_in_seconds: Option<i32>,
    retry_limit: Option<i32>,
    retry_delay: Option<i32>,
    local_concurrency: Option<usize>,
    on_failed: Option<FailureCallback>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Default for QueueConfig<T> {
    fn default() -> Self {
        Self {
            batch_size: None,
            expire_in_seconds: None,
            retry_limit: None,
            retry_delay: None,
            local_concurrency: None,
            on_failed: None,
            _payload: PhantomData,
        }
    }
}

impl<T> QueueConfig<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs handed to one handler invocation; values above 1 enable batch mode
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn expire_in_seconds(mut self, seconds: i32) -> Self {
        self.expire_in_seconds = Some(seconds);
        self
    }

    pub fn retry_limit(mut self, retry_limit: i32) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }

    /// Seconds between attempts
    pub fn retry_delay(mut self, retry_delay: i32) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    /// Maximum concurrent in-process deliveries for this queue
    pub fn local_concurrency(mut self, local_concurrency: usize) -> Self {
        self.local_concurrency = Some(local_concurrency);
        self
    }

    fn validate(&self, queue: &str) -> Result<()> {
        if self.batch_size == Some(0) {
            return Err(JobError::configuration(format!(
                "queue \"{queue}\": batch_size must be at least 1"
            )));
        }
        if self.local_concurrency == Some(0) {
            return Err(JobError::configuration(format!(
                "queue \"{queue}\": local_concurrency must be at least 1"
            )));
        }
        for (field, value) in [
            ("expire_in_seconds", self.expire_in_seconds),
            ("retry_limit", self.retry_limit),
            ("retry_delay", self.retry_delay),
        ] {
            if matches!(value, Some(v) if v < 0) {
                return Err(JobError::configuration(format!(
                    "queue \"{queue}\": {field} must not be negative"
                )));
            }
        }
        Ok(())
    }

    fn into_definition(self, name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_string(),
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            expire_in_seconds: self.expire_in_seconds,
            retry_limit: self.retry_limit,
            retry_delay: self.retry_delay,
            local_concurrency: self.local_concurrency,
            on_failed: self.on_failed,
        }
    }
}

impl<T> QueueConfig<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Callback run once per job, only when its final permitted attempt fails
    pub fn on_failed<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(FailedJob<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_failed = Some(erase_failure_callback(callback));
        self
    }
}

/// Recurring enqueue rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub queue: String,
    pub cron: String,
}

impl ScheduleConfig {
    pub fn new(queue: impl Into<String>, cron: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            cron: cron.into(),
        }
    }
}

/// Tuning for the bundled queue engine client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub max_connections: u32,
    pub polling_interval: Duration,
    /// Upper bound on a graceful drain during stop
    pub stop_timeout: Duration,
    pub cron_interval: Duration,
    /// Install process-wide SIGINT/SIGTERM handlers that stop the client
    pub handle_signals: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            max_connections: client::DEFAULT_MAX_CONNECTIONS,
            polling_interval: client::DEFAULT_POLLING_INTERVAL,
            stop_timeout: client::DEFAULT_STOP_TIMEOUT,
            cron_interval: client::DEFAULT_CRON_INTERVAL,
            handle_signals: true,
        }
    }
}

impl ClientSettings {
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn cron_interval(mut self, interval: Duration) -> Self {
        self.cron_interval = interval;
        self
    }

    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }
}

/// Everything needed to construct a [`crate::JobSystem`]
#[derive(Clone)]
pub struct JobSystemConfig {
    pub connection_string: String,
    pub schema: Option<String>,
    /// Reclaim orphaned active jobs during initialization
    pub clean_orphans: bool,
    pub client: ClientSettings,
    queues: QueueRegistry,
    schedules: Vec<ScheduleConfig>,
    on_error: Option<ErrorCallback>,
    pending_error: Option<JobError>,
}

impl JobSystemConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            schema: None,
            clean_orphans: true,
            client: ClientSettings::default(),
            queues: QueueRegistry::new(),
            schedules: Vec::new(),
            on_error: None,
            pending_error: None,
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Add a typed queue. Invalid policies surface from [`Self::validate`].
    pub fn queue<T>(mut self, queue: &Queue<T>, config: QueueConfig<T>) -> Self {
        if let Err(e) = config.validate(queue.name()) {
            self.pending_error.get_or_insert(e);
        }
        self.queues.insert(config.into_definition(queue.name()));
        self
    }

    pub fn schedule(mut self, queue: impl Into<String>, cron: impl Into<String>) -> Self {
        self.schedules.push(ScheduleConfig::new(queue, cron));
        self
    }

    pub fn schedules(mut self, schedules: impl IntoIterator<Item = ScheduleConfig>) -> Self {
        self.schedules.extend(schedules);
        self
    }

    pub fn clean_orphans(mut self, enabled: bool) -> Self {
        self.clean_orphans = enabled;
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn client_settings(mut self, settings: ClientSettings) -> Self {
        self.client = settings;
        self
    }

    pub fn resolved_schema(&self) -> &str {
        self.schema.as_deref().unwrap_or(DEFAULT_SCHEMA)
    }

    pub fn queue_registry(&self) -> &QueueRegistry {
        &self.queues
    }

    pub fn schedule_list(&self) -> &[ScheduleConfig] {
        &self.schedules
    }

    /// The configured error observer, or one that logs the error
    pub fn error_callback(&self) -> ErrorCallback {
        self.on_error.clone().unwrap_or_else(default_error_callback)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(e) = &self.pending_error {
            return Err(e.clone());
        }
        if self.connection_string.trim().is_empty() {
            return Err(JobError::configuration("connection_string must not be empty"));
        }
        validate_schema_name(self.resolved_schema())?;
        for schedule in &self.schedules {
            if schedule.queue.trim().is_empty() {
                return Err(JobError::configuration("schedule queue must not be empty"));
            }
            parse_cron(&schedule.cron)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for JobSystemConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSystemConfig")
            .field("schema", &self.resolved_schema())
            .field("clean_orphans", &self.clean_orphans)
            .field("client", &self.client)
            .field("queues", &self.queues)
            .field("schedules", &self.schedules)
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

/// Default error observer: log to stderr through tracing
pub fn default_error_callback() -> ErrorCallback {
    Arc::new(|err: &JobError| {
        error!(target: "tasker_jobs", error = %err, "❌ Queue client error");
    })
}

/// Schema names are interpolated into SQL, so only plain identifiers pass
pub fn validate_schema_name(schema: &str) -> Result<()> {
    let mut chars = schema.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || schema.len() > MAX_IDENTIFIER_LENGTH {
        return Err(JobError::configuration(format!(
            "invalid schema name \"{schema}\": expected [A-Za-z_][A-Za-z0-9_]* \
             up to {MAX_IDENTIFIER_LENGTH} bytes"
        )));
    }
    Ok(())
}

/// Parse a cron expression. Five-field crontab syntax gets a zero seconds
/// field prepended.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    cron::Schedule::from_str(&normalized).map_err(|e| {
        JobError::configuration(format!("invalid cron expression \"{expression}\": {e}"))
    })
}
