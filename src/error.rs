//! # Error Types
//!
//! Structured error handling for the job system using thiserror.
//!
//! Every variant carries owned, cloneable data so that a single failure can be
//! handed to several awaiting callers (for example every caller waiting on the
//! shared client start).

use std::sync::Arc;
use thiserror::Error;

/// Errors produced by the job system
#[derive(Error, Debug, Clone)]
pub enum JobError {
    /// A configured queue has no bound handler
    #[error("Configuration error: queue \"{queue}\" has no handler")]
    MissingHandler { queue: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// An application handler failed for a delivered job
    #[error("Handler failed for job {job_id} in queue {queue}: {error}")]
    Handler {
        queue: String,
        job_id: String,
        /// True when the failing attempt was the last one permitted
        exhausted: bool,
        error: Arc<anyhow::Error>,
    },

    /// The terminal-failure callback itself failed
    #[error("on_failed callback failed for job {job_id} in queue {queue}: {error}")]
    FailureCallback {
        queue: String,
        job_id: String,
        error: Arc<anyhow::Error>,
    },

    #[error("Database error: {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("Queue client error: {operation}: {message}")]
    Client { operation: String, message: String },

    #[error("Queue client is not started")]
    NotStarted,

    #[error("Timeout: {operation} exceeded {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Lookup of a job that does not exist
    #[error("Job {job_id} not found in queue {queue}")]
    JobNotFound { queue: String, job_id: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl JobError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn missing_handler(queue: impl Into<String>) -> Self {
        Self::MissingHandler {
            queue: queue.into(),
        }
    }

    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn client(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Client {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn job_not_found(queue: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self::JobNotFound {
            queue: queue.into(),
            job_id: job_id.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether this error belongs to the configuration class (fatal at startup)
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::MissingHandler { .. } | Self::Configuration { .. })
    }

    /// Whether this error came from the backend connection rather than application code
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Database { .. } | Self::Client { .. } | Self::NotStarted | Self::Timeout { .. }
        )
    }
}

impl From<sqlx::Error> for JobError {
    fn from(err: sqlx::Error) -> Self {
        Self::database("query", err.to_string())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<config::ConfigError> for JobError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
