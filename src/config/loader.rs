//! Configuration Loader
//!
//! Loads connection and engine settings from an optional TOML file and the
//! environment using the `config` crate. Queue definitions carry handlers and
//! payload types, so they are always added in code on top of the loaded
//! [`JobSettings`].

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use super::{ClientSettings, JobSystemConfig};
use crate::constants::{client, DEFAULT_SCHEMA};
use crate::error::{JobError, Result};

const DEFAULT_ENV_PREFIX: &str = "TASKER_JOBS";

/// Settings that can come from files or environment variables
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobSettings {
    pub connection_string: String,
    pub schema: String,
    pub clean_orphans: bool,
    pub max_connections: u32,
    pub polling_interval_seconds: u64,
    pub stop_timeout_seconds: u64,
    pub cron_interval_seconds: u64,
    pub handle_signals: bool,
}

impl JobSettings {
    /// Start a [`JobSystemConfig`] from these settings
    pub fn into_config(self) -> JobSystemConfig {
        let client = ClientSettings::default()
            .max_connections(self.max_connections)
            .polling_interval(Duration::from_secs(self.polling_interval_seconds))
            .stop_timeout(Duration::from_secs(self.stop_timeout_seconds))
            .cron_interval(Duration::from_secs(self.cron_interval_seconds))
            .handle_signals(self.handle_signals);

        JobSystemConfig::new(self.connection_string)
            .schema(self.schema)
            .clean_orphans(self.clean_orphans)
            .client_settings(client)
    }
}

/// Builder for loading [`JobSettings`]
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            file: None,
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read settings from this file; it must exist
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Merge defaults, `DATABASE_URL`, the file and prefixed environment
    /// variables, in increasing precedence
    pub fn load(&self) -> Result<JobSettings> {
        let mut builder = config::Config::builder()
            .set_default("schema", DEFAULT_SCHEMA)?
            .set_default("clean_orphans", true)?
            .set_default("max_connections", client::DEFAULT_MAX_CONNECTIONS as i64)?
            .set_default(
                "polling_interval_seconds",
                client::DEFAULT_POLLING_INTERVAL.as_secs() as i64,
            )?
            .set_default(
                "stop_timeout_seconds",
                client::DEFAULT_STOP_TIMEOUT.as_secs() as i64,
            )?
            .set_default(
                "cron_interval_seconds",
                client::DEFAULT_CRON_INTERVAL.as_secs() as i64,
            )?
            .set_default("handle_signals", true)?;

        if let Ok(database_url) = env::var("DATABASE_URL") {
            builder = builder.set_default("connection_string", database_url)?;
        }

        if let Some(path) = &self.file {
            debug!(path = %path.display(), "Loading job settings file");
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .try_parsing(true),
        );

        let settings: JobSettings = builder.build()?.try_deserialize().map_err(|e| {
            JobError::configuration(format!("failed to load job settings: {e}"))
        })?;

        if settings.connection_string.trim().is_empty() {
            return Err(JobError::configuration(
                "connection_string is empty (set it in the settings file, \
                 the environment or DATABASE_URL)",
            ));
        }
        super::validate_schema_name(&settings.schema)?;

        debug!(
            schema = %settings.schema,
            clean_orphans = settings.clean_orphans,
            max_connections = settings.max_connections,
            "Job settings loaded"
        );
        Ok(settings)
    }
}
