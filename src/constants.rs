//! # Constants
//!
//! Defaults and thresholds shared across the job system.

use std::time::Duration;

/// Schema used when none is configured
pub const DEFAULT_SCHEMA: &str = "pgboss";

/// Jobs delivered per worker invocation unless a queue says otherwise
pub const DEFAULT_BATCH_SIZE: usize = 1;

/// Active jobs whose `started_on` is older than this are treated as orphaned
pub const ORPHAN_STALENESS: Duration = Duration::from_secs(10);

/// Output attached to jobs reclaimed by the orphan sweep
pub const ORPHAN_OUTPUT_MESSAGE: &str = "worker restarted";

/// Dashboard pagination defaults
pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_PER_PAGE: i64 = 50;
pub const MAX_PER_PAGE: i64 = 500;

/// Engine tuning defaults
pub mod client {
    use std::time::Duration;

    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(2);
    pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_CRON_INTERVAL: Duration = Duration::from_secs(30);
    /// Expiration applied when neither the job nor its queue sets one (pg-boss default)
    pub const DEFAULT_EXPIRE_SECONDS: i64 = 15 * 60;
    /// Prefix of singleton keys used to dedupe cron fires across processes
    pub const CRON_SINGLETON_PREFIX: &str = "__cron__";
}

/// Postgres identifiers are truncated past this length
pub const MAX_IDENTIFIER_LENGTH: usize = 63;
