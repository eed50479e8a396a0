//! # Messaging Module
//!
//! The capability set the job system consumes from the durable queue engine,
//! plus a pg-boss compatible implementation backed by sqlx.

pub mod message;
pub mod pgboss_client;

pub use message::*;
pub use pgboss_client::PgBossClient;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Durable queue engine operations used by the lifecycle manager, the
/// dispatcher and the dashboard.
///
/// Implementations own polling, leasing, retry bookkeeping and scheduling;
/// callers only start/stop the client, enqueue, bind batch handlers and
/// report failures.
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self, options: StopOptions) -> Result<()>;

    /// Register an observer for errors raised by the live client
    fn on_error(&self, callback: ErrorCallback);

    /// Enqueue a job; `None` when the engine declined to create one
    async fn send(
        &self,
        queue: &str,
        data: Value,
        options: Option<SendOptions>,
    ) -> Result<Option<String>>;

    async fn get_queue(&self, name: &str) -> Result<Option<QueueDescriptor>>;

    async fn create_queue(&self, name: &str) -> Result<()>;

    async fn update_queue(&self, name: &str, update: QueueUpdate) -> Result<()>;

    /// Start delivering jobs from `name` to `handler`; returns a worker id
    async fn work(&self, name: &str, options: WorkOptions, handler: BatchHandler)
        -> Result<String>;

    /// Mark the given jobs failed, letting the engine decide retry vs terminal
    async fn fail(&self, name: &str, ids: &[String]) -> Result<()>;

    /// Register a recurring enqueue for `queue`
    async fn schedule(&self, queue: &str, cron: &str) -> Result<()>;

    async fn find_jobs(&self, name: &str, filter: Option<JobFilter>) -> Result<Vec<JobInfo>>;
}
