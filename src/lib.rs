#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Jobs
//!
//! Typed background job orchestration over a durable PostgreSQL queue.
//!
//! ## Overview
//!
//! Applications declare queues with a payload type, bind one async handler per
//! queue, and enqueue work through the same typed handles. Persistence, leasing,
//! retry scheduling and cron firing live in the queue engine's tables; this crate
//! decides how those features are wired together.
//!
//! ## Key Features
//!
//! - **Shared client lifecycle**: one queue client per job system, started
//!   exactly once no matter how many callers race for it
//! - **Single and batch delivery**: per-queue retry semantics with a terminal
//!   `on_failed` hook that only fires once retries are exhausted
//! - **Orphan recovery**: jobs left `active` by a crashed worker are moved back
//!   to `retry` (or `failed`) at startup
//! - **Dashboard queries**: per-queue counts, paginated recent jobs, re-runs
//!
//! ## Module Organization
//!
//! - [`system`] - The [`JobSystem`] facade
//! - [`orchestration`] - Client lifecycle, dispatch and orphan recovery
//! - [`registry`] - Typed queue handles and handler registration
//! - [`messaging`] - Queue client abstraction and the PostgreSQL client
//! - [`database`] - Direct SQL against the queue engine's tables
//! - [`dashboard`] - Read-only projections for operators
//! - [`config`] - Builder and file/environment configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Tracing subscriber setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use tasker_jobs::{Handlers, JobSystem, JobSystemConfig, Queue, QueueConfig};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Welcome {
//!     user_id: i64,
//! }
//!
//! const WELCOME: Queue<Welcome> = Queue::new("welcome-email");
//!
//! # async fn example() -> tasker_jobs::Result<()> {
//! let config = JobSystemConfig::new("postgresql://localhost/app")
//!     .queue(&WELCOME, QueueConfig::new().retry_limit(3));
//! let system = JobSystem::new(config)?;
//!
//! system
//!     .initialize(Handlers::new().register(&WELCOME, |job: Welcome| async move {
//!         println!("welcoming {}", job.user_id);
//!         Ok(())
//!     }))
//!     .await?;
//!
//! system.send(&WELCOME, &Welcome { user_id: 7 }, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod dashboard;
pub mod database;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod registry;
pub mod system;

pub use config::{
    ClientSettings, ConfigLoader, JobSettings, JobSystemConfig, QueueConfig, ScheduleConfig,
};
pub use dashboard::{Dashboard, DashboardData, PageRequest, Pagination, RecentJobs, RerunOutcome};
pub use database::{JobStore, PgJobStore, QueueStats};
pub use error::{JobError, Result};
pub use messaging::{
    Job, JobFilter, JobInfo, JobState, PgBossClient, QueueClient, SendOptions, StopOptions,
};
pub use orchestration::{
    ClientFactory, ClientManager, Dispatcher, OrphanRecovery, PgBossClientFactory,
};
pub use registry::{FailedJob, Handlers, Queue};
pub use system::JobSystem;
