//! # Orchestration Engine
//!
//! The moving parts behind a job system:
//!
//! - [`lifecycle`] - starts the shared queue client exactly once and stops it
//!   on request or on termination signals
//! - [`recovery`] - reclaims jobs orphaned by crashed workers
//! - [`dispatch`] - provisions queues, binds handlers, and applies the
//!   single-job and batch delivery policies
//!
//! Initialization order is fixed: client start, orphan recovery,
//! provisioning, worker registration, schedule registration.

pub mod dispatch;
pub mod lifecycle;
pub mod recovery;

pub use dispatch::Dispatcher;
pub use lifecycle::{ClientFactory, ClientManager, PgBossClientFactory};
pub use recovery::OrphanRecovery;
