//! # Queue Registry
//!
//! Typed queue handles, handler registration, and the ordered registry of
//! provisioned queue definitions.
//!
//! A [`Queue<T>`] tags a queue name with its payload type at compile time. The
//! same handle is used to configure the queue, bind its handler and enqueue
//! jobs, so all three agree on `T` without the type existing at runtime:
//!
//! ```rust,ignore
//! use tasker_jobs::{Handlers, JobSystemConfig, Queue, QueueConfig};
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Email { to: String, body: String }
//!
//! const EMAIL: Queue<Email> = Queue::new("email");
//!
//! let config = JobSystemConfig::new(database_url)
//!     .queue(&EMAIL, QueueConfig::new().retry_limit(3));
//! let handlers = Handlers::new().register(&EMAIL, |email: Email| async move {
//!     deliver(email).await
//! });
//! ```

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

use crate::constants::DEFAULT_BATCH_SIZE;
use crate::messaging::WorkOptions;

/// Erased application handler: receives the raw payload of one job
pub type JobHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Erased terminal-failure callback
pub type FailureCallback =
    Arc<dyn Fn(FailedJob<Value>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Payload and error of a job whose final permitted attempt failed
#[derive(Debug, Clone)]
pub struct FailedJob<T> {
    pub job_id: String,
    pub data: T,
    pub error: Arc<anyhow::Error>,
}

/// Compile-time tag binding a queue name to its payload type
pub struct Queue<T> {
    name: &'static str,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Queue<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Queue<T> {}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Queue").field(&self.name).finish()
    }
}

/// Wrap a typed handler so it accepts raw JSON payloads
pub(crate) fn erase_handler<T, F, Fut>(handler: F) -> JobHandler
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |data: Value| match serde_json::from_value::<T>(data) {
        Ok(payload) => handler(payload).boxed(),
        Err(e) => futures::future::ready(Err(
            anyhow::Error::new(e).context("payload does not match the queue's payload type")
        ))
        .boxed(),
    })
}

/// Wrap a typed terminal-failure callback
pub(crate) fn erase_failure_callback<T, F, Fut>(callback: F) -> FailureCallback
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(FailedJob<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |failed: FailedJob<Value>| {
        match serde_json::from_value::<T>(failed.data) {
            Ok(data) => callback(FailedJob {
                job_id: failed.job_id,
                data,
                error: failed.error,
            })
            .boxed(),
            Err(e) => futures::future::ready(Err(anyhow::Error::new(e)
                .context("payload of failed job does not match the queue's payload type")))
            .boxed(),
        }
    })
}

/// Handlers keyed by queue name, bound through typed queue handles
#[derive(Clone, Default)]
pub struct Handlers {
    handlers: HashMap<String, JobHandler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `queue`, replacing any earlier binding
    pub fn register<T, F, Fut>(mut self, queue: &Queue<T>, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(queue, handler);
        self
    }

    pub fn insert<T, F, Fut>(&mut self, queue: &Queue<T>, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self
            .handlers
            .insert(queue.name().to_string(), erase_handler(handler))
            .is_some()
        {
            warn!(queue = queue.name(), "Replacing previously registered handler");
        }
    }

    pub fn get(&self, queue: &str) -> Option<JobHandler> {
        self.handlers.get(queue).cloned()
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.handlers.contains_key(queue)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("Handlers").field("queues", &names).finish()
    }
}

/// Provisioning and delivery policy for one queue, with the payload type erased
#[derive(Clone)]
pub struct QueueDefinition {
    pub name: String,
    pub batch_size: usize,
    pub expire_in_seconds: Option<i32>,
    pub retry_limit: Option<i32>,
    pub retry_delay: Option<i32>,
    pub local_concurrency: Option<usize>,
    pub on_failed: Option<FailureCallback>,
}

impl QueueDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            expire_in_seconds: None,
            retry_limit: None,
            retry_delay: None,
            local_concurrency: None,
            on_failed: None,
        }
    }

    /// Single-job delivery unless the queue asks for batches
    pub fn is_batched(&self) -> bool {
        self.batch_size > 1
    }

    pub fn work_options(&self) -> WorkOptions {
        WorkOptions {
            batch_size: self.batch_size,
            local_concurrency: self.local_concurrency,
        }
    }
}

impl fmt::Debug for QueueDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDefinition")
            .field("name", &self.name)
            .field("batch_size", &self.batch_size)
            .field("expire_in_seconds", &self.expire_in_seconds)
            .field("retry_limit", &self.retry_limit)
            .field("retry_delay", &self.retry_delay)
            .field("local_concurrency", &self.local_concurrency)
            .field("on_failed", &self.on_failed.is_some())
            .finish()
    }
}

/// Queue definitions in the order they were configured
#[derive(Debug, Clone, Default)]
pub struct QueueRegistry {
    queues: Vec<QueueDefinition>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition; a definition with the same name is replaced in place
    pub fn insert(&mut self, definition: QueueDefinition) {
        match self.queues.iter_mut().find(|q| q.name == definition.name) {
            Some(existing) => {
                warn!(
                    queue = %definition.name,
                    "Queue configured twice, keeping the last definition"
                );
                *existing = definition;
            }
            None => self.queues.push(definition),
        }
    }

    pub fn get(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueDefinition> {
        self.queues.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
