//! # Dispatch Engine
//!
//! Provisions the configured queues, binds one handler per queue, and applies
//! the delivery policy to every batch the queue engine hands over.
//!
//! ## Delivery policies
//!
//! - **Single-job** (`batch_size == 1`): a handler error is always returned to
//!   the engine so its native retry applies. When the failing attempt was the
//!   last one permitted, `on_failed` runs first (and its own error wins).
//! - **Batch** (`batch_size > 1`): every job runs concurrently and settles
//!   independently. Failed jobs whose retries are exhausted get `on_failed`,
//!   then all failed ids go to the engine in one `fail` call. Successful jobs
//!   are acknowledged by omission and the batch itself returns `Ok`.

use futures::future::{join_all, try_join_all, FutureExt};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ScheduleConfig;
use crate::database::JobStore;
use crate::error::{JobError, Result};
use crate::messaging::{BatchHandler, Job, QueueClient, QueueUpdate};
use crate::orchestration::lifecycle::ClientManager;
use crate::orchestration::recovery::OrphanRecovery;
use crate::registry::{FailedJob, Handlers, JobHandler, QueueDefinition, QueueRegistry};

pub struct Dispatcher {
    queues: QueueRegistry,
    schedules: Vec<ScheduleConfig>,
    clean_orphans: bool,
    manager: ClientManager,
    recovery: OrphanRecovery,
    /// One-shot initialization flag; the async mutex also serializes callers
    initialized: Mutex<bool>,
}

impl Dispatcher {
    pub fn new(
        queues: QueueRegistry,
        schedules: Vec<ScheduleConfig>,
        clean_orphans: bool,
        manager: ClientManager,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            queues,
            schedules,
            clean_orphans,
            manager,
            recovery: OrphanRecovery::new(store),
            initialized: Mutex::new(false),
        }
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.lock().await
    }

    /// Every configured queue must have a handler
    pub fn validate_handlers(&self, handlers: &Handlers) -> Result<()> {
        match self.queues.iter().find(|q| !handlers.contains(&q.name)) {
            Some(queue) => Err(JobError::missing_handler(&queue.name)),
            None => Ok(()),
        }
    }

    /// Orphan recovery, provisioning, worker and schedule registration, at
    /// most once per dispatcher
    pub async fn initialize(&self, handlers: Handlers) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            debug!("Job system already initialized, skipping");
            return Ok(());
        }

        self.validate_handlers(&handlers)?;
        let client = self.manager.get_client().await?;
        *initialized = true;

        if self.clean_orphans {
            self.recovery.recover().await?;
        }

        self.provision_queues(client.as_ref()).await?;
        self.register_workers(client.clone(), &handlers).await?;
        self.register_schedules(client.as_ref()).await?;

        info!(queues = self.queues.len(), "✅ Job handlers registered");
        Ok(())
    }

    /// Create missing queues and apply explicitly configured policy fields
    pub async fn provision_queues(&self, client: &dyn QueueClient) -> Result<()> {
        for queue in self.queues.iter() {
            if client.get_queue(&queue.name).await?.is_none() {
                client.create_queue(&queue.name).await?;
                info!(queue = %queue.name, "📋 Created queue");
            }

            let update = QueueUpdate {
                expire_in_seconds: queue.expire_in_seconds,
                retry_limit: queue.retry_limit,
                retry_delay: queue.retry_delay,
            };
            if !update.is_empty() {
                client.update_queue(&queue.name, update).await?;
                debug!(queue = %queue.name, "Queue policy updated");
            }
        }
        Ok(())
    }

    /// Bind a batch handler for every configured queue.
    ///
    /// All handlers are resolved before the first `work` call so a missing
    /// one never leaves a partial registration behind.
    pub async fn register_workers(
        &self,
        client: Arc<dyn QueueClient>,
        handlers: &Handlers,
    ) -> Result<()> {
        let bound = self
            .queues
            .iter()
            .map(|queue| {
                handlers
                    .get(&queue.name)
                    .map(|handler| (Arc::new(queue.clone()), handler))
                    .ok_or_else(|| JobError::missing_handler(&queue.name))
            })
            .collect::<Result<Vec<_>>>()?;

        for (definition, handler) in bound {
            let options = definition.work_options();
            let name = definition.name.clone();
            let batch = batch_handler(definition, handler, client.clone());
            client.work(&name, options, batch).await?;
        }
        Ok(())
    }

    pub async fn register_schedules(&self, client: &dyn QueueClient) -> Result<()> {
        for schedule in &self.schedules {
            client.schedule(&schedule.queue, &schedule.cron).await?;
            info!(queue = %schedule.queue, cron = %schedule.cron, "⏰ Registered schedule");
        }
        Ok(())
    }
}

/// Adapt a queue's handler and policy into the engine's batch callback
pub fn batch_handler(
    definition: Arc<QueueDefinition>,
    handler: JobHandler,
    client: Arc<dyn QueueClient>,
) -> BatchHandler {
    Arc::new(move |jobs: Vec<Job>| {
        let definition = definition.clone();
        let handler = handler.clone();
        let client = client.clone();
        async move {
            if definition.is_batched() {
                deliver_batch(&definition, &handler, client.as_ref(), jobs).await
            } else {
                match jobs.into_iter().next() {
                    Some(job) => deliver_single(&definition, &handler, job).await,
                    None => Ok(()),
                }
            }
        }
        .boxed()
    })
}

/// Run one job; errors always propagate, after `on_failed` on the final attempt
pub async fn deliver_single(
    definition: &QueueDefinition,
    handler: &JobHandler,
    job: Job,
) -> Result<()> {
    let error = match handler(job.data.clone()).await {
        Ok(()) => return Ok(()),
        Err(e) => Arc::new(e),
    };

    let exhausted = job.retries_exhausted();
    if exhausted {
        warn!(
            queue = %definition.name,
            job_id = %job.id,
            retry_count = job.retry_count,
            error = %error,
            "Job failed on its final attempt"
        );
        if let Some(on_failed) = &definition.on_failed {
            on_failed(FailedJob {
                job_id: job.id.clone(),
                data: job.data,
                error: error.clone(),
            })
            .await
            .map_err(|e| JobError::FailureCallback {
                queue: definition.name.clone(),
                job_id: job.id.clone(),
                error: Arc::new(e),
            })?;
        }
    } else {
        debug!(
            queue = %definition.name,
            job_id = %job.id,
            retry_count = job.retry_count,
            retry_limit = job.retry_limit,
            "Job failed, leaving retry to the queue engine"
        );
    }

    Err(JobError::Handler {
        queue: definition.name.clone(),
        job_id: job.id,
        exhausted,
        error,
    })
}

/// Run every job of a batch concurrently and report failures through `fail`
pub async fn deliver_batch(
    definition: &QueueDefinition,
    handler: &JobHandler,
    client: &dyn QueueClient,
    jobs: Vec<Job>,
) -> Result<()> {
    let outcomes = join_all(jobs.iter().map(|job| handler(job.data.clone()))).await;

    let failures: Vec<(&Job, Arc<anyhow::Error>)> = jobs
        .iter()
        .zip(outcomes)
        .filter_map(|(job, outcome)| outcome.err().map(|e| (job, Arc::new(e))))
        .collect();

    if failures.is_empty() {
        return Ok(());
    }

    if let Some(on_failed) = &definition.on_failed {
        let callbacks = failures
            .iter()
            .filter(|(job, _)| job.retries_exhausted())
            .map(|(job, error)| {
                let queue = definition.name.clone();
                let job_id = job.id.clone();
                on_failed(FailedJob {
                    job_id: job.id.clone(),
                    data: job.data.clone(),
                    error: error.clone(),
                })
                .map(move |result| {
                    result.map_err(|e| JobError::FailureCallback {
                        queue,
                        job_id,
                        error: Arc::new(e),
                    })
                })
            });
        try_join_all(callbacks).await?;
    }

    let failed_ids: Vec<String> = failures.iter().map(|(job, _)| job.id.clone()).collect();
    warn!(
        queue = %definition.name,
        failed = failed_ids.len(),
        delivered = jobs.len(),
        "Batch had failing jobs"
    );
    client.fail(&definition.name, &failed_ids).await
}
