//! # pg-boss Compatible Queue Client
//!
//! sqlx implementation of [`QueueClient`] over the pg-boss v10 table layout
//! (`job`, `queue`, `schedule` in a configurable schema). The schema itself is
//! owned by pg-boss migrations; this client only verifies it exists.
//!
//! Each `work` registration spawns `local_concurrency` polling loops. A loop
//! leases up to `batch_size` jobs, runs the batch handler under the batch's
//! expiration, then completes the jobs on success or fails them on error.
//! Stopping cancels the loops between batches, so an in-flight batch is
//! allowed to finish when the stop is graceful.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    BatchHandler, ErrorCallback, Job, JobFilter, JobInfo, QueueClient, QueueDescriptor,
    QueueUpdate, SendOptions, StopOptions, WorkOptions,
};
use crate::config::{parse_cron, ClientSettings};
use crate::constants::client::{CRON_SINGLETON_PREFIX, DEFAULT_EXPIRE_SECONDS};
use crate::database::{job_info_from_row, sql};
use crate::error::{JobError, Result};

/// Everything a background loop needs, cloned into each spawned task
#[derive(Clone)]
struct LoopContext {
    pool: PgPool,
    schema: Arc<str>,
    shutdown: CancellationToken,
    on_error: Arc<RwLock<Option<ErrorCallback>>>,
    polling_interval: Duration,
}

impl LoopContext {
    fn report(&self, err: &JobError) {
        match self.on_error.read().as_ref() {
            Some(callback) => callback(err),
            None => error!(error = %err, "❌ Queue client error"),
        }
    }

    /// Sleep for the polling interval; false when shutdown interrupted it
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.polling_interval) => true,
        }
    }
}

/// pg-boss compatible [`QueueClient`]
pub struct PgBossClient {
    connection_string: String,
    schema: Arc<str>,
    settings: ClientSettings,
    pool: RwLock<Option<PgPool>>,
    shutdown: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    on_error: Arc<RwLock<Option<ErrorCallback>>>,
}

impl std::fmt::Debug for PgBossClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgBossClient")
            .field("schema", &self.schema)
            .field("started", &self.pool.read().is_some())
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

impl PgBossClient {
    pub fn new(
        connection_string: impl Into<String>,
        schema: impl Into<String>,
        settings: ClientSettings,
    ) -> Self {
        let schema: String = schema.into();
        Self {
            connection_string: connection_string.into(),
            schema: Arc::from(schema),
            settings,
            pool: RwLock::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            on_error: Arc::new(RwLock::new(None)),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn pool(&self) -> Result<PgPool> {
        self.pool.read().clone().ok_or(JobError::NotStarted)
    }

    fn loop_context(&self) -> Result<LoopContext> {
        Ok(LoopContext {
            pool: self.pool()?,
            schema: self.schema.clone(),
            shutdown: self.shutdown.lock().clone(),
            on_error: self.on_error.clone(),
            polling_interval: self.settings.polling_interval,
        })
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.lock().push(tokio::spawn(task));
    }

    /// Mark jobs completed; only jobs still active are touched
    pub async fn complete(&self, name: &str, ids: &[String], output: Option<Value>) -> Result<u64> {
        complete_jobs(&self.pool()?, &self.schema, name, ids, output).await
    }

    /// Fail jobs with an explicit output payload
    pub async fn fail_with_output(&self, name: &str, ids: &[String], output: Value) -> Result<u64> {
        fail_jobs(&self.pool()?, &self.schema, name, ids, output).await
    }

    /// Run one cron pass over `(since, now]`, returning how many jobs were enqueued
    pub async fn fire_schedules(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
        fire_due_schedules(&self.loop_context()?, since, now).await
    }

    async fn wait_for_tasks(&self, tasks: Vec<JoinHandle<()>>, graceful: bool) {
        if !graceful {
            for task in &tasks {
                task.abort();
            }
            return;
        }

        let aborters: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let drained = tokio::time::timeout(
            self.settings.stop_timeout,
            futures::future::join_all(tasks),
        )
        .await;

        if drained.is_err() {
            warn!(
                timeout_secs = self.settings.stop_timeout.as_secs(),
                "⏱️ Workers did not drain before the stop timeout, aborting"
            );
            for aborter in aborters {
                aborter.abort();
            }
        }
    }
}

#[async_trait]
impl QueueClient for PgBossClient {
    async fn start(&self) -> Result<()> {
        if self.pool.read().is_some() {
            return Ok(());
        }

        debug!(schema = %self.schema, "🚀 Connecting queue client");
        let pool = PgPoolOptions::new()
            .max_connections(self.settings.max_connections)
            .connect(&self.connection_string)
            .await
            .map_err(|e| JobError::client("start", e.to_string()))?;

        let installed: bool = sqlx::query_scalar(sql::schema_exists())
            .bind(self.schema.as_ref())
            .fetch_one(&pool)
            .await
            .map_err(|e| JobError::client("start", e.to_string()))?;

        if !installed {
            pool.close().await;
            return Err(JobError::configuration(format!(
                "schema \"{}\" is not installed; run the pg-boss migrations first",
                self.schema
            )));
        }

        *self.shutdown.lock() = CancellationToken::new();
        *self.pool.write() = Some(pool);

        let ctx = self.loop_context()?;
        let cron_interval = self.settings.cron_interval;
        self.spawn(run_cron_loop(ctx, cron_interval));

        info!(schema = %self.schema, "✅ Queue client started");
        Ok(())
    }

    async fn stop(&self, options: StopOptions) -> Result<()> {
        let Some(pool) = self.pool.read().clone() else {
            return Ok(());
        };

        self.shutdown.lock().cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        debug!(
            tasks = tasks.len(),
            graceful = options.graceful,
            "🛑 Stopping queue client"
        );
        self.wait_for_tasks(tasks, options.graceful).await;

        *self.pool.write() = None;
        pool.close().await;

        info!(schema = %self.schema, "✅ Queue client stopped");
        Ok(())
    }

    fn on_error(&self, callback: ErrorCallback) {
        *self.on_error.write() = Some(callback);
    }

    async fn send(
        &self,
        queue: &str,
        data: Value,
        options: Option<SendOptions>,
    ) -> Result<Option<String>> {
        let options = options.unwrap_or_default();
        let id: Option<String> = sqlx::query_scalar(&sql::insert_job(&self.schema))
            .bind(queue)
            .bind(data)
            .bind(options.priority)
            .bind(options.start_after_seconds)
            .bind(options.singleton_key)
            .bind(options.retry_limit)
            .bind(options.retry_delay)
            .bind(options.retry_backoff)
            .bind(options.expire_in_seconds)
            .fetch_optional(&self.pool()?)
            .await
            .map_err(|e| JobError::client("send", e.to_string()))?;

        match &id {
            Some(id) => debug!(queue = queue, job_id = %id, "📤 Job enqueued"),
            None => debug!(queue = queue, "📤 Enqueue suppressed (missing queue or singleton)"),
        }
        Ok(id)
    }

    async fn get_queue(&self, name: &str) -> Result<Option<QueueDescriptor>> {
        let row = sqlx::query(&sql::get_queue(&self.schema))
            .bind(name)
            .fetch_optional(&self.pool()?)
            .await
            .map_err(|e| JobError::client("get_queue", e.to_string()))?;

        row.map(|row| -> Result<QueueDescriptor> {
            Ok(QueueDescriptor {
                name: row.try_get("name")?,
                retry_limit: row.try_get("retry_limit")?,
                retry_delay: row.try_get("retry_delay")?,
                expire_seconds: row.try_get("expire_seconds")?,
                created_on: row.try_get("created_on")?,
            })
        })
        .transpose()
    }

    async fn create_queue(&self, name: &str) -> Result<()> {
        sqlx::query(&sql::create_queue(&self.schema))
            .bind(name)
            .bind(json!({ "policy": "standard" }))
            .execute(&self.pool()?)
            .await
            .map_err(|e| JobError::client("create_queue", e.to_string()))?;
        Ok(())
    }

    async fn update_queue(&self, name: &str, update: QueueUpdate) -> Result<()> {
        sqlx::query(&sql::update_queue(&self.schema))
            .bind(name)
            .bind(update.expire_in_seconds)
            .bind(update.retry_limit)
            .bind(update.retry_delay)
            .execute(&self.pool()?)
            .await
            .map_err(|e| JobError::client("update_queue", e.to_string()))?;
        Ok(())
    }

    async fn work(
        &self,
        name: &str,
        options: WorkOptions,
        handler: BatchHandler,
    ) -> Result<String> {
        let ctx = self.loop_context()?;
        let worker_id = Uuid::new_v4().to_string();
        let loops = options.local_concurrency.unwrap_or(1).max(1);
        let batch_size = options.batch_size.max(1) as i64;

        for index in 0..loops {
            self.spawn(run_worker_loop(
                ctx.clone(),
                WorkerSpec {
                    queue: name.to_string(),
                    worker_id: format!("{worker_id}:{index}"),
                    batch_size,
                    handler: handler.clone(),
                },
            ));
        }

        info!(
            queue = name,
            worker_id = %worker_id,
            batch_size = batch_size,
            loops = loops,
            "👷 Worker registered"
        );
        Ok(worker_id)
    }

    async fn fail(&self, name: &str, ids: &[String]) -> Result<()> {
        let output = json!({ "message": "failed by handler" });
        self.fail_with_output(name, ids, output).await?;
        Ok(())
    }

    async fn schedule(&self, queue: &str, cron: &str) -> Result<()> {
        parse_cron(cron)?;
        sqlx::query(&sql::upsert_schedule(&self.schema))
            .bind(queue)
            .bind(cron)
            .execute(&self.pool()?)
            .await
            .map_err(|e| JobError::client("schedule", e.to_string()))?;
        debug!(queue = queue, cron = cron, "⏰ Schedule registered");
        Ok(())
    }

    async fn find_jobs(&self, name: &str, filter: Option<JobFilter>) -> Result<Vec<JobInfo>> {
        let id = filter.and_then(|f| f.id);
        let rows = sqlx::query(&sql::find_jobs(&self.schema))
            .bind(name)
            .bind(id)
            .fetch_all(&self.pool()?)
            .await
            .map_err(|e| JobError::client("find_jobs", e.to_string()))?;

        rows.iter().map(job_info_from_row).collect()
    }
}

struct WorkerSpec {
    queue: String,
    worker_id: String,
    batch_size: i64,
    handler: BatchHandler,
}

async fn run_worker_loop(ctx: LoopContext, spec: WorkerSpec) {
    debug!(queue = %spec.queue, worker_id = %spec.worker_id, "Worker loop started");

    while !ctx.shutdown.is_cancelled() {
        match fetch_jobs(&ctx.pool, &ctx.schema, &spec.queue, spec.batch_size).await {
            Ok(jobs) if !jobs.is_empty() => {
                // A batch that started is allowed to finish; shutdown is checked between batches
                process_batch(&ctx, &spec, jobs).await;
            }
            Ok(_) => {
                if !ctx.idle().await {
                    break;
                }
            }
            Err(e) => {
                ctx.report(&e);
                if !ctx.idle().await {
                    break;
                }
            }
        }
    }

    debug!(queue = %spec.queue, worker_id = %spec.worker_id, "Worker loop stopped");
}

async fn process_batch(ctx: &LoopContext, spec: &WorkerSpec, jobs: Vec<Job>) {
    let ids: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
    let expire_secs = jobs
        .iter()
        .filter_map(|j| j.expire_in_seconds)
        .max()
        .unwrap_or(DEFAULT_EXPIRE_SECONDS)
        .max(1) as u64;

    debug!(queue = %spec.queue, count = jobs.len(), "📨 Delivering batch");

    let delivery = AssertUnwindSafe((spec.handler)(jobs)).catch_unwind();
    let outcome = match tokio::time::timeout(Duration::from_secs(expire_secs), delivery).await {
        Ok(Ok(result)) => result,
        Ok(Err(_panic)) => Err(JobError::client("work", "handler panicked")),
        Err(_) => Err(JobError::Timeout {
            operation: format!("handler for queue {}", spec.queue),
            seconds: expire_secs,
        }),
    };

    let settled = match outcome {
        Ok(()) => complete_jobs(&ctx.pool, &ctx.schema, &spec.queue, &ids, None)
            .await
            .map(|_| ()),
        Err(e) => {
            warn!(queue = %spec.queue, count = ids.len(), error = %e, "Batch failed");
            fail_jobs(
                &ctx.pool,
                &ctx.schema,
                &spec.queue,
                &ids,
                json!({ "message": e.to_string() }),
            )
            .await
            .map(|_| ())
        }
    };

    if let Err(e) = settled {
        ctx.report(&e);
    }
}

async fn fetch_jobs(pool: &PgPool, schema: &str, queue: &str, limit: i64) -> Result<Vec<Job>> {
    let rows = sqlx::query(&sql::fetch_jobs(schema))
        .bind(queue)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(|e| JobError::client("fetch", e.to_string()))?;

    rows.iter().map(job_from_row).collect()
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    Ok(Job {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        data: row
            .try_get::<Option<Value>, _>("data")?
            .unwrap_or(Value::Null),
        retry_count: row.try_get("retry_count")?,
        retry_limit: row.try_get("retry_limit")?,
        expire_in_seconds: row.try_get("expire_in_seconds")?,
    })
}

fn parse_ids(ids: &[String]) -> Result<Vec<Uuid>> {
    ids.iter()
        .map(|id| {
            Uuid::parse_str(id)
                .map_err(|e| JobError::client("parse_id", format!("invalid job id {id}: {e}")))
        })
        .collect()
}

async fn complete_jobs(
    pool: &PgPool,
    schema: &str,
    queue: &str,
    ids: &[String],
    output: Option<Value>,
) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query(&sql::complete_jobs(schema))
        .bind(queue)
        .bind(parse_ids(ids)?)
        .bind(output)
        .execute(pool)
        .await
        .map_err(|e| JobError::client("complete", e.to_string()))?;
    Ok(result.rows_affected())
}

async fn fail_jobs(
    pool: &PgPool,
    schema: &str,
    queue: &str,
    ids: &[String],
    output: Value,
) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query(&sql::fail_jobs(schema))
        .bind(queue)
        .bind(parse_ids(ids)?)
        .bind(output)
        .execute(pool)
        .await
        .map_err(|e| JobError::client("fail", e.to_string()))?;
    Ok(result.rows_affected())
}

async fn run_cron_loop(ctx: LoopContext, interval: Duration) {
    let mut last_tick = Utc::now();

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let now = Utc::now();
        if let Err(e) = fire_due_schedules(&ctx, last_tick, now).await {
            ctx.report(&e);
        }
        last_tick = now;
    }

    debug!("Cron loop stopped");
}

/// Enqueue one job per schedule whose most recent fire time falls in `(since, now]`
async fn fire_due_schedules(
    ctx: &LoopContext,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let rows = sqlx::query(&sql::list_schedules(&ctx.schema))
        .fetch_all(&ctx.pool)
        .await
        .map_err(|e| JobError::client("list_schedules", e.to_string()))?;

    let mut enqueued = 0;
    for row in rows {
        let name: String = row.try_get("name")?;
        let cron: String = row.try_get("cron")?;
        let data: Option<Value> = row.try_get("data")?;

        let Some(fire_at) = latest_fire_time(&cron, since, now)? else {
            continue;
        };

        let singleton_key = format!("{CRON_SINGLETON_PREFIX}{}", fire_at.timestamp());
        let id = claim_fire_time(ctx, &name, &singleton_key, data.unwrap_or_else(|| json!({})))
            .await
            .map_err(|e| JobError::client("cron_send", e.to_string()))?;

        match id {
            Some(id) => {
                enqueued += 1;
                info!(
                    queue = %name,
                    job_id = %id,
                    fire_at = %fire_at,
                    "⏰ Scheduled job enqueued"
                );
            }
            None => debug!(queue = %name, fire_at = %fire_at, "Fire time already claimed"),
        }
    }
    Ok(enqueued)
}

/// Insert the job for one fire time unless any process already did.
///
/// The advisory lock makes the existence check and the insert atomic across
/// processes; the insert runs in a fresh snapshot taken after the lock.
async fn claim_fire_time(
    ctx: &LoopContext,
    queue: &str,
    singleton_key: &str,
    data: Value,
) -> std::result::Result<Option<String>, sqlx::Error> {
    let mut tx = ctx.pool.begin().await?;
    sqlx::query(sql::lock_schedule_fire())
        .bind(format!("{}:{queue}:{singleton_key}", ctx.schema))
        .execute(&mut *tx)
        .await?;
    let id: Option<String> = sqlx::query_scalar(&sql::insert_scheduled_job(&ctx.schema))
        .bind(queue)
        .bind(data)
        .bind(singleton_key)
        .fetch_optional(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(id)
}

/// Most recent fire time of `cron` in `(since, now]`
fn latest_fire_time(
    cron: &str,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_cron(cron)?;
    Ok(schedule.after(&since).take_while(|t| *t <= now).last())
}
