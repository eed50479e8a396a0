//! In-memory stand-ins for the queue client and job store.
//!
//! Both record every call on a shared [`Timeline`] so tests can assert
//! ordering across the two backends.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tasker_jobs::database::{JobStore, QueueStats};
use tasker_jobs::error::{JobError, Result};
use tasker_jobs::messaging::{
    BatchHandler, ErrorCallback, Job, JobFilter, JobInfo, JobState, QueueClient, QueueDescriptor,
    QueueUpdate, SendOptions, StopOptions, WorkOptions,
};
use tasker_jobs::orchestration::{ClientFactory, ClientManager};
use tasker_jobs::JobSystemConfig;

/// Ordered record of backend calls, shared by the mocks of one test
pub type Timeline = Arc<Mutex<Vec<String>>>;

pub fn timeline() -> Timeline {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn noop_error_callback() -> ErrorCallback {
    Arc::new(|_| {})
}

/// Config whose client never installs process signal handlers
pub fn test_config() -> JobSystemConfig {
    JobSystemConfig::new("postgresql://localhost/tasker_jobs_test")
        .client_settings(tasker_jobs::ClientSettings::default().handle_signals(false))
}

pub fn job_info(id: &str, name: &str, data: Value) -> JobInfo {
    JobInfo {
        id: id.to_string(),
        name: name.to_string(),
        state: JobState::Completed,
        data,
        created_on: Utc::now(),
        started_on: None,
        completed_on: None,
        retry_count: 0,
        retry_limit: 0,
        singleton_key: None,
        output: None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCall {
    Start,
    Stop(bool),
    GetQueue(String),
    CreateQueue(String),
    UpdateQueue(String, QueueUpdate),
    Work(String, WorkOptions),
    Fail(String, Vec<String>),
    Send(String, Value),
    Schedule(String, String),
    FindJobs(String, Option<JobFilter>),
}

/// Queue client that keeps everything in memory
pub struct MockQueueClient {
    timeline: Timeline,
    start_delay: Duration,
    fail_start: bool,
    existing_queues: Mutex<HashSet<String>>,
    calls: Mutex<Vec<ClientCall>>,
    workers: Mutex<HashMap<String, BatchHandler>>,
    jobs: Mutex<Vec<JobInfo>>,
    fail_error: Mutex<Option<JobError>>,
}

impl MockQueueClient {
    pub fn new(timeline: Timeline) -> Self {
        Self {
            timeline,
            start_delay: Duration::ZERO,
            fail_start: false,
            existing_queues: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            workers: Mutex::new(HashMap::new()),
            jobs: Mutex::new(Vec::new()),
            fail_error: Mutex::new(None),
        }
    }

    pub fn with_existing_queue(self, name: &str) -> Self {
        self.existing_queues.lock().insert(name.to_string());
        self
    }

    pub fn with_job(self, job: JobInfo) -> Self {
        self.jobs.lock().push(job);
        self
    }

    /// Make the next `fail` call return `error`
    pub fn fail_next_fail_call(&self, error: JobError) {
        *self.fail_error.lock() = Some(error);
    }

    fn record(&self, call: ClientCall) {
        let label = match &call {
            ClientCall::Start => "client.start".to_string(),
            ClientCall::Stop(_) => "client.stop".to_string(),
            ClientCall::GetQueue(q) => format!("client.get_queue:{q}"),
            ClientCall::CreateQueue(q) => format!("client.create_queue:{q}"),
            ClientCall::UpdateQueue(q, _) => format!("client.update_queue:{q}"),
            ClientCall::Work(q, _) => format!("client.work:{q}"),
            ClientCall::Fail(q, _) => format!("client.fail:{q}"),
            ClientCall::Send(q, _) => format!("client.send:{q}"),
            ClientCall::Schedule(q, _) => format!("client.schedule:{q}"),
            ClientCall::FindJobs(q, _) => format!("client.find_jobs:{q}"),
        };
        self.timeline.lock().push(label);
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&ClientCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    pub fn fail_calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ClientCall::Fail(q, ids) => Some((q.clone(), ids.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ClientCall::Send(q, data) => Some((q.clone(), data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Hand `jobs` to the worker registered for `queue`, as the engine would
    pub async fn deliver(&self, queue: &str, jobs: Vec<Job>) -> Result<()> {
        let handler = self
            .workers
            .lock()
            .get(queue)
            .cloned()
            .ok_or_else(|| JobError::missing_handler(queue))?;
        handler(jobs).await
    }
}

#[async_trait]
impl QueueClient for MockQueueClient {
    async fn start(&self) -> Result<()> {
        self.record(ClientCall::Start);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.fail_start {
            return Err(JobError::client("start", "connection refused"));
        }
        Ok(())
    }

    async fn stop(&self, options: StopOptions) -> Result<()> {
        self.record(ClientCall::Stop(options.graceful));
        Ok(())
    }

    fn on_error(&self, _callback: ErrorCallback) {}

    async fn send(
        &self,
        queue: &str,
        data: Value,
        _options: Option<SendOptions>,
    ) -> Result<Option<String>> {
        self.record(ClientCall::Send(queue.to_string(), data));
        Ok(Some(uuid::Uuid::new_v4().to_string()))
    }

    async fn get_queue(&self, name: &str) -> Result<Option<QueueDescriptor>> {
        self.record(ClientCall::GetQueue(name.to_string()));
        Ok(self
            .existing_queues
            .lock()
            .contains(name)
            .then(|| QueueDescriptor {
                name: name.to_string(),
                retry_limit: None,
                retry_delay: None,
                expire_seconds: None,
                created_on: None,
            }))
    }

    async fn create_queue(&self, name: &str) -> Result<()> {
        self.record(ClientCall::CreateQueue(name.to_string()));
        self.existing_queues.lock().insert(name.to_string());
        Ok(())
    }

    async fn update_queue(&self, name: &str, update: QueueUpdate) -> Result<()> {
        self.record(ClientCall::UpdateQueue(name.to_string(), update));
        Ok(())
    }

    async fn work(
        &self,
        name: &str,
        options: WorkOptions,
        handler: BatchHandler,
    ) -> Result<String> {
        self.record(ClientCall::Work(name.to_string(), options));
        self.workers.lock().insert(name.to_string(), handler);
        Ok(format!("worker-{name}"))
    }

    async fn fail(&self, name: &str, ids: &[String]) -> Result<()> {
        self.record(ClientCall::Fail(name.to_string(), ids.to_vec()));
        match self.fail_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn schedule(&self, queue: &str, cron: &str) -> Result<()> {
        self.record(ClientCall::Schedule(queue.to_string(), cron.to_string()));
        Ok(())
    }

    async fn find_jobs(&self, name: &str, filter: Option<JobFilter>) -> Result<Vec<JobInfo>> {
        self.record(ClientCall::FindJobs(name.to_string(), filter.clone()));
        let wanted = filter.and_then(|f| f.id);
        Ok(self
            .jobs
            .lock()
            .iter()
            .filter(|j| j.name == name)
            .filter(|j| wanted.as_deref().map_or(true, |id| j.id == id))
            .cloned()
            .collect())
    }
}

/// Factory handing out [`MockQueueClient`]s and counting them
pub struct MockClientFactory {
    timeline: Timeline,
    created: AtomicUsize,
    /// Number of upcoming clients whose start fails
    failing_starts: AtomicUsize,
    start_delay: Duration,
    existing_queues: Vec<String>,
    jobs: Vec<JobInfo>,
    clients: Mutex<Vec<Arc<MockQueueClient>>>,
}

impl MockClientFactory {
    pub fn new(timeline: Timeline) -> Self {
        Self {
            timeline,
            created: AtomicUsize::new(0),
            failing_starts: AtomicUsize::new(0),
            start_delay: Duration::ZERO,
            existing_queues: Vec::new(),
            jobs: Vec::new(),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_failing_starts(self, count: usize) -> Self {
        self.failing_starts.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_existing_queue(mut self, name: &str) -> Self {
        self.existing_queues.push(name.to_string());
        self
    }

    pub fn with_job(mut self, job: JobInfo) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Most recently created client
    pub fn latest(&self) -> Arc<MockQueueClient> {
        self.clients
            .lock()
            .last()
            .cloned()
            .expect("no client created yet")
    }
}

impl ClientFactory for MockClientFactory {
    fn create(&self) -> Result<Arc<dyn QueueClient>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let fail_start = self
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let mut client = MockQueueClient::new(self.timeline.clone());
        client.start_delay = self.start_delay;
        client.fail_start = fail_start;
        for name in &self.existing_queues {
            client = client.with_existing_queue(name);
        }
        for job in &self.jobs {
            client = client.with_job(job.clone());
        }

        let client = Arc::new(client);
        self.clients.lock().push(client.clone());
        Ok(client)
    }
}

/// Job store serving canned results and recording queries
pub struct MockJobStore {
    timeline: Timeline,
    pub reclaimed: u64,
    pub stats: Vec<QueueStats>,
    pub jobs: Vec<JobInfo>,
    pub fail_with: Option<JobError>,
    pub recent_queries: Mutex<Vec<(Vec<String>, i64, i64)>>,
    pub reclaim_calls: Mutex<Vec<Duration>>,
}

impl MockJobStore {
    pub fn new(timeline: Timeline) -> Self {
        Self {
            timeline,
            reclaimed: 0,
            stats: Vec::new(),
            jobs: Vec::new(),
            fail_with: None,
            recent_queries: Mutex::new(Vec::new()),
            reclaim_calls: Mutex::new(Vec::new()),
        }
    }

    fn check(&self) -> Result<()> {
        match &self.fail_with {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl JobStore for MockJobStore {
    async fn reclaim_orphans(&self, stale_after: Duration) -> Result<u64> {
        self.timeline.lock().push("store.reclaim_orphans".to_string());
        self.reclaim_calls.lock().push(stale_after);
        self.check()?;
        Ok(self.reclaimed)
    }

    async fn queue_stats(&self, queue_names: &[String]) -> Result<Vec<QueueStats>> {
        self.timeline.lock().push("store.queue_stats".to_string());
        self.check()?;
        Ok(self
            .stats
            .iter()
            .filter(|s| queue_names.contains(&s.name))
            .cloned()
            .collect())
    }

    async fn recent_jobs(
        &self,
        queue_names: &[String],
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobInfo>> {
        self.timeline.lock().push("store.recent_jobs".to_string());
        self.recent_queries
            .lock()
            .push((queue_names.to_vec(), limit, offset));
        self.check()?;
        Ok(self
            .jobs
            .iter()
            .filter(|j| queue_names.contains(&j.name))
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_jobs(&self, queue_names: &[String]) -> Result<i64> {
        self.timeline.lock().push("store.count_jobs".to_string());
        self.check()?;
        Ok(self.jobs.iter().filter(|j| queue_names.contains(&j.name)).count() as i64)
    }
}

pub fn manager(factory: Arc<MockClientFactory>) -> ClientManager {
    ClientManager::new(factory, noop_error_callback())
}
