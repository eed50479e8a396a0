//! # Dashboard Queries
//!
//! Read-only projections over the configured queues plus the one write the
//! dashboard offers: re-running a previous job with its original payload.
//! Query errors propagate to the caller without retry.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::constants::{DEFAULT_PAGE, DEFAULT_PER_PAGE, MAX_PER_PAGE};
use crate::database::{JobStore, QueueStats};
use crate::error::{JobError, Result};
use crate::messaging::{JobFilter, JobInfo};
use crate::orchestration::ClientManager;

/// Requested page; `page` is at least 1 and `per_page` is kept within `1..=MAX_PER_PAGE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: i64,
    pub per_page: i64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl PageRequest {
    pub fn new(page: i64, per_page: i64) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, MAX_PER_PAGE),
        }
    }

    /// Rows to skip; saturates for pages past the end of any real table
    pub fn offset(&self) -> i64 {
        let request = Self::new(self.page, self.per_page);
        (request.page - 1).saturating_mul(request.per_page)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: i64,
    pub per_page: i64,
    pub total_count: i64,
    pub total_pages: i64,
}

impl Pagination {
    pub fn new(request: PageRequest, total_count: i64) -> Self {
        let request = PageRequest::new(request.page, request.per_page);
        let total_count = total_count.max(0);
        Self {
            page: request.page,
            per_page: request.per_page,
            total_count,
            total_pages: total_count / request.per_page
                + i64::from(total_count % request.per_page != 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentJobs {
    pub jobs: Vec<JobInfo>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardData {
    pub queues: Vec<QueueStats>,
    pub jobs: Vec<JobInfo>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerunOutcome {
    pub queued: bool,
}

pub struct Dashboard {
    store: Arc<dyn JobStore>,
    manager: ClientManager,
    queue_names: Vec<String>,
}

impl Dashboard {
    pub fn new(store: Arc<dyn JobStore>, manager: ClientManager, queue_names: Vec<String>) -> Self {
        Self {
            store,
            manager,
            queue_names,
        }
    }

    pub fn queue_names(&self) -> &[String] {
        &self.queue_names
    }

    pub async fn get_stats(&self) -> Result<Vec<QueueStats>> {
        self.store.queue_stats(&self.queue_names).await
    }

    /// Newest-first page of jobs across the configured queues
    pub async fn get_recent_jobs(&self, request: PageRequest) -> Result<RecentJobs> {
        let request = PageRequest::new(request.page, request.per_page);
        let jobs = self
            .store
            .recent_jobs(&self.queue_names, request.per_page, request.offset())
            .await?;
        let total_count = self.store.count_jobs(&self.queue_names).await?;

        Ok(RecentJobs {
            jobs,
            pagination: Pagination::new(request, total_count),
        })
    }

    pub async fn get_data(&self, request: PageRequest) -> Result<DashboardData> {
        let (queues, recent) = tokio::try_join!(self.get_stats(), self.get_recent_jobs(request))?;
        Ok(DashboardData {
            queues,
            jobs: recent.jobs,
            pagination: recent.pagination,
        })
    }

    /// Enqueue a new job carrying the payload of `job_id`
    pub async fn rerun_job(&self, queue: &str, job_id: &str) -> Result<RerunOutcome> {
        let client = self.manager.get_client().await?;
        let job = client
            .find_jobs(queue, Some(JobFilter::by_id(job_id)))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| JobError::job_not_found(queue, job_id))?;

        client.send(queue, job.data, None).await?;
        info!(queue = queue, job_id = job_id, "🔁 Job re-queued");
        Ok(RerunOutcome { queued: true })
    }
}
