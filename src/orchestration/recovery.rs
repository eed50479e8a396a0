//! # Orphan Recovery
//!
//! One-shot sweep run during initialization. Jobs left `active` by a worker
//! that crashed are reclaimed once their start is older than
//! [`ORPHAN_STALENESS`]: retryable jobs return to `retry`, the rest become
//! `failed`. The sweep goes straight to storage on its own connection rather
//! than through the shared queue client.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::constants::ORPHAN_STALENESS;
use crate::database::JobStore;
use crate::error::Result;

pub struct OrphanRecovery {
    store: Arc<dyn JobStore>,
    stale_after: Duration,
}

impl OrphanRecovery {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            stale_after: ORPHAN_STALENESS,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Reclaim orphaned jobs, returning how many were touched
    pub async fn recover(&self) -> Result<u64> {
        let count = self.store.reclaim_orphans(self.stale_after).await?;
        info!(
            count = count,
            stale_after_secs = self.stale_after.as_secs(),
            "🧹 Reclaimed orphaned active jobs"
        );
        Ok(count)
    }
}
