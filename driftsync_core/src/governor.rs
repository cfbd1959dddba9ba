use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::models::OrgId;
use crate::{Error, Result};

/// Enforces the per-organisation concurrency ceiling (commonly 1) across all
/// pages of all runs for that organisation. Pages queued beyond the ceiling
/// wait; they are never dropped.
///
/// Entries are retained for the life of the process, across uninstalls and
/// reinstalls: removing one while a permit is still held would hand the next
/// run a fresh semaphore and two pages for the same organisation could
/// execute at once. Growth is bounded by the number of tenants ever seen.
pub struct ConcurrencyGovernor {
    ceiling: usize,
    permits: DashMap<OrgId, Arc<Semaphore>>,
}

impl ConcurrencyGovernor {
    pub fn new(ceiling: usize) -> Result<Self> {
        if ceiling == 0 {
            return Err(Error::InvalidInput(
                "concurrency ceiling must be > 0".to_string(),
            ));
        }
        Ok(Self {
            ceiling,
            permits: DashMap::new(),
        })
    }

    /// Wait for a page slot for `organisation_id`. The permit must be held
    /// for the duration of the page execution.
    pub async fn acquire(&self, organisation_id: OrgId) -> Result<OwnedSemaphorePermit> {
        let semaphore = self
            .permits
            .entry(organisation_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.ceiling)))
            .clone();
        semaphore
            .acquire_owned()
            .await
            .map_err(|e| Error::backend("acquire organisation page slot", e))
    }
}
