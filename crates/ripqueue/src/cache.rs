//! TTL-bounded snapshot cache over the aggregate job list.
//!
//! Purely a read optimization: every mutation path invalidates before
//! returning, so its absence would change latency, never results.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

use crate::job::Job;

pub struct JobsCache {
    snapshot: Cache<(), Arc<Vec<Job>>>,
}

impl JobsCache {
    pub fn new(ttl: Duration) -> Self {
        let snapshot = Cache::builder()
            .max_capacity(1)
            .time_to_live(ttl)
            .build();
        Self { snapshot }
    }

    /// Returns the cached snapshot, or rebuilds it via `refresh` on a miss.
    pub fn get_or_refresh<F>(&self, refresh: F) -> Arc<Vec<Job>>
    where
        F: FnOnce() -> Vec<Job>,
    {
        self.snapshot.get_with((), || Arc::new(refresh()))
    }

    /// Drops the snapshot so the next read rebuilds it.
    pub fn invalidate(&self) {
        self.snapshot.invalidate(&());
    }
}
