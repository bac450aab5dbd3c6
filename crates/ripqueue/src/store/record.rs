//! Persisted per-source record: job list plus bounded attempt history.

use serde::{Deserialize, Serialize};

use crate::job::{HistoryEntry, Job};

/// Maximum history entries retained per source record.
pub const HISTORY_LIMIT: usize = 10;

/// Everything persisted for one source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeRecord {
    pub file_name: String,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl EncodeRecord {
    pub fn new(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            jobs: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Replaces the stored job for the same (title, display name), or appends.
    /// A fresh submission for a source/title supersedes the previous record.
    pub fn upsert_job(&mut self, job: &Job) {
        for existing in &mut self.jobs {
            if existing.title_number == job.title_number
                && existing.display_name == job.display_name
            {
                *existing = job.clone();
                return;
            }
        }
        self.jobs.push(job.clone());
    }

    /// Appends a history entry, evicting the oldest beyond [`HISTORY_LIMIT`].
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }
}
