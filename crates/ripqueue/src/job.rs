//! Job, progress and history records for transcode orchestration.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of diagnostic output lines retained on failure.
pub const FAILURE_LOG_LIMIT: usize = 100;

/// Lifecycle status of a transcode job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotSubmitted,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal jobs accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Queued or Running: the job occupies the pending/active set.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::NotSubmitted => write!(f, "not submitted"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Phase of the external tool's processing, derived from its output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Preparing,
    Running,
    Finalizing,
    Done,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Preparing => write!(f, "Preparing"),
            JobPhase::Running => write!(f, "Running"),
            JobPhase::Finalizing => write!(f, "Finalizing"),
            JobPhase::Done => write!(f, "Done"),
        }
    }
}

/// Mutable progress snapshot for a running job.
///
/// Owned exclusively by the process runner while the job is active;
/// everyone else only reads cloned snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Progress {
    pub percentage: f32,
    pub rate_fps: f32,
    pub elapsed_seconds: u64,
    pub remaining_seconds: u64,
    pub current_pass: u32,
    pub total_passes: u32,
    pub phase: JobPhase,
    pub last_updated: DateTime<Utc>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            percentage: 0.0,
            rate_fps: 0.0,
            elapsed_seconds: 0,
            remaining_seconds: 0,
            current_pass: 1,
            total_passes: 1,
            phase: JobPhase::Preparing,
            last_updated: Utc::now(),
        }
    }
}

impl Progress {
    /// Full update from a complete progress line.
    /// Percentage never goes backwards while a job runs.
    pub fn update_full(
        &mut self,
        percentage: f32,
        rate_fps: f32,
        current_pass: u32,
        total_passes: u32,
        remaining_seconds: u64,
    ) {
        self.percentage = self.percentage.max(percentage.clamp(0.0, 100.0));
        self.rate_fps = rate_fps;
        self.current_pass = current_pass;
        self.total_passes = total_passes;
        self.remaining_seconds = remaining_seconds;
        self.phase = JobPhase::Running;
        self.last_updated = Utc::now();
    }

    /// Partial update from a percent-only line; rate and ETA keep prior values.
    pub fn update_percent(&mut self, percentage: f32) {
        self.percentage = self.percentage.max(percentage.clamp(0.0, 100.0));
        self.phase = JobPhase::Running;
        self.last_updated = Utc::now();
    }

    /// Phase-only update from a transition marker line.
    pub fn update_phase(&mut self, phase: JobPhase, percentage_floor: Option<f32>) {
        self.phase = phase;
        if let Some(floor) = percentage_floor {
            self.percentage = self.percentage.max(floor.clamp(0.0, 100.0));
        }
        self.last_updated = Utc::now();
    }

    /// Stamps the terminal success snapshot.
    pub fn finish(&mut self) {
        self.percentage = 100.0;
        self.remaining_seconds = 0;
        self.phase = JobPhase::Done;
        self.last_updated = Utc::now();
    }
}

/// Descriptor supplied by callers when submitting a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Source file name (no path components).
    pub file_name: String,
    /// Title/selection index within the source.
    pub title_number: u32,
    /// Display name used to derive the output file name.
    pub display_name: String,
    /// Preset identifier; `None` falls back to the settings default.
    #[serde(default)]
    pub preset: Option<String>,
}

/// One transcode job tracked through its status lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub file_name: String,
    pub title_number: u32,
    pub display_name: String,
    pub output_file_name: String,
    pub preset: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Bounded tail of the tool's output, captured only on failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_log: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_size_bytes: Option<u64>,
}

impl Job {
    /// Creates a queued job from a validated descriptor.
    pub fn new(
        file_name: String,
        title_number: u32,
        display_name: String,
        output_file_name: String,
        preset: String,
    ) -> Self {
        let short = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}_{}_{}", file_name, title_number, &short[..8]);
        Self {
            id,
            file_name,
            title_number,
            display_name,
            output_file_name,
            preset,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: Progress::default(),
            error_message: None,
            failure_log: Vec::new(),
            output_path: None,
            output_size_bytes: None,
        }
    }

    /// Join key for duplicate detection across the queue and active set.
    pub fn source_key(&self) -> (String, u32) {
        (self.file_name.clone(), self.title_number)
    }
}

/// Historical record of one terminal encode attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub attempt_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_size_bytes: Option<u64>,
    pub duration_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub preset: String,
}

impl HistoryEntry {
    /// Builds a history entry from a terminal job.
    pub fn from_job(job: &Job) -> Self {
        let duration_seconds = match (job.started_at, job.completed_at) {
            (Some(start), Some(end)) => (end - start).num_seconds().max(0) as u64,
            _ => 0,
        };
        let stamp = job
            .completed_at
            .unwrap_or_else(Utc::now)
            .format("%Y%m%d_%H%M%S");
        Self {
            attempt_id: format!("{}_{}_{}", job.file_name, job.title_number, stamp),
            started_at: job.started_at,
            completed_at: job.completed_at,
            status: job.status,
            output_size_bytes: job.output_size_bytes,
            duration_seconds,
            error_message: job.error_message.clone(),
            preset: job.preset.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::new(
            "movie.img".to_string(),
            1,
            "Movie".to_string(),
            "Movie.mp4".to_string(),
            "Fast 1080p30".to_string(),
        )
    }

    #[test]
    fn test_job_id_scheme() {
        let job = sample_job();
        assert!(job.id.starts_with("movie.img_1_"));
        assert_eq!(job.id.len(), "movie.img_1_".len() + 8);
    }

    #[test]
    fn test_new_job_is_queued() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
        assert_eq!(job.progress.percentage, 0.0);
        assert_eq!(job.progress.phase, JobPhase::Preparing);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::NotSubmitted.is_terminal());
    }

    #[test]
    fn test_progress_monotonic_percentage() {
        let mut progress = Progress::default();
        progress.update_percent(50.0);
        assert_eq!(progress.percentage, 50.0);

        // A lower reading never moves the percentage backwards
        progress.update_percent(40.0);
        assert_eq!(progress.percentage, 50.0);

        progress.update_full(75.5, 120.0, 1, 2, 300);
        assert_eq!(progress.percentage, 75.5);
        assert_eq!(progress.rate_fps, 120.0);
        assert_eq!(progress.total_passes, 2);
        assert_eq!(progress.remaining_seconds, 300);
    }

    #[test]
    fn test_progress_percentage_clamped() {
        let mut progress = Progress::default();
        progress.update_percent(150.0);
        assert_eq!(progress.percentage, 100.0);
    }

    #[test]
    fn test_progress_phase_floor() {
        let mut progress = Progress::default();
        progress.update_percent(42.0);
        progress.update_phase(JobPhase::Finalizing, Some(99.0));
        assert_eq!(progress.phase, JobPhase::Finalizing);
        assert_eq!(progress.percentage, 99.0);

        // Floor never lowers an already-higher percentage
        let mut late = Progress::default();
        late.update_percent(99.5);
        late.update_phase(JobPhase::Finalizing, Some(99.0));
        assert_eq!(late.percentage, 99.5);
    }

    #[test]
    fn test_progress_finish() {
        let mut progress = Progress::default();
        progress.update_percent(87.0);
        progress.finish();
        assert_eq!(progress.percentage, 100.0);
        assert_eq!(progress.phase, JobPhase::Done);
        assert_eq!(progress.remaining_seconds, 0);
    }

    #[test]
    fn test_history_entry_from_job() {
        let mut job = sample_job();
        job.started_at = Some(Utc::now() - chrono::Duration::seconds(90));
        job.completed_at = Some(Utc::now());
        job.status = JobStatus::Completed;
        job.output_size_bytes = Some(1_500_000);

        let entry = HistoryEntry::from_job(&job);
        assert_eq!(entry.status, JobStatus::Completed);
        assert_eq!(entry.preset, "Fast 1080p30");
        assert!(entry.duration_seconds >= 89 && entry.duration_seconds <= 91);
        assert!(entry.attempt_id.starts_with("movie.img_1_"));
    }

    #[test]
    fn test_job_serde_round_trip() {
        let mut job = sample_job();
        job.status = JobStatus::Failed;
        job.error_message = Some("no valid source".to_string());
        job.failure_log = vec!["line one".to_string(), "line two".to_string()];

        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.status, JobStatus::Failed);
        assert_eq!(back.error_message.as_deref(), Some("no valid source"));
        assert_eq!(back.failure_log.len(), 2);
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&JobStatus::NotSubmitted).unwrap(),
            r#""not_submitted""#
        );
        assert_eq!(
            serde_json::to_string(&JobPhase::Finalizing).unwrap(),
            r#""finalizing""#
        );
    }
}
