//! Encoding engine facade: bounded-concurrency scheduling, cancellation,
//! status queries and callback fan-out.
//!
//! All state transitions happen under one mutex; the admission loop sleeps
//! on a condvar and is woken by submissions, completions and settings
//! changes, never by polling.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::cache::JobsCache;
use crate::error::{EngineError, Result, RipqueueError};
use crate::job::{HistoryEntry, Job, JobDescriptor, JobStatus, Progress};
use crate::runner::command::output_file_name;
use crate::runner::{CommandBuilder, ProcessHandle, ProgressSink, TERMINATE_GRACE};
use crate::settings::{load_settings, save_settings, Settings};
use crate::store::MetadataStore;
use crate::worker::{WorkItem, WorkOutcome, WorkerPool};

/// Progress is persisted roughly this often, in percentage points.
const PROGRESS_PERSIST_STEP: f32 = 5.0;

/// Events surfaced to notification callbacks, gated by the settings toggles.
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    Completed { job: Job },
    Failed { job: Job },
    QueueEmpty,
}

type ProgressCallback = Box<dyn Fn(&str, &Progress) + Send + Sync>;
type StatusCallback = Box<dyn Fn(&Job) + Send + Sync>;
type NotificationCallback = Box<dyn Fn(&NotificationEvent) + Send + Sync>;

/// Construction parameters for [`EncodingEngine`].
pub struct EngineConfig {
    pub store_directory: PathBuf,
    pub settings_path: PathBuf,
    pub cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_directory: PathBuf::from("."),
            settings_path: PathBuf::from("encoding_settings.json"),
            cache_ttl: Duration::from_secs(5),
        }
    }
}

/// A worker pool together with the collector thread draining its
/// outcomes. They are retired as a unit.
struct PoolSlot {
    pool: WorkerPool,
    collector: JoinHandle<()>,
}

struct EngineState {
    running: bool,
    /// FIFO of queued job ids, admission order.
    pending: VecDeque<String>,
    /// Live jobs only: terminal jobs move to the store and are evicted.
    jobs: HashMap<String, Job>,
    /// Process handles for jobs currently executing.
    handles: HashMap<String, Arc<ProcessHandle>>,
    running_count: usize,
    max_concurrent: usize,
}

struct EngineInner {
    state: Mutex<EngineState>,
    admit: Condvar,
    store: MetadataStore,
    cache: JobsCache,
    settings: Mutex<Settings>,
    settings_path: PathBuf,
    builder: Box<dyn CommandBuilder>,
    pool: Mutex<Option<PoolSlot>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    progress_callbacks: Mutex<Vec<ProgressCallback>>,
    status_callbacks: Mutex<Vec<StatusCallback>>,
    notification_callbacks: Mutex<Vec<NotificationCallback>>,
}

pub struct EncodingEngine {
    inner: Arc<EngineInner>,
}

impl EncodingEngine {
    pub fn new(config: EngineConfig, builder: Box<dyn CommandBuilder>) -> Self {
        let settings = load_settings(&config.settings_path);
        let max_concurrent = settings.max_concurrent;

        let inner = Arc::new(EngineInner {
            state: Mutex::new(EngineState {
                running: false,
                pending: VecDeque::new(),
                jobs: HashMap::new(),
                handles: HashMap::new(),
                running_count: 0,
                max_concurrent,
            }),
            admit: Condvar::new(),
            store: MetadataStore::new(config.store_directory),
            cache: JobsCache::new(config.cache_ttl),
            settings: Mutex::new(settings),
            settings_path: config.settings_path,
            builder,
            pool: Mutex::new(None),
            scheduler: Mutex::new(None),
            watcher: Mutex::new(None),
            progress_callbacks: Mutex::new(Vec::new()),
            status_callbacks: Mutex::new(Vec::new()),
            notification_callbacks: Mutex::new(Vec::new()),
        });

        Self { inner }
    }

    /// Starts the worker pool and the admission loop. Idempotent.
    pub fn start(&self) {
        let max_concurrent = self.inner.settings_snapshot().max_concurrent;
        {
            let mut state = self.inner.state();
            if state.running {
                return;
            }
            state.running = true;
            state.max_concurrent = max_concurrent;
        }

        {
            let mut slot = lock(&self.inner.pool);
            *slot = Some(spawn_pool(&self.inner, max_concurrent));
        }

        let scheduler_inner = Arc::clone(&self.inner);
        *lock(&self.inner.scheduler) = Some(thread::spawn(move || run_scheduler(scheduler_inner)));

        let watcher_inner = Arc::clone(&self.inner);
        let mut events = self.inner.store.subscribe();
        *lock(&self.inner.watcher) = Some(thread::spawn(move || {
            use tokio::sync::broadcast::error::TryRecvError;
            loop {
                if !watcher_inner.state().running {
                    break;
                }
                match events.try_recv() {
                    Ok(_) | Err(TryRecvError::Lagged(_)) => watcher_inner.cache.invalidate(),
                    Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(100)),
                    Err(TryRecvError::Closed) => break,
                }
            }
            debug!("Store watcher stopped");
        }));

        info!(
            "Encoding engine started ({} concurrent encodes)",
            max_concurrent
        );
    }

    /// Cancels live jobs, stops the admission loop and drains the pool.
    pub fn stop(&self) {
        let (cancelled_queued, running_handles) = {
            let mut state = self.inner.state();
            if !state.running {
                return;
            }
            state.running = false;

            let mut cancelled = Vec::new();
            let queued: Vec<String> = state.pending.drain(..).collect();
            for id in queued {
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.status = JobStatus::Cancelled;
                    job.completed_at = Some(Utc::now());
                    cancelled.push(job.clone());
                }
            }
            let handles: Vec<Arc<ProcessHandle>> = state.handles.values().cloned().collect();
            (cancelled, handles)
        };
        self.inner.admit.notify_all();

        for job in &cancelled_queued {
            self.inner.persist_terminal(job);
            self.inner.fire_status(job);
        }
        if !cancelled_queued.is_empty() {
            let mut state = self.inner.state();
            for job in &cancelled_queued {
                state.jobs.remove(&job.id);
            }
            drop(state);
            self.inner.cache.invalidate();
        }

        for handle in running_handles {
            handle.terminate(TERMINATE_GRACE);
        }

        if let Some(scheduler) = lock(&self.inner.scheduler).take() {
            if scheduler.join().is_err() {
                error!("Scheduler thread panicked");
            }
        }

        // Workers finish their last outcomes; joining the collector
        // guarantees their terminal bookkeeping is done before we return
        if let Some(slot) = lock(&self.inner.pool).take() {
            slot.pool.shutdown();
            slot.pool.wait();
            if slot.collector.join().is_err() {
                error!("Outcome collector panicked");
            }
        }

        if let Some(watcher) = lock(&self.inner.watcher).take() {
            if watcher.join().is_err() {
                error!("Store watcher thread panicked");
            }
        }

        info!("Encoding engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.state().running
    }

    /// Validates and enqueues a job, returning its id.
    pub fn submit(&self, descriptor: JobDescriptor) -> Result<String> {
        validate_descriptor(&descriptor)?;

        let settings = self.inner.settings_snapshot();
        let preset = descriptor
            .preset
            .clone()
            .unwrap_or(settings.default_preset);
        let output = output_file_name(&descriptor.display_name, "mp4");

        let job = {
            let mut state = self.inner.state();
            if !state.running {
                return Err(EngineError::NotRunning.into());
            }

            // One pending job per (source, title), checked under the lock
            // so racing submitters resolve deterministically
            let source = (descriptor.file_name.clone(), descriptor.title_number);
            let duplicate = state
                .jobs
                .values()
                .any(|j| j.status.is_pending() && j.source_key() == source);
            if duplicate {
                return Err(EngineError::DuplicateJob {
                    file_name: descriptor.file_name,
                    title_number: descriptor.title_number,
                }
                .into());
            }

            let job = Job::new(
                descriptor.file_name,
                descriptor.title_number,
                descriptor.display_name,
                output,
                preset,
            );
            state.pending.push_back(job.id.clone());
            state.jobs.insert(job.id.clone(), job.clone());
            job
        };

        info!(
            "Submitted job {} ({} title {})",
            job.id, job.file_name, job.title_number
        );
        self.inner.persist_job(&job);
        self.inner.cache.invalidate();
        self.inner.admit.notify_all();
        self.inner.fire_status(&job);
        Ok(job.id)
    }

    /// Cancels a job. Queued jobs never start; running jobs are terminated
    /// gracefully, then killed. Returns `false` for unknown or already
    /// terminal jobs, so repeated cancels are harmless.
    pub fn cancel(&self, job_id: &str) -> bool {
        let mut state = self.inner.state();
        let status = match state.jobs.get(job_id) {
            Some(job) => job.status,
            None => return false,
        };

        match status {
            JobStatus::Queued => {
                state.pending.retain(|id| id != job_id);
                let snapshot = match state.jobs.get_mut(job_id) {
                    Some(job) => {
                        job.status = JobStatus::Cancelled;
                        job.completed_at = Some(Utc::now());
                        job.clone()
                    }
                    None => return false,
                };
                drop(state);

                info!("Cancelled queued job {}", job_id);
                self.inner.persist_terminal(&snapshot);
                self.inner.state().jobs.remove(job_id);
                self.inner.cache.invalidate();
                self.inner.admit.notify_all();
                self.inner.fire_status(&snapshot);
                true
            }
            JobStatus::Running => {
                let handle = state.handles.get(job_id).cloned();
                drop(state);
                match handle {
                    Some(handle) => {
                        info!("Cancelling running job {}", job_id);
                        // Terminal bookkeeping happens when the worker
                        // reports the (cancelled) outcome
                        handle.terminate(TERMINATE_GRACE);
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// Current snapshot of one job: live state wins over persisted state.
    pub fn status(&self, job_id: &str) -> Option<Job> {
        {
            let state = self.inner.state();
            if let Some(job) = state.jobs.get(job_id) {
                return Some(job.clone());
            }
        }

        for key in self.inner.store.keys() {
            match self.inner.store.load(&key) {
                Ok(record) => {
                    if let Some(job) = record.jobs.into_iter().find(|j| j.id == job_id) {
                        return Some(job);
                    }
                }
                Err(e) => warn!("Could not read record for '{}': {}", key, e),
            }
        }
        None
    }

    /// All known jobs, live and persisted, oldest first. Served from the
    /// TTL cache; every mutation path invalidates before returning.
    pub fn all_jobs(&self) -> Arc<Vec<Job>> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .cache
            .get_or_refresh(move || collect_jobs(&inner))
    }

    /// Persisted attempt history for one source file, oldest first.
    pub fn history(&self, key: &str) -> Vec<HistoryEntry> {
        match self.inner.store.load(key) {
            Ok(record) => record.history,
            Err(e) => {
                warn!("Could not read history for '{}': {}", key, e);
                Vec::new()
            }
        }
    }

    pub fn get_settings(&self) -> Settings {
        self.inner.settings_snapshot()
    }

    /// Replaces the settings and persists them. A changed concurrency
    /// limit swaps the worker pool; running encodes on the old pool
    /// finish undisturbed.
    pub fn update_settings(&self, settings: Settings) -> Result<()> {
        let settings = settings.clamp();
        save_settings(&self.inner.settings_path, &settings).map_err(RipqueueError::from)?;

        let old_max = {
            let mut current = lock(&self.inner.settings);
            let old = current.max_concurrent;
            *current = settings.clone();
            old
        };
        {
            let mut state = self.inner.state();
            state.max_concurrent = settings.max_concurrent;
        }

        if old_max != settings.max_concurrent {
            info!(
                "Concurrency limit changed from {} to {}",
                old_max, settings.max_concurrent
            );
            swap_pool(&self.inner, settings.max_concurrent);
        }
        self.inner.admit.notify_all();
        Ok(())
    }

    pub fn on_progress(&self, callback: impl Fn(&str, &Progress) + Send + Sync + 'static) {
        lock(&self.inner.progress_callbacks).push(Box::new(callback));
    }

    pub fn on_status_change(&self, callback: impl Fn(&Job) + Send + Sync + 'static) {
        lock(&self.inner.status_callbacks).push(Box::new(callback));
    }

    pub fn on_notification(&self, callback: impl Fn(&NotificationEvent) + Send + Sync + 'static) {
        lock(&self.inner.notification_callbacks).push(Box::new(callback));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

fn validate_descriptor(descriptor: &JobDescriptor) -> std::result::Result<(), EngineError> {
    let invalid = |reason: &str| EngineError::InvalidDescriptor {
        reason: reason.to_string(),
    };

    let name = descriptor.file_name.trim();
    if name.is_empty() {
        return Err(invalid("file name is empty"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid("file name contains path separators"));
    }
    if name == "." || name == ".." {
        return Err(invalid("file name is not a plain file"));
    }
    if descriptor.display_name.trim().is_empty() {
        return Err(invalid("display name is empty"));
    }
    if descriptor.title_number == 0 {
        return Err(invalid("title number must be at least 1"));
    }
    Ok(())
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        lock(&self.state)
    }

    fn settings_snapshot(&self) -> Settings {
        lock(&self.settings).clone()
    }

    /// Persists one job's current state. Failures are logged; in-memory
    /// state stays authoritative and the next mutation retries.
    fn persist_job(&self, job: &Job) {
        let result = self.store.update(&job.file_name, |record| {
            record.upsert_job(job);
        });
        if let Err(e) = result {
            error!("Could not persist job {}: {}", job.id, e);
        }
    }

    /// Persists a terminal job together with its history entry, as one save.
    fn persist_terminal(&self, job: &Job) {
        let result = self.store.update(&job.file_name, |record| {
            record.upsert_job(job);
            record.push_history(HistoryEntry::from_job(job));
        });
        if let Err(e) = result {
            error!("Could not persist terminal job {}: {}", job.id, e);
        }
    }

    fn fire_progress(&self, job_id: &str, progress: &Progress) {
        let callbacks = lock(&self.progress_callbacks);
        for callback in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(job_id, progress))).is_err() {
                error!("Progress callback panicked for job {}", job_id);
            }
        }
    }

    fn fire_status(&self, job: &Job) {
        let callbacks = lock(&self.status_callbacks);
        for callback in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(job))).is_err() {
                error!("Status callback panicked for job {}", job.id);
            }
        }
    }

    fn fire_notification(&self, event: &NotificationEvent) {
        let callbacks = lock(&self.notification_callbacks);
        for callback in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("Notification callback panicked");
            }
        }
    }
}

fn collect_jobs(inner: &EngineInner) -> Vec<Job> {
    let mut by_id: HashMap<String, Job> = HashMap::new();

    for key in inner.store.keys() {
        match inner.store.load(&key) {
            Ok(record) => {
                for job in record.jobs {
                    by_id.insert(job.id.clone(), job);
                }
            }
            Err(e) => warn!("Could not read record for '{}': {}", key, e),
        }
    }

    {
        let state = inner.state();
        for job in state.jobs.values() {
            by_id.insert(job.id.clone(), job.clone());
        }
    }

    let mut jobs: Vec<Job> = by_id.into_values().collect();
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    jobs
}

/// Builds a pool plus the collector thread that feeds its outcomes back
/// into the engine. Each pool gets its own collector; after a swap the
/// old collector drains remaining outcomes, then exits on disconnect.
fn spawn_pool(inner: &Arc<EngineInner>, worker_count: usize) -> PoolSlot {
    let pool = WorkerPool::new(worker_count);
    let outcomes = pool.outcomes();
    let weak = Arc::downgrade(inner);
    let collector = thread::spawn(move || {
        while let Ok(outcome) = outcomes.recv() {
            let Some(inner) = weak.upgrade() else { break };
            handle_outcome(&inner, outcome);
        }
        debug!("Outcome collector stopped");
    });
    PoolSlot { pool, collector }
}

fn swap_pool(inner: &Arc<EngineInner>, worker_count: usize) {
    let mut slot = lock(&inner.pool);
    if slot.is_none() {
        // Engine not started; the new limit takes effect on start()
        return;
    }
    let old = slot.replace(spawn_pool(inner, worker_count));
    drop(slot);

    if let Some(old) = old {
        old.pool.shutdown();
        // Drain on a detached thread: running encodes finish undisturbed
        thread::spawn(move || {
            old.pool.wait();
            if old.collector.join().is_err() {
                error!("Outcome collector panicked");
            }
        });
    }
}

/// Admission loop: sleeps until there is both queue capacity and work,
/// then moves the FIFO head into the pool.
fn run_scheduler(inner: Arc<EngineInner>) {
    debug!("Scheduler started");
    loop {
        let (job, handle) = {
            let guard = inner.state();
            let mut state = inner
                .admit
                .wait_while(guard, |s| {
                    s.running && (s.pending.is_empty() || s.running_count >= s.max_concurrent)
                })
                .unwrap_or_else(|p| p.into_inner());

            if !state.running {
                break;
            }
            let id = match state.pending.pop_front() {
                Some(id) => id,
                None => continue,
            };
            let job = match state.jobs.get_mut(&id) {
                Some(job) if job.status == JobStatus::Queued => job,
                _ => continue,
            };

            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            let snapshot = job.clone();

            state.running_count += 1;
            let handle = Arc::new(ProcessHandle::new());
            state.handles.insert(id, Arc::clone(&handle));
            (snapshot, handle)
        };

        dispatch(&inner, job, handle);
    }
    debug!("Scheduler stopped");
}

fn dispatch(inner: &Arc<EngineInner>, mut job: Job, handle: Arc<ProcessHandle>) {
    let settings = inner.settings_snapshot();
    let invocation = match inner.builder.build(&job, &settings) {
        Ok(invocation) => invocation,
        Err(e) => {
            fail_dispatch(inner, &job.id, format!("Could not construct command: {}", e));
            return;
        }
    };

    job.output_path = Some(invocation.output_path.clone());
    {
        let mut state = inner.state();
        if let Some(live) = state.jobs.get_mut(&job.id) {
            live.output_path = job.output_path.clone();
        }
    }

    info!("Starting job {} ({})", job.id, job.display_name);
    inner.persist_job(&job);
    inner.cache.invalidate();
    inner.fire_status(&job);

    let sink = Arc::new(EngineSink {
        inner: Arc::downgrade(inner),
        job_id: job.id.clone(),
        last_persisted: Mutex::new(0.0),
    });
    let item = WorkItem {
        job_id: job.id.clone(),
        invocation,
        handle,
        sink,
    };

    let submitted = match lock(&inner.pool).as_ref() {
        Some(slot) => slot.pool.submit(item),
        None => Err(EngineError::ChannelClosed),
    };
    if let Err(e) = submitted {
        fail_dispatch(inner, &job.id, format!("Could not dispatch to workers: {}", e));
    }
}

/// Terminal failure before the worker ever ran the job.
fn fail_dispatch(inner: &Arc<EngineInner>, job_id: &str, message: String) {
    error!("Job {} failed before launch: {}", job_id, message);
    let snapshot = {
        let mut state = inner.state();
        state.handles.remove(job_id);
        state.running_count = state.running_count.saturating_sub(1);
        match state.jobs.get_mut(job_id) {
            Some(job) => {
                job.status = JobStatus::Failed;
                job.error_message = Some(message);
                job.completed_at = Some(Utc::now());
                Some(job.clone())
            }
            None => None,
        }
    };
    inner.admit.notify_all();

    let Some(job) = snapshot else { return };
    inner.persist_terminal(&job);
    inner.state().jobs.remove(&job.id);
    inner.cache.invalidate();
    inner.fire_status(&job);
    if inner.settings_snapshot().notifications.on_failure {
        inner.fire_notification(&NotificationEvent::Failed { job });
    }
}

/// Runs on the collector thread once a worker reports a terminal result.
fn handle_outcome(inner: &Arc<EngineInner>, outcome: WorkOutcome) {
    let (mut job, queue_empty) = {
        let mut state = inner.state();
        state.handles.remove(&outcome.job_id);
        state.running_count = state.running_count.saturating_sub(1);
        let queue_empty = state.pending.is_empty() && state.running_count == 0;

        let job = match state.jobs.get_mut(&outcome.job_id) {
            Some(job) => job,
            None => {
                inner.admit.notify_all();
                return;
            }
        };
        if job.status.is_terminal() {
            // A racing transition already resolved this job
            inner.admit.notify_all();
            return;
        }

        match outcome.result {
            Ok(terminal) => {
                job.progress = terminal.final_progress;
                if terminal.cancelled {
                    job.status = JobStatus::Cancelled;
                } else if terminal.success {
                    job.status = JobStatus::Completed;
                } else {
                    job.status = JobStatus::Failed;
                    job.error_message = terminal.error_message;
                    job.failure_log = terminal.diagnostic_tail;
                }
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                job.error_message = Some(e.to_string());
            }
        }
        job.completed_at = Some(Utc::now());
        (job.clone(), queue_empty)
    };

    // Filesystem effects outside the state lock
    match job.status {
        JobStatus::Completed => {
            if let Some(path) = &job.output_path {
                match std::fs::metadata(path) {
                    Ok(meta) => job.output_size_bytes = Some(meta.len()),
                    Err(e) => warn!("Could not stat output {}: {}", path.display(), e),
                }
            }
        }
        JobStatus::Failed | JobStatus::Cancelled => {
            if let Some(path) = &job.output_path {
                if path.exists() {
                    match std::fs::remove_file(path) {
                        Ok(()) => info!("Removed partial output {}", path.display()),
                        Err(e) => {
                            warn!("Could not remove partial output {}: {}", path.display(), e)
                        }
                    }
                }
            }
        }
        _ => {}
    }
    info!("Job {} finished: {}", job.id, job.status);
    inner.persist_terminal(&job);
    // Terminal jobs answer from the store from here on
    inner.state().jobs.remove(&job.id);
    inner.cache.invalidate();
    inner.admit.notify_all();
    inner.fire_status(&job);

    let settings = inner.settings_snapshot();
    match job.status {
        JobStatus::Completed if settings.notifications.on_completion => {
            inner.fire_notification(&NotificationEvent::Completed { job });
        }
        JobStatus::Failed if settings.notifications.on_failure => {
            inner.fire_notification(&NotificationEvent::Failed { job });
        }
        _ => {}
    }
    if queue_empty && settings.notifications.on_queue_empty {
        inner.fire_notification(&NotificationEvent::QueueEmpty);
    }
}

/// Per-job sink: mirrors runner progress into the live map, fans out to
/// progress callbacks and persists at a coarse cadence.
struct EngineSink {
    inner: Weak<EngineInner>,
    job_id: String,
    last_persisted: Mutex<f32>,
}

impl ProgressSink for EngineSink {
    fn update(&self, progress: &Progress) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        let snapshot = {
            let mut state = inner.state();
            match state.jobs.get_mut(&self.job_id) {
                Some(job) if job.status == JobStatus::Running => {
                    job.progress = progress.clone();
                    Some(job.clone())
                }
                _ => None,
            }
        };
        let Some(job) = snapshot else { return };

        inner.fire_progress(&self.job_id, progress);

        let should_persist = {
            let mut last = lock(&self.last_persisted);
            if progress.percentage - *last >= PROGRESS_PERSIST_STEP {
                *last = progress.percentage;
                true
            } else {
                false
            }
        };
        if should_persist {
            inner.persist_job(&job);
            inner.cache.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ShellCommand;
    use tempfile::TempDir;

    fn engine_in(dir: &TempDir, script: &str) -> EncodingEngine {
        let config = EngineConfig {
            store_directory: dir.path().join("store"),
            settings_path: dir.path().join("settings.json"),
            cache_ttl: Duration::from_millis(50),
        };
        let builder = ShellCommand::new(script, dir.path().join("out.mp4"));
        EncodingEngine::new(config, Box::new(builder))
    }

    fn descriptor(file: &str, title: u32) -> JobDescriptor {
        JobDescriptor {
            file_name: file.to_string(),
            title_number: title,
            display_name: format!("Title {}", title),
            preset: None,
        }
    }

    #[test]
    fn test_submit_requires_started_engine() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir, "exit 0");

        let result = engine.submit(descriptor("disc.img", 1));
        assert!(matches!(
            result,
            Err(RipqueueError::Engine(EngineError::NotRunning))
        ));
    }

    #[test]
    fn test_descriptor_validation() {
        let bad = [
            descriptor("", 1),
            descriptor("dir/file.img", 1),
            descriptor("dir\\file.img", 1),
            descriptor("..", 1),
            descriptor("disc.img", 0),
        ];
        for d in bad {
            assert!(matches!(
                validate_descriptor(&d),
                Err(EngineError::InvalidDescriptor { .. })
            ));
        }

        let mut empty_name = descriptor("disc.img", 1);
        empty_name.display_name = "  ".to_string();
        assert!(validate_descriptor(&empty_name).is_err());

        assert!(validate_descriptor(&descriptor("disc.img", 1)).is_ok());
    }

    #[test]
    fn test_cancel_unknown_job_is_false() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir, "exit 0");
        assert!(!engine.cancel("no-such-job"));
    }

    #[test]
    fn test_start_stop_idempotent() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir, "exit 0");

        assert!(!engine.is_running());
        engine.start();
        engine.start();
        assert!(engine.is_running());

        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_settings_round_trip_through_engine() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir, "exit 0");

        let mut settings = engine.get_settings();
        assert_eq!(settings.max_concurrent, 2);

        settings.max_concurrent = 0; // clamped to 1 on update
        settings.testing_mode = true;
        engine.update_settings(settings).unwrap();

        let reloaded = engine.get_settings();
        assert_eq!(reloaded.max_concurrent, 1);
        assert!(reloaded.testing_mode);
    }
}
