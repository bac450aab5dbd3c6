//! Bounded pool of encode workers.
//!
//! Workers only ever receive items the scheduler has already admitted
//! against the concurrency cap, so the pool itself enforces nothing
//! beyond running each item to completion and reporting the outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info};

use crate::error::EngineError;
use crate::runner::{Invocation, ProcessHandle, ProcessRunner, ProgressSink, TerminalOutcome};

/// One admitted encode, ready to execute.
pub struct WorkItem {
    pub job_id: String,
    pub invocation: Invocation,
    /// Shared with the engine so the job can be cancelled mid-run.
    pub handle: Arc<ProcessHandle>,
    pub sink: Arc<dyn ProgressSink>,
}

/// Terminal report for one work item.
pub struct WorkOutcome {
    pub job_id: String,
    pub result: Result<TerminalOutcome, crate::error::RunnerError>,
}

pub struct WorkerPool {
    item_sender: Sender<WorkItem>,
    outcome_receiver: Receiver<WorkOutcome>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts `worker_count` threads.
    ///
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn new(worker_count: usize) -> Self {
        assert!(worker_count > 0, "worker_count must be > 0");
        let (item_sender, item_receiver) = bounded::<WorkItem>(worker_count * 2);
        let (outcome_sender, outcome_receiver) = bounded::<WorkOutcome>(worker_count * 2);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let item_rx = item_receiver.clone();
            let outcome_tx = outcome_sender.clone();
            let shutdown_flag = Arc::clone(&shutdown);

            let handle = thread::spawn(move || {
                run_worker(worker_id, item_rx, outcome_tx, shutdown_flag);
            });
            workers.push(handle);
        }

        info!("Started {} encode workers", worker_count);

        Self {
            item_sender,
            outcome_receiver,
            workers,
            shutdown,
        }
    }

    pub fn submit(&self, item: WorkItem) -> Result<(), EngineError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(EngineError::ChannelClosed);
        }

        self.item_sender
            .send(item)
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Clones the outcome channel so a collector can keep draining it
    /// after the pool itself has been handed off for shutdown.
    pub fn outcomes(&self) -> Receiver<WorkOutcome> {
        self.outcome_receiver.clone()
    }

    pub fn recv_outcome(&self) -> Option<WorkOutcome> {
        self.outcome_receiver.recv().ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn wait(self) {
        // Drop sender to signal workers to exit
        drop(self.item_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

fn run_worker(
    worker_id: usize,
    item_receiver: Receiver<WorkItem>,
    outcome_sender: Sender<WorkOutcome>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Worker {} started", worker_id);

    let runner = ProcessRunner::new();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match item_receiver.recv_timeout(std::time::Duration::from_millis(100)) {
            Ok(item) => {
                debug!("Worker {} processing job {}", worker_id, item.job_id);

                let result = runner.run(&item.invocation, item.sink.as_ref(), &item.handle);

                let outcome = WorkOutcome {
                    job_id: item.job_id,
                    result,
                };
                if let Err(e) = outcome_sender.send(outcome) {
                    error!("Worker {} failed to send outcome: {}", worker_id, e);
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                debug!("Worker {} item channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::NoopSink;
    use std::path::PathBuf;

    fn shell_item(job_id: &str, script: &str) -> WorkItem {
        WorkItem {
            job_id: job_id.to_string(),
            invocation: Invocation {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                output_path: PathBuf::from("/dev/null"),
            },
            handle: Arc::new(ProcessHandle::new()),
            sink: Arc::new(NoopSink),
        }
    }

    #[test]
    fn test_pool_lifecycle() {
        let pool = WorkerPool::new(2);
        assert!(!pool.is_shutdown());

        pool.shutdown();
        assert!(pool.is_shutdown());

        pool.wait();
    }

    #[test]
    fn test_submit_and_collect_outcome() {
        let pool = WorkerPool::new(2);

        pool.submit(shell_item("job-1", "exit 0")).unwrap();

        let outcome = pool.recv_outcome().unwrap();
        assert_eq!(outcome.job_id, "job-1");
        let terminal = outcome.result.unwrap();
        assert!(terminal.success);

        pool.shutdown();
        pool.wait();
    }

    #[test]
    fn test_failure_is_reported_not_swallowed() {
        let pool = WorkerPool::new(1);

        pool.submit(shell_item("job-err", "echo boom >&2; exit 7"))
            .unwrap();

        let outcome = pool.recv_outcome().unwrap();
        let terminal = outcome.result.unwrap();
        assert!(!terminal.success);
        assert_eq!(terminal.exit_code, Some(7));

        pool.shutdown();
        pool.wait();
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::new(1);
        pool.shutdown();

        let result = pool.submit(shell_item("late", "exit 0"));
        assert!(matches!(result, Err(EngineError::ChannelClosed)));

        pool.wait();
    }
}
