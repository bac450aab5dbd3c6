//! Executes and monitors one external transcoder invocation.

pub mod command;
pub mod parse;

use std::collections::VecDeque;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::RunnerError;
use crate::job::{Progress, FAILURE_LOG_LIMIT};
pub use command::{CommandBuilder, HandBrakeCommand, Invocation, ShellCommand};
use parse::{LineDecoder, ParsedProgress, ProgressParser};

/// How long a terminated process gets to exit before being killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Receives progress snapshots as the runner observes them.
pub trait ProgressSink: Send + Sync {
    fn update(&self, progress: &Progress);
}

/// No-op sink for unit tests.
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn update(&self, _progress: &Progress) {}
}

/// Terminal result of one invocation.
#[derive(Debug)]
pub struct TerminalOutcome {
    pub success: bool,
    pub cancelled: bool,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    /// Bounded tail of the tool's combined output, newest last.
    pub diagnostic_tail: Vec<String>,
    pub final_progress: Progress,
}

/// Shared handle to a running child process, used to cancel it from
/// another thread while the runner blocks on the output pipe.
#[derive(Default)]
pub struct ProcessHandle {
    child: Mutex<Option<Child>>,
    cancel_requested: AtomicBool,
}

impl ProcessHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Requests cancellation: graceful terminate, bounded grace period,
    /// then forced kill. Signals go to the tool's whole process group,
    /// so helpers it spawned die too and release the output pipe.
    pub fn terminate(&self, grace: Duration) {
        self.cancel_requested.store(true, Ordering::SeqCst);

        let pid = {
            let guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
            match guard.as_ref() {
                Some(child) => child.id(),
                None => return,
            }
        };

        // SIGTERM first: lets the tool flush and remove partial state
        self.signal(pid, false);

        let deadline = Instant::now() + grace;
        loop {
            if self.has_exited() {
                return;
            }
            if Instant::now() >= deadline {
                log::warn!("Process {} did not exit within grace period, killing", pid);
                self.signal(pid, true);
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn signal(&self, pid: u32, force: bool) {
        #[cfg(unix)]
        {
            let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
            // The child leads its own process group; the negative pid
            // reaches every process in it
            unsafe {
                libc::kill(-(pid as libc::pid_t), signal);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (pid, force);
            let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(child) = guard.as_mut() {
                let _ = child.kill();
            }
        }
    }

    /// True once the child has been reaped. `wait` still reports the
    /// cached exit status afterwards.
    fn has_exited(&self) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => false,
        }
    }

    fn attach(&self, child: Child) {
        let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some(child);
    }

    fn wait(&self) -> std::io::Result<std::process::ExitStatus> {
        let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_mut() {
            Some(child) => child.wait(),
            None => Err(std::io::Error::other("no child process attached")),
        }
    }
}

/// Runs invocations and extracts progress from their combined output.
pub struct ProcessRunner {
    parser: ProgressParser,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            parser: ProgressParser::new(),
        }
    }

    /// Executes the invocation, streaming progress into `sink`, and
    /// reports the terminal result once the process exits and its
    /// remaining output is drained.
    pub fn run(
        &self,
        invocation: &Invocation,
        sink: &dyn ProgressSink,
        handle: &ProcessHandle,
    ) -> Result<TerminalOutcome, RunnerError> {
        // stdout and stderr share one pipe so the tool's own interleaving
        // of progress and error text is preserved.
        let (mut reader, writer) = std::io::pipe().map_err(RunnerError::Pipe)?;
        let writer_err = writer.try_clone().map_err(RunnerError::Pipe)?;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(writer_err);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so cancellation can signal the whole tree
            cmd.process_group(0);
        }

        log::info!(
            "Launching {} with {} args",
            invocation.program,
            invocation.args.len()
        );

        let child = cmd.spawn().map_err(|e| RunnerError::Spawn {
            program: invocation.program.clone(),
            source: e,
        })?;
        handle.attach(child);
        // Drop the parent's copies of the pipe write ends, or EOF never arrives
        drop(cmd);

        // A cancel that raced the spawn lands here instead of being lost
        if handle.cancel_requested() {
            handle.terminate(Duration::from_millis(0));
        }

        let started = Instant::now();
        let mut progress = Progress::default();
        let mut decoder = LineDecoder::new();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(FAILURE_LOG_LIMIT);
        let mut buf = [0u8; 4096];

        loop {
            if !wait_readable(&reader, Duration::from_millis(100)) {
                // No output for a while. Once the tool itself is gone,
                // stop waiting on write ends stray children may still hold
                if handle.has_exited() {
                    break;
                }
                continue;
            }
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for line in decoder.push(&buf[..n]) {
                        self.handle_line(&line, &mut progress, &mut tail, started, sink);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Output pipe read failed: {}", e);
                    break;
                }
            }
        }

        // The tool may flush final lines after its exit code is observable
        if let Some(rest) = decoder.finish() {
            self.handle_line(&rest, &mut progress, &mut tail, started, sink);
        }

        let status = handle.wait()?;
        let cancelled = handle.cancel_requested();
        let exit_code = status.code();
        let diagnostic_tail: Vec<String> = tail.into_iter().collect();

        if cancelled {
            return Ok(TerminalOutcome {
                success: false,
                cancelled: true,
                exit_code,
                error_message: None,
                diagnostic_tail,
                final_progress: progress,
            });
        }

        if status.success() {
            progress.finish();
            sink.update(&progress);
            Ok(TerminalOutcome {
                success: true,
                cancelled: false,
                exit_code,
                error_message: None,
                diagnostic_tail,
                final_progress: progress,
            })
        } else {
            let recent: Vec<&str> = diagnostic_tail
                .iter()
                .rev()
                .take(5)
                .map(String::as_str)
                .collect();
            let detail: Vec<&str> = recent.into_iter().rev().collect();
            let error_message = format!(
                "{} failed with exit code {}: {}",
                invocation.program,
                exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string()),
                detail.join("\n")
            );
            Ok(TerminalOutcome {
                success: false,
                cancelled: false,
                exit_code,
                error_message: Some(error_message),
                diagnostic_tail,
                final_progress: progress,
            })
        }
    }

    fn handle_line(
        &self,
        line: &str,
        progress: &mut Progress,
        tail: &mut VecDeque<String>,
        started: Instant,
        sink: &dyn ProgressSink,
    ) {
        if tail.len() == FAILURE_LOG_LIMIT {
            tail.pop_front();
        }
        tail.push_back(line.to_string());

        let parsed = match self.parser.parse(line) {
            Some(parsed) => parsed,
            None => return,
        };

        progress.elapsed_seconds = started.elapsed().as_secs();
        match parsed {
            ParsedProgress::Full {
                percentage,
                rate_fps,
                current_pass,
                total_passes,
                remaining_seconds,
            } => progress.update_full(
                percentage,
                rate_fps,
                current_pass,
                total_passes,
                remaining_seconds,
            ),
            ParsedProgress::Percent { percentage } => progress.update_percent(percentage),
            ParsedProgress::Phase {
                phase,
                percentage_floor,
            } => progress.update_phase(phase, percentage_floor),
        }
        sink.update(progress);
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits until the pipe has data or EOF to deliver, with a bounded
/// timeout so the reader can notice that the child is gone.
#[cfg(unix)]
fn wait_readable(reader: &std::io::PipeReader, timeout: Duration) -> bool {
    use std::os::fd::AsRawFd;

    let mut fds = libc::pollfd {
        fd: reader.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut fds, 1, timeout.as_millis() as libc::c_int) };
    rc > 0
}

#[cfg(not(unix))]
fn wait_readable(_reader: &std::io::PipeReader, _timeout: Duration) -> bool {
    true
}
