// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Supervision of one external inference process

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Result, WildsortError};

/// Which pipe a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Messages from the supervisor itself
    System,
}

/// One line of task output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub task_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub text: String,
}

impl LogEvent {
    pub fn new(task_id: Uuid, stream: LogStream, text: impl Into<String>) -> Self {
        Self { task_id, timestamp: Utc::now(), stream, text: text.into() }
    }
}

/// An executable invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Short name for logs, e.g. "SpeciesNet"
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// File the tool writes; it is rolled back unless the run succeeds
    pub results_path: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            label: program.clone(),
            program,
            args,
            working_dir: None,
            results_path: None,
        }
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process exited on its own
    Exited {
        code: Option<i32>,
        stderr_tail: Vec<String>,
    },
    /// Termination was requested by the operator
    Cancelled { code: Option<i32> },
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited { code: Some(0), .. })
    }
}

/// Requests termination of a running process; cheap to clone
#[derive(Debug, Clone)]
pub struct Canceller {
    tx: Arc<watch::Sender<bool>>,
}

impl Canceller {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// A started process
pub struct ProcessHandle {
    pid: Option<u32>,
    canceller: Canceller,
    pump: JoinHandle<ProcessOutcome>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Wait until the process has exited and all of its output was forwarded
    pub async fn wait(self) -> ProcessOutcome {
        match self.pump.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Process pump ended abnormally: {}", e);
                ProcessOutcome::Exited { code: None, stderr_tail: vec![e.to_string()] }
            }
        }
    }
}

/// Spawns child processes and pumps their output
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace_period: Duration,
    stderr_tail: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 20)
    }
}

impl ProcessRunner {
    pub fn new(grace_period: Duration, stderr_tail: usize) -> Self {
        Self { grace_period, stderr_tail }
    }

    /// Spawn `spec` and forward every output line to `events`.
    ///
    /// Must be called from within a tokio runtime. The `events` sender is
    /// dropped once the process has exited and its pipes are drained, so a
    /// receiver sees end-of-stream only after the last line.
    pub fn start(&self, task_id: Uuid, spec: &CommandSpec, events: mpsc::UnboundedSender<LogEvent>) -> Result<ProcessHandle> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| WildsortError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();
        info!("Started {} (pid {:?}): {} {}", spec.label, pid, spec.program, spec.args.join(" "));

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(self.stderr_tail)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(stdout, task_id, LogStream::Stdout, events.clone(), None)));
        }
        if let Some(stderr) = child.stderr.take() {
            let tail = (tail.clone(), self.stderr_tail);
            readers.push(tokio::spawn(pump_lines(stderr, task_id, LogStream::Stderr, events.clone(), Some(tail))));
        }
        drop(events);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let grace = self.grace_period;
        let label = spec.label.clone();
        let pump = tokio::spawn(async move {
            let (code, cancelled) = supervise(&mut child, cancel_rx, grace, &label).await;

            // Output still in the pipes belongs to this task; give readers a
            // bounded time in case a grandchild holds the pipe open.
            for reader in readers {
                let abort = reader.abort_handle();
                if tokio::time::timeout(grace, reader).await.is_err() {
                    warn!("{}: output reader did not finish, abandoning it", label);
                    abort.abort();
                }
            }

            if cancelled {
                ProcessOutcome::Cancelled { code }
            } else {
                let stderr_tail = tail.lock().map(|t| t.iter().cloned().collect()).unwrap_or_default();
                ProcessOutcome::Exited { code, stderr_tail }
            }
        });

        Ok(ProcessHandle {
            pid,
            canceller: Canceller { tx: Arc::new(cancel_tx) },
            pump,
        })
    }
}

async fn supervise(child: &mut Child, mut cancel_rx: watch::Receiver<bool>, grace: Duration, label: &str) -> (Option<i32>, bool) {
    let status = tokio::select! {
        status = child.wait() => Some(status),
        changed = cancel_rx.changed() => {
            if changed.is_err() {
                // Every canceller is gone; nobody can cancel any more
                None
            } else {
                return (terminate(child, grace, label).await, true);
            }
        }
    };

    let status = match status {
        Some(status) => status,
        None => child.wait().await,
    };
    match status {
        Ok(status) => {
            debug!("{} exited with {}", label, status);
            (status.code(), false)
        }
        Err(e) => {
            warn!("{}: failed to wait for process: {}", label, e);
            (None, false)
        }
    }
}

/// Ask the child to stop, then kill it once the grace period runs out
async fn terminate(child: &mut Child, grace: Duration, label: &str) -> Option<i32> {
    info!("Cancelling {}", label);
    request_stop(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            warn!("{}: wait after termination request failed: {}", label, e);
            None
        }
        Err(_) => {
            warn!("{} ignored the termination request for {:?}, killing it", label, grace);
            if let Err(e) = child.kill().await {
                warn!("{}: kill failed: {}", label, e);
            }
            None
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    match child.id().and_then(|pid| i32::try_from(pid).ok()) {
        // SAFETY: plain signal delivery to a pid we spawned and have not reaped
        Some(pid) => unsafe {
            libc::kill(pid, libc::SIGTERM);
        },
        None => debug!("Process already reaped, nothing to signal"),
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    // No graceful signal available; the grace period still bounds the wait
    let _ = child.start_kill();
}

async fn pump_lines<R: AsyncRead + Unpin>(
    pipe: R,
    task_id: Uuid,
    stream: LogStream,
    events: mpsc::UnboundedSender<LogEvent>,
    tail: Option<(Arc<Mutex<VecDeque<String>>>, usize)>,
) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let text = line.trim_end().to_string();
                if let Some((tail, limit)) = &tail {
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == *limit {
                            tail.pop_front();
                        }
                        if *limit > 0 {
                            tail.push_back(text.clone());
                        }
                    }
                }
                // The receiver may be gone; keep draining so the child never blocks on a full pipe
                let _ = events.send(LogEvent::new(task_id, stream, text));
            }
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(LogEvent::new(task_id, LogStream::System, format!("read error on {:?}: {}", stream, e)));
                break;
            }
        }
    }
}
