// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! The single background task slot and its event fan-out
//!
//! [`TaskManager`] accepts at most one running inference process. Every
//! subscriber receives the same ordered stream of [`TaskEvent`]s: the
//! `Running` transition, the task's log lines in arrival order, then exactly
//! one terminal transition. Events of a later task never overtake those of an
//! earlier one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TaskConfig;
use crate::runner::{Canceller, CommandSpec, LogEvent, LogStream, ProcessOutcome, ProcessRunner};
use crate::{Result, WildsortError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Whether the slot is occupied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerState {
    Idle,
    Running,
}

/// One run of an external tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub label: String,
    pub command: String,
    pub arguments: Vec<String>,
    pub state: TaskState,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Last stderr lines of a failed run
    #[serde(default)]
    pub stderr_tail: Vec<String>,
    #[serde(skip)]
    pub spec: Option<CommandSpec>,
}

/// What subscribers receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskEvent {
    State {
        task_id: Uuid,
        state: TaskState,
        exit_code: Option<i32>,
    },
    Log(LogEvent),
}

impl TaskEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::State { task_id, .. } => *task_id,
            Self::Log(log) => log.task_id,
        }
    }
}

/// Keeps a tool's results file as it was before a run that does not succeed
struct ResultsGuard {
    path: PathBuf,
    backup: Option<PathBuf>,
}

impl ResultsGuard {
    fn protect(path: &Path, task_id: Uuid) -> Result<Self> {
        let backup = match path.file_name() {
            Some(name) if path.is_file() => {
                let backup = path.with_file_name(format!(".{}.{}.bak", name.to_string_lossy(), task_id.simple()));
                fs::copy(path, &backup).map_err(|e| WildsortError::io(&backup, e))?;
                debug!("Saved {:?} to {:?}", path, backup);
                Some(backup)
            }
            _ => None,
        };
        Ok(Self { path: path.to_path_buf(), backup })
    }

    fn commit(self) {
        if let Some(backup) = &self.backup {
            if let Err(e) = fs::remove_file(backup) {
                warn!("Could not remove {:?}: {}", backup, e);
            }
        }
    }

    fn rollback(self) {
        match &self.backup {
            Some(backup) => match fs::rename(backup, &self.path) {
                Ok(()) => info!("Restored previous {:?}", self.path),
                Err(e) => warn!("Could not restore {:?} from {:?}: {}", self.path, backup, e),
            },
            None => match fs::remove_file(&self.path) {
                Ok(()) => info!("Removed incomplete {:?}", self.path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove incomplete {:?}: {}", self.path, e),
            },
        }
    }
}

/// Snapshot returned by [`TaskManager::status`]
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub state: ManagerState,
    /// The running task, or the most recently finished one
    pub task: Option<Task>,
}

struct Inner {
    current: Option<Task>,
    running: bool,
    canceller: Option<Canceller>,
    subscribers: Vec<mpsc::UnboundedSender<TaskEvent>>,
}

impl Inner {
    fn publish(&mut self, event: TaskEvent) {
        self.subscribers.retain(|s| s.send(event.clone()).is_ok());
    }
}

/// Owns the single background task slot.
///
/// Cloning yields another handle to the same slot.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Mutex<Inner>>,
    runner: ProcessRunner,
    idle_tx: Arc<watch::Sender<Option<Uuid>>>,
}

impl TaskManager {
    pub fn new(config: &TaskConfig) -> Self {
        Self::with_runner(ProcessRunner::new(config.grace_period(), config.stderr_tail_lines))
    }

    pub fn with_runner(runner: ProcessRunner) -> Self {
        let (idle_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                current: None,
                running: false,
                canceller: None,
                subscribers: Vec::new(),
            })),
            runner,
            idle_tx: Arc::new(idle_tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    pub fn status(&self) -> TaskStatus {
        let inner = self.lock();
        TaskStatus {
            state: if inner.running { ManagerState::Running } else { ManagerState::Idle },
            task: inner.current.clone(),
        }
    }

    /// Start `spec` in the background.
    ///
    /// Rejected with [`WildsortError::TaskBusy`] while another task runs; the
    /// running task is not affected. Must be called within a tokio runtime.
    pub fn submit(&self, spec: CommandSpec) -> Result<Uuid> {
        let mut inner = self.lock();
        if inner.running {
            let busy = inner.current.as_ref().map(|t| t.id).unwrap_or_default();
            warn!("Rejected {}: task {} is still running", spec.label, busy);
            return Err(WildsortError::TaskBusy(busy));
        }

        let mut task = Task {
            id: Uuid::new_v4(),
            label: spec.label.clone(),
            command: spec.program.clone(),
            arguments: spec.args.clone(),
            state: TaskState::Pending,
            exit_code: None,
            started_at: Utc::now(),
            finished_at: None,
            stderr_tail: Vec::new(),
            spec: Some(spec.clone()),
        };
        let task_id = task.id;
        let guard = spec.results_path.as_deref()
            .map(|path| ResultsGuard::protect(path, task_id))
            .transpose()?;

        let (log_tx, mut log_rx) = mpsc::unbounded_channel();
        let handle = match self.runner.start(task_id, &spec, log_tx) {
            Ok(handle) => handle,
            Err(e) => {
                error!("{} could not be started: {}", spec.label, e);
                if let Some(guard) = guard {
                    guard.commit();
                }
                task.state = TaskState::Failed;
                task.finished_at = Some(Utc::now());
                inner.publish(TaskEvent::Log(LogEvent::new(task_id, LogStream::System, e.to_string())));
                inner.publish(TaskEvent::State { task_id, state: TaskState::Failed, exit_code: None });
                inner.current = Some(task);
                return Err(e);
            }
        };

        task.state = TaskState::Running;
        inner.running = true;
        inner.canceller = Some(handle.canceller());
        inner.current = Some(task);
        inner.publish(TaskEvent::State { task_id, state: TaskState::Running, exit_code: None });
        inner.publish(TaskEvent::Log(LogEvent::new(
            task_id,
            LogStream::System,
            format!("Starting {}", spec.label),
        )));
        drop(inner);

        info!("Task {} started: {} (pid {:?})", task_id, spec.label, handle.pid());

        let manager = self.clone();
        tokio::spawn(async move {
            // Ends once the process has exited and its pipes are drained
            while let Some(log) = log_rx.recv().await {
                manager.lock().publish(TaskEvent::Log(log));
            }
            let outcome = handle.wait().await;
            // Settle the results file before anyone observes the terminal state
            if let Some(guard) = guard {
                if outcome.success() {
                    guard.commit();
                } else {
                    guard.rollback();
                }
            }
            manager.finish(task_id, outcome);
        });

        Ok(task_id)
    }

    fn finish(&self, task_id: Uuid, outcome: ProcessOutcome) {
        let mut inner = self.lock();
        let (state, exit_code, stderr_tail) = match outcome {
            ProcessOutcome::Exited { code: Some(0), .. } => (TaskState::Succeeded, Some(0), Vec::new()),
            ProcessOutcome::Exited { code, stderr_tail } => (TaskState::Failed, code, stderr_tail),
            ProcessOutcome::Cancelled { code } => (TaskState::Cancelled, code, Vec::new()),
        };

        let label = match inner.current.as_mut().filter(|t| t.id == task_id) {
            Some(task) => {
                task.state = state;
                task.exit_code = exit_code;
                task.finished_at = Some(Utc::now());
                task.stderr_tail = stderr_tail;
                task.label.clone()
            }
            None => String::from("task"),
        };

        let message = match state {
            TaskState::Succeeded => format!("{} completed successfully", label),
            TaskState::Cancelled => format!("{} was cancelled", label),
            _ => format!("{} exited with code {:?}", label, exit_code),
        };
        if state == TaskState::Failed {
            warn!("Task {}: {}", task_id, message);
        } else {
            info!("Task {}: {}", task_id, message);
        }

        inner.publish(TaskEvent::Log(LogEvent::new(task_id, LogStream::System, message)));
        inner.publish(TaskEvent::State { task_id, state, exit_code });
        inner.running = false;
        inner.canceller = None;
        drop(inner);

        let _ = self.idle_tx.send(Some(task_id));
    }

    /// Request termination of the running task.
    ///
    /// The task reaches `Cancelled` only once the process has exited.
    pub fn cancel(&self) -> Result<Uuid> {
        let inner = self.lock();
        match (&inner.canceller, &inner.current) {
            (Some(canceller), Some(task)) if inner.running => {
                info!("Cancellation requested for task {}", task.id);
                canceller.cancel();
                Ok(task.id)
            }
            _ => Err(WildsortError::NoActiveTask),
        }
    }

    /// Wait until no task is running and return the last task
    pub async fn wait_idle(&self) -> Option<Task> {
        let mut idle_rx = self.idle_tx.subscribe();
        loop {
            {
                let inner = self.lock();
                if !inner.running {
                    return inner.current.clone();
                }
            }
            if idle_rx.changed().await.is_err() {
                return self.status().task;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn sh(label: &str, script: &str) -> CommandSpec {
        let mut spec = CommandSpec::new("sh", vec!["-c".to_string(), script.to_string()]);
        spec.label = label.to_string();
        spec
    }

    fn manager() -> TaskManager {
        TaskManager::with_runner(ProcessRunner::new(Duration::from_secs(2), 10))
    }

    async fn events_until_terminal(rx: &mut mpsc::UnboundedReceiver<TaskEvent>) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, TaskEvent::State { state, .. } if state.is_terminal());
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn states(events: &[TaskEvent]) -> Vec<TaskState> {
        events.iter()
            .filter_map(|e| match e {
                TaskEvent::State { state, .. } => Some(*state),
                TaskEvent::Log(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_success_lifecycle() {
        let manager = manager();
        let mut rx = manager.subscribe();

        let id = manager.submit(sh("echo", "echo hello; echo world")).unwrap();
        let events = events_until_terminal(&mut rx).await;

        assert_eq!(states(&events), vec![TaskState::Running, TaskState::Succeeded]);
        let lines: Vec<&str> = events.iter()
            .filter_map(|e| match e {
                TaskEvent::Log(l) if l.stream == LogStream::Stdout => Some(l.text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["hello", "world"]);
        assert!(events.iter().all(|e| e.task_id() == id));

        let task = manager.wait_idle().await.unwrap();
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.exit_code, Some(0));
        assert!(task.finished_at.is_some());
        assert_eq!(manager.status().state, ManagerState::Idle);
    }

    #[tokio::test]
    async fn test_failure_keeps_exit_code_and_stderr() {
        let manager = manager();
        let mut rx = manager.subscribe();
        manager.submit(sh("broken", "echo bad input >&2; exit 2")).unwrap();

        let events = events_until_terminal(&mut rx).await;
        assert_eq!(states(&events).last(), Some(&TaskState::Failed));

        let task = manager.wait_idle().await.unwrap();
        assert_eq!(task.exit_code, Some(2));
        assert_eq!(task.stderr_tail, vec!["bad input".to_string()]);
    }

    #[tokio::test]
    async fn test_second_submit_is_rejected_while_running() {
        let manager = manager();
        let first = manager.submit(sh("slow", "exec sleep 30")).unwrap();

        let err = manager.submit(sh("other", "echo hi")).unwrap_err();
        assert!(matches!(err, WildsortError::TaskBusy(id) if id == first));

        let status = manager.status();
        assert_eq!(status.state, ManagerState::Running);
        let task = status.task.unwrap();
        assert_eq!(task.id, first);
        assert_eq!(task.state, TaskState::Running);

        manager.cancel().unwrap();
        manager.wait_idle().await;
    }

    #[tokio::test]
    async fn test_cancel_yields_cancelled_not_failed() {
        let manager = manager();
        let mut rx = manager.subscribe();
        manager.submit(sh("sleeper", "echo working; exec sleep 30")).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.cancel().unwrap();

        let events = tokio::time::timeout(Duration::from_secs(10), events_until_terminal(&mut rx))
            .await
            .unwrap();
        assert_eq!(states(&events), vec![TaskState::Running, TaskState::Cancelled]);

        let task = manager.wait_idle().await.unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert!(matches!(manager.cancel(), Err(WildsortError::NoActiveTask)));
    }

    fn writing_results(dir: &TempDir, script: &str) -> CommandSpec {
        let mut spec = sh("SpeciesNet", script);
        spec.working_dir = Some(dir.path().to_path_buf());
        spec.results_path = Some(dir.path().join("predictions.json"));
        spec
    }

    fn file_names(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.path()).unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_no_partial_results() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let mut rx = manager.subscribe();
        let spec = writing_results(&dir, r#"printf '{"media": [' > predictions.json; echo written; exec sleep 30"#);
        manager.submit(spec).unwrap();

        // Cancel only once the partial file is on disk
        while let Some(event) = rx.recv().await {
            if matches!(&event, TaskEvent::Log(l) if l.text == "written") {
                break;
            }
        }
        assert!(dir.path().join("predictions.json").exists());
        manager.cancel().unwrap();

        let task = manager.wait_idle().await.unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert!(file_names(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_restores_previous_results() {
        let dir = TempDir::new().unwrap();
        let results = dir.path().join("predictions.json");
        std::fs::write(&results, r#"{"media": []}"#).unwrap();

        let manager = manager();
        manager.submit(writing_results(&dir, "printf 'trunc' > predictions.json; exit 1")).unwrap();
        let task = manager.wait_idle().await.unwrap();

        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(std::fs::read_to_string(&results).unwrap(), r#"{"media": []}"#);
        assert_eq!(file_names(&dir), vec!["predictions.json"]);
    }

    #[tokio::test]
    async fn test_successful_run_keeps_new_results() {
        let dir = TempDir::new().unwrap();
        let results = dir.path().join("predictions.json");
        std::fs::write(&results, "old").unwrap();

        let manager = manager();
        manager.submit(writing_results(&dir, "printf 'new' > predictions.json")).unwrap();
        let task = manager.wait_idle().await.unwrap();

        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(std::fs::read_to_string(&results).unwrap(), "new");
        assert_eq!(file_names(&dir), vec!["predictions.json"]);
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_rejected() {
        assert!(matches!(manager().cancel(), Err(WildsortError::NoActiveTask)));
    }

    #[tokio::test]
    async fn test_spawn_failure_records_failed_task() {
        let manager = manager();
        let mut rx = manager.subscribe();
        let spec = CommandSpec::new("/no/such/inference-tool", vec![]);

        assert!(matches!(manager.submit(spec), Err(WildsortError::Spawn { .. })));
        let status = manager.status();
        assert_eq!(status.state, ManagerState::Idle);
        assert_eq!(status.task.unwrap().state, TaskState::Failed);

        let events = events_until_terminal(&mut rx).await;
        assert_eq!(states(&events), vec![TaskState::Failed]);
    }

    #[tokio::test]
    async fn test_events_of_consecutive_tasks_do_not_interleave() {
        let manager = manager();
        let mut rx = manager.subscribe();

        let first = manager.submit(sh("one", "echo a; echo b")).unwrap();
        manager.wait_idle().await;
        let second = manager.submit(sh("two", "echo c")).unwrap();
        manager.wait_idle().await;

        let mut events = events_until_terminal(&mut rx).await;
        events.extend(events_until_terminal(&mut rx).await);

        let boundary = events.iter().position(|e| e.task_id() == second).unwrap();
        assert!(events[..boundary].iter().all(|e| e.task_id() == first));
        assert!(events[boundary..].iter().all(|e| e.task_id() == second));
    }
}
