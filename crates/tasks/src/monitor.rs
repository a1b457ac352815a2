//! Per-task execution status and history.
//!
//! State is keyed by task name in a sharded map; every read-modify-write for
//! one task happens under that key's shard guard, so executions of different
//! tasks do not contend and the RUNNING check in [`TaskMonitor::record_start`]
//! is atomic.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use backline_core::{Clock, ExecutionId, Notifier, Severity};

use crate::registry::TaskRegistry;
use crate::task::TaskRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        })
    }
}

/// What caused an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// The timer driver fired the task on its schedule.
    Schedule,
    /// An operator or caller ran the task on demand.
    Manual,
    /// An operator re-ran a failed task.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    pub id: ExecutionId,
    pub task_name: String,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

impl TaskExecutionRecord {
    fn started(task_name: &str, trigger: TriggerSource, at: DateTime<Utc>) -> Self {
        Self {
            id: ExecutionId::new(),
            task_name: task_name.to_string(),
            trigger,
            started_at: at,
            finished_at: None,
            status: TaskStatus::Running,
            error: None,
            duration_ms: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }
}

/// A task is already running; the caller must skip this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task '{task}' is already running (execution {running})")]
pub struct ConcurrentExecutionError {
    pub task: String,
    pub running: ExecutionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task history storage error: {0}")]
pub struct HistoryStoreError(pub String);

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Concurrent(#[from] ConcurrentExecutionError),

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("task '{0}' is registered without an implementation")]
    NotExecutable(String),

    #[error("task '{task}' is not in a failed state (latest status: {status:?})")]
    NotFailed {
        task: String,
        status: Option<TaskStatus>,
    },

    #[error("execution {execution_id} of task '{task}' is not running")]
    NotRunning {
        task: String,
        execution_id: ExecutionId,
    },

    #[error("cannot complete task '{task}' with status {status}")]
    InvalidCompletion { task: String, status: TaskStatus },

    #[error("scheduler already started")]
    AlreadyStarted,

    #[error(transparent)]
    History(#[from] HistoryStoreError),
}

/// Persistence port for completed execution history (get/put/delete by task name).
pub trait TaskHistoryStore: Send + Sync + 'static {
    fn task_names(&self) -> Result<Vec<String>, HistoryStoreError>;

    /// Stored history, most recent first.
    fn get(&self, task_name: &str) -> Result<Option<Vec<TaskExecutionRecord>>, HistoryStoreError>;

    fn put(&self, task_name: &str, history: &[TaskExecutionRecord]) -> Result<(), HistoryStoreError>;

    fn delete(&self, task_name: &str) -> Result<(), HistoryStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryTaskHistoryStore {
    inner: RwLock<HashMap<String, Vec<TaskExecutionRecord>>>,
}

impl InMemoryTaskHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> HistoryStoreError {
    HistoryStoreError("lock poisoned".to_string())
}

impl TaskHistoryStore for InMemoryTaskHistoryStore {
    fn task_names(&self) -> Result<Vec<String>, HistoryStoreError> {
        let guard = self.inner.read().map_err(poisoned)?;
        let mut names: Vec<String> = guard.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn get(&self, task_name: &str) -> Result<Option<Vec<TaskExecutionRecord>>, HistoryStoreError> {
        let guard = self.inner.read().map_err(poisoned)?;
        Ok(guard.get(task_name).cloned())
    }

    fn put(&self, task_name: &str, history: &[TaskExecutionRecord]) -> Result<(), HistoryStoreError> {
        let mut guard = self.inner.write().map_err(poisoned)?;
        guard.insert(task_name.to_string(), history.to_vec());
        Ok(())
    }

    fn delete(&self, task_name: &str) -> Result<(), HistoryStoreError> {
        let mut guard = self.inner.write().map_err(poisoned)?;
        guard.remove(task_name);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Completed records kept per task.
    pub history_limit: usize,
    /// Consecutive failures after which alerts escalate to critical. 0 disables escalation.
    pub failure_alert_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_limit: 50,
            failure_alert_threshold: 3,
        }
    }
}

#[derive(Debug, Default)]
struct TaskState {
    running: Option<TaskExecutionRecord>,
    // Front is most recent.
    history: VecDeque<TaskExecutionRecord>,
    consecutive_failures: u32,
}

impl TaskState {
    fn latest(&self) -> Option<&TaskExecutionRecord> {
        self.running.as_ref().or_else(|| self.history.front())
    }
}

pub struct TaskMonitor {
    states: DashMap<String, TaskState>,
    config: MonitorConfig,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn TaskHistoryStore>>,
}

impl TaskMonitor {
    pub fn new(config: MonitorConfig, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            states: DashMap::new(),
            config,
            notifier,
            clock,
            store: None,
        }
    }

    /// Monitor backed by a history store; existing history is loaded now.
    pub fn with_store(
        config: MonitorConfig,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn TaskHistoryStore>,
    ) -> Result<Self, HistoryStoreError> {
        let mut monitor = Self::new(config, notifier, clock);
        for name in store.task_names()? {
            let Some(records) = store.get(&name)? else {
                continue;
            };
            let history: VecDeque<TaskExecutionRecord> = records
                .into_iter()
                .filter(|r| !r.is_running())
                .take(monitor.config.history_limit)
                .collect();
            let consecutive_failures = history
                .iter()
                .take_while(|r| r.status == TaskStatus::Failed)
                .count() as u32;
            monitor.states.insert(
                name,
                TaskState {
                    running: None,
                    history,
                    consecutive_failures,
                },
            );
        }
        debug!(tasks = monitor.states.len(), "task history hydrated");
        monitor.store = Some(store);
        Ok(monitor)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Open a RUNNING record, or fail if one is already open for this task.
    pub fn record_start(
        &self,
        task_name: &str,
        trigger: TriggerSource,
    ) -> Result<TaskExecutionRecord, ConcurrentExecutionError> {
        let mut state = self.states.entry(task_name.to_string()).or_default();
        if let Some(running) = &state.running {
            return Err(ConcurrentExecutionError {
                task: task_name.to_string(),
                running: running.id,
            });
        }
        let record = TaskExecutionRecord::started(task_name, trigger, self.clock.now());
        state.running = Some(record.clone());
        debug!(task = task_name, execution_id = %record.id, ?trigger, "task started");
        Ok(record)
    }

    /// Close the RUNNING record `execution_id` with a terminal status.
    pub fn record_completion(
        &self,
        task_name: &str,
        execution_id: ExecutionId,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<TaskExecutionRecord, TaskError> {
        if status == TaskStatus::Running {
            return Err(TaskError::InvalidCompletion {
                task: task_name.to_string(),
                status,
            });
        }

        let not_running = || TaskError::NotRunning {
            task: task_name.to_string(),
            execution_id,
        };
        let mut state = self.states.get_mut(task_name).ok_or_else(not_running)?;
        let mut record = match state.running.take() {
            Some(r) if r.id == execution_id => r,
            other => {
                state.running = other;
                return Err(not_running());
            }
        };

        let finished_at = self.clock.now();
        record.finished_at = Some(finished_at);
        record.duration_ms = Some(
            (finished_at - record.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        record.status = status;
        record.error = error;

        state.consecutive_failures = match status {
            TaskStatus::Failed => state.consecutive_failures.saturating_add(1),
            _ => 0,
        };
        state.history.push_front(record.clone());
        state.history.truncate(self.config.history_limit);

        let snapshot: Option<Vec<TaskExecutionRecord>> = self
            .store
            .as_ref()
            .map(|_| state.history.iter().cloned().collect());
        // Persist without holding the shard lock.
        drop(state);

        if let (Some(store), Some(snapshot)) = (&self.store, snapshot) {
            if let Err(err) = store.put(task_name, &snapshot) {
                warn!(task = task_name, error = %err, "failed to persist task history");
            }
        }

        Ok(record)
    }

    /// Most recent first, including the running execution if any.
    pub fn history(&self, task_name: &str, limit: usize) -> Vec<TaskExecutionRecord> {
        let Some(state) = self.states.get(task_name) else {
            return Vec::new();
        };
        state
            .running
            .iter()
            .chain(state.history.iter())
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn latest(&self, task_name: &str) -> Option<TaskExecutionRecord> {
        self.states.get(task_name)?.latest().cloned()
    }

    pub fn running(&self, task_name: &str) -> Option<TaskExecutionRecord> {
        self.states.get(task_name)?.running.clone()
    }

    /// Latest status per task that has ever run.
    pub fn all_statuses(&self) -> BTreeMap<String, TaskStatus> {
        self.states
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .latest()
                    .map(|r| (entry.key().clone(), r.status))
            })
            .collect()
    }

    pub fn consecutive_failures(&self, task_name: &str) -> u32 {
        self.states
            .get(task_name)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    /// Drop completed history for a task; a running execution is kept.
    pub fn clear_history(&self, task_name: &str) -> Result<(), TaskError> {
        if let Some(mut state) = self.states.get_mut(task_name) {
            state.history.clear();
            state.consecutive_failures = 0;
        }
        if let Some(store) = &self.store {
            store.delete(task_name)?;
        }
        Ok(())
    }

    /// Alert operators about a failed execution.
    ///
    /// Escalates to [`Severity::Critical`] once the task has failed
    /// `failure_alert_threshold` times in a row.
    #[instrument(skip(self, error), fields(task = task_name))]
    pub async fn handle_task_failure(&self, task_name: &str, error: &str) {
        let failures = self.consecutive_failures(task_name);
        let threshold = self.config.failure_alert_threshold;
        let severity = if threshold > 0 && failures >= threshold {
            Severity::Critical
        } else {
            Severity::Error
        };

        let title = format!("Scheduled task '{task_name}' failed");
        let message = format!("{error} ({failures} consecutive failure(s))");
        if let Err(err) = self.notifier.notify(&title, &message, severity).await {
            warn!(error = %err, "failed to send task failure notification");
        }
    }

    /// Operator-triggered re-run of a task whose latest execution failed.
    #[instrument(skip(self, registry, runner), fields(task = task_name))]
    pub async fn retry_failed_task(
        &self,
        task_name: &str,
        registry: &TaskRegistry,
        runner: &TaskRunner,
    ) -> Result<TaskExecutionRecord, TaskError> {
        if registry.get(task_name).is_none() {
            return Err(TaskError::UnknownTask(task_name.to_string()));
        }
        let task = registry
            .task(task_name)
            .ok_or_else(|| TaskError::NotExecutable(task_name.to_string()))?;

        match self.latest(task_name).map(|r| r.status) {
            Some(TaskStatus::Failed) => {}
            status => {
                return Err(TaskError::NotFailed {
                    task: task_name.to_string(),
                    status,
                });
            }
        }

        info!("re-running failed task");
        Ok(runner.execute(task.as_ref(), TriggerSource::Retry).await?)
    }
}
