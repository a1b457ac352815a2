//! Dependency-injected construction of the background layer.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use backline_core::{Clock, LogNotifier, Notifier, SystemClock};
use backline_events::{
    DeadLetterQueue, DeadLetterStore, EventPublisher, EventRetryExecutor, InMemoryDeadLetterStore,
    InMemoryRetryLedger, InvalidPolicyError, RetryLedger,
};
use backline_tasks::builtin::RecordCleanupTask;
use backline_tasks::{
    HistoryStoreError, RegistryError, ScheduledTask, TaskDescriptor, TaskError,
    TaskExecutionRecord, TaskHistoryStore, TaskMonitor, TaskPerformanceTracker, TaskRegistry,
    TaskRunner, TaskScheduler,
};

use crate::config::BacklineConfig;
use crate::maintenance::{DeadLetterFlushTask, LedgerCleanupTarget};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(#[from] InvalidPolicyError),

    #[error("failed to load task history: {0}")]
    History(#[from] HistoryStoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Collaborators for [`Runtime`]; anything not supplied gets an in-memory
/// or system default.
pub struct RuntimeBuilder {
    config: BacklineConfig,
    clock: Option<Arc<dyn Clock>>,
    notifier: Option<Arc<dyn Notifier>>,
    ledger: Option<Arc<dyn RetryLedger>>,
    dead_letter_store: Option<Arc<dyn DeadLetterStore>>,
    history_store: Option<Arc<dyn TaskHistoryStore>>,
}

impl RuntimeBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn RetryLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letter_store = Some(store);
        self
    }

    /// Persist completed task history; existing history is loaded at build time.
    pub fn history_store(mut self, store: Arc<dyn TaskHistoryStore>) -> Self {
        self.history_store = Some(store);
        self
    }

    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let config = self.config;
        let policy = config.retry_policy()?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let notifier: Arc<dyn Notifier> = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));
        let ledger: Arc<dyn RetryLedger> = self
            .ledger
            .unwrap_or_else(|| Arc::new(InMemoryRetryLedger::new()));
        let dead_letter_store: Arc<dyn DeadLetterStore> = self
            .dead_letter_store
            .unwrap_or_else(|| Arc::new(InMemoryDeadLetterStore::new()));

        let dead_letters = Arc::new(DeadLetterQueue::new(
            dead_letter_store,
            Arc::clone(&notifier),
            Arc::clone(&clock),
        ));
        let mut executor =
            EventRetryExecutor::new(Arc::clone(&ledger), Arc::clone(&dead_letters), Arc::clone(&clock))
                .with_default_policy(policy);
        if let Some(seed) = config.jitter_seed {
            executor = executor.with_jitter_seed(seed);
        }
        let executor = Arc::new(executor);
        let publisher = Arc::new(EventPublisher::new(Arc::clone(&executor)));

        let monitor = Arc::new(match self.history_store {
            Some(store) => TaskMonitor::with_store(
                config.monitor.clone(),
                Arc::clone(&notifier),
                Arc::clone(&clock),
                store,
            )?,
            None => TaskMonitor::new(config.monitor.clone(), Arc::clone(&notifier), Arc::clone(&clock)),
        });
        let tracker = Arc::new(TaskPerformanceTracker::new(
            config.performance.clone(),
            Arc::clone(&clock),
        ));
        let runner = Arc::new(TaskRunner::new(
            Arc::clone(&monitor),
            Arc::clone(&tracker),
            Arc::clone(&clock),
        ));
        let registry = Arc::new(TaskRegistry::new());
        let scheduler = TaskScheduler::new(Arc::clone(&registry), Arc::clone(&runner), Arc::clone(&clock));

        Ok(Runtime {
            config,
            clock,
            notifier,
            ledger,
            dead_letters,
            executor,
            publisher,
            registry,
            monitor,
            tracker,
            runner,
            scheduler,
        })
    }
}

/// The process-wide set of background components.
pub struct Runtime {
    config: BacklineConfig,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    ledger: Arc<dyn RetryLedger>,
    dead_letters: Arc<DeadLetterQueue>,
    executor: Arc<EventRetryExecutor>,
    publisher: Arc<EventPublisher>,
    registry: Arc<TaskRegistry>,
    monitor: Arc<TaskMonitor>,
    tracker: Arc<TaskPerformanceTracker>,
    runner: Arc<TaskRunner>,
    scheduler: TaskScheduler,
}

impl Runtime {
    pub fn builder(config: BacklineConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            clock: None,
            notifier: None,
            ledger: None,
            dead_letter_store: None,
            history_store: None,
        }
    }

    pub fn config(&self) -> &BacklineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn ledger(&self) -> &Arc<dyn RetryLedger> {
        &self.ledger
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    pub fn executor(&self) -> &Arc<EventRetryExecutor> {
        &self.executor
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<TaskMonitor> {
        &self.monitor
    }

    pub fn tracker(&self) -> &Arc<TaskPerformanceTracker> {
        &self.tracker
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn register_task(
        &self,
        task: Arc<dyn ScheduledTask>,
        schedule_expression: &str,
    ) -> Result<TaskDescriptor, RuntimeError> {
        Ok(self.registry.register_task(task, schedule_expression)?)
    }

    /// Register ledger cleanup and dead-letter flushing per the maintenance config.
    /// Returns the number of tasks registered.
    pub fn register_maintenance_tasks(&self) -> Result<usize, RuntimeError> {
        let maintenance = &self.config.maintenance;
        if !maintenance.enabled {
            return Ok(0);
        }

        let retention = chrono::Duration::hours(i64::from(maintenance.ledger_retention_hours));
        let cleanup = RecordCleanupTask::new(retention, Arc::clone(&self.clock))
            .with_target(Arc::new(LedgerCleanupTarget::new(Arc::clone(&self.ledger))));
        self.register_task(Arc::new(cleanup), &maintenance.ledger_cleanup_schedule)?;

        let flush = DeadLetterFlushTask::new(Arc::clone(&self.dead_letters));
        self.register_task(Arc::new(flush), &maintenance.dead_letter_flush_schedule)?;
        Ok(2)
    }

    /// Run a task now, outside its schedule.
    pub async fn trigger(&self, task_name: &str) -> Result<TaskExecutionRecord, RuntimeError> {
        Ok(self.scheduler.trigger(task_name).await?)
    }

    /// Operator re-run of a task whose latest execution failed.
    pub async fn retry_failed_task(&self, task_name: &str) -> Result<TaskExecutionRecord, RuntimeError> {
        Ok(self
            .monitor
            .retry_failed_task(task_name, &self.registry, &self.runner)
            .await?)
    }

    /// Start the task scheduler. Event dispatch needs no start: it runs on
    /// `publish`.
    pub async fn start(&self) -> Result<usize, RuntimeError> {
        let started = self.scheduler.start().await?;
        info!(tasks = started, "background runtime started");
        Ok(started)
    }

    /// Stop the scheduler, refuse new events and wait for running retry
    /// campaigns (bounded by `shutdown_grace_secs` when set).
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.publisher.close();
        self.drain_events().await;

        match self.ledger.in_flight() {
            Ok(open) => {
                for entry in open {
                    warn!(
                        key = %entry.key,
                        attempts = entry.attempts.len(),
                        last_error = entry.last_error.as_deref().unwrap_or(""),
                        "retry campaign still in flight at shutdown"
                    );
                }
            }
            Err(err) => warn!(error = %err, "could not list in-flight retry campaigns"),
        }

        let parked = self.dead_letters.pending_fallback().len();
        if parked > 0 {
            error!(parked, "shutting down with dead letters still buffered");
        }
        info!("background runtime stopped");
    }

    async fn drain_events(&self) {
        let Some(grace_secs) = self.config.shutdown_grace_secs else {
            self.publisher.drain().await;
            return;
        };
        let grace = Duration::from_secs(grace_secs);
        if tokio::time::timeout(grace, self.publisher.drain()).await.is_err() {
            warn!(
                grace_secs,
                in_flight = self.publisher.in_flight(),
                "shutdown grace period elapsed with event campaigns still running"
            );
        }
    }
}
