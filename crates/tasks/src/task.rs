//! The scheduled-task contract and the execution wrapper around it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, instrument, warn};

use backline_core::{Clock, capture};

use crate::monitor::{
    ConcurrentExecutionError, TaskExecutionRecord, TaskMonitor, TaskStatus, TriggerSource,
};
use crate::performance::{PerformanceSample, TaskPerformanceTracker};

/// A unit of recurring background work.
///
/// Implementors provide only the business step; timing, monitoring and error
/// capture are applied by [`TaskRunner::execute`].
#[async_trait]
pub trait ScheduledTask: Send + Sync + 'static {
    /// Unique key in the registry.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn run_body(&self) -> anyhow::Result<()>;
}

/// Execution wrapper shared by every task.
pub struct TaskRunner {
    monitor: Arc<TaskMonitor>,
    tracker: Arc<TaskPerformanceTracker>,
    clock: Arc<dyn Clock>,
}

impl TaskRunner {
    pub fn new(
        monitor: Arc<TaskMonitor>,
        tracker: Arc<TaskPerformanceTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            monitor,
            tracker,
            clock,
        }
    }

    pub fn monitor(&self) -> &Arc<TaskMonitor> {
        &self.monitor
    }

    pub fn tracker(&self) -> &Arc<TaskPerformanceTracker> {
        &self.tracker
    }

    /// Run `task` once.
    ///
    /// Fails only when the task is already running. A failing or panicking
    /// body is recorded as `FAILED` in the returned record and reported to the
    /// monitor; it never propagates to the caller.
    #[instrument(skip(self, task), fields(task = %task.name()))]
    pub async fn execute(
        &self,
        task: &dyn ScheduledTask,
        trigger: TriggerSource,
    ) -> Result<TaskExecutionRecord, ConcurrentExecutionError> {
        let name = task.name();
        let started = match self.monitor.record_start(name, trigger) {
            Ok(record) => record,
            Err(err) => {
                warn!(running = %err.running, "task already running, skipping");
                return Err(err);
            }
        };

        let outcome = capture(task.run_body()).await;

        let (status, error) = match &outcome {
            Ok(()) => (TaskStatus::Succeeded, None),
            Err(err) => (TaskStatus::Failed, Some(err.message().to_string())),
        };
        let record = match self
            .monitor
            .record_completion(name, started.id, status, error.clone())
        {
            Ok(record) => record,
            Err(err) => {
                // Only reachable if the RUNNING record was cleared under us.
                error!(error = %err, execution_id = %started.id, "failed to close execution record");
                let finished_at = self.clock.now();
                TaskExecutionRecord {
                    finished_at: Some(finished_at),
                    duration_ms: Some(
                        (finished_at - started.started_at)
                            .num_milliseconds()
                            .max(0) as u64,
                    ),
                    status,
                    error: error.clone(),
                    ..started
                }
            }
        };

        let duration_ms = record.duration_ms.unwrap_or(0);
        self.tracker.record(PerformanceSample {
            task_name: name.to_string(),
            duration_ms,
            succeeded: status == TaskStatus::Succeeded,
            timestamp: record.finished_at.unwrap_or(record.started_at),
        });

        match error {
            None => {
                info!(execution_id = %record.id, duration_ms, ?trigger, "task succeeded");
            }
            Some(err) => {
                warn!(execution_id = %record.id, duration_ms, error = %err, "task failed");
                self.monitor.handle_task_failure(name, &err).await;
            }
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorConfig;
    use crate::performance::PerformanceConfig;
    use crate::registry::TaskRegistry;
    use crate::monitor::TaskError;
    use backline_core::{ManualClock, MemoryNotifier, Severity};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Harness {
        runner: TaskRunner,
        clock: Arc<ManualClock>,
        notifier: Arc<MemoryNotifier>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::at_epoch());
        let notifier = Arc::new(MemoryNotifier::new());
        let monitor = Arc::new(TaskMonitor::new(
            MonitorConfig::default(),
            notifier.clone(),
            clock.clone(),
        ));
        let tracker = Arc::new(TaskPerformanceTracker::new(
            PerformanceConfig::default(),
            clock.clone(),
        ));
        Harness {
            runner: TaskRunner::new(monitor, tracker, clock.clone()),
            clock,
            notifier,
        }
    }

    /// Sleeps 40ms of virtual time, then fails on the calls listed in `fail_on`.
    struct Scripted {
        clock: Arc<ManualClock>,
        calls: AtomicU32,
        fail_on: Vec<u32>,
    }

    #[async_trait]
    impl ScheduledTask for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn description(&self) -> &str {
            "test task"
        }

        async fn run_body(&self) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.clock.sleep(Duration::from_millis(40)).await;
            if self.fail_on.contains(&call) {
                anyhow::bail!("call {call} failed");
            }
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl ScheduledTask for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        fn description(&self) -> &str {
            "always panics"
        }

        async fn run_body(&self) -> anyhow::Result<()> {
            let items: Vec<u32> = Vec::new();
            let _ = items[3];
            Ok(())
        }
    }

    #[tokio::test]
    async fn success_is_recorded_with_timing() {
        let h = harness();
        let task = Scripted {
            clock: h.clock.clone(),
            calls: AtomicU32::new(0),
            fail_on: vec![],
        };

        let record = h.runner.execute(&task, TriggerSource::Manual).await.unwrap();
        assert_eq!(record.status, TaskStatus::Succeeded);
        assert_eq!(record.duration_ms, Some(40));
        assert_eq!(record.trigger, TriggerSource::Manual);

        let metrics = h.runner.tracker().metrics_for("scripted").unwrap();
        assert_eq!(metrics.count, 1);
        assert_eq!(metrics.success_count, 1);
        assert!(h.notifier.notifications().is_empty());
    }

    #[tokio::test]
    async fn failure_is_recorded_not_rethrown() {
        let h = harness();
        let task = Scripted {
            clock: h.clock.clone(),
            calls: AtomicU32::new(0),
            fail_on: vec![1],
        };

        let record = h.runner.execute(&task, TriggerSource::Schedule).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("call 1 failed"));

        let metrics = h.runner.tracker().metrics_for("scripted").unwrap();
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(h.notifier.count_at_least(Severity::Error), 1);
        assert_eq!(
            h.runner.monitor().all_statuses().get("scripted"),
            Some(&TaskStatus::Failed)
        );
    }

    #[tokio::test]
    async fn panicking_body_is_captured() {
        let h = harness();
        let record = h.runner.execute(&Panics, TriggerSource::Manual).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.unwrap_or_default().starts_with("panicked"));
        assert!(h.runner.monitor().running("panics").is_none());
    }

    /// Blocks in its body until released.
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ScheduledTask for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        fn description(&self) -> &str {
            "waits to be released"
        }

        async fn run_body(&self) -> anyhow::Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_execution_of_same_task_is_rejected() {
        let h = harness();
        let runner = Arc::new(h.runner);
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        });

        let first = tokio::spawn({
            let runner = runner.clone();
            let gate = gate.clone();
            async move { runner.execute(gate.as_ref(), TriggerSource::Schedule).await }
        });
        gate.entered.notified().await;

        let second = runner.execute(gate.as_ref(), TriggerSource::Manual).await;
        let err = second.unwrap_err();
        assert_eq!(err.task, "gate");
        assert_eq!(runner.monitor().history("gate", 10).len(), 1);

        gate.release.notify_one();
        let record = first.await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Succeeded);
        assert_eq!(err.running, record.id);
        assert_eq!(runner.monitor().history("gate", 10).len(), 1);
    }

    #[tokio::test]
    async fn failed_task_can_be_retried_by_operator() {
        let h = harness();
        let task = Arc::new(Scripted {
            clock: h.clock.clone(),
            calls: AtomicU32::new(0),
            fail_on: vec![1],
        });
        let registry = TaskRegistry::new();
        registry.register_task(task.clone(), "every 1h").unwrap();
        let monitor = h.runner.monitor().clone();

        // nothing to retry yet
        let err = monitor
            .retry_failed_task("scripted", &registry, &h.runner)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotFailed { status: None, .. }));

        h.runner
            .execute(task.as_ref(), TriggerSource::Schedule)
            .await
            .unwrap();
        let retried = monitor
            .retry_failed_task("scripted", &registry, &h.runner)
            .await
            .unwrap();
        assert_eq!(retried.status, TaskStatus::Succeeded);
        assert_eq!(retried.trigger, TriggerSource::Retry);

        let err = monitor
            .retry_failed_task("scripted", &registry, &h.runner)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::NotFailed {
                status: Some(TaskStatus::Succeeded),
                ..
            }
        ));

        let err = monitor
            .retry_failed_task("missing", &registry, &h.runner)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::UnknownTask(_)));
    }
}
