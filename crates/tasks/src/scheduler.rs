//! Timer driver: fires registered tasks on their schedules.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use backline_core::Clock;

use crate::monitor::{TaskError, TaskExecutionRecord, TriggerSource};
use crate::registry::TaskRegistry;
use crate::schedule::TaskSchedule;
use crate::task::{ScheduledTask, TaskRunner};

pub struct TaskScheduler {
    registry: Arc<TaskRegistry>,
    runner: Arc<TaskRunner>,
    clock: Arc<dyn Clock>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl TaskScheduler {
    pub fn new(registry: Arc<TaskRegistry>, runner: Arc<TaskRunner>, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registry,
            runner,
            clock,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn one loop per runnable task. Returns the number of loops started.
    ///
    /// Tasks registered after `start` are not picked up.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<usize, TaskError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TaskError::AlreadyStarted);
        }

        let mut handles = self.handles.lock().await;
        for (schedule, task) in self.registry.runnable() {
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(run_loop(
                schedule,
                task,
                Arc::clone(&self.runner),
                Arc::clone(&self.clock),
                shutdown_rx,
            )));
        }

        info!(task_count = handles.len(), "task scheduler started");
        Ok(handles.len())
    }

    /// Run a registered task now, outside its schedule.
    #[instrument(skip(self))]
    pub async fn trigger(&self, task_name: &str) -> Result<TaskExecutionRecord, TaskError> {
        if self.registry.get(task_name).is_none() {
            return Err(TaskError::UnknownTask(task_name.to_string()));
        }
        let task = self
            .registry
            .task(task_name)
            .ok_or_else(|| TaskError::NotExecutable(task_name.to_string()))?;
        Ok(self.runner.execute(task.as_ref(), TriggerSource::Manual).await?)
    }

    /// Stop every loop and wait for them. An execution in progress finishes first.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(err) = handle.await {
                warn!(error = %err, "task loop ended abnormally");
            }
        }

        info!("task scheduler shut down");
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }
}

async fn run_loop(
    schedule: TaskSchedule,
    task: Arc<dyn ScheduledTask>,
    runner: Arc<TaskRunner>,
    clock: Arc<dyn Clock>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let name = task.name().to_string();
    loop {
        let Some(next) = schedule.next_after(clock.now()) else {
            warn!(task = %name, schedule = %schedule, "schedule has no further fire times");
            break;
        };
        debug!(task = %name, next = %next, "next run scheduled");

        tokio::select! {
            _ = clock.sleep_until(next) => {
                // ConcurrentExecutionError: the previous run (manual or retry) is still going.
                if let Err(err) = runner.execute(task.as_ref(), TriggerSource::Schedule).await {
                    debug!(task = %name, error = %err, "skipped scheduled run");
                }
            }
            _ = shutdown_rx.recv() => {
                info!(task = %name, "stopping task loop");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{MonitorConfig, TaskMonitor, TaskStatus};
    use crate::performance::{PerformanceConfig, TaskPerformanceTracker};
    use async_trait::async_trait;
    use backline_core::{ManualClock, MemoryNotifier};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Counting {
        runs: AtomicU32,
    }

    #[async_trait]
    impl ScheduledTask for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn description(&self) -> &str {
            "counts its runs"
        }

        async fn run_body(&self) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scheduler(clock: Arc<ManualClock>) -> (TaskScheduler, Arc<Counting>) {
        let monitor = Arc::new(TaskMonitor::new(
            MonitorConfig::default(),
            Arc::new(MemoryNotifier::new()),
            clock.clone(),
        ));
        let tracker = Arc::new(TaskPerformanceTracker::new(
            PerformanceConfig::default(),
            clock.clone(),
        ));
        let runner = Arc::new(TaskRunner::new(monitor, tracker, clock.clone()));
        let registry = Arc::new(TaskRegistry::new());
        let task = Arc::new(Counting {
            runs: AtomicU32::new(0),
        });
        registry.register_task(task.clone(), "every 1m").unwrap();
        (TaskScheduler::new(registry, runner, clock), task)
    }

    #[tokio::test]
    async fn loops_fire_on_schedule_until_shutdown() {
        let clock = Arc::new(ManualClock::at_epoch());
        let (scheduler, task) = scheduler(clock.clone());

        assert_eq!(scheduler.start().await.unwrap(), 1);
        while task.runs.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }
        scheduler.shutdown().await;

        let sleeps = clock.sleeps();
        assert!(sleeps.len() >= 3);
        assert!(sleeps.iter().all(|d| *d == Duration::from_secs(60)));

        let history = scheduler.runner().monitor().history("counting", 10);
        assert!(history.len() >= 3);
        assert!(history.iter().all(|r| r.trigger == TriggerSource::Schedule));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let clock = Arc::new(ManualClock::at_epoch());
        let (scheduler, _) = scheduler(clock);
        scheduler.start().await.unwrap();
        assert!(matches!(scheduler.start().await, Err(TaskError::AlreadyStarted)));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn trigger_runs_task_manually() {
        let clock = Arc::new(ManualClock::at_epoch());
        let (scheduler, task) = scheduler(clock);

        let record = scheduler.trigger("counting").await.unwrap();
        assert_eq!(record.status, TaskStatus::Succeeded);
        assert_eq!(record.trigger, TriggerSource::Manual);
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);

        assert!(matches!(
            scheduler.trigger("missing").await,
            Err(TaskError::UnknownTask(_))
        ));
    }
}
