//! `backline-tasks`: scheduled maintenance and reporting jobs.
//!
//! Concrete jobs implement [`ScheduledTask`] (a name, a description and a
//! business step). The [`TaskRunner`] wraps every execution with timing,
//! monitoring and uniform error handling; the [`TaskScheduler`] fires tasks
//! from the [`TaskRegistry`] on their schedules.
//!
//! Task-level retry is operator-triggered ([`TaskMonitor::retry_failed_task`]);
//! it is deliberately separate from the automatic per-event retry in
//! `backline-events`.

pub mod builtin;
pub mod monitor;
pub mod performance;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod task;

pub use monitor::{
    ConcurrentExecutionError, HistoryStoreError, InMemoryTaskHistoryStore, MonitorConfig,
    TaskError, TaskExecutionRecord, TaskHistoryStore, TaskMonitor, TaskStatus, TriggerSource,
};
pub use performance::{PerformanceConfig, PerformanceSample, TaskMetrics, TaskPerformanceTracker};
pub use registry::{RegistryError, TaskDescriptor, TaskRegistry};
pub use schedule::{ScheduleError, TaskSchedule};
pub use scheduler::TaskScheduler;
pub use task::{ScheduledTask, TaskRunner};
