//! Rolling timing and error-rate statistics per task.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use backline_core::Clock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub task_name: String,
    pub duration_ms: u64,
    pub succeeded: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskMetrics {
    pub count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub mean_duration_ms: f64,
    pub p95_duration_ms: u64,
    pub failure_rate: f64,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Samples retained per task.
    pub window_samples: usize,
    /// Samples older than this are evicted.
    pub window_hours: u32,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            window_samples: 500,
            window_hours: 24,
        }
    }
}

pub struct TaskPerformanceTracker {
    samples: DashMap<String, VecDeque<PerformanceSample>>,
    config: PerformanceConfig,
    clock: Arc<dyn Clock>,
}

impl TaskPerformanceTracker {
    pub fn new(config: PerformanceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            samples: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &PerformanceConfig {
        &self.config
    }

    pub fn record(&self, sample: PerformanceSample) {
        let cutoff = self.cutoff();
        let mut window = self.samples.entry(sample.task_name.clone()).or_default();
        window.push_back(sample);
        self.evict(&mut window, cutoff);
    }

    /// Statistics over the current window; `None` when the task has no samples in it.
    pub fn metrics_for(&self, task_name: &str) -> Option<TaskMetrics> {
        let cutoff = self.cutoff();
        let mut window = self.samples.get_mut(task_name)?;
        self.evict(&mut window, cutoff);
        summarize(&window)
    }

    /// Failure rate per task over the current window.
    pub fn error_metrics(&self) -> BTreeMap<String, f64> {
        self.all_metrics()
            .into_iter()
            .map(|(name, m)| (name, m.failure_rate))
            .collect()
    }

    pub fn all_metrics(&self) -> BTreeMap<String, TaskMetrics> {
        let names: Vec<String> = self.samples.iter().map(|e| e.key().clone()).collect();
        names
            .into_iter()
            .filter_map(|name| self.metrics_for(&name).map(|m| (name, m)))
            .collect()
    }

    fn cutoff(&self) -> Option<DateTime<Utc>> {
        let window = Duration::try_hours(i64::from(self.config.window_hours))?;
        self.clock.now().checked_sub_signed(window)
    }

    fn evict(&self, window: &mut VecDeque<PerformanceSample>, cutoff: Option<DateTime<Utc>>) {
        while window.len() > self.config.window_samples {
            window.pop_front();
        }
        if let Some(cutoff) = cutoff {
            window.retain(|s| s.timestamp >= cutoff);
        }
    }
}

fn summarize(window: &VecDeque<PerformanceSample>) -> Option<TaskMetrics> {
    if window.is_empty() {
        return None;
    }
    let count = window.len();
    let success_count = window.iter().filter(|s| s.succeeded).count();
    let failure_count = count - success_count;

    let mut durations: Vec<u64> = window.iter().map(|s| s.duration_ms).collect();
    durations.sort_unstable();
    let total: u64 = durations.iter().sum();

    // nearest-rank: ceil(0.95 * n), 1-based
    let rank = (count * 95).div_ceil(100).max(1);
    let p95_duration_ms = durations[rank - 1];

    Some(TaskMetrics {
        count,
        success_count,
        failure_count,
        mean_duration_ms: total as f64 / count as f64,
        p95_duration_ms,
        failure_rate: failure_count as f64 / count as f64,
        last_run_at: window.iter().map(|s| s.timestamp).max(),
    })
}
