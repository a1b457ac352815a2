use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use backline_core::Clock;

use crate::task::ScheduledTask;

/// A store whose old records can be purged.
#[async_trait]
pub trait CleanupTarget: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Delete records older than `cutoff`; returns how many were removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
}

/// Purges records older than the retention period from every target.
///
/// All targets are attempted even if one fails; the run fails if any did.
pub struct RecordCleanupTask {
    targets: Vec<Arc<dyn CleanupTarget>>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl RecordCleanupTask {
    pub fn new(retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            targets: Vec::new(),
            retention,
            clock,
        }
    }

    pub fn with_target(mut self, target: Arc<dyn CleanupTarget>) -> Self {
        self.targets.push(target);
        self
    }
}

#[async_trait]
impl ScheduledTask for RecordCleanupTask {
    fn name(&self) -> &str {
        "record-cleanup"
    }

    fn description(&self) -> &str {
        "Purge records older than the retention period"
    }

    async fn run_body(&self) -> anyhow::Result<()> {
        let cutoff = self.clock.now() - self.retention;
        let mut purged = 0u64;
        let mut failed = Vec::new();

        for target in &self.targets {
            match target.purge_older_than(cutoff).await {
                Ok(n) => {
                    info!(cleanup_target = target.name(), purged = n, %cutoff, "records purged");
                    purged += n;
                }
                Err(err) => {
                    warn!(cleanup_target = target.name(), error = %format!("{err:#}"), "cleanup target failed");
                    failed.push(format!("{}: {err:#}", target.name()));
                }
            }
        }

        if !failed.is_empty() {
            bail!("cleanup failed for {}", failed.join("; "));
        }
        info!(purged, targets = self.targets.len(), "cleanup finished");
        Ok(())
    }
}
