//! Housekeeping for the retry subsystem, run as scheduled tasks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use backline_events::{DeadLetterQueue, RetryLedger};
use backline_tasks::ScheduledTask;
use backline_tasks::builtin::CleanupTarget;

/// Purges terminal retry-ledger markers as part of record cleanup.
pub struct LedgerCleanupTarget {
    ledger: Arc<dyn RetryLedger>,
}

impl LedgerCleanupTarget {
    pub fn new(ledger: Arc<dyn RetryLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl CleanupTarget for LedgerCleanupTarget {
    fn name(&self) -> &str {
        "retry-ledger"
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let purged = self.ledger.purge_terminal_before(cutoff)?;
        Ok(purged as u64)
    }
}

/// Re-delivers dead letters that were parked in the fallback buffer while the
/// dead-letter store was unavailable. Fails while entries remain parked, so
/// the monitor keeps alerting.
pub struct DeadLetterFlushTask {
    dead_letters: Arc<DeadLetterQueue>,
}

impl DeadLetterFlushTask {
    pub fn new(dead_letters: Arc<DeadLetterQueue>) -> Self {
        Self { dead_letters }
    }
}

#[async_trait]
impl ScheduledTask for DeadLetterFlushTask {
    fn name(&self) -> &str {
        "dead-letter-flush"
    }

    fn description(&self) -> &str {
        "Re-deliver dead letters buffered during a dead-letter store outage"
    }

    async fn run_body(&self) -> anyhow::Result<()> {
        if self.dead_letters.pending_fallback().is_empty() {
            debug!("no buffered dead letters");
            return Ok(());
        }

        let delivered = self.dead_letters.flush_fallback();
        let remaining = self.dead_letters.pending_fallback().len();
        info!(delivered, remaining, "flushed buffered dead letters");
        if remaining > 0 {
            anyhow::bail!("{remaining} dead letter(s) still buffered after flush");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backline_core::{Clock, EventId, ManualClock};
    use backline_events::{InMemoryRetryLedger, RetryKey};
    use std::time::Duration;

    #[tokio::test]
    async fn ledger_target_purges_only_old_terminal_markers() {
        let clock = ManualClock::at_epoch();
        let ledger = Arc::new(InMemoryRetryLedger::new());

        let old = RetryKey::new(EventId::new(), "billing");
        ledger.begin(&old, clock.now()).unwrap();
        ledger.mark_failed(&old, clock.now()).unwrap();

        clock.advance(Duration::from_secs(3600));
        let recent = RetryKey::new(EventId::new(), "billing");
        ledger.begin(&recent, clock.now()).unwrap();
        ledger.mark_failed(&recent, clock.now()).unwrap();

        let active = RetryKey::new(EventId::new(), "billing");
        ledger.begin(&active, clock.now()).unwrap();

        let target = LedgerCleanupTarget::new(ledger.clone());
        let purged = target
            .purge_older_than(clock.now() - chrono::Duration::minutes(30))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert!(ledger.get(&old).unwrap().is_none());
        assert!(ledger.get(&recent).unwrap().is_some());
        assert!(ledger.get(&active).unwrap().is_some());
    }
}
