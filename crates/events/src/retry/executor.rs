//! Retry executor: drives one event through one handler under a retry policy.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use backline_core::{Clock, DeadLetterId, capture};

use super::dead_letter::{DeadLetterDeliveryError, DeadLetterQueue};
use super::ledger::{LedgerError, RetryKey, RetryLedger};
use super::policy::RetryPolicy;
use crate::{Event, EventHandler};

/// How a retry campaign ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RetryOutcome {
    /// The handler succeeded on attempt `attempts`.
    Succeeded { attempts: u32 },
    /// Every attempt failed; the event was dead-lettered.
    Exhausted {
        attempts: u32,
        dead_letter_id: DeadLetterId,
    },
    /// Another campaign for the same event and handler is still running;
    /// the handler was not invoked.
    AlreadyInFlight,
}

impl RetryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts } | RetryOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
            RetryOutcome::AlreadyInFlight => 0,
        }
    }
}

/// Runs handlers with retry, backoff and dead-lettering.
///
/// ## Semantics
///
/// - Attempt 1 runs inline; the ledger records it right before the handler is invoked
/// - A failed attempt is recorded with its error; the next attempt waits out
///   `policy.delay_for_attempt(n)` on the clock (a non-blocking suspension)
/// - Success deletes the ledger entry
/// - After `max_attempts` failures the event goes to the dead-letter queue and
///   the ledger entry becomes a terminal marker
///
/// Handler failures never escape: they end up in the ledger and the dead-letter
/// queue. The only error returned is [`DeadLetterDeliveryError`], because
/// losing a dead letter means losing the event.
///
/// Delivery is at-least-once; handlers must tolerate repeated invocation.
pub struct EventRetryExecutor {
    ledger: Arc<dyn RetryLedger>,
    dead_letters: Arc<DeadLetterQueue>,
    clock: Arc<dyn Clock>,
    default_policy: RetryPolicy,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for EventRetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRetryExecutor")
            .field("default_policy", &self.default_policy)
            .finish_non_exhaustive()
    }
}

impl EventRetryExecutor {
    pub fn new(
        ledger: Arc<dyn RetryLedger>,
        dead_letters: Arc<DeadLetterQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            dead_letters,
            clock,
            default_policy: RetryPolicy::default(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Policy used when a caller does not pass one.
    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Seed the jitter RNG so backoff delays are reproducible.
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    pub fn ledger(&self) -> &Arc<dyn RetryLedger> {
        &self.ledger
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    /// Deliver `event` to `processor`, retrying under `policy` (or the default).
    #[instrument(
        skip(self, event, processor, policy),
        fields(event_id = %event.id(), event_type = %event.event_type(), handler = %processor.name())
    )]
    pub async fn execute_with_retry(
        &self,
        event: &Event,
        processor: &dyn EventHandler,
        policy: Option<&RetryPolicy>,
    ) -> Result<RetryOutcome, DeadLetterDeliveryError> {
        let policy = policy.unwrap_or(&self.default_policy);
        let key = RetryKey::new(event.id(), processor.name());

        match self.ledger.begin(&key, self.clock.now()) {
            Ok(()) => {}
            Err(LedgerError::CampaignActive(_)) => {
                warn!("retry campaign already in flight; skipping delivery");
                return Ok(RetryOutcome::AlreadyInFlight);
            }
            Err(err) => warn!(error = %err, "retry ledger unavailable; continuing without bookkeeping"),
        }

        let mut attempt: u32 = 1;
        let mut first_failed_at: Option<DateTime<Utc>> = None;

        loop {
            if attempt > 1 {
                let result = self.ledger.record_attempt(&key, attempt, self.clock.now());
                self.bookkeep("record_attempt", result);
            }

            debug!(attempt, max_attempts = policy.max_attempts(), "invoking handler");

            match capture(processor.handle(event)).await {
                Ok(()) => {
                    self.bookkeep("complete", self.ledger.complete(&key));
                    if attempt > 1 {
                        info!(attempts = attempt, "handler succeeded after retry");
                    } else {
                        debug!("handler succeeded");
                    }
                    return Ok(RetryOutcome::Succeeded { attempts: attempt });
                }
                Err(err) => {
                    let failed_at = self.clock.now();
                    let first_failed = *first_failed_at.get_or_insert(failed_at);

                    if policy.should_retry(attempt) {
                        let delay = self.next_delay(policy, attempt);
                        let next_at = failed_at
                            + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
                        let result = self.ledger.record_failure(
                            &key,
                            attempt,
                            err.message(),
                            failed_at,
                            Some(next_at),
                        );
                        self.bookkeep("record_failure", result);

                        warn!(
                            attempt,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "handler failed; retry scheduled"
                        );
                        self.clock.sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    let result =
                        self.ledger
                            .record_failure(&key, attempt, err.message(), failed_at, None);
                    self.bookkeep("record_failure", result);
                    warn!(attempts = attempt, error = %err, "retries exhausted; dead-lettering event");

                    let sent = self
                        .dead_letters
                        .send(event, processor.name(), err.message(), attempt, first_failed)
                        .await;
                    self.bookkeep("mark_failed", self.ledger.mark_failed(&key, self.clock.now()));

                    let dead_letter_id = sent?;
                    return Ok(RetryOutcome::Exhausted {
                        attempts: attempt,
                        dead_letter_id,
                    });
                }
            }
        }
    }

    fn next_delay(&self, policy: &RetryPolicy, attempt: u32) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        policy.delay_for_attempt_with(attempt, &mut *rng)
    }

    fn bookkeep(&self, op: &'static str, result: Result<(), LedgerError>) {
        if let Err(err) = result {
            warn!(op, error = %err, "retry ledger update failed");
        }
    }
}
