//! Fan-out dispatch of domain events to subscribed handlers.
//!
//! ## Delivery model
//!
//! - **Per-handler isolation**: every handler runs in its own retry campaign on
//!   its own tokio task, so one handler's exhaustion never blocks or fails the
//!   others for the same event
//! - **Fire-and-forget with tracked outcome**: `publish` returns as soon as the
//!   handler tasks are spawned; the returned [`DispatchHandle`] can be awaited
//!   when the caller (typically a test) wants the outcome
//! - **Tolerant routing**: an event type nobody subscribed to is a no-op
//! - **At-least-once**: handlers must be idempotent
//! - **Graceful stop**: [`EventPublisher::close`] refuses new dispatches and
//!   [`EventPublisher::drain`] waits for every running campaign, including
//!   ones whose handle was dropped
//!
//! `publish` must be called from within a tokio runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use backline_core::{DeadLetterId, EventId};

use crate::retry::{
    DeadLetterDeliveryError, DeadLetterError, EventRetryExecutor, RetryOutcome, RetryPolicy,
};
use crate::{Event, EventHandler};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("handler '{handler}' is already subscribed to '{event_type}'")]
    DuplicateHandler { event_type: String, handler: String },
    #[error("no handler '{handler}' subscribed to '{event_type}'")]
    UnknownHandler { event_type: String, handler: String },
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
}

/// Why a handler produced no [`RetryOutcome`].
#[derive(Debug, Error)]
pub enum DispatchFailure {
    #[error(transparent)]
    DeadLetterDelivery(#[from] DeadLetterDeliveryError),
    #[error("dispatch task aborted: {0}")]
    Aborted(String),
}

/// Result of one handler's campaign.
#[derive(Debug)]
pub struct HandlerReport {
    pub handler: String,
    pub result: Result<RetryOutcome, DispatchFailure>,
}

/// Results for every handler an event was dispatched to.
#[derive(Debug)]
pub struct DispatchReport {
    pub event_id: EventId,
    pub handlers: Vec<HandlerReport>,
}

impl DispatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.handlers
            .iter()
            .all(|h| matches!(&h.result, Ok(outcome) if outcome.is_success()))
    }

    pub fn for_handler(&self, handler: &str) -> Option<&HandlerReport> {
        self.handlers.iter().find(|h| h.handler == handler)
    }
}

/// Handle on the handler tasks spawned by one `publish`.
///
/// Dropping the handle does not cancel anything; campaigns always run to
/// success or exhaustion.
#[derive(Debug)]
pub struct DispatchHandle {
    event_id: EventId,
    tasks: Vec<(String, JoinHandle<Result<RetryOutcome, DeadLetterDeliveryError>>)>,
}

impl DispatchHandle {
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Number of handlers the event was dispatched to.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|(name, _)| name.as_str())
    }

    /// Wait for every campaign to finish.
    pub async fn wait(self) -> DispatchReport {
        let mut handlers = Vec::with_capacity(self.tasks.len());
        for (handler, task) in self.tasks {
            let result = match task.await {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(err)) => Err(DispatchFailure::DeadLetterDelivery(err)),
                Err(join_err) => Err(DispatchFailure::Aborted(join_err.to_string())),
            };
            handlers.push(HandlerReport { handler, result });
        }
        DispatchReport {
            event_id: self.event_id,
            handlers,
        }
    }
}

#[derive(Clone)]
struct Subscription {
    handler: Arc<dyn EventHandler>,
    policy: Option<RetryPolicy>,
}

/// Decrements the in-flight campaign count when a dispatch task ends,
/// including by panic or abort.
struct CampaignGuard(Arc<watch::Sender<usize>>);

impl Drop for CampaignGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Routes events to handlers by event type, each wrapped in the retry executor.
pub struct EventPublisher {
    executor: Arc<EventRetryExecutor>,
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    in_flight: Arc<watch::Sender<usize>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subs = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        let counts: HashMap<&str, usize> = subs.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("EventPublisher")
            .field("subscriptions", &counts)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl EventPublisher {
    pub fn new(executor: Arc<EventRetryExecutor>) -> Self {
        Self {
            executor,
            subscriptions: RwLock::new(HashMap::new()),
            in_flight: Arc::new(watch::channel(0).0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn executor(&self) -> &Arc<EventRetryExecutor> {
        &self.executor
    }

    /// Subscribe a handler using the executor's default retry policy.
    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), PublishError> {
        self.add_subscription(event_type.into(), handler, None)
    }

    /// Subscribe a handler with its own retry policy.
    pub fn subscribe_with_policy(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        policy: RetryPolicy,
    ) -> Result<(), PublishError> {
        self.add_subscription(event_type.into(), handler, Some(policy))
    }

    fn add_subscription(
        &self,
        event_type: String,
        handler: Arc<dyn EventHandler>,
        policy: Option<RetryPolicy>,
    ) -> Result<(), PublishError> {
        let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        let handlers = subs.entry(event_type.clone()).or_default();

        if handlers.iter().any(|s| s.handler.name() == handler.name()) {
            return Err(PublishError::DuplicateHandler {
                event_type,
                handler: handler.name().to_string(),
            });
        }

        debug!(event_type = %event_type, handler = %handler.name(), "handler subscribed");
        handlers.push(Subscription { handler, policy });
        Ok(())
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Dispatch `event` to every handler subscribed to its type.
    pub fn publish(&self, event: Event) -> DispatchHandle {
        let subs = self.subscriptions_for(event.event_type());
        if subs.is_empty() {
            debug!(event_id = %event.id(), event_type = %event.event_type(), "no handlers for event type");
        }
        self.dispatch(event, subs)
    }

    /// Dispatch `event` to a single named handler.
    pub fn redeliver(&self, event: Event, handler: &str) -> Result<DispatchHandle, PublishError> {
        let sub = self
            .subscriptions_for(event.event_type())
            .into_iter()
            .find(|s| s.handler.name() == handler)
            .ok_or_else(|| PublishError::UnknownHandler {
                event_type: event.event_type().to_string(),
                handler: handler.to_string(),
            })?;
        Ok(self.dispatch(event, vec![sub]))
    }

    /// Operator-triggered recovery: re-inject a dead-lettered event into the
    /// handler that gave up on it.
    pub fn replay_dead_letter(&self, id: DeadLetterId) -> Result<DispatchHandle, PublishError> {
        let dead_letters = self.executor.dead_letters();
        let entry = dead_letters.get(id)?.ok_or(DeadLetterError::NotFound(id))?;

        if self
            .subscriptions_for(entry.event.event_type())
            .iter()
            .all(|s| s.handler.name() != entry.handler)
        {
            return Err(PublishError::UnknownHandler {
                event_type: entry.event.event_type().to_string(),
                handler: entry.handler,
            });
        }

        let event = dead_letters.replay(id)?;
        info!(dead_letter_id = %id, event_id = %event.id(), handler = %entry.handler, "replaying dead letter");
        self.redeliver(event, &entry.handler)
    }

    /// Handler campaigns currently running.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting events. Later `publish`/`redeliver` calls dispatch
    /// nothing and return an empty handle. Running campaigns continue.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(in_flight = self.in_flight(), "event publisher closed");
        }
    }

    /// Wait until every spawned campaign has finished.
    ///
    /// Does not close the publisher; events published meanwhile are waited
    /// for too.
    pub async fn drain(&self) {
        let mut rx = self.in_flight.subscribe();
        let pending = *rx.borrow_and_update();
        if pending == 0 {
            return;
        }
        debug!(pending, "draining event campaigns");
        // the sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|n| *n == 0).await;
        debug!("event campaigns drained");
    }

    fn subscriptions_for(&self, event_type: &str) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    fn dispatch(&self, event: Event, subs: Vec<Subscription>) -> DispatchHandle {
        let event_id = event.id();
        if self.is_closed() {
            warn!(event_id = %event_id, event_type = %event.event_type(), "publisher closed; event not dispatched");
            return DispatchHandle {
                event_id,
                tasks: Vec::new(),
            };
        }

        let event = Arc::new(event);
        let mut tasks = Vec::with_capacity(subs.len());

        for sub in subs {
            let name = sub.handler.name().to_string();
            let executor = Arc::clone(&self.executor);
            let event = Arc::clone(&event);
            self.in_flight.send_modify(|n| *n += 1);
            let guard = CampaignGuard(Arc::clone(&self.in_flight));

            let task = tokio::spawn(async move {
                let _guard = guard;
                let result = executor
                    .execute_with_retry(&event, sub.handler.as_ref(), sub.policy.as_ref())
                    .await;
                if let Err(err) = &result {
                    warn!(error = %err, "dead-letter delivery failed during dispatch");
                }
                result
            });
            tasks.push((name, task));
        }

        debug!(event_id = %event_id, handlers = tasks.len(), "event dispatched");
        DispatchHandle { event_id, tasks }
    }
}
