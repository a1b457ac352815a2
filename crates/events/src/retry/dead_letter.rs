//! Dead-letter queue for events whose retries are exhausted.
//!
//! Entries are append-only. Replay is an explicit operator action; nothing in
//! this layer replays automatically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use backline_core::{Clock, DeadLetterId, Notifier, Severity};

use super::ledger::RetryKey;
use crate::Event;

/// An event that exhausted its retry campaign for one handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub event: Event,
    pub handler: String,
    pub final_error: String,
    pub attempts_made: u32,
    pub first_failed_at: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
    /// Set once an operator re-injected the event.
    pub replayed_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn key(&self) -> RetryKey {
        RetryKey::new(self.event.id(), self.handler.clone())
    }

    pub fn is_replayed(&self) -> bool {
        self.replayed_at.is_some()
    }
}

/// Selection of dead-letter entries.
///
/// The default selects every entry that has not been replayed yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterFilter {
    pub event_type: Option<String>,
    pub handler: Option<String>,
    pub include_replayed: bool,
    pub limit: Option<usize>,
}

impl DeadLetterFilter {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_replayed(mut self) -> Self {
        self.include_replayed = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        (self.include_replayed || !entry.is_replayed())
            && self
                .event_type
                .as_deref()
                .is_none_or(|t| entry.event.event_type() == t)
            && self.handler.as_deref().is_none_or(|h| entry.handler == h)
    }
}

/// Dead-letter storage error.
#[derive(Debug, Clone, Error)]
pub enum DeadLetterError {
    #[error("dead-letter entry not found: {0}")]
    NotFound(DeadLetterId),
    #[error("dead-letter entry already replayed: {0}")]
    AlreadyReplayed(DeadLetterId),
    #[error("dead-letter storage error: {0}")]
    Storage(String),
}

/// The dead-letter sink itself failed.
///
/// This is the one failure that must surface: the entry was kept in the
/// fallback buffer and logged, but it is not durable until
/// [`DeadLetterQueue::flush_fallback`] succeeds.
#[derive(Debug, Clone, Error)]
#[error("dead-letter delivery failed for {key} after {attempts_made} attempts: {reason}")]
pub struct DeadLetterDeliveryError {
    pub key: RetryKey,
    pub entry_id: DeadLetterId,
    pub attempts_made: u32,
    pub reason: String,
}

/// Durable storage backend for dead-letter entries.
pub trait DeadLetterStore: Send + Sync {
    fn append(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError>;

    fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, DeadLetterError>;

    /// Entries matching `filter`, newest first.
    fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, DeadLetterError>;

    /// The un-replayed entry for a campaign key, if any.
    fn find_open(&self, key: &RetryKey) -> Result<Option<DeadLetterEntry>, DeadLetterError>;

    /// Stamp `replayed_at` and return the updated entry.
    fn mark_replayed(
        &self,
        id: DeadLetterId,
        at: DateTime<Utc>,
    ) -> Result<DeadLetterEntry, DeadLetterError>;
}

/// In-memory dead-letter store for tests/dev.
///
/// Un-replayed entries are indexed by campaign key, so `find_open` does not
/// scan the whole store.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    state: RwLock<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<DeadLetterId, DeadLetterEntry>,
    open: HashMap<RetryKey, DeadLetterId>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> DeadLetterError {
    DeadLetterError::Storage("lock poisoned".to_string())
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn append(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if !entry.is_replayed() {
            state.open.insert(entry.key(), entry.id);
        }
        state.entries.insert(entry.id, entry);
        Ok(())
    }

    fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.entries.get(&id).cloned())
    }

    fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = state
            .entries
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();

        result.sort_by(|a, b| b.sent_at.cmp(&a.sent_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    fn find_open(&self, key: &RetryKey) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state
            .open
            .get(key)
            .and_then(|id| state.entries.get(id))
            .cloned())
    }

    fn mark_replayed(
        &self,
        id: DeadLetterId,
        at: DateTime<Utc>,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let entry = state.entries.get_mut(&id).ok_or(DeadLetterError::NotFound(id))?;
        if entry.is_replayed() {
            return Err(DeadLetterError::AlreadyReplayed(id));
        }
        entry.replayed_at = Some(at);
        let entry = entry.clone();

        let key = entry.key();
        if state.open.get(&key) == Some(&id) {
            state.open.remove(&key);
        }
        Ok(entry)
    }
}

/// Dead-letter queue: durable append with a loud fallback.
///
/// `send` never discards an entry. When the backend refuses it, the entry is
/// logged in full, kept in an in-process fallback buffer, a critical
/// notification goes out, and the caller receives a
/// [`DeadLetterDeliveryError`].
pub struct DeadLetterQueue {
    store: Arc<dyn DeadLetterStore>,
    fallback: Mutex<Vec<DeadLetterEntry>>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("fallback", &self.pending_fallback().len())
            .finish_non_exhaustive()
    }
}

impl DeadLetterQueue {
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            fallback: Mutex::new(Vec::new()),
            notifier,
            clock,
        }
    }

    /// Append an exhausted event.
    ///
    /// At most one un-replayed entry exists per (event, handler), counting
    /// entries parked in the fallback buffer. A repeated send returns the
    /// stored entry's id; if the entry is still parked, its delivery is
    /// retried instead of creating a second one.
    #[instrument(skip(self, event, error), fields(event_id = %event.id(), event_type = %event.event_type()))]
    pub async fn send(
        &self,
        event: &Event,
        handler: &str,
        error: &str,
        attempts_made: u32,
        first_failed_at: DateTime<Utc>,
    ) -> Result<DeadLetterId, DeadLetterDeliveryError> {
        let key = RetryKey::new(event.id(), handler);

        match self.store.find_open(&key) {
            Ok(Some(existing)) => {
                warn!(dead_letter_id = %existing.id, "event already dead-lettered for handler");
                return Ok(existing.id);
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "could not check for an existing dead-letter entry"),
        }

        let entry = match self.take_parked(&key) {
            Some(parked) => {
                warn!(dead_letter_id = %parked.id, "event already parked in fallback buffer; retrying its delivery");
                parked
            }
            None => DeadLetterEntry {
                id: DeadLetterId::new(),
                event: event.clone(),
                handler: handler.to_string(),
                final_error: error.to_string(),
                attempts_made,
                first_failed_at,
                sent_at: self.clock.now(),
                replayed_at: None,
            },
        };
        let id = entry.id;
        let attempts_made = entry.attempts_made;

        match self.store.append(entry.clone()) {
            Ok(()) => {
                info!(dead_letter_id = %id, attempts_made, "event dead-lettered");
                self.alert(
                    "Event dead-lettered",
                    &format!(
                        "{} event {} failed in handler '{}' after {} attempts: {}",
                        event.event_type(),
                        event.id(),
                        handler,
                        attempts_made,
                        entry.final_error
                    ),
                    Severity::Error,
                )
                .await;
                Ok(id)
            }
            Err(err) => {
                let serialized = serde_json::to_string(&entry)
                    .unwrap_or_else(|e| format!("<unserializable entry: {e}>"));
                error!(
                    dead_letter_id = %id,
                    error = %err,
                    entry = %serialized,
                    "dead-letter store unavailable; entry kept in fallback buffer"
                );
                self.fallback
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(entry);
                self.alert(
                    "Dead-letter delivery failed",
                    &format!(
                        "could not persist dead letter {} for {} event {} (handler '{}'): {}",
                        id,
                        event.event_type(),
                        event.id(),
                        handler,
                        err
                    ),
                    Severity::Critical,
                )
                .await;

                Err(DeadLetterDeliveryError {
                    key,
                    entry_id: id,
                    attempts_made,
                    reason: err.to_string(),
                })
            }
        }
    }

    pub fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        self.store.get(id)
    }

    pub fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        self.store.list(filter)
    }

    /// Mark an entry replayed and hand back its event for re-injection.
    ///
    /// Re-dispatch goes through `EventPublisher::replay_dead_letter`.
    #[instrument(skip(self))]
    pub fn replay(&self, id: DeadLetterId) -> Result<Event, DeadLetterError> {
        let entry = self.store.mark_replayed(id, self.clock.now())?;
        info!(event_id = %entry.event.id(), handler = %entry.handler, "dead-letter entry replayed");
        Ok(entry.event)
    }

    /// Entries waiting in the fallback buffer.
    pub fn pending_fallback(&self) -> Vec<DeadLetterEntry> {
        self.fallback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Retry delivering buffered entries to the backend. Returns how many were stored.
    ///
    /// A buffered entry whose campaign already has an un-replayed entry in the
    /// store is dropped rather than stored twice.
    pub fn flush_fallback(&self) -> usize {
        let pending = std::mem::take(&mut *self.fallback.lock().unwrap_or_else(|e| e.into_inner()));
        let mut delivered = 0;
        let mut remaining = Vec::new();

        for entry in pending {
            match self.store.find_open(&entry.key()) {
                Ok(Some(stored)) => {
                    warn!(
                        dead_letter_id = %entry.id,
                        stored_id = %stored.id,
                        "dropping buffered dead letter; campaign already stored"
                    );
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(dead_letter_id = %entry.id, error = %err, "fallback entry still undeliverable");
                    remaining.push(entry);
                    continue;
                }
            }

            match self.store.append(entry.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(dead_letter_id = %entry.id, error = %err, "fallback entry still undeliverable");
                    remaining.push(entry);
                }
            }
        }

        if !remaining.is_empty() {
            self.fallback
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend(remaining);
        }
        if delivered > 0 {
            info!(delivered, "flushed dead-letter fallback buffer");
        }
        delivered
    }

    /// Remove and return the buffered entry for `key`, if one is parked.
    fn take_parked(&self, key: &RetryKey) -> Option<DeadLetterEntry> {
        let mut fallback = self.fallback.lock().unwrap_or_else(|e| e.into_inner());
        let index = fallback.iter().position(|e| e.key() == *key)?;
        Some(fallback.remove(index))
    }

    async fn alert(&self, title: &str, message: &str, severity: Severity) {
        if let Err(err) = self.notifier.notify(title, message, severity).await {
            error!(error = %err, %title, "failed to send dead-letter notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use backline_core::{AggregateId, ManualClock, MemoryNotifier};

    /// Store that refuses writes while `down` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryDeadLetterStore,
        down: AtomicBool,
    }

    impl DeadLetterStore for FlakyStore {
        fn append(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(DeadLetterError::Storage("connection reset".to_string()));
            }
            self.inner.append(entry)
        }

        fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
            self.inner.get(id)
        }

        fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
            self.inner.list(filter)
        }

        fn find_open(&self, key: &RetryKey) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
            self.inner.find_open(key)
        }

        fn mark_replayed(
            &self,
            id: DeadLetterId,
            at: DateTime<Utc>,
        ) -> Result<DeadLetterEntry, DeadLetterError> {
            self.inner.mark_replayed(id, at)
        }
    }

    fn event(event_type: &str) -> Event {
        Event::new(event_type, AggregateId::new(), serde_json::json!({}))
    }

    fn queue(store: Arc<dyn DeadLetterStore>) -> (DeadLetterQueue, Arc<MemoryNotifier>) {
        let notifier = Arc::new(MemoryNotifier::new());
        let queue = DeadLetterQueue::new(store, notifier.clone(), Arc::new(ManualClock::at_epoch()));
        (queue, notifier)
    }

    #[tokio::test]
    async fn send_list_and_replay() {
        let (queue, notifier) = queue(Arc::new(InMemoryDeadLetterStore::new()));
        let ev = event("order.placed");

        let id = queue.send(&ev, "invoice", "boom", 3, Utc::now()).await.unwrap();

        let pending = queue.list(&DeadLetterFilter::pending()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].attempts_made, 3);
        assert_eq!(pending[0].final_error, "boom");
        assert_eq!(notifier.count_at_least(Severity::Error), 1);

        let replayed = queue.replay(id).unwrap();
        assert_eq!(replayed.id(), ev.id());
        assert!(queue.list(&DeadLetterFilter::pending()).unwrap().is_empty());
        assert_eq!(
            queue.list(&DeadLetterFilter::pending().with_replayed()).unwrap().len(),
            1
        );
        assert!(matches!(
            queue.replay(id),
            Err(DeadLetterError::AlreadyReplayed(_))
        ));
    }

    #[tokio::test]
    async fn repeated_send_is_deduplicated() {
        let (queue, _) = queue(Arc::new(InMemoryDeadLetterStore::new()));
        let ev = event("order.placed");

        let first = queue.send(&ev, "invoice", "boom", 3, Utc::now()).await.unwrap();
        let second = queue.send(&ev, "invoice", "boom", 3, Utc::now()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(queue.list(&DeadLetterFilter::pending()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn filter_by_event_type_and_handler() {
        let (queue, _) = queue(Arc::new(InMemoryDeadLetterStore::new()));

        queue.send(&event("a"), "h1", "e", 1, Utc::now()).await.unwrap();
        queue.send(&event("a"), "h2", "e", 1, Utc::now()).await.unwrap();
        queue.send(&event("b"), "h1", "e", 1, Utc::now()).await.unwrap();

        assert_eq!(queue.list(&DeadLetterFilter::pending().event_type("a")).unwrap().len(), 2);
        assert_eq!(queue.list(&DeadLetterFilter::pending().handler("h1")).unwrap().len(), 2);
        assert_eq!(queue.list(&DeadLetterFilter::pending().limit(1)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backend_outage_buffers_and_escalates() {
        let store = Arc::new(FlakyStore::default());
        store.down.store(true, Ordering::SeqCst);
        let (queue, notifier) = queue(store.clone());

        let err = queue
            .send(&event("order.placed"), "invoice", "boom", 5, Utc::now())
            .await
            .unwrap_err();

        assert_eq!(err.attempts_made, 5);
        assert_eq!(queue.pending_fallback().len(), 1);
        assert_eq!(notifier.count_at_least(Severity::Critical), 1);
        assert!(queue.list(&DeadLetterFilter::pending()).unwrap().is_empty());

        // Still down: nothing delivered, nothing lost.
        assert_eq!(queue.flush_fallback(), 0);
        assert_eq!(queue.pending_fallback().len(), 1);

        store.down.store(false, Ordering::SeqCst);
        assert_eq!(queue.flush_fallback(), 1);
        assert!(queue.pending_fallback().is_empty());

        let stored = queue.list(&DeadLetterFilter::pending()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, err.entry_id);
    }

    #[tokio::test]
    async fn parked_entry_is_reused_when_the_store_recovers() {
        let store = Arc::new(FlakyStore::default());
        store.down.store(true, Ordering::SeqCst);
        let (queue, _) = queue(store.clone());
        let ev = event("order.placed");

        let parked = queue.send(&ev, "invoice", "boom", 3, Utc::now()).await.unwrap_err();
        assert_eq!(queue.pending_fallback().len(), 1);

        // A second campaign for the same key lands while the store is back up.
        store.down.store(false, Ordering::SeqCst);
        let id = queue.send(&ev, "invoice", "boom again", 3, Utc::now()).await.unwrap();
        assert_eq!(id, parked.entry_id);
        assert!(queue.pending_fallback().is_empty());

        assert_eq!(queue.flush_fallback(), 0);
        let key = RetryKey::new(ev.id(), "invoice");
        let open: Vec<_> = queue
            .list(&DeadLetterFilter::pending())
            .unwrap()
            .into_iter()
            .filter(|e| e.key() == key)
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].final_error, "boom");
    }

    #[tokio::test]
    async fn flush_drops_entries_already_stored() {
        let store = Arc::new(FlakyStore::default());
        let (queue, _) = queue(store.clone());
        let ev = event("order.placed");

        store.down.store(true, Ordering::SeqCst);
        queue.send(&ev, "invoice", "boom", 3, Utc::now()).await.unwrap_err();

        // The same campaign reaches the store through another path.
        store.down.store(false, Ordering::SeqCst);
        let stored = DeadLetterEntry {
            id: DeadLetterId::new(),
            event: ev.clone(),
            handler: "invoice".to_string(),
            final_error: "boom".to_string(),
            attempts_made: 3,
            first_failed_at: Utc::now(),
            sent_at: Utc::now(),
            replayed_at: None,
        };
        store.append(stored.clone()).unwrap();

        assert_eq!(queue.flush_fallback(), 0);
        assert!(queue.pending_fallback().is_empty());
        let pending = queue.list(&DeadLetterFilter::pending()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, stored.id);
    }

    #[tokio::test]
    async fn replay_reopens_the_campaign_key() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let (queue, _) = queue(store.clone());
        let ev = event("order.placed");
        let key = RetryKey::new(ev.id(), "invoice");

        let first = queue.send(&ev, "invoice", "boom", 3, Utc::now()).await.unwrap();
        assert_eq!(store.find_open(&key).unwrap().map(|e| e.id), Some(first));

        queue.replay(first).unwrap();
        assert!(store.find_open(&key).unwrap().is_none());

        let second = queue.send(&ev, "invoice", "boom", 3, Utc::now()).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(store.find_open(&key).unwrap().map(|e| e.id), Some(second));
        assert!(store.find_open(&RetryKey::new(ev.id(), "shipping")).unwrap().is_none());
    }
}
