//! Retry ledger: bookkeeping of in-flight retry attempts.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use backline_core::EventId;

/// Identity of one retry campaign: an event delivered to one handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RetryKey {
    pub event_id: EventId,
    pub handler: String,
}

impl RetryKey {
    pub fn new(event_id: EventId, handler: impl Into<String>) -> Self {
        Self {
            event_id,
            handler: handler.into(),
        }
    }
}

impl std::fmt::Display for RetryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.event_id, self.handler)
    }
}

/// Record of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttemptRecord {
    pub event_id: EventId,
    /// 1-indexed.
    pub attempt_number: u32,
    pub scheduled_at: DateTime<Utc>,
    /// Set once the attempt failed.
    pub error: Option<String>,
}

/// Campaign state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    /// Attempts still running or scheduled.
    InFlight,
    /// Exhausted and dead-lettered (terminal marker).
    Failed,
}

/// Ledger entry for one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub key: RetryKey,
    pub state: LedgerState,
    pub attempts: Vec<RetryAttemptRecord>,
    /// When the next attempt becomes eligible (set while waiting out a backoff).
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub first_failed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    fn begin(key: RetryKey, scheduled_at: DateTime<Utc>) -> Self {
        let first = RetryAttemptRecord {
            event_id: key.event_id,
            attempt_number: 1,
            scheduled_at,
            error: None,
        };
        Self {
            key,
            state: LedgerState::InFlight,
            attempts: vec![first],
            next_eligible_at: None,
            last_error: None,
            first_failed_at: None,
            updated_at: scheduled_at,
        }
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn is_terminal(&self) -> bool {
        self.state == LedgerState::Failed
    }
}

/// Ledger error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("retry campaign already in flight: {0}")]
    CampaignActive(RetryKey),
    #[error("no ledger entry for {0}")]
    NotFound(RetryKey),
    #[error("ledger entry is terminal: {0}")]
    Terminal(RetryKey),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Persistence of in-flight retry attempts, keyed by campaign.
///
/// Every mutation is a read-modify-write of a single key and must be atomic
/// per key; operations on different keys must not serialize behind each other.
pub trait RetryLedger: Send + Sync {
    /// Open a campaign and record attempt 1.
    ///
    /// Fails with `CampaignActive` when an in-flight entry exists for the key.
    /// A terminal entry is replaced (dead-letter replay starts a new campaign).
    fn begin(&self, key: &RetryKey, scheduled_at: DateTime<Utc>) -> Result<(), LedgerError>;

    /// Record that attempt `attempt_number` is about to run.
    fn record_attempt(
        &self,
        key: &RetryKey,
        attempt_number: u32,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    /// Record that attempt `attempt_number` failed.
    fn record_failure(
        &self,
        key: &RetryKey,
        attempt_number: u32,
        error: &str,
        failed_at: DateTime<Utc>,
        next_eligible_at: Option<DateTime<Utc>>,
    ) -> Result<(), LedgerError>;

    /// Campaign succeeded: delete the entry.
    fn complete(&self, key: &RetryKey) -> Result<(), LedgerError>;

    /// Campaign exhausted: convert the entry into a terminal marker.
    fn mark_failed(&self, key: &RetryKey, at: DateTime<Utc>) -> Result<(), LedgerError>;

    fn get(&self, key: &RetryKey) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Entries whose campaign is still running.
    fn in_flight(&self) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Drop terminal markers last updated before `cutoff`. Returns how many were removed.
    fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, LedgerError>;
}

/// In-memory ledger for tests/dev.
///
/// Backed by a sharded map so unrelated keys do not contend on one lock.
#[derive(Debug, Default)]
pub struct InMemoryRetryLedger {
    entries: DashMap<RetryKey, LedgerEntry>,
}

impl InMemoryRetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RetryLedger for InMemoryRetryLedger {
    fn begin(&self, key: &RetryKey, scheduled_at: DateTime<Utc>) -> Result<(), LedgerError> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(existing) if !existing.get().is_terminal() => {
                Err(LedgerError::CampaignActive(key.clone()))
            }
            Entry::Occupied(mut terminal) => {
                terminal.insert(LedgerEntry::begin(key.clone(), scheduled_at));
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(LedgerEntry::begin(key.clone(), scheduled_at));
                Ok(())
            }
        }
    }

    fn record_attempt(
        &self,
        key: &RetryKey,
        attempt_number: u32,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;
        if entry.is_terminal() {
            return Err(LedgerError::Terminal(key.clone()));
        }

        entry.attempts.push(RetryAttemptRecord {
            event_id: key.event_id,
            attempt_number,
            scheduled_at,
            error: None,
        });
        entry.next_eligible_at = None;
        entry.updated_at = scheduled_at;
        Ok(())
    }

    fn record_failure(
        &self,
        key: &RetryKey,
        attempt_number: u32,
        error: &str,
        failed_at: DateTime<Utc>,
        next_eligible_at: Option<DateTime<Utc>>,
    ) -> Result<(), LedgerError> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;
        if entry.is_terminal() {
            return Err(LedgerError::Terminal(key.clone()));
        }

        if let Some(record) = entry
            .attempts
            .iter_mut()
            .rev()
            .find(|r| r.attempt_number == attempt_number)
        {
            record.error = Some(error.to_string());
        }
        entry.last_error = Some(error.to_string());
        entry.first_failed_at.get_or_insert(failed_at);
        entry.next_eligible_at = next_eligible_at;
        entry.updated_at = failed_at;
        Ok(())
    }

    fn complete(&self, key: &RetryKey) -> Result<(), LedgerError> {
        self.entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| LedgerError::NotFound(key.clone()))
    }

    fn mark_failed(&self, key: &RetryKey, at: DateTime<Utc>) -> Result<(), LedgerError> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;
        entry.state = LedgerState::Failed;
        entry.next_eligible_at = None;
        entry.updated_at = at;
        Ok(())
    }

    fn get(&self, key: &RetryKey) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    fn in_flight(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut result: Vec<_> = self
            .entries
            .iter()
            .filter(|e| !e.is_terminal())
            .map(|e| e.value().clone())
            .collect();
        result.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(result)
    }

    fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, LedgerError> {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let expired = entry.is_terminal() && entry.updated_at < cutoff;
            if expired {
                removed += 1;
            }
            !expired
        });
        Ok(removed)
    }
}
