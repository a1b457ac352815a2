//! Event retry subsystem: backoff, bookkeeping and dead-letter routing.
//!
//! ## Design
//!
//! - Each (event, handler) pair runs one retry campaign at a time
//! - Retry policy with exponential backoff and downward jitter
//! - Every attempt is recorded in the retry ledger; success clears the entry,
//!   exhaustion leaves a terminal marker
//! - Exhausted campaigns land in the dead-letter queue for manual replay
//! - Delays are non-blocking suspensions on the injected clock
//!
//! ## Components
//!
//! - `RetryPolicy`: validated backoff configuration
//! - `RetryLedger`: persistence of in-flight attempts
//! - `DeadLetterQueue`: failed events for inspection/replay
//! - `EventRetryExecutor`: drives one event through one handler

pub mod dead_letter;
pub mod executor;
pub mod ledger;
pub mod policy;

pub use dead_letter::{
    DeadLetterDeliveryError, DeadLetterEntry, DeadLetterError, DeadLetterFilter, DeadLetterQueue,
    DeadLetterStore, InMemoryDeadLetterStore,
};
pub use executor::{EventRetryExecutor, RetryOutcome};
pub use ledger::{
    InMemoryRetryLedger, LedgerEntry, LedgerError, LedgerState, RetryAttemptRecord, RetryKey,
    RetryLedger,
};
pub use policy::{InvalidPolicyError, RetryPolicy, RetryPolicyConfig};
