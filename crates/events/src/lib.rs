//! Domain event dispatch with automatic retry.
//!
//! Application code publishes [`Event`]s through the [`EventPublisher`]. Every
//! handler subscribed to the event type runs inside the
//! [`EventRetryExecutor`], which retries transient failures with exponential
//! backoff and jitter, keeps per-attempt bookkeeping in a [`RetryLedger`], and
//! routes exhausted events to the [`DeadLetterQueue`].

pub mod event;
pub mod handler;
pub mod publisher;
pub mod retry;

pub use event::Event;
pub use handler::{EventHandler, FnHandler, handler_fn};
pub use publisher::{
    DispatchFailure, DispatchHandle, DispatchReport, EventPublisher, HandlerReport, PublishError,
};
pub use retry::{
    DeadLetterDeliveryError, DeadLetterEntry, DeadLetterError, DeadLetterFilter, DeadLetterQueue,
    DeadLetterStore, EventRetryExecutor, InMemoryDeadLetterStore, InMemoryRetryLedger,
    InvalidPolicyError, LedgerEntry, LedgerError, LedgerState, RetryAttemptRecord, RetryKey,
    RetryLedger, RetryOutcome, RetryPolicy, RetryPolicyConfig,
};
