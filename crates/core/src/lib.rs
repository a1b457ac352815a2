//! `backline-core`: shared building blocks for the background-processing layer.
//!
//! This crate holds primitives used by both the event retry subsystem and the
//! scheduled-task framework: identifiers, the time abstraction and the
//! notification port. It has no knowledge of events or tasks.

pub mod clock;
pub mod error;
pub mod id;
pub mod notify;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult, ProcessorError, capture};
pub use id::{AggregateId, DeadLetterId, EventId, ExecutionId, UserId};
pub use notify::{LogNotifier, MemoryNotifier, Notification, Notifier, Severity};
