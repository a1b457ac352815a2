//! Configuration and wiring of the background layer.
//!
//! Every shared component (ledger, dead-letter queue, executor, publisher,
//! registry, monitor, tracker, scheduler) is constructed once by
//! [`RuntimeBuilder::build`] and handed out by `Arc`.

pub mod config;
pub mod maintenance;
pub mod runtime;

pub use config::{BacklineConfig, ConfigError, MaintenanceConfig};
pub use maintenance::{DeadLetterFlushTask, LedgerCleanupTarget};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeError};
