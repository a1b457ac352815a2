//! Built-in maintenance and reporting tasks.
//!
//! Each task holds only orchestration; the data it works on comes from a
//! collaborator trait implemented by the host application.

mod analytics;
mod cache;
mod cleanup;
mod low_stock;

pub use analytics::{AnalyticsReport, AnalyticsReportTask, AnalyticsSource, ReportSink};
pub use cache::{CacheBackend, CacheOptimizationTask, CacheStats};
pub use cleanup::{CleanupTarget, RecordCleanupTask};
pub use low_stock::{LowStockAlertTask, StockLevel, StockLevelSource};
