use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use backline_core::{Notifier, Severity};

use crate::task::ScheduledTask;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub product_id: String,
    pub sku: String,
    pub name: String,
    pub on_hand: i64,
    pub reorder_point: i64,
}

impl StockLevel {
    pub fn is_out_of_stock(&self) -> bool {
        self.on_hand <= 0
    }
}

/// Supplies items at or below their reorder point.
#[async_trait]
pub trait StockLevelSource: Send + Sync + 'static {
    async fn low_stock_items(&self) -> anyhow::Result<Vec<StockLevel>>;
}

/// Notifies operators about low stock. Out-of-stock items raise the severity to error.
pub struct LowStockAlertTask {
    source: Arc<dyn StockLevelSource>,
    notifier: Arc<dyn Notifier>,
    max_listed: usize,
}

impl LowStockAlertTask {
    pub fn new(source: Arc<dyn StockLevelSource>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            source,
            notifier,
            max_listed: 20,
        }
    }

    /// Items listed in one notification; the rest are summarized.
    pub fn with_max_listed(mut self, max_listed: usize) -> Self {
        self.max_listed = max_listed;
        self
    }
}

#[async_trait]
impl ScheduledTask for LowStockAlertTask {
    fn name(&self) -> &str {
        "low-stock-alert"
    }

    fn description(&self) -> &str {
        "Notify operators about products at or below their reorder point"
    }

    async fn run_body(&self) -> anyhow::Result<()> {
        let items = self
            .source
            .low_stock_items()
            .await
            .context("loading stock levels")?;
        if items.is_empty() {
            debug!("no low-stock items");
            return Ok(());
        }

        let out_of_stock = items.iter().filter(|i| i.is_out_of_stock()).count();
        let severity = if out_of_stock > 0 {
            Severity::Error
        } else {
            Severity::Warning
        };

        let mut message = String::new();
        for item in items.iter().take(self.max_listed) {
            let _ = writeln!(
                message,
                "{} ({}): {} on hand, reorder at {}",
                item.name, item.sku, item.on_hand, item.reorder_point
            );
        }
        if items.len() > self.max_listed {
            let _ = writeln!(message, "... and {} more", items.len() - self.max_listed);
        }

        let title = format!("{} product(s) low on stock", items.len());
        self.notifier
            .notify(&title, message.trim_end(), severity)
            .await
            .context("sending low-stock notification")?;
        info!(items = items.len(), out_of_stock, "low-stock alert sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backline_core::MemoryNotifier;

    struct Fixed(Vec<StockLevel>);

    #[async_trait]
    impl StockLevelSource for Fixed {
        async fn low_stock_items(&self) -> anyhow::Result<Vec<StockLevel>> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl StockLevelSource for Broken {
        async fn low_stock_items(&self) -> anyhow::Result<Vec<StockLevel>> {
            anyhow::bail!("inventory service unavailable")
        }
    }

    fn level(sku: &str, on_hand: i64) -> StockLevel {
        StockLevel {
            product_id: format!("p-{sku}"),
            sku: sku.to_string(),
            name: format!("Widget {sku}"),
            on_hand,
            reorder_point: 10,
        }
    }

    #[tokio::test]
    async fn nothing_low_sends_nothing() {
        let notifier = Arc::new(MemoryNotifier::new());
        let task = LowStockAlertTask::new(Arc::new(Fixed(vec![])), notifier.clone());
        task.run_body().await.unwrap();
        assert!(notifier.notifications().is_empty());
    }

    #[tokio::test]
    async fn low_items_are_listed_at_warning() {
        let notifier = Arc::new(MemoryNotifier::new());
        let source = Fixed(vec![level("A1", 3), level("B2", 5), level("C3", 1)]);
        let task = LowStockAlertTask::new(Arc::new(source), notifier.clone()).with_max_listed(2);
        task.run_body().await.unwrap();

        let sent = notifier.notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Warning);
        assert_eq!(sent[0].title, "3 product(s) low on stock");
        assert!(sent[0].message.contains("Widget A1 (A1): 3 on hand"));
        assert!(!sent[0].message.contains("C3"));
        assert!(sent[0].message.ends_with("... and 1 more"));
    }

    #[tokio::test]
    async fn out_of_stock_raises_severity() {
        let notifier = Arc::new(MemoryNotifier::new());
        let task = LowStockAlertTask::new(Arc::new(Fixed(vec![level("A1", 0)])), notifier.clone());
        task.run_body().await.unwrap();
        assert_eq!(notifier.notifications()[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn source_errors_fail_the_run() {
        let notifier = Arc::new(MemoryNotifier::new());
        let task = LowStockAlertTask::new(Arc::new(Broken), notifier);
        let err = task.run_body().await.unwrap_err();
        assert_eq!(
            format!("{err:#}"),
            "loading stock levels: inventory service unavailable"
        );
    }
}
