use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use backline_core::{Notifier, Severity};

use crate::task::ScheduledTask;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// `None` before any lookups.
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits + self.misses;
        (total > 0).then(|| self.hits as f64 / total as f64)
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    async fn evict_expired(&self) -> anyhow::Result<u64>;

    async fn stats(&self) -> anyhow::Result<CacheStats>;
}

/// Evicts expired cache entries and warns when the hit rate is poor.
pub struct CacheOptimizationTask {
    cache: Arc<dyn CacheBackend>,
    notifier: Arc<dyn Notifier>,
    min_hit_rate: f64,
}

impl CacheOptimizationTask {
    pub fn new(cache: Arc<dyn CacheBackend>, notifier: Arc<dyn Notifier>, min_hit_rate: f64) -> Self {
        Self {
            cache,
            notifier,
            min_hit_rate,
        }
    }
}

#[async_trait]
impl ScheduledTask for CacheOptimizationTask {
    fn name(&self) -> &str {
        "cache-optimization"
    }

    fn description(&self) -> &str {
        "Evict expired cache entries and check the hit rate"
    }

    async fn run_body(&self) -> anyhow::Result<()> {
        let evicted = self
            .cache
            .evict_expired()
            .await
            .context("evicting expired cache entries")?;
        let stats = self.cache.stats().await.context("reading cache stats")?;
        info!(evicted, entries = stats.entries, hit_rate = ?stats.hit_rate(), "cache optimized");

        if let Some(rate) = stats.hit_rate().filter(|r| *r < self.min_hit_rate) {
            let message = format!(
                "hit rate {:.1}% is below {:.1}% ({} hits, {} misses, {} entries)",
                rate * 100.0,
                self.min_hit_rate * 100.0,
                stats.hits,
                stats.misses,
                stats.entries
            );
            self.notifier
                .notify("Cache hit rate low", &message, Severity::Warning)
                .await
                .context("sending cache notification")?;
        }
        Ok(())
    }
}
