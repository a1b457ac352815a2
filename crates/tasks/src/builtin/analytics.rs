use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use backline_core::Clock;

use crate::task::ScheduledTask;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub metrics: JsonValue,
}

/// Computes report figures for a period `[start, end)`.
#[async_trait]
pub trait AnalyticsSource: Send + Sync + 'static {
    async fn collect(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> anyhow::Result<JsonValue>;
}

/// Persists or forwards generated reports.
#[async_trait]
pub trait ReportSink: Send + Sync + 'static {
    async fn store(&self, report: &AnalyticsReport) -> anyhow::Result<()>;
}

/// Builds the report for the period that just ended and hands it to the sink.
pub struct AnalyticsReportTask {
    source: Arc<dyn AnalyticsSource>,
    sink: Arc<dyn ReportSink>,
    clock: Arc<dyn Clock>,
    period: Duration,
}

impl AnalyticsReportTask {
    pub fn new(
        source: Arc<dyn AnalyticsSource>,
        sink: Arc<dyn ReportSink>,
        clock: Arc<dyn Clock>,
        period: Duration,
    ) -> Self {
        Self {
            source,
            sink,
            clock,
            period,
        }
    }
}

#[async_trait]
impl ScheduledTask for AnalyticsReportTask {
    fn name(&self) -> &str {
        "analytics-report"
    }

    fn description(&self) -> &str {
        "Generate the analytics report for the previous period"
    }

    async fn run_body(&self) -> anyhow::Result<()> {
        let period_end = self.clock.now();
        let period_start = period_end - self.period;

        let metrics = self
            .source
            .collect(period_start, period_end)
            .await
            .context("collecting analytics")?;
        let report = AnalyticsReport {
            period_start,
            period_end,
            generated_at: self.clock.now(),
            metrics,
        };
        self.sink.store(&report).await.context("storing analytics report")?;

        info!(%period_start, %period_end, "analytics report generated");
        Ok(())
    }
}
