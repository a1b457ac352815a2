//! Operator notification port.
//!
//! Delivery (email, Slack, webhooks) lives outside this layer. Tasks and the
//! monitoring components only see [`Notifier`].

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::CoreError;

/// How urgently an operator should look at a notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    /// Process-level alert: something may be lost unless a human acts.
    Critical,
}

impl core::fmt::Display for Severity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Sends operator-facing notifications.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, title: &str, message: &str, severity: Severity) -> Result<(), CoreError>;
}

/// Notifier that writes notifications to the log.
///
/// Used when no external delivery channel is configured.
#[derive(Debug, Default, Copy, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, message: &str, severity: Severity) -> Result<(), CoreError> {
        match severity {
            Severity::Info => info!(%title, %message, "notification"),
            Severity::Warning => warn!(%title, %message, "notification"),
            Severity::Error | Severity::Critical => {
                error!(%title, %message, %severity, "notification")
            }
        }
        Ok(())
    }
}

/// A notification captured by [`MemoryNotifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

/// In-memory notifier for tests/dev.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications sent so far, oldest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count_at_least(&self, severity: Severity) -> usize {
        self.notifications()
            .iter()
            .filter(|n| n.severity >= severity)
            .count()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, title: &str, message: &str, severity: Severity) -> Result<(), CoreError> {
        self.sent
            .lock()
            .map_err(|_| CoreError::notification("notifier lock poisoned"))?
            .push(Notification {
                title: title.to_string(),
                message: message.to_string(),
                severity,
            });
        Ok(())
    }
}
