//! Tracing/logging initialization.
//!
//! Output is JSON by default with system timestamps; the filter comes from
//! configuration, then `RUST_LOG`, then `info`.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `info,backline_events=debug`.
    pub filter: Option<String>,
    /// JSON lines when true, human-readable otherwise.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: None,
            json: true,
        }
    }
}

/// Initialize tracing/logging for the process with default settings.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(&LogConfig::default());
}

/// Initialize tracing/logging from `config`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_with(config: &LogConfig) -> bool {
    let (filter, rejected) = build_filter(config.filter.as_deref());

    let installed = if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init()
            .is_ok()
    };

    if let Some(directives) = rejected.filter(|_| installed) {
        ::tracing::warn!(%directives, "invalid log filter, falling back to default");
    }
    installed
}

/// Filter from explicit directives, else `RUST_LOG`, else the default.
/// Also returns the directives that failed to parse, if any.
fn build_filter(directives: Option<&str>) -> (EnvFilter, Option<String>) {
    match directives.map(str::trim).filter(|d| !d.is_empty()) {
        Some(d) => match EnvFilter::try_new(d) {
            Ok(filter) => (filter, None),
            Err(_) => (EnvFilter::new(DEFAULT_FILTER), Some(d.to_string())),
        },
        None => (
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
            None,
        ),
    }
}
