//! Runtime configuration.
//!
//! Sources, lowest precedence first: built-in defaults, an optional JSON file
//! (`BACKLINE_CONFIG`), then `BACKLINE_*` environment variables.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use backline_events::{InvalidPolicyError, RetryPolicy, RetryPolicyConfig};
use backline_observability::LogConfig;
use backline_tasks::{MonitorConfig, PerformanceConfig};

pub const CONFIG_PATH_VAR: &str = "BACKLINE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value '{value}' for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Schedules and retention for the runtime's own housekeeping tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    /// Terminal retry-ledger markers older than this are purged.
    pub ledger_retention_hours: u32,
    pub ledger_cleanup_schedule: String,
    pub dead_letter_flush_schedule: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ledger_retention_hours: 168,
            ledger_cleanup_schedule: "0 3 * * *".to_string(),
            dead_letter_flush_schedule: "every 1m".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BacklineConfig {
    pub retry: RetryPolicyConfig,
    /// Fixed seed for backoff jitter; entropy-seeded when absent.
    pub jitter_seed: Option<u64>,
    pub monitor: MonitorConfig,
    pub performance: PerformanceConfig,
    pub log: LogConfig,
    pub maintenance: MaintenanceConfig,
    /// Upper bound on waiting for running event campaigns at shutdown;
    /// unbounded when absent.
    pub shutdown_grace_secs: Option<u64>,
}

impl BacklineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Defaults overlaid with `BACKLINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// File named by `BACKLINE_CONFIG` (if set), then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        base.with_overrides(|var| std::env::var(var).ok())
    }

    /// Defaults overlaid with variables resolved through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Self::default().with_overrides(lookup)
    }

    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = Overrides(&lookup);

        env.apply("BACKLINE_RETRY_MAX_ATTEMPTS", &mut self.retry.max_attempts)?;
        env.apply("BACKLINE_RETRY_INITIAL_DELAY_MS", &mut self.retry.initial_delay_ms)?;
        env.apply("BACKLINE_RETRY_MAX_DELAY_MS", &mut self.retry.max_delay_ms)?;
        env.apply("BACKLINE_RETRY_BACKOFF_MULTIPLIER", &mut self.retry.backoff_multiplier)?;
        env.apply_flag("BACKLINE_RETRY_JITTER", &mut self.retry.jitter_enabled)?;
        if let Some(seed) = env.parse::<u64>("BACKLINE_JITTER_SEED")? {
            self.jitter_seed = Some(seed);
        }
        env.apply("BACKLINE_TASK_HISTORY_LIMIT", &mut self.monitor.history_limit)?;
        env.apply("BACKLINE_TASK_ALERT_THRESHOLD", &mut self.monitor.failure_alert_threshold)?;
        env.apply("BACKLINE_PERF_WINDOW_SAMPLES", &mut self.performance.window_samples)?;
        env.apply("BACKLINE_PERF_WINDOW_HOURS", &mut self.performance.window_hours)?;
        if let Some(filter) = env.raw("BACKLINE_LOG_FILTER") {
            self.log.filter = Some(filter);
        }
        env.apply_flag("BACKLINE_LOG_JSON", &mut self.log.json)?;
        if let Some(secs) = env.parse::<u64>("BACKLINE_SHUTDOWN_GRACE_SECS")? {
            self.shutdown_grace_secs = Some(secs);
        }

        Ok(self)
    }

    /// Default retry policy; invalid settings are rejected, never corrected.
    pub fn retry_policy(&self) -> Result<RetryPolicy, InvalidPolicyError> {
        RetryPolicy::try_from(self.retry.clone())
    }
}

struct Overrides<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Overrides<'_, F> {
    fn raw(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.raw(var)
            .map(|value| {
                value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                    var,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn apply<T>(&self, var: &'static str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(value) = self.parse(var)? {
            *target = value;
        }
        Ok(())
    }

    fn apply_flag(&self, var: &'static str, target: &mut bool) -> Result<(), ConfigError> {
        let Some(value) = self.raw(var) else {
            return Ok(());
        };
        *target = match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(ConfigError::InvalidValue {
                    var,
                    value,
                    reason: "expected a boolean".to_string(),
                });
            }
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = BacklineConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert!(config.retry.jitter_enabled);
        assert_eq!(config.monitor.history_limit, 50);
        assert_eq!(config.monitor.failure_alert_threshold, 3);
        assert_eq!(config.performance.window_samples, 500);
        assert_eq!(config.performance.window_hours, 24);
        assert!(config.jitter_seed.is_none());
        assert!(config.shutdown_grace_secs.is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = BacklineConfig::from_json_str(
            r#"{ "retry": { "max_attempts": 5, "jitter_enabled": false }, "log": { "json": false } }"#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert!(!config.retry.jitter_enabled);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert!(!config.log.json);
        assert_eq!(config.monitor, MonitorConfig::default());
    }

    #[test]
    fn environment_overrides_apply() {
        let config = BacklineConfig::from_lookup(lookup(&[
            ("BACKLINE_RETRY_MAX_ATTEMPTS", "4"),
            ("BACKLINE_RETRY_INITIAL_DELAY_MS", "10"),
            ("BACKLINE_RETRY_MAX_DELAY_MS", "200"),
            ("BACKLINE_RETRY_JITTER", "off"),
            ("BACKLINE_JITTER_SEED", "42"),
            ("BACKLINE_TASK_ALERT_THRESHOLD", "5"),
            ("BACKLINE_LOG_FILTER", "debug"),
            ("BACKLINE_LOG_JSON", "false"),
            ("BACKLINE_SHUTDOWN_GRACE_SECS", "15"),
        ]))
        .unwrap();

        assert_eq!(config.jitter_seed, Some(42));
        assert_eq!(config.shutdown_grace_secs, Some(15));
        assert_eq!(config.monitor.failure_alert_threshold, 5);
        assert_eq!(config.log.filter.as_deref(), Some("debug"));
        assert!(!config.log.json);

        let policy = config.retry_policy().unwrap();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.initial_delay(), Duration::from_millis(10));
        assert_eq!(policy.max_delay(), Duration::from_millis(200));
        assert!(!policy.jitter_enabled());
    }

    #[test]
    fn unparseable_variable_is_named() {
        let err = BacklineConfig::from_lookup(lookup(&[("BACKLINE_PERF_WINDOW_HOURS", "a day")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: "BACKLINE_PERF_WINDOW_HOURS", .. }
        ));

        let err = BacklineConfig::from_lookup(lookup(&[("BACKLINE_LOG_JSON", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("BACKLINE_LOG_JSON"));
    }

    #[test]
    fn negative_delay_reaches_policy_validation() {
        let config = BacklineConfig::from_lookup(lookup(&[("BACKLINE_RETRY_INITIAL_DELAY_MS", "-5")]))
            .unwrap();
        assert_eq!(
            config.retry_policy().unwrap_err(),
            InvalidPolicyError::NegativeInitialDelay(-5)
        );
    }

    #[test]
    fn file_source_is_read() {
        let path = std::env::temp_dir().join(format!(
            "backline-config-{}-{}.json",
            std::process::id(),
            backline_core::ExecutionId::new()
        ));
        std::fs::write(&path, r#"{ "jitter_seed": 7, "maintenance": { "enabled": false } }"#).unwrap();

        let config = BacklineConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.jitter_seed, Some(7));
        assert!(!config.maintenance.enabled);

        let missing = BacklineConfig::from_file(&path).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
