//! Retry policy: how many attempts, and how long to wait between them.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lower bound of the jitter factor; delays are scaled into `[0.5, 1.0]` of the cap.
const JITTER_FLOOR: f64 = 0.5;

/// A retry policy could not be constructed.
///
/// Invalid values are rejected, never clamped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidPolicyError {
    #[error("max_attempts must be at least 1 (got {0})")]
    MaxAttempts(u32),
    #[error("initial_delay must not be negative (got {0}ms)")]
    NegativeInitialDelay(i64),
    #[error("max_delay ({max_delay_ms}ms) must not be below initial_delay ({initial_delay_ms}ms)")]
    MaxDelayBelowInitial {
        initial_delay_ms: i64,
        max_delay_ms: i64,
    },
    #[error("backoff_multiplier must be a finite number greater than 1.0 (got {0})")]
    BackoffMultiplier(f64),
}

/// Backoff shape for one retry campaign.
///
/// `delay_for_attempt(n) = min(max_delay, initial_delay * backoff_multiplier^(n-1))`,
/// then, with jitter enabled, scaled by a uniform factor in `[0.5, 1.0]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
        jitter_enabled: bool,
    ) -> Result<Self, InvalidPolicyError> {
        if max_attempts < 1 {
            return Err(InvalidPolicyError::MaxAttempts(max_attempts));
        }
        if max_delay < initial_delay {
            return Err(InvalidPolicyError::MaxDelayBelowInitial {
                initial_delay_ms: duration_ms(initial_delay),
                max_delay_ms: duration_ms(max_delay),
            });
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier <= 1.0 {
            return Err(InvalidPolicyError::BackoffMultiplier(backoff_multiplier));
        }

        Ok(Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            jitter_enabled,
        })
    }

    /// Exponential policy without jitter.
    pub fn exponential(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self, InvalidPolicyError> {
        Self::new(max_attempts, initial_delay, max_delay, backoff_multiplier, false)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn jitter_enabled(&self) -> bool {
        self.jitter_enabled
    }

    /// Check if another attempt may follow attempt number `attempt` (1-indexed).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Capped exponential delay after attempt `attempt` (1-indexed), before jitter.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exp);
        let cap = self.max_delay.as_nanos() as f64;

        if !scaled.is_finite() || scaled >= cap {
            self.max_delay
        } else {
            Duration::from_nanos(scaled.round() as u64).min(self.max_delay)
        }
    }

    /// Delay to wait after attempt `attempt`, jittered with the thread-local RNG.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_for_attempt_with(attempt, &mut rand::thread_rng())
    }

    /// Delay to wait after attempt `attempt`, jittered with `rng`.
    ///
    /// Deterministic for a seeded RNG. The jittered value never exceeds the
    /// capped delay.
    pub fn delay_for_attempt_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let capped = self.capped_delay(attempt);
        if !self.jitter_enabled || capped.is_zero() {
            return capped;
        }

        let factor = rng.gen_range(JITTER_FLOOR..=1.0);
        capped.mul_f64(factor).min(capped)
    }
}

/// Serializable retry policy settings.
///
/// Delays are signed milliseconds so that negative values coming from a config
/// file or the environment reach validation instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: i64,
    pub max_delay_ms: i64,
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: duration_ms(policy.initial_delay),
            max_delay_ms: duration_ms(policy.max_delay),
            backoff_multiplier: policy.backoff_multiplier,
            jitter_enabled: policy.jitter_enabled,
        }
    }
}

impl TryFrom<RetryPolicyConfig> for RetryPolicy {
    type Error = InvalidPolicyError;

    fn try_from(config: RetryPolicyConfig) -> Result<Self, Self::Error> {
        if config.initial_delay_ms < 0 {
            return Err(InvalidPolicyError::NegativeInitialDelay(config.initial_delay_ms));
        }
        if config.max_delay_ms < config.initial_delay_ms {
            return Err(InvalidPolicyError::MaxDelayBelowInitial {
                initial_delay_ms: config.initial_delay_ms,
                max_delay_ms: config.max_delay_ms,
            });
        }

        RetryPolicy::new(
            config.max_attempts,
            Duration::from_millis(config.initial_delay_ms as u64),
            Duration::from_millis(config.max_delay_ms as u64),
            config.backoff_multiplier,
            config.jitter_enabled,
        )
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
