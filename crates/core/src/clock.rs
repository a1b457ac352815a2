//! Time abstraction for delay scheduling.
//!
//! Every component that reads the current time or waits for a delay goes
//! through [`Clock`]. Production code uses [`SystemClock`] (wall clock +
//! `tokio::time::sleep`); tests inject a [`ManualClock`] so retry timing and
//! schedule computation can be asserted exactly without real waits.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Source of the current time and of non-blocking delays.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the calling task for `duration` without blocking a thread.
    async fn sleep(&self, duration: Duration);

    /// Suspend until `deadline`; returns immediately if it already passed.
    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let remaining = (deadline - self.now()).to_std().unwrap_or(Duration::ZERO);
        if !remaining.is_zero() {
            self.sleep(remaining).await;
        }
    }
}

/// Wall-clock time backed by the tokio timer.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock for deterministic tests.
///
/// `sleep` advances virtual time by the requested duration, records it, and
/// yields to the scheduler once so other tasks make progress.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// A clock starting at the Unix epoch.
    pub fn at_epoch() -> Self {
        Self::new(DateTime::<Utc>::default())
    }

    /// Move virtual time forward.
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = now.checked_add_signed(by).unwrap_or(*now);
    }

    /// Jump virtual time to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at_epoch()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::at_epoch();
        let start = clock.now();

        clock.sleep(Duration::from_millis(10)).await;
        clock.sleep(Duration::from_millis(20)).await;

        assert_eq!(clock.now() - start, chrono::Duration::milliseconds(30));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[tokio::test]
    async fn sleep_until_past_deadline_returns_immediately() {
        let clock = ManualClock::at_epoch();
        let deadline = clock.now();
        clock.advance(Duration::from_secs(5));

        clock.sleep_until(deadline).await;

        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn sleep_until_future_deadline_sleeps_the_difference() {
        let clock = ManualClock::at_epoch();
        let deadline = clock.now() + chrono::Duration::seconds(90);

        clock.sleep_until(deadline).await;

        assert_eq!(clock.sleeps(), vec![Duration::from_secs(90)]);
        assert_eq!(clock.now(), deadline);
    }
}
