//! Retry scheduling with exponential backoff.

use std::time::Duration;

use crate::registry::RetryParameters;
use crate::task::Task;

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub min_backoff: Duration,
    /// Times the delay may double.
    pub max_doublings: u32,
    /// Optional hard cap on the delay.
    pub max_backoff: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetryParameters::default())
    }
}

impl From<&RetryParameters> for RetryConfig {
    fn from(params: &RetryParameters) -> Self {
        Self {
            max_retries: params.task_retry_limit,
            min_backoff: Duration::try_from_secs_f64(params.min_backoff_seconds)
                .unwrap_or(Duration::MAX),
            max_doublings: params.max_doublings,
            max_backoff: params
                .max_backoff_seconds
                .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-indexed).
    ///
    /// `min_backoff * 2^min(retry, max_doublings)`, then capped by
    /// `max_backoff` if set.
    #[must_use]
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let doublings = retry.min(self.max_doublings).min(1023);
        let secs = self.min_backoff.as_secs_f64() * 2f64.powi(doublings as i32);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);

        match self.max_backoff {
            Some(max) if delay > max => max,
            _ => delay,
        }
    }

    /// Check if a task that has failed `failures` times may run again.
    #[must_use]
    pub const fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after `delay`.
    Retry {
        /// Backoff before the next attempt.
        delay: Duration,
        /// Failures recorded so far.
        attempts: u32,
    },
    /// Retry limit surpassed; the task is terminally failed.
    Exhausted {
        /// Failures recorded so far.
        attempts: u32,
    },
}

/// Decides what happens to a task after a failed attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryScheduler;

impl RetryScheduler {
    /// Record a failure on `task` and decide whether it runs again.
    pub fn on_failure(&self, config: &RetryConfig, task: &mut Task) -> RetryDecision {
        task.attempts = task.attempts.saturating_add(1);

        if config.should_retry(task.attempts) {
            RetryDecision::Retry {
                delay: config.delay_for_attempt(task.attempts - 1),
                attempts: task.attempts,
            }
        } else {
            RetryDecision::Exhausted {
                attempts: task.attempts,
            }
        }
    }
}
