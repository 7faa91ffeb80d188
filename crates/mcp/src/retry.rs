//! Retry decisions with exponential backoff.

use crate::error::ErrorKind;
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Decides whether and when a failed send attempt is retried.
///
/// The policy is a pure function of the error kind and attempt number; it
/// never touches the network.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay.
    pub max_delay: Duration,
    /// Random spread applied to each delay, as a fraction in `[0, 1]`.
    pub jitter: f64,
    /// Error kinds worth retrying.
    pub retryable: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.1,
            retryable: HashSet::from([ErrorKind::Transport, ErrorKind::Timeout]),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the maximum number of attempts. Zero is treated as one.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the base delay.
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter fraction, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_nan() {
            0.0
        } else {
            jitter.clamp(0.0, 1.0)
        };
        self
    }

    /// Replace the set of retryable error kinds.
    #[must_use]
    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    /// Whether errors of `kind` are retried at all.
    #[must_use]
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Decide whether to retry after `attempt` (1-based) failed with `kind`.
    ///
    /// Returns the delay to wait before the next attempt, or `None` when the
    /// failure is terminal.
    #[must_use]
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts || !self.is_retryable(kind) {
            return None;
        }

        let delay = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return Some(delay);
        }

        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Some(delay.mul_f64(factor))
    }

    /// Un-jittered delay after `attempt` failed: `base * 2^(attempt - 1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}
