//! Local retry policy with exponential backoff.
//!
//! Retries happen in-process, inside a single delivery, before any
//! dead-letter decision. They are not broker redeliveries.
//!
//! # Example
//!
//! ```rust,ignore
//! use market_data_persister::application::services::retry::{ExponentialBackoff, RetryPolicy};
//!
//! let policy = RetryPolicy::default(); // 3 attempts in total
//! let mut backoff = ExponentialBackoff::new(&policy);
//!
//! let delay1 = backoff.next_backoff(); // ~100ms with jitter
//! let delay2 = backoff.next_backoff(); // ~200ms with jitter
//! assert!(backoff.next_backoff().is_none());
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for retryable storage failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3).
    pub max_attempts: u32,
    /// Backoff before the second attempt (default: 100ms).
    pub initial_backoff: Duration,
    /// Backoff cap (default: 2s).
    pub max_backoff: Duration,
    /// Growth factor per attempt (default: 2.0).
    pub backoff_multiplier: f64,
    /// Jitter factor for randomization (default: 0.2 = ±20%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt count and backoff bounds.
    #[must_use]
    pub const fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }

    /// Policy that retries without sleeping. For tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }
}

/// Calculator for exponential backoff with jitter.
///
/// Yields `max_attempts - 1` delays: one before each retry.
#[derive(Debug)]
pub struct ExponentialBackoff {
    retries_taken: u32,
    max_retries: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    backoff_multiplier: f64,
    jitter_factor: f64,
}

impl ExponentialBackoff {
    /// Create a backoff calculator from a retry policy.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(policy: &RetryPolicy) -> Self {
        Self {
            retries_taken: 0,
            max_retries: policy.max_attempts.saturating_sub(1),
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            jitter_factor: policy.jitter_factor,
        }
    }

    /// Delay before the next retry, or `None` once attempts are exhausted.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries_taken >= self.max_retries {
            return None;
        }

        let base_ms = self.base_backoff_ms();
        let capped_ms = self.apply_jitter(base_ms).min(self.max_backoff_ms);

        self.retries_taken += 1;

        Some(Duration::from_millis(capped_ms))
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss
    )]
    fn base_backoff_ms(&self) -> u64 {
        let multiplier = self.backoff_multiplier.powi(self.retries_taken as i32);
        let backoff = (self.initial_backoff_ms as f64 * multiplier) as u64;
        backoff.min(self.max_backoff_ms)
    }

    /// Random value in `[backoff * (1 - jitter), backoff * (1 + jitter)]`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn apply_jitter(&self, backoff_ms: u64) -> u64 {
        if backoff_ms == 0 || self.jitter_factor <= 0.0 {
            return backoff_ms;
        }
        let jitter_range = backoff_ms as f64 * self.jitter_factor;
        let min = (backoff_ms as f64 - jitter_range).max(0.0);
        let max = backoff_ms as f64 + jitter_range;

        rand::rng().random_range(min..=max) as u64
    }

    /// Retries handed out so far.
    #[must_use]
    pub const fn retries_taken(&self) -> u32 {
        self.retries_taken
    }

    /// Check if more retries are available.
    #[must_use]
    pub const fn has_remaining_attempts(&self) -> bool {
        self.retries_taken < self.max_retries
    }
}
