//! Backoff controller
//!
//! Pure per-channel retry state machine. `on_failure` classifies the error,
//! schedules the next permissible attempt and returns a `Decision`; it does
//! no I/O and takes the jitter sample as an argument, so the executor owns
//! the waiting and tests own the randomness.
//!
//! Delay for the n-th consecutive retryable failure (n counted from 0):
//! `min(base * 2^n * (1 + jitter_ratio * sample), max)`. Because
//! `jitter_ratio < 1`, consecutive delays never decrease.

use std::time::Duration;

use rand::RngExt;

use crate::classify::ErrorKind;

/// Exponents above this are already far past any sane `max`.
const MAX_EXPONENT: u32 = 20;

/// Delay parameters for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    /// Delay after `retry_count` previous consecutive failures.
    ///
    /// `jitter_sample` is expected in `[0, 1)`.
    pub fn delay_for(&self, retry_count: u32, jitter_sample: f64) -> Duration {
        let exponential = self
            .base
            .saturating_mul(1u32 << retry_count.min(MAX_EXPONENT));
        let jitter = exponential.mul_f64(self.jitter_ratio * jitter_sample.clamp(0.0, 1.0));
        exponential.saturating_add(jitter).min(self.max)
    }
}

/// Outcome of a failure: retry or surface, and how long to wait first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub retry: bool,
    pub delay: Duration,
}

impl Decision {
    pub fn surface() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Retry bookkeeping of one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackoffState {
    /// Consecutive retryable failures since the last success
    pub retry_count: u32,
    /// Earliest unix-millis time another attempt may run
    pub next_retry_at: Option<u64>,
}

impl BackoffState {
    /// Record a failure at `now`.
    ///
    /// Retryable kinds increment `retry_count` and push `next_retry_at`; a
    /// server-supplied rate-limit wait replaces the computed delay.
    /// Non-retryable kinds leave the state untouched.
    pub fn on_failure(
        &mut self,
        policy: &BackoffPolicy,
        kind: &ErrorKind,
        now: u64,
        jitter_sample: f64,
    ) -> Decision {
        let delay = match kind {
            ErrorKind::RateLimited {
                retry_after: Some(hint),
            } => *hint,
            ErrorKind::RateLimited { retry_after: None } | ErrorKind::ServerError => {
                policy.delay_for(self.retry_count, jitter_sample)
            }
            ErrorKind::QuotaExceeded | ErrorKind::Unauthorized | ErrorKind::Other => {
                return Decision::surface();
            }
        };

        self.retry_count = self.retry_count.saturating_add(1);
        self.next_retry_at = Some(now.saturating_add(delay.as_millis() as u64));
        Decision { retry: true, delay }
    }

    pub fn on_success(&mut self) {
        self.retry_count = 0;
        self.next_retry_at = None;
    }

    /// Time left in the cool-down at `now`, `None` once it has elapsed.
    pub fn remaining(&self, now: u64) -> Option<Duration> {
        match self.next_retry_at {
            Some(at) if now < at => Some(Duration::from_millis(at - now)),
            _ => None,
        }
    }
}

/// Uniform jitter sample in `[0, 1)`.
pub fn jitter_sample() -> f64 {
    rand::rng().random::<f64>()
}
