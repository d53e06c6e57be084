//! Retry policy for calls to the vision service, as an explicit state machine.
//!
//! The policy itself is pure: it never sleeps and never draws random numbers.
//! The caller feeds it the failure class and a jitter sample in `[0, 1)` and
//! gets back the next [`CallState`]. That keeps the backoff schedule testable
//! without a clock and lets the caller own the actual waiting.
//!
//! ```text
//! Attempting(1) ──fail(retryable)──▶ Backoff{1, d} ──sleep d──▶ Attempting(2) ── …
//!      │                                                             │
//!      ├──ok──▶ Succeeded                                            └─fail(fatal or
//!      └──fail(fatal)──▶ GaveUp                                        retries spent)─▶ GaveUp
//! ```

use crate::error::ErrorClass;
use std::time::Duration;

/// Where a call currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// About to make attempt `n` (1-based).
    Attempting(u32),
    /// Attempt `attempt` failed retryably; wait `delay` before the next one.
    Backoff { attempt: u32, delay: Duration },
    Succeeded,
    /// No further attempts; `attempts` were made in total.
    GaveUp { attempts: u32 },
}

/// Exponential backoff with additive jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay unit; the n-th retry waits `base × 2ⁿ` plus jitter.
    pub base: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base: Duration::from_millis(2000),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration) -> Self {
        Self {
            max_retries,
            base,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (1-based), with `jitter` in `[0, 1)`.
    pub fn delay(&self, retry: u32, jitter: f64) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        let jitter = self.max_jitter.mul_f64(jitter.clamp(0.0, 1.0));
        self.base.saturating_mul(factor) + jitter
    }

    /// Transition after attempt `attempt` (1-based) failed with `class`.
    pub fn on_failure(&self, attempt: u32, class: ErrorClass, jitter: f64) -> CallState {
        if class.is_retryable() && attempt <= self.max_retries {
            CallState::Backoff {
                attempt,
                delay: self.delay(attempt, jitter),
            }
        } else {
            CallState::GaveUp { attempts: attempt }
        }
    }

    /// Transition after a backoff has been waited out.
    pub fn after_backoff(&self, state: CallState) -> CallState {
        match state {
            CallState::Backoff { attempt, .. } => CallState::Attempting(attempt + 1),
            other => other,
        }
    }
}
