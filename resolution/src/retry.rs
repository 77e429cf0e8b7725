//! Backoff for evaluator calls that time out or report themselves
//! unavailable.
//!
//! A critique pass makes up to [`RetryPolicy::attempts`] calls. Only when
//! every one of them fails does the pass record a blocking
//! `evaluator:available` contradiction.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a critique pass retries an unreachable evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Calls after the first failed one (0 = single call).
    pub max_retries: u32,
    /// Wait before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Growth of the wait between consecutive retries. Values below 1 or
    /// non-finite values mean a constant wait.
    pub backoff_multiplier: f64,
    /// Longest single wait, in milliseconds.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// One call per pass, no waiting.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Evaluator calls a single critique pass may make.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait before call number `attempt` of a pass (0-based). The first call
    /// goes out at once.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let growth = if self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0 {
            self.backoff_multiplier
        } else {
            1.0
        };
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        // Float-to-int casts saturate, so an overflowing product lands on the cap.
        let ms = (self.initial_backoff_ms as f64 * growth.powi(exponent)) as u64;
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

impl Default for RetryPolicy {
    /// Three calls per pass: waits of 200ms then 400ms, never above 2s.
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 200,
            backoff_multiplier: 2.0,
            max_backoff_ms: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.delay_before(0), Duration::ZERO);
        assert_eq!(policy.delay_before(1), Duration::from_millis(200));
        assert_eq!(policy.delay_before(2), Duration::from_millis(400));
        assert_eq!(policy.delay_before(10), Duration::from_millis(2_000));
    }

    #[test]
    fn test_none_makes_a_single_call() {
        assert_eq!(RetryPolicy::none().attempts(), 1);
    }

    #[test]
    fn test_degenerate_multiplier_keeps_a_constant_wait() {
        let policy = RetryPolicy {
            backoff_multiplier: f64::NAN,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_before(5), Duration::from_millis(200));

        let shrinking = RetryPolicy {
            backoff_multiplier: 0.1,
            ..RetryPolicy::default()
        };
        assert_eq!(shrinking.delay_before(3), Duration::from_millis(200));
    }

    #[test]
    fn test_huge_exponent_saturates_at_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(u32::MAX), Duration::from_millis(2_000));
    }
}
