//! Retry policy: what happens after a failed consultation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::failure::FailureKind;

/// Outcome of consulting the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back to `pending`, not claimable before `next_scheduled_at`.
    Retry { next_scheduled_at: DateTime<Utc> },
    /// Transient failure, but no attempts left.
    Exhausted,
    /// Non-retryable failure; terminal regardless of remaining attempts.
    Fatal,
}

/// Exponential backoff with a fixed base and cap: `min(base * 2^n, cap)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(30 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay after `prior_failures` earlier failed attempts (0 for the first failure).
    pub fn delay_for(&self, prior_failures: u32) -> Duration {
        1u32.checked_shl(prior_failures)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Decide the next step for a job that just failed.
    ///
    /// `attempts` already counts the failure being reported.
    pub fn decide(
        &self,
        attempts: u32,
        max_attempts: u32,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !kind.is_transient() {
            return RetryDecision::Fatal;
        }
        if attempts >= max_attempts {
            return RetryDecision::Exhausted;
        }

        let delay = self.delay_for(attempts.saturating_sub(1));
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let next_scheduled_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Retry { next_scheduled_at }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(300))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_secs(10));
        assert_eq!(p.delay_for(1), Duration::from_secs(20));
        assert_eq!(p.delay_for(2), Duration::from_secs(40));
        assert_eq!(p.delay_for(5), Duration::from_secs(300));
        assert_eq!(p.delay_for(64), Duration::from_secs(300));
    }

    #[test]
    fn first_transient_failure_waits_base_delay() {
        let decision = policy().decide(1, 3, FailureKind::Timeout, now());
        assert_eq!(
            decision,
            RetryDecision::Retry {
                next_scheduled_at: now() + chrono::Duration::seconds(10)
            }
        );
    }

    #[test]
    fn last_allowed_failure_is_exhausted() {
        assert_eq!(
            policy().decide(3, 3, FailureKind::Network, now()),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn captcha_is_fatal_with_attempts_left() {
        assert_eq!(
            policy().decide(1, 5, FailureKind::CaptchaBlocked, now()),
            RetryDecision::Fatal
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: backoff never exceeds the cap and never shrinks as failures accumulate.
        #[test]
        fn backoff_is_monotonic_and_capped(base_ms in 1u64..60_000, cap_factor in 1u64..200, n in 0u32..40) {
            let p = RetryPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(base_ms * cap_factor),
            );
            let d = p.delay_for(n);
            prop_assert!(d <= p.max_delay);
            prop_assert!(p.delay_for(n + 1) >= d);
            if d < p.max_delay {
                prop_assert!(p.delay_for(n + 1) > d);
            }
        }

        /// Property: a transient failure is retried exactly while attempts remain.
        #[test]
        fn retry_only_below_max_attempts(attempts in 1u32..30, max in 1u32..30) {
            let decision = policy().decide(attempts, max, FailureKind::PortalMaintenance, now());
            if attempts < max {
                prop_assert!(matches!(decision, RetryDecision::Retry { .. }), "expected retry");
            } else {
                prop_assert_eq!(decision, RetryDecision::Exhausted);
            }
        }
    }
}
