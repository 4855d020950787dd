#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Capped exponential backoff for transient push failures.
///
/// `max_attempts` counts deliveries, not retries: with the default of 3 a mutation is sent at
/// most three times before it is marked Failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub factor: u32,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            factor: 2,
            max_delay_ms: 60_000,
            max_attempts: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(i64),
    Exhausted,
}

impl BackoffPolicy {
    /// Delay before the attempt following failure number `retry_count` (1-based).
    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        let exp = retry_count.saturating_sub(1);
        let mult = u64::from(self.factor).saturating_pow(exp);
        self.base_ms.saturating_mul(mult).min(self.max_delay_ms)
    }

    /// `retry_count` is the count after the failure that was just observed.
    pub fn after_failure(&self, retry_count: u32, now_ms: i64) -> RetryDecision {
        if retry_count >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        let delay = i64::try_from(self.delay_ms(retry_count)).unwrap_or(i64::MAX);
        RetryDecision::RetryAt(now_ms.saturating_add(delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_and_cap() {
        let policy = BackoffPolicy {
            max_delay_ms: 5_000,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay_ms(1), 1_000);
        assert_eq!(policy.delay_ms(2), 2_000);
        assert_eq!(policy.delay_ms(3), 4_000);
        assert_eq!(policy.delay_ms(4), 5_000);
        assert_eq!(policy.delay_ms(200), 5_000);
    }

    #[test]
    fn third_failure_exhausts_default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.after_failure(1, 100), RetryDecision::RetryAt(1_100));
        assert_eq!(policy.after_failure(2, 100), RetryDecision::RetryAt(2_100));
        assert_eq!(policy.after_failure(3, 100), RetryDecision::Exhausted);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let policy: BackoffPolicy = serde_json::from_str(r#"{"max_attempts":5}"#).expect("parse");
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_ms, 1_000);
    }
}
