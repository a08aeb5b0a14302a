//! Automatic retry policy for failed executions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default exponential multiplier when not specified.
pub const DEFAULT_EXPONENTIAL_MULTIPLIER: f64 = 2.0;

/// Delay before the next attempt is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Same delay before every retry.
    Fixed { delay_secs: u64 },
    /// `base_secs * multiplier^(attempt - 1)`, capped at `max_secs`.
    Exponential {
        base_secs: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default)]
        max_secs: Option<u64>,
    },
}

fn default_multiplier() -> f64 {
    DEFAULT_EXPONENTIAL_MULTIPLIER
}

impl Backoff {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fixed { .. } => "fixed",
            Self::Exponential { .. } => "exponential",
        }
    }

    /// Delay before retrying after `failed_attempt` (1-based) failed.
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        if failed_attempt == 0 {
            return Duration::ZERO;
        }
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay_secs } => Duration::from_secs(delay_secs),
            Self::Exponential {
                base_secs,
                multiplier,
                max_secs,
            } => {
                let multiplier = if multiplier > 0.0 {
                    multiplier
                } else {
                    DEFAULT_EXPONENTIAL_MULTIPLIER
                };
                let exp = i32::try_from(failed_attempt - 1).unwrap_or(i32::MAX);
                #[allow(clippy::cast_precision_loss, reason = "delays are far below 2^52 seconds")]
                let secs = (base_secs as f64) * multiplier.powi(exp);
                let capped = max_secs.map_or(secs, |max| secs.min(max as f64));
                Duration::try_from_secs_f64(capped).unwrap_or(Duration::MAX)
            }
        }
    }
}

/// How many attempts one firing gets and how far apart they are.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. `0` and `1` disable retries.
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Apply a per-schedule attempt limit.
    #[must_use]
    pub fn with_override(self, max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts: max_attempts.unwrap_or(self.max_attempts),
            ..self
        }
    }

    /// Whether another attempt follows `failed_attempt`.
    pub fn should_retry(&self, failed_attempt: u32) -> bool {
        failed_attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_never_retries() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(1));
        assert!(!RetryPolicy::new(1, Backoff::None).should_retry(1));
    }

    #[test]
    fn test_max_attempts_counts_first_attempt() {
        let policy = RetryPolicy::new(2, Backoff::None);
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn test_override() {
        let policy = RetryPolicy::new(3, Backoff::None);
        assert_eq!(policy.with_override(None).max_attempts, 3);
        assert_eq!(policy.with_override(Some(1)).max_attempts, 1);
    }

    #[test]
    fn test_backoff_delays() {
        assert_eq!(Backoff::None.delay(3), Duration::ZERO);
        assert_eq!(Backoff::Fixed { delay_secs: 300 }.delay(2), Duration::from_secs(300));

        let exp = Backoff::Exponential {
            base_secs: 10,
            multiplier: 2.0,
            max_secs: Some(60),
        };
        assert_eq!(exp.delay(0), Duration::ZERO);
        assert_eq!(exp.delay(1), Duration::from_secs(10));
        assert_eq!(exp.delay(2), Duration::from_secs(20));
        assert_eq!(exp.delay(3), Duration::from_secs(40));
        assert_eq!(exp.delay(4), Duration::from_secs(60));
        assert_eq!(exp.kind_str(), "exponential");
    }

    #[test]
    fn test_backoff_deserializes_tagged() {
        let backoff: Backoff =
            serde_json::from_value(serde_json::json!({"kind": "exponential", "base_secs": 5}))
                .unwrap();
        assert_eq!(
            backoff,
            Backoff::Exponential {
                base_secs: 5,
                multiplier: 2.0,
                max_secs: None
            }
        );
    }
}
