//! Bounded retry with exponential backoff and jitter
//!
//! Used by the consolidation engine to re-run a cycle that lost a conditional
//! commit to a concurrent writer. Durations are configured in milliseconds.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum allowed retry attempts
const MAX_RETRY_ATTEMPTS: u32 = 1000;
/// Maximum backoff duration
const MAX_BACKOFF_MILLIS: u64 = 3_600_000;
/// Maximum multiplier to prevent exponential explosion
const MAX_MULTIPLIER: f64 = 100.0;
/// Maximum jitter factor
const MAX_JITTER_FACTOR: f64 = 1.0;

fn validate_max_retries<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u32::deserialize(deserializer)?;
    if value > MAX_RETRY_ATTEMPTS {
        return Err(serde::de::Error::custom(format!(
            "max_retries {} exceeds maximum allowed value {}",
            value, MAX_RETRY_ATTEMPTS
        )));
    }
    Ok(value)
}

fn validate_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    if millis > MAX_BACKOFF_MILLIS {
        return Err(serde::de::Error::custom(format!(
            "backoff of {}ms exceeds maximum allowed {}ms",
            millis, MAX_BACKOFF_MILLIS
        )));
    }
    Ok(Duration::from_millis(millis))
}

fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn validate_multiplier<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || !(1.0..=MAX_MULTIPLIER).contains(&value) {
        return Err(serde::de::Error::custom(format!(
            "backoff_multiplier {} must be finite and between 1.0 and {}",
            value, MAX_MULTIPLIER
        )));
    }
    Ok(value)
}

fn validate_jitter<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || !(0.0..=MAX_JITTER_FACTOR).contains(&value) {
        return Err(serde::de::Error::custom(format!(
            "jitter_factor {} must be finite and between 0.0 and {}",
            value, MAX_JITTER_FACTOR
        )));
    }
    Ok(value)
}

/// Retry policy with validated bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    #[serde(deserialize_with = "validate_max_retries")]
    pub max_retries: u32,
    /// Backoff before the first retry, in milliseconds
    #[serde(
        rename = "initial_backoff_ms",
        deserialize_with = "validate_millis",
        serialize_with = "serialize_millis"
    )]
    pub initial_backoff: Duration,
    /// Backoff cap, in milliseconds
    #[serde(
        rename = "max_backoff_ms",
        deserialize_with = "validate_millis",
        serialize_with = "serialize_millis"
    )]
    pub max_backoff: Duration,
    /// Growth factor between consecutive backoffs
    #[serde(deserialize_with = "validate_multiplier")]
    pub backoff_multiplier: f64,
    /// Random extra delay, as a fraction of the backoff
    #[serde(deserialize_with = "validate_jitter")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter_factor: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based)
    pub fn next_backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        // Past ~30 doublings the cap always wins
        let exponent = retry.min(30) as i32 - 1;
        let multiplier = self.backoff_multiplier.powi(exponent);
        let base = if multiplier.is_finite() {
            self.initial_backoff.as_secs_f64() * multiplier
        } else {
            self.max_backoff.as_secs_f64()
        };
        let capped = base.min(self.max_backoff.as_secs_f64());

        let jitter = capped * self.jitter_factor * rand::random::<f64>();
        let backoff = Duration::from_secs_f64(capped + jitter);

        debug!("Backoff for retry {}: {:?}", retry, backoff);
        backoff
    }

    /// Whether another retry is allowed after `retries` retries
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// A policy with a constant backoff
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff: backoff,
            max_backoff: backoff,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries > MAX_RETRY_ATTEMPTS {
            return Err(format!("max_retries cannot exceed {}", MAX_RETRY_ATTEMPTS));
        }
        if self.initial_backoff > self.max_backoff {
            return Err("initial_backoff_ms cannot exceed max_backoff_ms".to_string());
        }
        Ok(())
    }
}

/// Outcome of a retried operation
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// The operation eventually succeeded
    Success {
        /// Value produced
        value: T,
        /// Attempts made, including the successful one
        attempts: u32,
    },
    /// The operation failed permanently or ran out of retries
    Failed {
        /// Last error
        error: E,
        /// Attempts made
        attempts: u32,
    },
}

/// Runs an operation under a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create a new retry executor
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Retry `operation` while `should_retry` accepts its error
    pub async fn execute_with_predicate<F, Fut, P, T, E>(
        &self,
        mut operation: F,
        mut should_retry: P,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut retries = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!("Operation succeeded after {} retries", retries);
                    }
                    return RetryResult::Success {
                        value,
                        attempts: retries + 1,
                    };
                }
                Err(error) => {
                    if !should_retry(&error) {
                        return RetryResult::Failed {
                            error,
                            attempts: retries + 1,
                        };
                    }
                    if !self.policy.should_retry(retries) {
                        warn!("Operation failed after {} attempts: {}", retries + 1, error);
                        return RetryResult::Failed {
                            error,
                            attempts: retries + 1,
                        };
                    }

                    retries += 1;
                    let backoff = self.policy.next_backoff(retries);
                    warn!(
                        "Operation failed (attempt {}), retrying in {:?}: {}",
                        retries, backoff, error
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        };

        assert_eq!(policy.next_backoff(0), Duration::ZERO);

        let first = policy.next_backoff(1);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(110));

        let second = policy.next_backoff(2);
        assert!(second >= Duration::from_millis(200));
        assert!(second <= Duration::from_millis(220));

        assert!(policy.next_backoff(200) <= Duration::from_secs(11));
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(policy.next_backoff(1), Duration::from_millis(500));
        assert_eq!(policy.next_backoff(3), Duration::from_millis(500));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(3, Duration::from_millis(1)));
        let calls = Arc::new(AtomicU32::new(0));

        let result = executor
            .execute_with_predicate(
                || {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err("conflict")
                        } else {
                            Ok("done")
                        }
                    }
                },
                |_| true,
            )
            .await;

        match result {
            RetryResult::Success { value, attempts } => {
                assert_eq!(value, "done");
                assert_eq!(attempts, 3);
            }
            RetryResult::Failed { .. } => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn test_predicate_stops_retries() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(5, Duration::from_millis(1)));
        let result: RetryResult<(), &str> = executor
            .execute_with_predicate(|| async { Err("bad input") }, |_| false)
            .await;
        assert!(matches!(result, RetryResult::Failed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(2, Duration::from_millis(1)));
        let result: RetryResult<(), &str> = executor
            .execute_with_predicate(|| async { Err("conflict") }, |_| true)
            .await;
        assert!(matches!(result, RetryResult::Failed { attempts: 3, .. }));
    }

    #[test]
    fn test_policy_bounds_are_validated() {
        let ok: RetryPolicy = toml::from_str(
            "max_retries = 5\ninitial_backoff_ms = 10\nmax_backoff_ms = 1000\n",
        )
        .unwrap();
        assert_eq!(ok.initial_backoff, Duration::from_millis(10));
        assert_eq!(ok.jitter_factor, RetryPolicy::default().jitter_factor);

        for bad in [
            "max_retries = 10000",
            "max_backoff_ms = 7200000",
            "backoff_multiplier = -1.0",
            "jitter_factor = 1.5",
        ] {
            assert!(toml::from_str::<RetryPolicy>(bad).is_err(), "{}", bad);
        }

        let inverted = RetryPolicy {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }
}
