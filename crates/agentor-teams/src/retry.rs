use crate::config::RetryConfig;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Injectable sleep used between attempts, so tests can skip (and record) real delays.
pub type SleepFn = Arc<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Sleep backed by `tokio::time::sleep`.
pub fn tokio_sleep() -> SleepFn {
    Arc::new(|duration| {
        Box::pin(tokio::time::sleep(duration)) as Pin<Box<dyn Future<Output = ()> + Send>>
    })
}

/// Retry behaviour resolved for a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// Read `max_retries` and `retry_backoff_ms` from task metadata, clamped to the
    /// configured bounds. Missing or non-numeric values fall back to the defaults.
    pub fn from_metadata(metadata: &serde_json::Value, config: &RetryConfig) -> Self {
        let max_retries = numeric(metadata, "max_retries")
            .map(|v| v.clamp(i64::from(config.min_max_retries), i64::from(config.max_max_retries)))
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(config.default_max_retries);

        let min_backoff = i64::try_from(config.min_backoff_ms).unwrap_or(i64::MAX);
        let max_backoff = i64::try_from(config.max_backoff_ms).unwrap_or(i64::MAX);
        let backoff_ms = numeric(metadata, "retry_backoff_ms")
            .map(|v| v.clamp(min_backoff, max_backoff))
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(config.default_backoff_ms);

        Self {
            max_retries,
            backoff_ms,
        }
    }

    /// Delay after the given failed attempt (1-based): `backoff_ms * 2^(attempt-1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u64.saturating_pow(exponent);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

fn numeric(metadata: &serde_json::Value, key: &str) -> Option<i64> {
    let value = metadata.get(key)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.round() as i64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_when_metadata_missing() {
        let policy = RetryPolicy::from_metadata(&serde_json::Value::Null, &RetryConfig::default());
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff_ms, 600);
    }

    #[test]
    fn test_overrides_are_clamped() {
        let config = RetryConfig::default();
        let high = RetryPolicy::from_metadata(
            &json!({ "max_retries": 12, "retry_backoff_ms": 60_000 }),
            &config,
        );
        assert_eq!(high.max_retries, 5);
        assert_eq!(high.backoff_ms, 5000);

        let low =
            RetryPolicy::from_metadata(&json!({ "max_retries": 0, "retry_backoff_ms": 5 }), &config);
        assert_eq!(low.max_retries, 1);
        assert_eq!(low.backoff_ms, 200);

        let negative = RetryPolicy::from_metadata(&json!({ "max_retries": -4 }), &config);
        assert_eq!(negative.max_retries, 1);
    }

    #[test]
    fn test_string_and_float_overrides() {
        let config = RetryConfig::default();
        let policy = RetryPolicy::from_metadata(
            &json!({ "max_retries": "2", "retry_backoff_ms": 250.4 }),
            &config,
        );
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.backoff_ms, 250);

        let garbage = RetryPolicy::from_metadata(&json!({ "max_retries": "many" }), &config);
        assert_eq!(garbage.max_retries, 3);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_ms: 600,
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(600));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(2400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(4800));
    }

    #[tokio::test]
    async fn test_tokio_sleep_completes() {
        let sleep = tokio_sleep();
        sleep(Duration::from_millis(1)).await;
    }
}
