// Exponential backoff with jitter, shared by every retrying caller of the gateway

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::gateway::UpstreamError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    // Total tries including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 250,
            max_backoff_ms: 8000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    jitter: fn() -> f64,
}

fn random_unit() -> f64 {
    rand::random::<f64>()
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            jitter: random_unit,
        }
    }

    // Replaces the random source; it must return values in [0, 1)
    pub fn with_jitter(mut self, jitter: fn() -> f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    // Delay before retry number `retry_attempt` (0-based). Jitter spreads the
    // delay across [base * (1 - j/2), base * (1 + j/2)).
    pub fn backoff(&self, retry_attempt: u32) -> Duration {
        let config = &self.config;
        let base_backoff_ms = (config.initial_backoff_ms as f64
            * config.backoff_multiplier.powf(retry_attempt as f64))
        .min(config.max_backoff_ms as f64);

        let jitter = (self.jitter)() * config.jitter_factor * base_backoff_ms;
        let backoff_ms = base_backoff_ms * (1.0 - config.jitter_factor / 2.0) + jitter;

        Duration::from_millis(backoff_ms.min(config.max_backoff_ms as f64).max(0.0) as u64)
    }

    // Runs `operation` until it succeeds, fails with a non-retryable error, or
    // attempts run out. Returns the last error in the latter cases.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    debug!("{} failed without retry: {}", label, e);
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    warn!("{} gave up after {} attempts: {}", label, attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff(attempt - 1);
                    debug!(
                        "{} attempt {}/{} failed ({}), retrying in {:?}",
                        label, attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use test_case::test_case;
    use tokio::time::Instant;

    fn no_jitter() -> f64 {
        0.0
    }

    fn max_jitter() -> f64 {
        0.999
    }

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }

    #[test_case(0, 90; "first retry")]
    #[test_case(1, 180; "second retry")]
    #[test_case(2, 360; "third retry")]
    #[test_case(10, 900; "capped")]
    fn test_backoff_lower_bound(retry_attempt: u32, expected_ms: u64) {
        let policy = RetryPolicy::new(config()).with_jitter(no_jitter);
        assert_eq!(policy.backoff(retry_attempt), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_backoff_never_exceeds_max() {
        let policy = RetryPolicy::new(config()).with_jitter(max_jitter);
        for retry_attempt in 0..20 {
            assert!(policy.backoff(retry_attempt) <= Duration::from_millis(1000));
        }
        assert!(policy.backoff(1) > policy.backoff(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_then_succeeds() {
        let policy = RetryPolicy::new(config()).with_jitter(no_jitter);
        let calls = &AtomicU32::new(0);
        let started = Instant::now();

        let result = policy
            .run("chunk", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(UpstreamError::Transient("HTTP 503".to_string()))
                } else {
                    Ok("calendar")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "calendar");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(90 + 180));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(config()).with_jitter(no_jitter);
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run("chunk", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(UpstreamError::RateLimited { retry_after: None })
            })
            .await;

        assert!(matches!(result, Err(UpstreamError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rejected_is_not_retried() {
        let policy = RetryPolicy::new(config());
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run("chunk", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(UpstreamError::Rejected {
                    status: 404,
                    message: "listing not found".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(UpstreamError::Rejected { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
