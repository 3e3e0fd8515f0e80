//! Bounded exponential backoff for cluster calls.
//!
//! Only transient errors (rate limiting, conflicts, timeouts, unavailable
//! API server) are retried. Everything else returns on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use elastic_core::config::ExecutorConfig;

use crate::cluster::ClusterError;

/// Backoff parameters for one cluster call.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum attempts per call, at least 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl From<&ExecutorConfig> for RetryConfig {
    fn from(cfg: &ExecutorConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_delay: cfg.initial_backoff(),
            max_delay: cfg.max_backoff(),
            backoff_multiplier: cfg.backoff_multiplier,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or exhausts
/// `config.max_attempts`.
///
/// Every attempt is added to `attempts` so callers can report the total
/// across several calls that make up one pod operation.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    attempts: &mut u32,
    mut operation: F,
) -> Result<T, ClusterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClusterError>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        *attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "cluster call failed after max retries"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay.
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "cluster call failed, retrying"
                );

                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let mut attempts = 0;

        let result = retry_transient(&fast(5), "create", &mut attempts, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ClusterError::RateLimited("slow down".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let mut attempts = 0;
        let result: Result<(), _> = retry_transient(&fast(5), "create", &mut attempts, || async {
            Err(ClusterError::Validation("bad quantity".into()))
        })
        .await;

        assert!(matches!(result, Err(ClusterError::Validation(_))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn exhausts_attempt_ceiling() {
        let mut attempts = 0;
        let result: Result<(), _> = retry_transient(&fast(3), "delete", &mut attempts, || async {
            Err(ClusterError::Timeout("api".into()))
        })
        .await;

        assert!(matches!(result, Err(ClusterError::Timeout(_))));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn built_from_executor_config() {
        let cfg = ExecutorConfig {
            max_attempts: 0,
            ..Default::default()
        };
        let retry = RetryConfig::from(&cfg);
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.initial_delay, Duration::from_millis(200));
    }
}
