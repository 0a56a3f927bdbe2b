//! Retry utilities with exponential backoff and jitter.
//!
//! Two flavors live here:
//!
//! - [`retry_with_backoff`] retries an async operation in place. Agents use
//!   it for transfers and HTTP calls.
//! - [`RetryContext`] persists the attempt counter on the reconciled object
//!   as annotations, so a reconciler can return early and let the scheduler
//!   requeue after [`RetryConfig::backoff_delay`] instead of sleeping.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Annotation holding the number of failed attempts of a gated operation
pub const RETRY_COUNT_ANNOTATION: &str = "ome.io/pvc-retry-count";

/// Annotation holding the correlation id that ties log lines and events together
pub const CORRELATION_ID_ANNOTATION: &str = "ome.io/correlation-id";

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }

    /// The policy shared by every reconciler: 2s base, factor 2, 5 min cap, 3 attempts
    pub fn reconcile() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }

    /// Fixed-interval policy: `attempts` tries spaced `delay` apart
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    ///
    /// `initial_delay * multiplier^retry`, capped at `max_delay`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry.min(64) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
/// Returns the last error once max_attempts is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = if config.backoff_multiplier > 1.0 {
                    rand::thread_rng().gen_range(0.5..1.5)
                } else {
                    1.0
                };
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Retry bookkeeping persisted as annotations on a reconciled object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryContext {
    /// Failed attempts of the gated operation so far
    pub retry_count: u32,
    /// Correlation id, generated once and then preserved
    pub correlation_id: Option<String>,
}

impl RetryContext {
    /// Read the retry context from an object's annotations.
    ///
    /// A missing or unparsable counter reads as zero.
    pub fn from_annotations(annotations: Option<&BTreeMap<String, String>>) -> Self {
        let Some(annotations) = annotations else {
            return Self::default();
        };
        Self {
            retry_count: annotations
                .get(RETRY_COUNT_ANNOTATION)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            correlation_id: annotations
                .get(CORRELATION_ID_ANNOTATION)
                .filter(|v| !v.is_empty())
                .cloned(),
        }
    }

    /// Return the correlation id, generating one on first use
    pub fn ensure_correlation_id(&mut self, prefix: &str) -> &str {
        self.correlation_id
            .get_or_insert_with(|| new_correlation_id(prefix))
    }

    /// Record one more failure, never exceeding the configured maximum
    pub fn record_failure(&mut self, config: &RetryConfig) {
        self.retry_count = self.retry_count.saturating_add(1);
        if config.max_attempts > 0 {
            self.retry_count = self.retry_count.min(config.max_attempts);
        }
    }

    /// Clear the counter after the gated operation succeeded
    pub fn reset(&mut self) {
        self.retry_count = 0;
    }

    /// Annotation values to merge-patch onto the object
    pub fn to_annotations(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert(
            RETRY_COUNT_ANNOTATION.to_string(),
            self.retry_count.to_string(),
        );
        if let Some(id) = &self.correlation_id {
            out.insert(CORRELATION_ID_ANNOTATION.to_string(), id.clone());
        }
        out
    }
}

/// Build a correlation id of the form `<prefix>-<unix-nanos>-<random>`
pub fn new_correlation_id(prefix: &str) -> String {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    let suffix: u32 = rand::thread_rng().gen_range(0..0x10000);
    format!("{prefix}-{nanos}-{suffix:04x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fixed_policy_exhausts_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig::fixed(3, Duration::from_millis(1));
        let result: Result<i32, &str> = retry_with_backoff(&config, "download", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_reconcile_backoff_schedule() {
        let config = RetryConfig::reconcile();
        assert_eq!(config.backoff_delay(0), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(8));
        assert_eq!(config.backoff_delay(20), Duration::from_secs(300));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
    }

    /// Story: the retry counter is capped and cleared on success
    #[test]
    fn story_retry_counter_never_exceeds_max() {
        let config = RetryConfig::reconcile();
        let mut ctx = RetryContext::default();
        for _ in 0..10 {
            ctx.record_failure(&config);
        }
        assert_eq!(ctx.retry_count, 3);

        ctx.reset();
        assert_eq!(ctx.retry_count, 0);
        assert_eq!(ctx.to_annotations()[RETRY_COUNT_ANNOTATION], "0");
    }

    /// Story: the correlation id is generated once and then preserved
    #[test]
    fn story_correlation_id_is_stable() {
        let mut ctx = RetryContext::default();
        let first = ctx.ensure_correlation_id("pvc").to_string();
        assert!(first.starts_with("pvc-"));

        let restored = RetryContext::from_annotations(Some(&ctx.to_annotations()));
        let mut restored = restored;
        assert_eq!(restored.ensure_correlation_id("pvc"), first);
    }

    #[test]
    fn test_garbage_counter_reads_as_zero() {
        let mut annotations = BTreeMap::new();
        annotations.insert(RETRY_COUNT_ANNOTATION.to_string(), "many".to_string());
        let ctx = RetryContext::from_annotations(Some(&annotations));
        assert_eq!(ctx.retry_count, 0);
        assert_eq!(ctx.correlation_id, None);
    }
}
