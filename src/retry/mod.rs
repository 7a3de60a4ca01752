//! Retry executor — exponential backoff around outbound calls.
//!
//! [`RetryExecutor::execute`] runs an async operation, classifies each failure
//! with the policy's classifier and either retries after
//! `base_delay * backoff_factor^(attempt - 1)`, or stops. Every call ends in
//! exactly one of: success, the first permanent failure, a passed deadline, or
//! [`ToolError::RetryExhausted`] after `max_retries` retries.
//!
//! The backoff is a `tokio::time::sleep`, so the waiting task yields to the
//! runtime and holds no lock while it waits.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::{Disposition, ToolError, classify};
use crate::metrics::MetricsCollector;

/// Maps a failure to [`Disposition::Retryable`] or [`Disposition::Permanent`].
pub type Classifier = Arc<dyn Fn(&ToolError) -> Disposition + Send + Sync>;

/// How an operation is retried.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; the operation runs at most `max_retries + 1` times.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub classifier: Classifier,
    /// No attempt starts after this instant.
    pub deadline: Option<Instant>,
    /// Non-idempotent operations only retry failures that prove the request
    /// was not processed (upstream 429).
    pub idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            classifier: Arc::new(classify),
            deadline: None,
            idempotent: true,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("deadline", &self.deadline)
            .field("idempotent", &self.idempotent)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff_factor,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&ToolError) -> Disposition + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Marks the operation as unsafe to repeat.
    #[must_use]
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    fn disposition(&self, error: &ToolError) -> Disposition {
        let disposition = (self.classifier)(error);
        if self.idempotent || disposition == Disposition::Permanent {
            return disposition;
        }
        match error {
            ToolError::Upstream { status: 429, .. } => Disposition::Retryable,
            _ => Disposition::Permanent,
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Runs operations under a [`RetryPolicy`], reporting outcomes to metrics.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    metrics: Option<Arc<MetricsCollector>>,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs `operation` until it succeeds, fails permanently, runs out of
    /// retries, or the policy deadline passes.
    ///
    /// When the deadline stops the loop after a failure, that failure is
    /// returned unchanged. When it passes before the first attempt,
    /// [`ToolError::Timeout`] is returned.
    pub async fn execute<T, F, Fut>(&self, policy: &RetryPolicy, mut operation: F) -> Result<T, ToolError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ToolError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            if policy.deadline_passed() {
                debug!(attempts = attempt, "deadline passed before attempt");
                self.count("retry_deadline_exceeded_total");
                return Err(ToolError::Timeout { attempts: attempt });
            }

            attempt += 1;
            self.count("retry_attempts_total");

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    self.count("retry_success_total");
                    return Ok(value);
                }
                Err(e) => e,
            };

            if policy.disposition(&error) == Disposition::Permanent {
                debug!(attempt, error = %error, "permanent failure, not retrying");
                self.count("retry_permanent_failures_total");
                return Err(error);
            }

            if attempt > policy.max_retries {
                warn!(attempts = attempt, error = %error, "retries exhausted");
                self.count("retry_exhausted_total");
                return Err(ToolError::RetryExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = policy.delay_for(attempt);
            if let Some(deadline) = policy.deadline {
                if Instant::now().checked_add(delay).is_none_or(|at| at >= deadline) {
                    debug!(attempt, error = %error, "next attempt would start after the deadline");
                    self.count("retry_deadline_exceeded_total");
                    return Err(error);
                }
            }

            warn!(
                attempt,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, retrying"
            );
            if let Some(metrics) = &self.metrics {
                metrics.observe_histogram("retry_backoff_seconds", delay.as_secs_f64(), &[]);
            }
            sleep(delay).await;
        }
    }

    fn count(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc(name);
        }
    }
}
