//! Bounded retry with exponential backoff and jitter.
//!
//! The retry engine is stateless per call and independent of the circuit
//! breaker; callers compose the two as needed (a retry-wrapped operation
//! passed into a breaker, or vice versa). Errors are classified as transient
//! or fatal before any re-attempt: fatal errors propagate on first
//! occurrence with no delay, transient ones are absorbed until attempts run
//! out. Whatever error finally escapes is the caller's original error,
//! unmodified.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::breaker::{ConfigError, ConfigResult};

/// Classification of an operation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Re-attempting the same operation could plausibly succeed.
    Transient,
    /// Retrying cannot help; propagate immediately.
    Fatal,
}

/// Maps an operation error to retryable or fatal.
///
/// Implementations must be cheap and side-effect free; the classifier runs
/// on every failed attempt.
pub trait Classify<E>: Send + Sync {
    fn classify(&self, error: &E) -> ErrorClass;
}

/// Classifier built from a plain function.
pub struct ClassifyWith<F>(F);

impl<F> ClassifyWith<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F, E> Classify<E> for ClassifyWith<F>
where
    F: Fn(&E) -> ErrorClass + Send + Sync,
{
    fn classify(&self, error: &E) -> ErrorClass {
        (self.0)(error)
    }
}

/// Default classifier for transport-level failures.
///
/// Connection refused/reset, DNS failures, timeouts, 5xx-equivalent
/// statuses, plus 429 and 408 are transient. Everything else, notably
/// 4xx-equivalent validation and auth errors, is fatal. The match works on
/// the error's display text, which is what the gateway and provider client
/// errors expose.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportClassifier;

impl TransportClassifier {
    fn is_transient(text: &str) -> bool {
        // Client errors are never retryable, except the two throttling
        // statuses handled below.
        if text.contains("400")
            || text.contains("401")
            || text.contains("403")
            || text.contains("404")
            || text.contains("409")
            || text.contains("422")
        {
            return false;
        }

        text.contains("connection refused")
            || text.contains("connection reset")
            || text.contains("dns")
            || text.contains("timed out")
            || text.contains("timeout")
            || text.contains("429")
            || text.contains("too many requests")
            || text.contains("408")
            || text.contains("500")
            || text.contains("502")
            || text.contains("503")
            || text.contains("504")
            || text.contains("internal server error")
            || text.contains("bad gateway")
            || text.contains("service unavailable")
            || text.contains("gateway timeout")
    }
}

impl<E: std::fmt::Display> Classify<E> for TransportClassifier {
    fn classify(&self, error: &E) -> ErrorClass {
        let text = error.to_string().to_lowercase();
        if Self::is_transient(&text) {
            ErrorClass::Transient
        } else {
            ErrorClass::Fatal
        }
    }
}

/// Immutable retry settings; stateless and shareable across call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_retries: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Cap on any single backoff delay.
    pub max_delay: Duration,
    /// Exponential growth factor between delays.
    pub backoff_multiplier: f64,
    /// Add a uniform random value in `[0, 0.1 * delay)` to each delay,
    /// de-synchronizing retry storms across callers.
    pub jitter_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid {
                message: "max_retries must be greater than 0".to_string(),
            });
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                message: "backoff_multiplier must be at least 1.0".to_string(),
            });
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::Invalid {
                message: "initial_delay cannot exceed max_delay".to_string(),
            });
        }
        Ok(())
    }

    /// Backoff delay after the failed 1-based `attempt`, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }

    /// Backoff delay after the failed 1-based `attempt`, jittered if enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter_enabled {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..0.1) * base.as_millis() as f64;
        base + Duration::from_millis(jitter as u64)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    pub fn max_retries(mut self, attempts: u32) -> Self {
        self.policy.max_retries = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.policy.jitter_enabled = enabled;
        self
    }

    pub fn build(self) -> ConfigResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Retry executor pairing a policy with an error classifier.
#[derive(Debug, Clone)]
pub struct Retrier<C = TransportClassifier> {
    policy: RetryPolicy,
    classifier: C,
}

impl Retrier<TransportClassifier> {
    /// Executor using the default transport classifier.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, classifier: TransportClassifier }
    }
}

impl<C> Retrier<C> {
    pub fn with_classifier(policy: RetryPolicy, classifier: C) -> Self {
        Self { policy, classifier }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `operation` up to `max_retries` times.
    ///
    /// Backoff sleeps are non-blocking; other tasks proceed while this one
    /// waits. The error returned on exhaustion or fatal classification is
    /// the operation's own, untouched.
    #[instrument(skip_all, fields(max_retries = self.policy.max_retries))]
    pub async fn run<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        C: Classify<E>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.policy.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if self.classifier.classify(&error) == ErrorClass::Fatal {
                        debug!(attempt, %error, "fatal error, not retrying");
                        return Err(error);
                    }
                    if attempt >= attempts {
                        warn!(attempt, %error, "retry attempts exhausted");
                        return Err(error);
                    }
                    let delay = self.policy.delay_for(attempt);
                    warn!(attempt, %error, ?delay, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Run `operation` under `policy` with `classifier`, without building a
/// [`Retrier`] by hand.
pub async fn execute_with_retry<C, F, Fut, T, E>(
    policy: RetryPolicy,
    classifier: C,
    operation: F,
) -> Result<T, E>
where
    C: Classify<E>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    Retrier::with_classifier(policy, classifier).run(operation).await
}

/// Wrap `operation` so every invocation runs under `retrier`'s retry loop.
///
/// The composed counterpart of [`crate::breaker::with_breaker`]; call sites
/// get a drop-in operation with retry behavior baked in.
pub fn with_retry<C, F, Fut, T, E>(
    retrier: Arc<Retrier<C>>,
    operation: F,
) -> impl Fn() -> BoxFuture<'static, Result<T, E>>
where
    C: Classify<E> + Send + Sync + 'static,
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    move || {
        let retrier = Arc::clone(&retrier);
        let operation = operation.clone();
        Box::pin(async move { retrier.run(operation).await })
    }
}
