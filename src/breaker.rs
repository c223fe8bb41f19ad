//! Per-dependency circuit breaker state machine.
//!
//! A [`CircuitBreaker`] wraps one logical dependency (an AI completion
//! provider, a mail gateway, the primary store) and fast-fails calls while
//! that dependency is misbehaving. Opening is driven by two predicates:
//! consecutive failures, and the failure percentage over a rolling window of
//! recent outcomes. Recovery goes through a half-open probe phase entered
//! lazily on the first call after the reset timeout, never from a background
//! timer.
//!
//! Each call races the wrapped operation against a per-call deadline; a
//! deadline expiry is accounted exactly like an operation failure. All
//! mutable breaker state lives behind a single mutex so outcome accounting
//! is serialized even when one breaker is shared across tasks.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::events::{BreakerEvent, EventBus};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow through; failures are being counted.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// Limited probing to test whether the dependency recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration error raised when breaker settings fail validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid { message: message.into() }
    }
}

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Immutable per-breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive successes in half-open before the circuit closes.
    pub success_threshold: u32,
    /// Per-call deadline raced against the operation.
    pub call_timeout: Duration,
    /// How long to stay open before probing the dependency again.
    pub reset_timeout: Duration,
    /// Minimum rolling-window sample size before the percentage predicate
    /// applies.
    pub request_volume_threshold: usize,
    /// Failure percentage (0-100) over the window that opens the circuit.
    pub error_threshold_percentage: f64,
    /// Rolling-window duration for the percentage calculation.
    pub window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            call_timeout: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(30),
            request_volume_threshold: 20,
            error_threshold_percentage: 50.0,
            window: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be greater than 0"));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::invalid("call_timeout must be non-zero"));
        }
        if !(0.0..=100.0).contains(&self.error_threshold_percentage) {
            return Err(ConfigError::invalid(format!(
                "error_threshold_percentage must be within 0-100, got {}",
                self.error_threshold_percentage
            )));
        }
        if self.window.is_zero() {
            return Err(ConfigError::invalid("window must be non-zero"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn request_volume_threshold(mut self, threshold: usize) -> Self {
        self.config.request_volume_threshold = threshold;
        self
    }

    pub fn error_threshold_percentage(mut self, percentage: f64) -> Self {
        self.config.error_threshold_percentage = percentage;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Partial settings merged over registry defaults when a call site needs a
/// dependency-specific breaker (e.g. a longer deadline for AI completions).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerOverrides {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub call_timeout: Option<Duration>,
    pub reset_timeout: Option<Duration>,
    pub request_volume_threshold: Option<usize>,
    pub error_threshold_percentage: Option<f64>,
    pub window: Option<Duration>,
}

impl BreakerOverrides {
    /// Apply these overrides on top of `base`, leaving unset fields alone.
    pub fn apply(&self, base: &CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            success_threshold: self.success_threshold.unwrap_or(base.success_threshold),
            call_timeout: self.call_timeout.unwrap_or(base.call_timeout),
            reset_timeout: self.reset_timeout.unwrap_or(base.reset_timeout),
            request_volume_threshold: self
                .request_volume_threshold
                .unwrap_or(base.request_volume_threshold),
            error_threshold_percentage: self
                .error_threshold_percentage
                .unwrap_or(base.error_threshold_percentage),
            window: self.window.unwrap_or(base.window),
        }
    }
}

/// Errors surfaced to callers of [`CircuitBreaker::execute`].
///
/// The underlying operation error is preserved unmodified as the `source` of
/// [`BreakerError::Operation`], so callers can branch on it (serve cached
/// data, queue for later, surface a message).
#[derive(Debug, Error)]
pub enum BreakerError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The circuit is open; the operation was not invoked.
    ///
    /// The display text is a fixed string so downstream error classification
    /// stays deterministic; `retry_at` is available on the variant itself.
    #[error("circuit '{circuit}' is open")]
    Open { circuit: String, retry_at: Instant },

    /// The operation lost the race against the per-call deadline.
    #[error("call timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The operation itself failed.
    #[error("operation failed: {source}")]
    Operation {
        #[source]
        source: E,
    },
}

impl<E> BreakerError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// True for the deterministic fast-fail rejection, which is expected
    /// operational behavior rather than a defect.
    pub fn is_open_rejection(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// Recover the original operation error, if there is one.
    pub fn into_source(self) -> Option<E> {
        match self {
            BreakerError::Operation { source } => Some(source),
            _ => None,
        }
    }
}

/// Result type for breaker-protected operations.
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;

/// One recorded state transition, for diagnostics only.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub at: Instant,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Read-only snapshot of a breaker's statistics.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub last_failure_time: Option<Instant>,
    pub last_success_time: Option<Instant>,
    pub next_attempt_time: Option<Instant>,
    pub state_changes: Vec<StateChange>,
}

/// One outcome in the rolling window.
#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    at: Instant,
    succeeded: bool,
}

/// All mutable breaker state, serialized under one lock.
#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u64,
    successes: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_requests: u64,
    last_failure_time: Option<Instant>,
    last_success_time: Option<Instant>,
    next_attempt_time: Option<Instant>,
    state_changes: Vec<StateChange>,
    window: VecDeque<WindowEntry>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_requests: 0,
            last_failure_time: None,
            last_success_time: None,
            next_attempt_time: None,
            state_changes: Vec::new(),
            window: VecDeque::new(),
        }
    }
}

/// Whether a call may proceed, decided at the start of `execute`.
enum Admission {
    Proceed,
    Rejected { retry_at: Instant },
}

/// Named circuit breaker guarding a single logical dependency.
///
/// The breaker owns its statistics and rolling window exclusively; callers
/// observe them only through [`CircuitBreaker::stats`]. Timing decisions go
/// through the [`Clock`] parameter so the full open/half-open/closed cycle is
/// testable without real delays.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    events: EventBus,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .field("total_requests", &inner.total_requests)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker using the system clock and a private event bus.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }

    /// Create a breaker publishing on an existing shared bus.
    pub fn with_event_bus(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        events: EventBus,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::assemble(name.into(), config, Arc::new(SystemClock), events))
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock (used by tests).
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::assemble(name.into(), config, Arc::new(clock), EventBus::default()))
    }

    /// Construct without validation; callers must have validated `config`.
    pub(crate) fn assemble(
        name: String,
        config: CircuitBreakerConfig,
        clock: Arc<C>,
        events: EventBus,
    ) -> Self {
        Self { name, config, inner: Mutex::new(Inner::new()), events, clock }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. Does not trigger the lazy open-to-half-open
    /// transition; only `execute` does.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot of the breaker's statistics.
    pub fn stats(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        StatsSnapshot {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_requests: inner.total_requests,
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            next_attempt_time: inner.next_attempt_time,
            state_changes: inner.state_changes.clone(),
        }
    }

    /// Subscribe to this breaker's event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Return the breaker to closed with zeroed statistics.
    ///
    /// For test isolation or operator intervention only; never called
    /// automatically. The state-change log survives, with the reset
    /// transition appended.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let was = inner.state;
        self.transition(&mut inner, CircuitState::Closed, now);
        inner.failures = 0;
        inner.successes = 0;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.total_requests = 0;
        inner.last_failure_time = None;
        inner.last_success_time = None;
        inner.next_attempt_time = None;
        inner.window.clear();
        drop(inner);
        if was != CircuitState::Closed {
            self.events.publish(BreakerEvent::Close { circuit: self.name.clone() });
        }
        info!(circuit = %self.name, "circuit manually reset to closed");
    }

    /// Execute `operation` under breaker protection.
    ///
    /// The operation is raced against the configured per-call deadline.
    /// Outcome accounting happens strictly after the race is decided and
    /// before this returns. Retrying is a separate concern; compose with the
    /// retry engine when needed.
    #[instrument(skip_all, fields(circuit = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.admit() {
            Admission::Rejected { retry_at } => {
                Err(BreakerError::Open { circuit: self.name.clone(), retry_at })
            }
            Admission::Proceed => self.race(operation).await,
        }
    }

    /// Execute `operation`, falling back to `fallback` on rejection or
    /// failure.
    ///
    /// The fallback runs outside the deadline race and its outcome is not
    /// recorded in the breaker's statistics. If the fallback itself fails,
    /// the *original* breaker error is re-raised, not the fallback's.
    #[instrument(skip_all, fields(circuit = %self.name))]
    pub async fn execute_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        operation: F,
        fallback: G,
    ) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let primary = match self.admit() {
            Admission::Rejected { retry_at } => {
                Err(BreakerError::Open { circuit: self.name.clone(), retry_at })
            }
            Admission::Proceed => self.race(operation).await,
        };

        match primary {
            Ok(value) => Ok(value),
            Err(original) => {
                debug!(circuit = %self.name, "invoking fallback");
                match fallback().await {
                    Ok(value) => Ok(value),
                    Err(_) => Err(original),
                }
            }
        }
    }

    /// Race the operation against the call deadline and record the outcome.
    ///
    /// A timed-out operation is abandoned: its future is dropped and cannot
    /// influence later breaker state. Callers relying on its side effects
    /// must bring their own idempotence guarantees.
    async fn race<F, Fut, T, E>(&self, operation: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        match tokio::time::timeout(self.config.call_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(error)) => {
                self.on_failure(&error.to_string());
                Err(BreakerError::Operation { source: error })
            }
            Err(_) => {
                let timeout = self.config.call_timeout;
                self.on_failure(&format!("call timed out after {timeout:?}"));
                Err(BreakerError::Timeout { timeout })
            }
        }
    }

    /// Decide whether the call may run, applying the lazy open-to-half-open
    /// transition.
    fn admit(&self) -> Admission {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            match inner.next_attempt_time {
                Some(retry_at) if now < retry_at => {
                    debug!(circuit = %self.name, "rejecting call, circuit open");
                    self.events.publish(BreakerEvent::Reject {
                        circuit: self.name.clone(),
                        state: inner.state,
                    });
                    return Admission::Rejected { retry_at };
                }
                _ => {
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    self.events.publish(BreakerEvent::HalfOpen { circuit: self.name.clone() });
                }
            }
        }
        Admission::Proceed
    }

    fn on_success(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        inner.successes += 1;
        inner.total_requests += 1;
        inner.consecutive_successes += 1;
        inner.consecutive_failures = 0;
        inner.last_success_time = Some(now);
        inner.window.push_back(WindowEntry { at: now, succeeded: true });
        Self::prune(&mut inner.window, now, self.config.window);

        let state = inner.state;
        self.events.publish(BreakerEvent::Success { circuit: self.name.clone(), state });

        if state == CircuitState::HalfOpen
            && inner.consecutive_successes >= self.config.success_threshold
        {
            self.transition(&mut inner, CircuitState::Closed, now);
            inner.consecutive_failures = 0;
            inner.consecutive_successes = 0;
            inner.next_attempt_time = None;
            self.events.publish(BreakerEvent::Close { circuit: self.name.clone() });
        }
    }

    fn on_failure(&self, error: &str) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        inner.failures += 1;
        inner.total_requests += 1;
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        inner.last_failure_time = Some(now);
        inner.window.push_back(WindowEntry { at: now, succeeded: false });

        let state = inner.state;
        self.events.publish(BreakerEvent::Failure {
            circuit: self.name.clone(),
            state,
            error: error.to_string(),
        });

        // A single failed half-open probe reopens the circuit immediately.
        let should_open = state == CircuitState::HalfOpen || self.should_open(&mut inner, now);
        if should_open && inner.state != CircuitState::Open {
            let retry_at = now + self.config.reset_timeout;
            self.transition(&mut inner, CircuitState::Open, now);
            inner.next_attempt_time = Some(retry_at);
            warn!(
                circuit = %self.name,
                consecutive_failures = inner.consecutive_failures,
                "circuit opened"
            );
            self.events.publish(BreakerEvent::Open { circuit: self.name.clone(), retry_at });
        }
    }

    /// Opening predicate shared by the closed and half-open states.
    fn should_open(&self, inner: &mut Inner, now: Instant) -> bool {
        if inner.consecutive_failures >= self.config.failure_threshold {
            return true;
        }

        // Percentage-based opening only applies once the pruned window holds
        // a meaningful sample.
        Self::prune(&mut inner.window, now, self.config.window);
        if inner.window.len() < self.config.request_volume_threshold {
            return false;
        }
        let failed = inner.window.iter().filter(|entry| !entry.succeeded).count();
        let percentage = failed as f64 * 100.0 / inner.window.len() as f64;
        percentage >= self.config.error_threshold_percentage
    }

    /// Discard window entries older than the window duration.
    fn prune(window: &mut VecDeque<WindowEntry>, now: Instant, width: Duration) {
        let Some(cutoff) = now.checked_sub(width) else {
            return;
        };
        while window.front().is_some_and(|entry| entry.at < cutoff) {
            window.pop_front();
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, at: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.state_changes.push(StateChange { at, from, to });
        info!(circuit = %self.name, %from, %to, "circuit state change");
    }
}

/// Wrap `operation` so every invocation runs under `breaker`.
///
/// Explicit higher-order composition; the returned closure is a drop-in
/// operation for call sites that previously invoked the raw one.
pub fn with_breaker<C, F, Fut, T, E>(
    breaker: Arc<CircuitBreaker<C>>,
    operation: F,
) -> impl Fn() -> BoxFuture<'static, BreakerResult<T, E>>
where
    C: Clock,
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    move || {
        let breaker = Arc::clone(&breaker);
        let operation = operation.clone();
        Box::pin(async move { breaker.execute(operation).await })
    }
}
