//! Fault-tolerant execution layer for calls to unreliable dependencies.
//!
//! This crate protects calls to external services (AI completion providers,
//! speech services, messaging and email gateways, the primary data store)
//! with two independently correct, composable mechanisms:
//!
//! - **Circuit breakers** ([`breaker`]): a named per-dependency state
//!   machine with windowed failure-rate accounting, per-call deadline
//!   racing, and optional fallbacks.
//! - **Bounded retry** ([`retry`]): stateless exponential backoff with
//!   jitter, driven by a transient/fatal error classifier.
//!
//! A [`registry::BreakerRegistry`] memoizes one breaker per dependency name
//! and is constructed explicitly at startup; a [`sampler::StatusSampler`]
//! periodically reads registry-wide stats and raises alerts for open
//! circuits. All breaker outcomes and transitions are published as
//! [`events::BreakerEvent`]s on a bounded broadcast channel, which is the
//! sole contract point with the rest of the application.
//!
//! ```no_run
//! use std::time::Duration;
//! use faultgate::{BreakerRegistry, CircuitBreakerConfig, Retrier, RetryPolicy};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let registry = BreakerRegistry::new(CircuitBreakerConfig::default())?;
//! let breaker = registry.breaker("mail-gateway");
//! let retrier = Retrier::new(RetryPolicy::default());
//!
//! // Retry-wrapped operation passed into the breaker.
//! let result = breaker
//!     .execute(|| retrier.run(|| async { send_digest().await }))
//!     .await;
//! # Ok(())
//! # }
//! # async fn send_digest() -> std::io::Result<()> { Ok(()) }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod breaker;
pub mod clock;
pub mod events;
pub mod registry;
pub mod retry;
pub mod sampler;

pub use breaker::{
    with_breaker, BreakerError, BreakerOverrides, BreakerResult, CircuitBreaker,
    CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitState, ConfigError, ConfigResult,
    StateChange, StatsSnapshot,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use events::{BreakerEvent, EventBus, DEFAULT_EVENT_CAPACITY};
pub use registry::{BreakerRegistry, BreakerStats};
pub use retry::{
    execute_with_retry, with_retry, Classify, ClassifyWith, ErrorClass, Retrier, RetryPolicy,
    RetryPolicyBuilder, TransportClassifier,
};
pub use sampler::{OpenCircuitAlert, StatusSampler, DEFAULT_ALERT_CAPACITY};
