//! Integration tests for the retry engine and its composition with the
//! circuit breaker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use faultgate::{
    with_breaker, with_retry, CircuitBreaker, CircuitBreakerConfig, CircuitState, Retrier,
    RetryPolicy,
};

/// Route retry logs through the test harness; safe to call repeatedly.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
struct GatewayError(&'static str);

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for GatewayError {}

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(10))
        .jitter(false)
        .build()
        .expect("valid policy")
}

/// Validates that a persistently failing retryable operation is invoked
/// exactly `max_retries` times and the final error re-raised untouched.
#[tokio::test(flavor = "multi_thread")]
async fn transient_failure_exhausts_and_reraises() {
    init_tracing();
    let retrier = Retrier::new(fast_policy(3));
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);

    let result: Result<(), _> = retrier
        .run(|| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError("connection reset"))
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.expect_err("must fail").to_string(), "connection reset");
}

/// Validates that a fatal error short-circuits the retry loop: one
/// invocation, immediate re-raise, no backoff.
#[tokio::test(flavor = "multi_thread")]
async fn fatal_error_is_never_retried() {
    init_tracing();
    let retrier = Retrier::new(RetryPolicy::default());
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);

    let started = Instant::now();
    let result: Result<(), _> = retrier
        .run(|| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError("HTTP 403 Forbidden"))
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_millis(500), "no delay should be inserted");
}

/// Validates the documented backoff numerics: with a 1s initial delay and
/// multiplier 2, the un-jittered delays before attempts 2 and 3 are 1s and
/// 2s. Measured here at millisecond scale to keep the test fast.
#[tokio::test(flavor = "multi_thread")]
async fn backoff_delays_grow_exponentially() {
    init_tracing();
    let policy = RetryPolicy::builder()
        .max_retries(3)
        .initial_delay(Duration::from_millis(50))
        .max_delay(Duration::from_millis(1000))
        .jitter(false)
        .build()
        .expect("valid policy");
    let retrier = Retrier::new(policy);

    let started = Instant::now();
    let result: Result<(), _> =
        retrier.run(|| async { Err(GatewayError("request timed out")) }).await;
    let elapsed = started.elapsed();

    assert!(result.is_err());
    // Two backoffs: 50ms + 100ms.
    assert!(elapsed >= Duration::from_millis(150), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(600), "elapsed {elapsed:?}");
}

/// Validates the typical composition: a retry-wrapped operation passed into
/// a breaker. The breaker sees one outcome per retry sequence, not one per
/// attempt.
#[tokio::test(flavor = "multi_thread")]
async fn retry_inside_breaker_records_one_outcome() {
    init_tracing();
    let breaker = Arc::new(
        CircuitBreaker::new(
            "mail-gateway",
            CircuitBreakerConfig::builder().failure_threshold(2).build().unwrap(),
        )
        .unwrap(),
    );
    let retrier = Arc::new(Retrier::new(fast_policy(3)));
    let calls = Arc::new(AtomicU32::new(0));

    let calls_for_op = Arc::clone(&calls);
    let retried = with_retry(retrier, move || {
        let calls = Arc::clone(&calls_for_op);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(GatewayError("connection refused"))
        }
    });

    let result = breaker.execute(retried).await;
    assert!(result.is_err());

    // Three attempts inside, one failure recorded outside.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let stats = breaker.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.failures, 1);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

/// Validates the inverse composition: a breaker-wrapped operation passed
/// into the retry engine. The gateway's 502 classifies as transient, but
/// once the circuit opens the rejection error classifies as fatal, so the
/// retry loop ends early instead of hammering an open circuit.
#[tokio::test(flavor = "multi_thread")]
async fn breaker_inside_retry_fails_fast_once_open() {
    init_tracing();
    let breaker = Arc::new(
        CircuitBreaker::new(
            "completion-api",
            CircuitBreakerConfig::builder().failure_threshold(1).build().unwrap(),
        )
        .unwrap(),
    );
    let calls = Arc::new(AtomicU32::new(0));

    let calls_for_op = Arc::clone(&calls);
    let guarded = with_breaker(Arc::clone(&breaker), move || {
        let calls = Arc::clone(&calls_for_op);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(GatewayError("HTTP 502 Bad Gateway"))
        }
    });

    let retrier = Retrier::new(fast_policy(5));
    let result = retrier.run(guarded).await;
    assert!(result.is_err());

    // The first attempt reached the gateway and opened the circuit; the
    // second was rejected at the breaker, classified fatal, and ended the
    // loop with three attempts still unspent.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.state(), CircuitState::Open);
}
