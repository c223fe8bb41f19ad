//! Breaker signal surface.
//!
//! Every breaker outcome and state transition is published as a
//! [`BreakerEvent`] on a bounded broadcast channel. External monitoring
//! subscribes through [`EventBus::subscribe`]; the breaker never holds
//! per-listener callbacks, so a slow or abandoned subscriber lags and drops
//! events instead of accumulating unboundedly.

use std::time::Instant;

use tokio::sync::broadcast;

use crate::breaker::CircuitState;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Signals emitted by circuit breakers.
///
/// These are the sole contract points between the execution layer and the
/// rest of the application.
#[derive(Debug, Clone)]
pub enum BreakerEvent {
    /// A protected call completed successfully.
    Success { circuit: String, state: CircuitState },
    /// A protected call failed (including deadline expiry).
    Failure { circuit: String, state: CircuitState, error: String },
    /// The circuit transitioned to open; no calls run until `retry_at`.
    Open { circuit: String, retry_at: Instant },
    /// The circuit transitioned to half-open and will probe the dependency.
    HalfOpen { circuit: String },
    /// The circuit transitioned back to closed.
    Close { circuit: String },
    /// A call was rejected without invoking the operation.
    Reject { circuit: String, state: CircuitState },
}

impl BreakerEvent {
    /// Name of the circuit that emitted this event.
    pub fn circuit(&self) -> &str {
        match self {
            BreakerEvent::Success { circuit, .. }
            | BreakerEvent::Failure { circuit, .. }
            | BreakerEvent::Open { circuit, .. }
            | BreakerEvent::HalfOpen { circuit }
            | BreakerEvent::Close { circuit }
            | BreakerEvent::Reject { circuit, .. } => circuit,
        }
    }
}

/// Bounded publish/subscribe channel for breaker events.
///
/// Cloning shares the underlying channel, so one bus can be handed to every
/// breaker a registry creates. Publishing never blocks and never fails: with
/// no subscribers the event is simply dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BreakerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub(crate) fn publish(&self, event: BreakerEvent) {
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(BreakerEvent::HalfOpen { circuit: "db".into() });

        tokio_test::block_on(async {
            match rx.recv().await.expect("event should arrive") {
                BreakerEvent::HalfOpen { circuit } => assert_eq!(circuit, "db"),
                other => panic!("unexpected event: {other:?}"),
            }
        });
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        assert_eq!(bus.receiver_count(), 0);
        bus.publish(BreakerEvent::Close { circuit: "mail".into() });
    }

    #[test]
    fn circuit_accessor_covers_all_variants() {
        let events = [
            BreakerEvent::Success { circuit: "a".into(), state: CircuitState::Closed },
            BreakerEvent::Failure {
                circuit: "a".into(),
                state: CircuitState::Closed,
                error: "boom".into(),
            },
            BreakerEvent::Open { circuit: "a".into(), retry_at: Instant::now() },
            BreakerEvent::HalfOpen { circuit: "a".into() },
            BreakerEvent::Close { circuit: "a".into() },
            BreakerEvent::Reject { circuit: "a".into(), state: CircuitState::Open },
        ];
        for event in events {
            assert_eq!(event.circuit(), "a");
        }
    }
}
