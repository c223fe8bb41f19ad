//! Periodic status sampler for open-circuit alerting.
//!
//! The sampler runs on its own schedule, never sharing a call stack with
//! `execute`. Each tick it reads registry-wide stats and raises an alert for
//! every breaker currently open. It is strictly observational: it never
//! mutates breaker state or statistics.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::breaker::{CircuitState, StatsSnapshot};
use crate::clock::Clock;
use crate::registry::BreakerRegistry;

/// Capacity of the alert channel; slow consumers lag rather than grow it.
pub const DEFAULT_ALERT_CAPACITY: usize = 64;

/// Alert raised while a circuit is open.
#[derive(Debug, Clone)]
pub struct OpenCircuitAlert {
    pub circuit: String,
    pub stats: StatsSnapshot,
}

/// Handle to the background sampling task.
///
/// Dropping the handle leaves the task running for the life of the runtime;
/// call [`StatusSampler::shutdown`] to stop it.
pub struct StatusSampler {
    alerts: broadcast::Sender<OpenCircuitAlert>,
    handle: JoinHandle<()>,
}

impl StatusSampler {
    /// Spawn a sampler reading `registry` every `period`.
    ///
    /// The first sample happens immediately, so a freshly started process
    /// reports pre-existing trouble without waiting a full period.
    pub fn spawn<C: Clock>(registry: Arc<BreakerRegistry<C>>, period: Duration) -> Self {
        let (alerts, _) = broadcast::channel(DEFAULT_ALERT_CAPACITY);
        let tx = alerts.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sample(&registry, &tx);
            }
        });

        Self { alerts, handle }
    }

    /// Subscribe to open-circuit alerts.
    pub fn subscribe(&self) -> broadcast::Receiver<OpenCircuitAlert> {
        self.alerts.subscribe()
    }

    /// Stop the sampling task.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

fn sample<C: Clock>(
    registry: &BreakerRegistry<C>,
    alerts: &broadcast::Sender<OpenCircuitAlert>,
) {
    for entry in registry.all_stats() {
        if entry.stats.state != CircuitState::Open {
            continue;
        }
        warn!(
            circuit = %entry.name,
            failures = entry.stats.failures,
            consecutive_failures = entry.stats.consecutive_failures,
            "circuit is open"
        );
        let _ = alerts.send(OpenCircuitAlert { circuit: entry.name, stats: entry.stats });
    }
}
