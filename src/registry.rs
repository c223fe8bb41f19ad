//! Breaker registry: one memoized circuit breaker per dependency name.
//!
//! The registry is an explicit object constructed once at startup and passed
//! by reference to call sites; there is no process-wide singleton. All
//! breakers it creates share one bounded event bus, so monitoring subscribes
//! in a single place.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::breaker::{
    BreakerOverrides, CircuitBreaker, CircuitBreakerConfig, ConfigResult, StatsSnapshot,
};
use crate::clock::{Clock, SystemClock};
use crate::events::{BreakerEvent, EventBus};

/// Stats for one registered breaker, as returned by
/// [`BreakerRegistry::all_stats`].
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub name: String,
    pub stats: StatsSnapshot,
}

/// Factory and owner of per-dependency circuit breakers.
///
/// Lookups are concurrent; the create-on-miss path is atomic, so two tasks
/// racing to obtain the same name always end up sharing one breaker.
pub struct BreakerRegistry<C: Clock = SystemClock> {
    breakers: DashMap<String, Arc<CircuitBreaker<C>>>,
    defaults: CircuitBreakerConfig,
    events: EventBus,
    clock: Arc<C>,
}

impl BreakerRegistry<SystemClock> {
    /// Registry handing out system-clock breakers built from `defaults`.
    pub fn new(defaults: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(defaults, SystemClock)
    }
}

impl<C: Clock> BreakerRegistry<C> {
    /// Registry with a custom clock shared by every breaker it creates.
    pub fn with_clock(defaults: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        defaults.validate()?;
        Ok(Self {
            breakers: DashMap::new(),
            defaults,
            events: EventBus::default(),
            clock: Arc::new(clock),
        })
    }

    /// Get or lazily create the breaker for `name` with default settings.
    ///
    /// Idempotent by name: repeated calls return the same instance.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker<C>> {
        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(circuit = name, "creating circuit breaker");
            Arc::new(CircuitBreaker::assemble(
                name.to_string(),
                self.defaults.clone(),
                Arc::clone(&self.clock),
                self.events.clone(),
            ))
        });
        Arc::clone(&entry)
    }

    /// Get or lazily create the breaker for `name`, merging `overrides` over
    /// the registry defaults.
    ///
    /// Overrides only take effect on first creation; an existing breaker for
    /// `name` is returned as-is.
    pub fn breaker_with(
        &self,
        name: &str,
        overrides: BreakerOverrides,
    ) -> ConfigResult<Arc<CircuitBreaker<C>>> {
        if let Some(existing) = self.breakers.get(name) {
            return Ok(Arc::clone(&existing));
        }
        let config = overrides.apply(&self.defaults);
        config.validate()?;
        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(circuit = name, "creating circuit breaker with overrides");
            Arc::new(CircuitBreaker::assemble(
                name.to_string(),
                config,
                Arc::clone(&self.clock),
                self.events.clone(),
            ))
        });
        Ok(Arc::clone(&entry))
    }

    /// Snapshot statistics across all registered breakers, sorted by name.
    ///
    /// Read-only and safe to call at any time.
    pub fn all_stats(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<BreakerStats> = self
            .breakers
            .iter()
            .map(|entry| BreakerStats { name: entry.key().clone(), stats: entry.value().stats() })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Return every registered breaker to closed with zeroed stats.
    ///
    /// For test isolation or manual operator recovery; never called
    /// automatically.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    /// Subscribe to the shared event bus all registry breakers publish on.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
