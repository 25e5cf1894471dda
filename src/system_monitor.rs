//! Periodic sweep correlating memory pressure, breaker state, and health (C9).
//!
//! Runs as one long-lived background task, the same shape the config
//! watcher uses for its poll loop: a `tokio::time::interval` driving a
//! correlation pass, started and stopped explicitly rather than tied to any
//! particular caller's lifetime.
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::health::{HealthState, HealthTracker};
use crate::memory_tracker::MemoryTracker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct SystemMonitor {
    memory_tracker: Arc<MemoryTracker>,
    registry: Arc<CircuitBreakerRegistry>,
    health: Arc<HealthTracker>,
    sweep_interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl SystemMonitor {
    pub fn new(memory_tracker: Arc<MemoryTracker>, registry: Arc<CircuitBreakerRegistry>, health: Arc<HealthTracker>) -> Self {
        Self {
            memory_tracker,
            registry,
            health,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            task: None,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let registry = self.registry.clone();
        let health = self.health.clone();
        let interval = self.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                Self::sweep_once(&registry, &health).await;
            }
        });
        self.task = Some(handle);
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.task.take() {
            handle.abort();
        }
    }

    /// One correlation pass, exposed standalone so callers (and tests) can
    /// trigger it without waiting on the interval.
    pub async fn sweep_once(registry: &CircuitBreakerRegistry, health: &HealthTracker) {
        for name in registry.names() {
            let Ok(breaker) = registry.get(&name) else { continue };
            let state = breaker.state().await;
            let (status, description) = match state {
                CircuitState::Closed => (HealthState::Healthy, "circuit closed".to_string()),
                CircuitState::HalfOpen => (HealthState::Degraded, "circuit half-open, probing recovery".to_string()),
                CircuitState::Open => (HealthState::Unhealthy, "circuit open".to_string()),
            };
            health.report(&format!("circuit_breaker:{}", name), status, &description, None).await;
        }
        debug!("system monitor sweep complete");
    }

    pub fn memory_tracker(&self) -> &Arc<MemoryTracker> {
        &self.memory_tracker
    }
}

impl Drop for SystemMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::event_bus::EventBus;
    use crate::state_store::StateStore;

    #[tokio::test]
    async fn sweep_reports_open_breaker_as_unhealthy() {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let state_store = Arc::new(StateStore::new(bus.clone()));
        let registry = Arc::new(CircuitBreakerRegistry::new(bus.clone(), state_store));
        let health = Arc::new(HealthTracker::new(bus.clone()));
        let memory = Arc::new(MemoryTracker::new(bus));

        let breaker = registry.get_or_create("svc", CircuitBreakerConfig::default());
        breaker.trip("test").await;

        SystemMonitor::sweep_once(&registry, &health).await;
        let _ = memory;
        assert_eq!(health.get("circuit_breaker:svc").unwrap().status, HealthState::Unhealthy);
    }
}
