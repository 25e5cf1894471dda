//! S3: tripping a breaker cascades to every breaker transitively registered
//! as its dependent, and a reset of the tripped breaker does not by itself
//! close the breakers it cascaded into.
use std::sync::Arc;
use std::time::Duration;

use substrate_core::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, EventBus, StateStore};

#[tokio::test]
async fn tripping_a_parent_cascades_to_registered_children() {
    let bus = Arc::new(EventBus::new());
    bus.start();
    let state_store = Arc::new(StateStore::new(bus.clone()));
    let registry = CircuitBreakerRegistry::new(bus, state_store);

    let a = registry.get_or_create("a", CircuitBreakerConfig::default());
    let b = registry.get_or_create("b", CircuitBreakerConfig::default());
    let c = registry.get_or_create("c", CircuitBreakerConfig::default());

    registry.register_dependency("b", "a").await.unwrap();
    registry.register_dependency("c", "b").await.unwrap();

    registry.trip("a", "manual test trip").await.unwrap();

    // give the cascade a moment to propagate
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(a.state().await, CircuitState::Open);
    assert_eq!(b.state().await, CircuitState::Open);
    assert_eq!(c.state().await, CircuitState::Open);

    registry.reset("a").await.unwrap();
    assert_eq!(a.state().await, CircuitState::Closed);
    // cascaded trips are independent after the fact
    assert_eq!(b.state().await, CircuitState::Open);
    assert_eq!(c.state().await, CircuitState::Open);
}

#[tokio::test]
async fn cyclic_dependency_registration_is_rejected() {
    let bus = Arc::new(EventBus::new());
    bus.start();
    let state_store = Arc::new(StateStore::new(bus.clone()));
    let registry = CircuitBreakerRegistry::new(bus, state_store);

    registry.get_or_create("x", CircuitBreakerConfig::default());
    registry.get_or_create("y", CircuitBreakerConfig::default());

    registry.register_dependency("y", "x").await.unwrap();
    assert!(registry.register_dependency("x", "y").await.is_err());
}
