//! S6: many tasks concurrently creating/tripping the same named breaker
//! converge on a single breaker instance, ending up open, with no panics.
use std::sync::Arc;

use substrate_core::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, EventBus, StateStore};

#[tokio::test]
async fn concurrent_get_or_create_and_trip_converge_on_one_breaker() {
    let bus = Arc::new(EventBus::new());
    bus.start();
    let state_store = Arc::new(StateStore::new(bus.clone()));
    let registry = Arc::new(CircuitBreakerRegistry::new(bus, state_store));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let breaker = registry.get_or_create("shared", CircuitBreakerConfig::default());
            registry.trip("shared", "concurrent test trip").await.unwrap();
            breaker
        }));
    }

    let mut breakers = Vec::new();
    for handle in handles {
        breakers.push(handle.await.unwrap());
    }

    // every task observed the same underlying breaker
    for breaker in &breakers {
        assert!(Arc::ptr_eq(breaker, &breakers[0]));
    }

    assert_eq!(registry.names(), vec!["shared".to_string()]);
    assert_eq!(breakers[0].state().await, CircuitState::Open);
}
