//! Shared helpers for the integration tests

#![allow(dead_code)]

use netsim_simulation::{Coordinator, DeviceId, DeviceSnapshot, EngineConfig, TopologyGraph};

pub fn config() -> EngineConfig {
    EngineConfig::default().with_tick_interval_ms(2)
}

pub fn dev(id: &str) -> DeviceId {
    DeviceId::new(id).unwrap()
}

/// Initialized coordinator for `graph`, before Day-1
pub fn coordinator(graph: TopologyGraph) -> Coordinator {
    netsim_logging::init_testing();
    let coordinator = Coordinator::new(config()).unwrap().with_name("integration");
    coordinator.initialize(graph).unwrap();
    coordinator
}

/// Poll `device` once per tick until `predicate` holds or `max_ticks` pass
pub async fn wait_for_device<F>(coordinator: &Coordinator, device: &str, max_ticks: u64, predicate: F) -> DeviceSnapshot
where
    F: Fn(&DeviceSnapshot) -> bool,
{
    let id = dev(device);
    for _ in 0..max_ticks {
        let snapshot = coordinator.snapshot(&id).unwrap();
        if predicate(&snapshot) {
            return snapshot;
        }
        coordinator.wait_ticks(1).await.unwrap();
    }
    coordinator.snapshot(&id).unwrap()
}
