//! Day-1 bring-up of the enterprise network

mod common;

use std::net::Ipv4Addr;

use common::{coordinator, dev, wait_for_device};
use netsim_core::{LifecycleState, Protocol, RouteSource};
use netsim_simulation::scenarios;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_enterprise_bring_up() {
    let coordinator = coordinator(scenarios::enterprise().unwrap());
    let report = coordinator.start_day1().await.unwrap();

    assert_eq!(report.devices.len(), 5);
    for device in &report.devices {
        assert!(
            matches!(device.state, LifecycleState::Operational | LifecycleState::Converging),
            "{} ended in {}",
            device.device,
            device.state
        );
    }
    assert!(report.errors.is_empty());

    for router in ["R1", "R2"] {
        let snapshot = coordinator.snapshot(&dev(router)).unwrap();
        assert_eq!(snapshot.state, LifecycleState::Operational);
        let up: Vec<_> = snapshot.up_adjacencies().collect();
        assert_eq!(up.len(), 1, "{} adjacencies: {:?}", router, snapshot.adjacencies);
        assert_eq!(up[0].protocol, Protocol::Ospf);
    }

    // Each router learns the other's LAN over OSPF
    let r1 = wait_for_device(&coordinator, "R1", 50, |s| {
        s.routing_table.lookup(Ipv4Addr::new(192, 168, 20, 10)).is_some()
    })
    .await;
    let route = r1.routing_table.lookup(Ipv4Addr::new(192, 168, 20, 10)).unwrap();
    assert_eq!(route.source, RouteSource::Ospf);
    assert!(route.next_hops.iter().any(|h| h.device == dev("R2")));

    let status = coordinator.status().unwrap();
    assert!(status.day1_complete);
    assert_eq!(status.faulted, 0);

    // A second call returns the same report
    let again = coordinator.start_day1().await.unwrap();
    assert_eq!(again, report);

    let shutdown = coordinator.stop().await.unwrap();
    assert!(shutdown.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operations_after_stop_are_rejected() {
    let coordinator = coordinator(scenarios::enterprise().unwrap());
    coordinator.stop().await.unwrap();

    assert!(coordinator.start_day1().await.is_err());
    assert!(coordinator.pause().is_err());
    assert!(coordinator.stop().await.is_err());
    // The event log outlives the run
    let events = coordinator.events().unwrap();
    assert!(!events.is_empty());
}
