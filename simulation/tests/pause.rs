//! Pause and resume during bring-up

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{coordinator, dev, wait_for_device};
use netsim_core::{EventKind, LifecycleState, LinkId};
use netsim_simulation::{FaultOutcome, FaultTarget, scenarios};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_events_stamped_while_paused() {
    let coordinator = Arc::new(coordinator(scenarios::enterprise().unwrap()));
    let day1 = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.start_day1().await })
    };
    coordinator.wait_ticks(3).await.unwrap();

    assert!(coordinator.pause().unwrap());
    assert!(!coordinator.pause().unwrap());
    let paused_at = coordinator.now().unwrap();
    let log = coordinator.event_log().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(coordinator.now().unwrap(), paused_at);
    let stamped_after = log.count(|e| e.timestamp > paused_at);
    assert_eq!(stamped_after, 0);
    assert!(coordinator.status().unwrap().paused);

    assert!(coordinator.resume().unwrap());
    assert!(!coordinator.resume().unwrap());
    coordinator.wait_ticks(2).await.unwrap();
    assert!(coordinator.now().unwrap() > paused_at);

    let report = day1.await.unwrap().unwrap();
    for device in &report.devices {
        assert!(matches!(
            device.state,
            LifecycleState::Operational | LifecycleState::Converging
        ));
    }

    let events = log.snapshot();
    let paused = events.iter().position(|e| e.kind == EventKind::Paused).unwrap();
    let resumed = events.iter().position(|e| e.kind == EventKind::Resumed).unwrap();
    assert!(paused < resumed);
    assert_eq!(events[paused].timestamp, paused_at);
    assert_eq!(events[resumed].timestamp, paused_at);

    coordinator.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fault_injected_while_paused_lands_after_resume() {
    let coordinator = coordinator(scenarios::enterprise().unwrap());
    coordinator.start_day1().await.unwrap();
    let link = LinkId::new("R1-R2").unwrap();

    assert!(coordinator.pause().unwrap());
    let paused_at = coordinator.now().unwrap();
    let before: Vec<_> = ["R1", "R2"]
        .iter()
        .map(|id| coordinator.snapshot(&dev(id)).unwrap())
        .collect();

    let outcome = coordinator.inject_fault(FaultTarget::Link(link.clone())).await.unwrap();
    assert!(matches!(outcome, FaultOutcome::Injected { .. }));

    // Link status changes at once, the devices only see it past the gate
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(coordinator.now().unwrap(), paused_at);
    for snapshot in &before {
        let now = coordinator.snapshot(&snapshot.id).unwrap();
        assert_eq!(now.state, snapshot.state);
        assert_ne!(now.state, LifecycleState::Faulted);
        assert!(now.faulted_links.is_empty());
    }

    assert!(coordinator.resume().unwrap());
    for router in ["R1", "R2"] {
        let snapshot = wait_for_device(&coordinator, router, 20, |s| s.faulted_links.contains(&link)).await;
        assert_eq!(snapshot.state, LifecycleState::Faulted);
    }
    let log = coordinator.event_log().unwrap();
    let faulted = log.filter(|e| matches!(e.kind, EventKind::StateChanged { to: LifecycleState::Faulted, .. }));
    assert!(faulted.iter().all(|e| e.timestamp >= paused_at));

    coordinator.stop().await.unwrap();
}
