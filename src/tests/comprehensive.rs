//! End-to-end reconciliation scenarios.
//!
//! The direct-drive tests call the reconciler by hand so every transition is
//! deterministic; the controller tests run the full stack (leadership,
//! watchers, queue) against the in-memory stores with a simulated per-device
//! controller completing whatever starts running.

use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle};

use crate::{
    new_network_controller,
    stores::{
        DeviceChangeStore, MemDeviceChangeStore, MemDeviceStore, MemLeadershipStore,
        MemNetworkChangeStore, NetworkChangeStore,
    },
    test_utils::{init_test_logging, poll_until, refresh, set_child_states, submit_change},
    types::{Device, DeviceId, Index, NetworkChange, Phase, Reason, State},
    NetworkChangeReconciler, Reconciler,
};

struct Fixture {
    network_changes: Arc<MemNetworkChangeStore>,
    device_changes: Arc<MemDeviceChangeStore>,
    devices: Arc<MemDeviceStore>,
    leadership: Arc<MemLeadershipStore>,
}

impl Fixture {
    fn new() -> Self {
        init_test_logging();
        Self {
            network_changes: Arc::new(MemNetworkChangeStore::new()),
            device_changes: Arc::new(MemDeviceChangeStore::new()),
            devices: Arc::new(MemDeviceStore::new()),
            leadership: Arc::new(MemLeadershipStore::new(false)),
        }
    }

    fn reconciler(&self) -> NetworkChangeReconciler {
        NetworkChangeReconciler::new(
            Arc::clone(&self.network_changes) as _,
            Arc::clone(&self.device_changes) as _,
        )
    }

    fn register_device(&self, id: &str) {
        self.devices.add(Device {
            id: DeviceId(id.to_string()),
            version: "1.0.0".to_string(),
            address: format!("{}:9339", id),
        });
    }

    /// Simulated per-device controller: completes every device change that
    /// starts running, in either phase.
    fn spawn_device_sim(&self) -> JoinHandle<()> {
        let device_changes = Arc::clone(&self.device_changes);
        tokio::spawn(async move {
            let mut events = device_changes.watch().await.unwrap();
            while let Some(event) = events.recv().await {
                if event.entity.status.state != State::Running {
                    continue;
                }
                let Some(mut child) = device_changes.get(&event.entity.id).await.unwrap() else {
                    continue;
                };
                if child.status.state == State::Running {
                    child.status.state = State::Complete;
                    // A lost race means the reconciler just rewrote the
                    // child; its own event re-triggers this loop.
                    let _ = device_changes.update(&mut child).await;
                }
            }
        })
    }
}

/// Reconcile until neither progress nor writes happen: call repeatedly until
/// a call reports no progress or a bounded number of settled rounds pass.
async fn settle(reconciler: &NetworkChangeReconciler, change: &NetworkChange) {
    for _ in 0..8 {
        if !reconciler.reconcile(&change.id).await.unwrap() {
            return;
        }
    }
}

// ====================================================================================
// Direct-drive scenarios
// ====================================================================================

#[tokio::test]
async fn test_single_device_happy_path() {
    let fixture = Fixture::new();
    let reconciler = fixture.reconciler();
    let change = submit_change(&fixture.network_changes, &["d1"]).await;

    settle(&reconciler, &change).await;

    // One child exists and was promoted to running.
    let current = refresh(&fixture.network_changes, &change).await;
    assert_eq!(current.status.state, State::Running);
    assert_eq!(fixture.device_changes.last_index().await.unwrap(), Index(1));
    let child_id = current.changes[0].device_change_id.clone().unwrap();
    let child = fixture.device_changes.get(&child_id).await.unwrap().unwrap();
    assert_eq!(child.status.state, State::Running);

    // The device controller completes the push.
    set_child_states(&fixture.device_changes, &current, |_| Some(State::Complete)).await;
    settle(&reconciler, &change).await;

    let current = refresh(&fixture.network_changes, &change).await;
    assert_eq!(current.status.phase, Phase::Change);
    assert_eq!(current.status.state, State::Complete);
}

#[tokio::test]
async fn test_non_overlapping_changes_run_in_parallel() {
    let fixture = Fixture::new();
    let reconciler = fixture.reconciler();
    let first = submit_change(&fixture.network_changes, &["d1"]).await;
    let second = submit_change(&fixture.network_changes, &["d2"]).await;

    settle(&reconciler, &second).await;
    settle(&reconciler, &first).await;

    // Neither waited on the other.
    let first = refresh(&fixture.network_changes, &first).await;
    let second = refresh(&fixture.network_changes, &second).await;
    assert_eq!(first.status.state, State::Running);
    assert_eq!(second.status.state, State::Running);
}

#[tokio::test]
async fn test_overlapping_changes_serialize() {
    let fixture = Fixture::new();
    let reconciler = fixture.reconciler();
    let first = submit_change(&fixture.network_changes, &["d1", "d2"]).await;
    let second = submit_change(&fixture.network_changes, &["d2", "d3"]).await;

    settle(&reconciler, &first).await;
    settle(&reconciler, &second).await;

    let current = refresh(&fixture.network_changes, &second).await;
    assert_eq!(current.status.state, State::Pending);

    // First completes; second is then admitted.
    let first = refresh(&fixture.network_changes, &first).await;
    set_child_states(&fixture.device_changes, &first, |_| Some(State::Complete)).await;
    settle(&reconciler, &first).await;
    assert_eq!(
        refresh(&fixture.network_changes, &first).await.status.state,
        State::Complete
    );

    settle(&reconciler, &second).await;
    let current = refresh(&fixture.network_changes, &second).await;
    assert_eq!(current.status.state, State::Running);
}

#[tokio::test]
async fn test_partial_failure_rolls_back_and_requeues() {
    let fixture = Fixture::new();
    let reconciler = fixture.reconciler();
    let change = submit_change(&fixture.network_changes, &["d1", "d2"]).await;

    settle(&reconciler, &change).await;
    let running = refresh(&fixture.network_changes, &change).await;
    assert_eq!(running.status.state, State::Running);

    // d1 succeeds, d2 fails.
    set_child_states(&fixture.device_changes, &running, |child| {
        match child.device_id.0.as_str() {
            "d1" => Some(State::Complete),
            _ => Some(State::Failed),
        }
    })
    .await;

    // The succeeded child is rolled back.
    settle(&reconciler, &change).await;
    let d1_id = running.changes[0].device_change_id.clone().unwrap();
    let d1_child = fixture.device_changes.get(&d1_id).await.unwrap().unwrap();
    assert_eq!(d1_child.status.phase, Phase::Rollback);
    assert_eq!(d1_child.status.state, State::Running);

    // Its rollback completes; the parent returns to PENDING with an error.
    // One step only: the PENDING retry would be re-admitted immediately.
    set_child_states(&fixture.device_changes, &running, |child| {
        (child.status.phase == Phase::Rollback && child.status.state == State::Running)
            .then_some(State::Complete)
    })
    .await;
    assert!(reconciler.reconcile(&change.id).await.unwrap());

    let current = refresh(&fixture.network_changes, &change).await;
    assert_eq!(current.status.phase, Phase::Change);
    assert_eq!(current.status.state, State::Pending);
    assert_eq!(current.status.reason, Reason::Error);

    // The failed child keeps its verdict.
    let d2_id = running.changes[1].device_change_id.clone().unwrap();
    let d2_child = fixture.device_changes.get(&d2_id).await.unwrap().unwrap();
    assert_eq!(d2_child.status.phase, Phase::Change);
    assert_eq!(d2_child.status.state, State::Failed);
}

#[tokio::test]
async fn test_rollback_blocked_by_overlapping_future_change() {
    let fixture = Fixture::new();
    let reconciler = fixture.reconciler();

    // First change completes on d1.
    let first = submit_change(&fixture.network_changes, &["d1"]).await;
    settle(&reconciler, &first).await;
    let running = refresh(&fixture.network_changes, &first).await;
    set_child_states(&fixture.device_changes, &running, |_| Some(State::Complete)).await;
    settle(&reconciler, &first).await;

    // Second change on d1 starts running.
    let second = submit_change(&fixture.network_changes, &["d1"]).await;
    settle(&reconciler, &second).await;
    assert_eq!(
        refresh(&fixture.network_changes, &second).await.status.state,
        State::Running
    );

    // Operator requests a rollback of the first change.
    let mut rollback = refresh(&fixture.network_changes, &first).await;
    rollback.status.phase = Phase::Rollback;
    rollback.status.state = State::Pending;
    fixture.network_changes.update(&mut rollback).await.unwrap();

    settle(&reconciler, &first).await;
    let current = refresh(&fixture.network_changes, &first).await;
    assert_eq!(current.status.phase, Phase::Rollback);
    assert_eq!(current.status.state, State::Pending);

    // The masking change completes; the rollback is admitted and runs.
    let second = refresh(&fixture.network_changes, &second).await;
    set_child_states(&fixture.device_changes, &second, |child| {
        (child.status.state == State::Running).then_some(State::Complete)
    })
    .await;
    settle(&reconciler, &second).await;

    settle(&reconciler, &first).await;
    let current = refresh(&fixture.network_changes, &first).await;
    set_child_states(&fixture.device_changes, &current, |child| {
        (child.status.state == State::Running).then_some(State::Complete)
    })
    .await;
    settle(&reconciler, &first).await;

    let current = refresh(&fixture.network_changes, &first).await;
    assert_eq!(current.status.phase, Phase::Rollback);
    assert_eq!(current.status.state, State::Complete);
}

#[tokio::test]
async fn test_reconcile_is_stable_without_external_writes() {
    let fixture = Fixture::new();
    let reconciler = fixture.reconciler();
    let change = submit_change(&fixture.network_changes, &["d1", "d2"]).await;

    settle(&reconciler, &change).await;
    let before = refresh(&fixture.network_changes, &change).await;

    // Without external progress, further calls must not move anything.
    for _ in 0..3 {
        reconciler.reconcile(&change.id).await.unwrap();
    }
    let after = refresh(&fixture.network_changes, &change).await;
    assert_eq!(before, after);
    assert_eq!(fixture.device_changes.last_index().await.unwrap(), Index(2));
}

#[tokio::test]
async fn test_restarted_reconciler_converges() {
    let fixture = Fixture::new();

    // The first reconciler dies right after materializing children.
    let crashed = fixture.reconciler();
    let change = submit_change(&fixture.network_changes, &["d1", "d2"]).await;
    crashed.reconcile(&change.id).await.unwrap();
    drop(crashed);

    // A successor with empty process state picks the change up.
    let successor = fixture.reconciler();
    settle(&successor, &change).await;
    let current = refresh(&fixture.network_changes, &change).await;
    assert_eq!(current.status.state, State::Running);

    set_child_states(&fixture.device_changes, &current, |_| Some(State::Complete)).await;
    settle(&successor, &change).await;

    assert_eq!(
        refresh(&fixture.network_changes, &change).await.status.state,
        State::Complete
    );
    // No duplicate device changes were created along the way.
    assert_eq!(fixture.device_changes.last_index().await.unwrap(), Index(2));
}

// ====================================================================================
// Full-controller scenarios
// ====================================================================================

#[tokio::test]
async fn test_controller_end_to_end() {
    let fixture = Fixture::new();
    fixture.register_device("d1");
    fixture.register_device("d2");
    let _sim = fixture.spawn_device_sim();

    let controller = new_network_controller(
        Arc::clone(&fixture.leadership) as _,
        Arc::clone(&fixture.devices) as _,
        Arc::clone(&fixture.network_changes) as _,
        Arc::clone(&fixture.device_changes) as _,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let task = tokio::spawn(controller.start(shutdown_rx));

    fixture.leadership.acquire();
    let change = submit_change(&fixture.network_changes, &["d1", "d2"]).await;

    let network_changes = Arc::clone(&fixture.network_changes);
    let id = change.id.clone();
    let completed = poll_until(Duration::from_secs(5), || {
        let store = Arc::clone(&network_changes);
        let id = id.clone();
        async move {
            store
                .get(&id)
                .await
                .unwrap()
                .is_some_and(|c| c.status.state == State::Complete)
        }
    })
    .await;
    assert!(completed, "network change did not complete");

    shutdown_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_leadership_failover_resumes_without_duplicates() {
    let fixture = Fixture::new();
    fixture.register_device("d1");

    // Two processes share the entity stores but hold separate leaderships.
    let leadership_a = Arc::new(MemLeadershipStore::new(true));
    let leadership_b = Arc::new(MemLeadershipStore::new(false));

    let controller_a = new_network_controller(
        Arc::clone(&leadership_a) as _,
        Arc::clone(&fixture.devices) as _,
        Arc::clone(&fixture.network_changes) as _,
        Arc::clone(&fixture.device_changes) as _,
    );
    let controller_b = new_network_controller(
        Arc::clone(&leadership_b) as _,
        Arc::clone(&fixture.devices) as _,
        Arc::clone(&fixture.network_changes) as _,
        Arc::clone(&fixture.device_changes) as _,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let task_a = tokio::spawn(controller_a.start(shutdown_rx.clone()));
    let task_b = tokio::spawn(controller_b.start(shutdown_rx.clone()));

    // Leader A materializes the child but no device controller runs yet.
    let change = submit_change(&fixture.network_changes, &["d1"]).await;
    let network_changes = Arc::clone(&fixture.network_changes);
    let id = change.id.clone();
    let materialized = poll_until(Duration::from_secs(5), || {
        let store = Arc::clone(&network_changes);
        let id = id.clone();
        async move {
            store
                .get(&id)
                .await
                .unwrap()
                .is_some_and(|c| c.changes[0].device_change_id.is_some())
        }
    })
    .await;
    assert!(materialized, "child was not materialized");

    // Failover in mid-flight.
    leadership_a.resign();
    leadership_b.acquire();

    let _sim = fixture.spawn_device_sim();
    let completed = poll_until(Duration::from_secs(5), || {
        let store = Arc::clone(&network_changes);
        let id = id.clone();
        async move {
            store
                .get(&id)
                .await
                .unwrap()
                .is_some_and(|c| c.status.state == State::Complete)
        }
    })
    .await;
    assert!(completed, "network change did not complete after failover");

    // The successor reused the persisted child instead of creating another.
    assert_eq!(fixture.device_changes.last_index().await.unwrap(), Index(1));

    shutdown_tx.send(()).unwrap();
    task_a.await.unwrap().unwrap();
    task_b.await.unwrap().unwrap();
}
