//! Shared fixtures for crate-internal tests.

use std::{
    sync::Once,
    time::{Duration, Instant},
};

use serde_json::json;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{
    stores::{DeviceChangeStore, MemDeviceChangeStore, MemNetworkChangeStore, NetworkChangeStore},
    types::{DeviceChange, DeviceChangeRef, DeviceId, NetworkChange, PathValue, State},
};

static INIT: Once = Once::new();

/// Initialize test logging infrastructure
pub(crate) fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

/// Create and persist a network change touching the given devices.
pub(crate) async fn submit_change(
    store: &MemNetworkChangeStore,
    devices: &[&str],
) -> NetworkChange {
    let mut change = NetworkChange::new(
        devices
            .iter()
            .map(|d| {
                DeviceChangeRef::new(
                    DeviceId((*d).to_string()),
                    "1.0.0",
                    vec![PathValue::new("/interfaces/eth0/enabled", json!(true))],
                )
            })
            .collect(),
    );
    store.create(&mut change).await.unwrap();
    change
}

/// Re-read a network change from the store.
pub(crate) async fn refresh(store: &MemNetworkChangeStore, change: &NetworkChange) -> NetworkChange {
    store
        .get(&change.id)
        .await
        .unwrap()
        .expect("change exists")
}

/// Apply `decide` to every materialized child of `change`, writing back the
/// returned state. Stands in for the per-device controller.
pub(crate) async fn set_child_states<F>(
    device_changes: &MemDeviceChangeStore,
    change: &NetworkChange,
    decide: F,
) where
    F: Fn(&DeviceChange) -> Option<State>,
{
    for change_ref in &change.changes {
        let Some(id) = &change_ref.device_change_id else {
            continue;
        };
        let Some(mut child) = device_changes.get(id).await.unwrap() else {
            continue;
        };
        if let Some(state) = decide(&child) {
            child.status.state = state;
            device_changes.update(&mut child).await.unwrap();
        }
    }
}

/// Poll `condition` every few milliseconds until it holds or the deadline
/// passes. Returns whether it held.
pub(crate) async fn poll_until<F, Fut>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
