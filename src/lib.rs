//! Network-change reconciliation core for a distributed configuration
//! control plane.
//!
//! Operators submit declarative, multi-device configuration intents
//! (network changes); this crate drives each to completion, or to a
//! consistent rollback, across the affected devices:
//! - Leadership-gated controller framework: watchers and reconcile loops run
//!   only on the cluster leader and re-prime from store replay on failover
//! - Deduplicating, rate-limited work queue with per-id serialization
//! - Idempotent network-change state machine with admission control over
//!   overlapping in-flight changes and rollback on partial failure
//! - Typed store façades over the replicated stores, with in-memory
//!   implementations for tests and single-process deployments

mod controller;
mod error;
mod flow_control;
mod reconciler;
mod stores;
mod types;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use controller::{
    Activator, Controller, DeviceChangeWatcher, LeadershipActivator, NetworkChangeWatcher,
    QueueConfig, Reconciler, Watcher, WorkQueue, WorkQueueHandle,
};
pub use error::{ControllerError, ControllerResult, StoreError, StoreResult};
pub use flow_control::RetryManager;
pub use reconciler::{new_network_controller, NetworkChangeReconciler};
pub use stores::{
    DeviceChangeEvent, DeviceChangeStore, DeviceEvent, DeviceStore, EventType, LeadershipStore,
    MemDeviceChangeStore, MemDeviceStore, MemLeadershipStore, MemNetworkChangeStore,
    NetworkChangeEvent, NetworkChangeStore, StoreEvent,
};
pub use types::{
    Device, DeviceChange, DeviceChangeId, DeviceChangeRef, DeviceId, Index, NetworkChange,
    NetworkChangeId, PathValue, Phase, Reason, Revision, State, Status,
};
