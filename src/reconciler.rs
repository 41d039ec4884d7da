//! Network-change reconciliation.
//!
//! [`NetworkChangeReconciler`] drives each network change through its
//! two-phase life cycle: it materializes the per-device changes, admits the
//! change against concurrently in-flight changes on overlapping devices,
//! aggregates child outcomes, and on partial failure rolls the succeeded
//! children back before requeueing the change. Every step re-reads store
//! state, so the reconciler is idempotent and tolerant of stale or reordered
//! watch events.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    controller::{
        Controller, DeviceChangeWatcher, LeadershipActivator, NetworkChangeWatcher, Reconciler,
    },
    error::{ControllerResult, StoreError},
    stores::{DeviceChangeStore, DeviceStore, LeadershipStore, NetworkChangeStore},
    types::{
        DeviceChange, Index, NetworkChange, NetworkChangeId, Phase, Reason, State,
    },
};

/// Build the network-change controller: leadership activation, the two
/// watchers, and the reconciler, composed on the controller framework.
pub fn new_network_controller(
    leadership: Arc<dyn LeadershipStore>,
    devices: Arc<dyn DeviceStore>,
    network_changes: Arc<dyn NetworkChangeStore>,
    device_changes: Arc<dyn DeviceChangeStore>,
) -> Controller {
    let mut controller = Controller::new("network-change");
    controller.activate(LeadershipActivator::new(leadership));
    controller.watch(NetworkChangeWatcher::new(Arc::clone(&network_changes)));
    controller.watch(DeviceChangeWatcher::new(devices, Arc::clone(&device_changes)));
    controller.reconcile(NetworkChangeReconciler::new(network_changes, device_changes));
    controller
}

/// The network-change state machine.
pub struct NetworkChangeReconciler {
    network_changes: Arc<dyn NetworkChangeStore>,
    device_changes: Arc<dyn DeviceChangeStore>,
    /// Lower bound below which every network change is terminal. Purely an
    /// admission-scan accelerator: it resets to 0 on restart and catches up
    /// by re-scanning. Advanced with `fetch_max` so concurrent workers on
    /// distinct ids can only tighten it.
    change_index: AtomicU64,
}

impl NetworkChangeReconciler {
    pub fn new(
        network_changes: Arc<dyn NetworkChangeStore>,
        device_changes: Arc<dyn DeviceChangeStore>,
    ) -> Self {
        Self {
            network_changes,
            device_changes,
            change_index: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn change_index(&self) -> u64 {
        self.change_index.load(Ordering::SeqCst)
    }

    /// Create the device changes referenced by `change` that do not exist
    /// yet, recording their ids and indexes on the parent. The parent is
    /// persisted before any state advance so the identifiers survive a crash
    /// and a successor never creates duplicates.
    async fn ensure_device_changes(&self, change: &mut NetworkChange) -> ControllerResult<bool> {
        let mut updated = false;
        for i in 0..change.changes.len() {
            if change.changes[i].device_change_id.is_some() {
                continue;
            }
            let mut device_change = DeviceChange::new(
                change.id.clone(),
                change.changes[i].device_id.clone(),
                change.changes[i].device_version.clone(),
                change.changes[i].values.clone(),
            );
            self.device_changes.create(&mut device_change).await?;
            debug!(
                "created device change {} for {} on {}",
                device_change.id, change.id, device_change.device_id
            );
            change.changes[i].device_change_id = Some(device_change.id);
            change.changes[i].device_change_index = device_change.index;
            updated = true;
        }

        if updated {
            self.network_changes.update(change).await?;
        }
        Ok(updated)
    }

    /// Load the device changes referenced by `change`. A missing child is a
    /// transient error (its create may not be visible yet) and requeues.
    async fn device_changes_for(
        &self,
        change: &NetworkChange,
    ) -> ControllerResult<Vec<DeviceChange>> {
        let mut children = Vec::with_capacity(change.changes.len());
        for change_ref in &change.changes {
            let id = change_ref
                .device_change_id
                .as_ref()
                .ok_or_else(|| StoreError::NotFound(change_ref.device_id.to_string()))?;
            let child = self
                .device_changes
                .get(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            children.push(child);
        }
        Ok(children)
    }

    // ------------------------------------------------------------------
    // CHANGE phase
    // ------------------------------------------------------------------

    async fn reconcile_change(&self, change: NetworkChange) -> ControllerResult<bool> {
        match change.status.state {
            State::Pending => self.reconcile_pending_change(change).await,
            State::Running => self.reconcile_running_change(change).await,
            // Terminal or foreign states are owned by someone else.
            _ => Ok(true),
        }
    }

    async fn reconcile_pending_change(&self, mut change: NetworkChange) -> ControllerResult<bool> {
        if !self.can_apply_change(&change).await? {
            return Ok(false);
        }

        change.status.state = State::Running;
        self.network_changes.update(&mut change).await?;
        info!("network change {} is running", change.id);
        Ok(true)
    }

    /// A change may begin once every earlier change on an overlapping device
    /// set has terminated. Earlier in-flight changes on disjoint devices run
    /// in parallel.
    async fn can_apply_change(&self, change: &NetworkChange) -> ControllerResult<bool> {
        let mut floor = self.change_index.load(Ordering::SeqCst);
        let mut sequential = true;
        let mut admitted = true;

        for index in floor..change.index.0 {
            let Some(prior) = self.network_changes.get_by_index(Index(index)).await? else {
                continue;
            };
            match prior.status.state {
                State::Pending | State::Running => {
                    if change.intersects(&prior) {
                        debug!(
                            "network change {} blocked by in-flight change {} (index {})",
                            change.id, prior.id, prior.index
                        );
                        admitted = false;
                        break;
                    }
                    sequential = false;
                }
                State::Complete | State::Failed => {
                    // Advance the floor only over an uninterrupted prefix of
                    // terminal priors.
                    if sequential {
                        floor += 1;
                    }
                }
            }
        }

        self.change_index.fetch_max(floor, Ordering::SeqCst);
        Ok(admitted)
    }

    async fn reconcile_running_change(&self, mut change: NetworkChange) -> ControllerResult<bool> {
        let children = self.device_changes_for(&change).await?;

        // Signal the device controllers before inspecting outcomes.
        if self.ensure_device_changes_running(&children).await? {
            return Ok(true);
        }

        if children.iter().all(|c| c.status.state == State::Complete) {
            change.status.state = State::Complete;
            self.network_changes.update(&mut change).await?;
            info!("network change {} is complete", change.id);
            return Ok(true);
        }

        if children.iter().any(|c| c.status.state == State::Failed) {
            // Roll back everything that did not fail, then requeue the
            // change for another attempt.
            if self.ensure_child_rollbacks_running(&children).await? {
                return Ok(true);
            }

            if child_rollbacks_complete(&children) {
                change.status.state = State::Pending;
                change.status.reason = Reason::Error;
                change.status.message =
                    "change failed on one or more devices; rolled back".to_string();
                self.network_changes.update(&mut change).await?;
                info!(
                    "network change {} failed and was rolled back; awaiting retry",
                    change.id
                );
            }
        }
        Ok(true)
    }

    /// Promote children still PENDING to RUNNING.
    async fn ensure_device_changes_running(
        &self,
        children: &[DeviceChange],
    ) -> ControllerResult<bool> {
        let mut updated = false;
        for child in children {
            if child.status.state == State::Pending {
                let mut child = child.clone();
                child.status.state = State::Running;
                self.device_changes.update(&mut child).await?;
                updated = true;
            }
        }
        Ok(updated)
    }

    /// Move every non-failed child still in the CHANGE phase into a running
    /// rollback.
    async fn ensure_child_rollbacks_running(
        &self,
        children: &[DeviceChange],
    ) -> ControllerResult<bool> {
        let mut updated = false;
        for child in children {
            if child.status.phase == Phase::Change && child.status.state != State::Failed {
                let mut child = child.clone();
                child.status.phase = Phase::Rollback;
                child.status.state = State::Running;
                self.device_changes.update(&mut child).await?;
                updated = true;
            }
        }
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // ROLLBACK phase
    // ------------------------------------------------------------------

    async fn reconcile_rollback(&self, change: NetworkChange) -> ControllerResult<bool> {
        if self.ensure_child_rollbacks_pending(&change).await? {
            return Ok(true);
        }

        match change.status.state {
            State::Pending => self.reconcile_pending_rollback(change).await,
            State::Running => self.reconcile_running_rollback(change).await,
            _ => Ok(true),
        }
    }

    /// Rewrite any child not yet in the ROLLBACK phase to a pending rollback.
    async fn ensure_child_rollbacks_pending(
        &self,
        change: &NetworkChange,
    ) -> ControllerResult<bool> {
        let children = self.device_changes_for(change).await?;
        let mut updated = false;
        for child in &children {
            if child.status.phase != Phase::Rollback {
                let mut child = child.clone();
                child.status.phase = Phase::Rollback;
                child.status.state = State::Pending;
                self.device_changes.update(&mut child).await?;
                updated = true;
            }
        }
        Ok(updated)
    }

    async fn reconcile_pending_rollback(
        &self,
        mut change: NetworkChange,
    ) -> ControllerResult<bool> {
        if !self.can_apply_rollback(&change).await? {
            return Ok(false);
        }

        change.status.state = State::Running;
        self.network_changes.update(&mut change).await?;
        info!("rollback of network change {} is running", change.id);
        Ok(true)
    }

    /// A rollback may begin once no later change on an overlapping device set
    /// is still in flight; rolling back underneath such a change would
    /// reintroduce an inconsistent layering.
    async fn can_apply_rollback(&self, change: &NetworkChange) -> ControllerResult<bool> {
        let last_index = self.network_changes.last_index().await?;
        for index in (change.index.0 + 1)..=last_index.0 {
            let Some(future) = self.network_changes.get_by_index(Index(index)).await? else {
                continue;
            };
            if change.intersects(&future) && !future.status.is_terminal() {
                debug!(
                    "rollback of {} blocked by in-flight change {} (index {})",
                    change.id, future.id, future.index
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn reconcile_running_rollback(
        &self,
        mut change: NetworkChange,
    ) -> ControllerResult<bool> {
        let children = self.device_changes_for(&change).await?;

        if self.ensure_device_changes_running(&children).await? {
            return Ok(true);
        }

        if children.iter().all(|c| c.status.state == State::Complete) {
            change.status.state = State::Complete;
            self.network_changes.update(&mut change).await?;
            info!("rollback of network change {} is complete", change.id);
        }
        Ok(true)
    }
}

/// True once every child that entered the ROLLBACK phase has completed it.
fn child_rollbacks_complete(children: &[DeviceChange]) -> bool {
    children
        .iter()
        .filter(|c| c.status.phase == Phase::Rollback)
        .all(|c| c.status.state == State::Complete)
}

#[async_trait]
impl Reconciler for NetworkChangeReconciler {
    async fn reconcile(&self, id: &NetworkChangeId) -> ControllerResult<bool> {
        let Some(mut change) = self.network_changes.get(id).await? else {
            // Deleted or never created; nothing to drive.
            return Ok(true);
        };

        // Materialization is a separate step from any state advance: the
        // persisted child identifiers must be visible first.
        if self.ensure_device_changes(&mut change).await? {
            return Ok(true);
        }

        match change.status.phase {
            Phase::Change => self.reconcile_change(change).await,
            Phase::Rollback => self.reconcile_rollback(change).await,
        }
    }
}
