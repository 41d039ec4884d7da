//! Watchers converting store events into reconcile requests.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{debug, warn};

use super::{queue::WorkQueueHandle, Watcher};
use crate::{
    error::ControllerResult,
    stores::{DeviceChangeStore, DeviceStore, NetworkChangeStore},
    types::DeviceId,
};

// ============================================================================
// Network Change Watcher
// ============================================================================

/// Emits a reconcile request for every network-change event.
pub struct NetworkChangeWatcher {
    store: Arc<dyn NetworkChangeStore>,
    task: Option<JoinHandle<()>>,
}

impl NetworkChangeWatcher {
    pub fn new(store: Arc<dyn NetworkChangeStore>) -> Self {
        Self { store, task: None }
    }
}

#[async_trait]
impl Watcher for NetworkChangeWatcher {
    async fn start(&mut self, queue: WorkQueueHandle) -> ControllerResult<()> {
        let events = self.store.watch().await?;
        self.task = Some(tokio::spawn(async move {
            let mut events = ReceiverStream::new(events);
            while let Some(event) = events.next().await {
                queue.enqueue(event.entity.id).await;
            }
            debug!("network change watch stream closed");
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Device Change Watcher
// ============================================================================

/// Emits the owning network-change id for every device-change event.
///
/// Subscriptions are opened per device as devices appear in the inventory, so
/// a device registered after activation is picked up without a restart.
pub struct DeviceChangeWatcher {
    devices: Arc<dyn DeviceStore>,
    device_changes: Arc<dyn DeviceChangeStore>,
    task: Option<JoinHandle<()>>,
    subscriptions: Arc<Mutex<HashMap<DeviceId, JoinHandle<()>>>>,
}

impl DeviceChangeWatcher {
    pub fn new(devices: Arc<dyn DeviceStore>, device_changes: Arc<dyn DeviceChangeStore>) -> Self {
        Self {
            devices,
            device_changes,
            task: None,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Watcher for DeviceChangeWatcher {
    async fn start(&mut self, queue: WorkQueueHandle) -> ControllerResult<()> {
        let device_events = self.devices.watch().await?;
        let device_changes = Arc::clone(&self.device_changes);
        let subscriptions = Arc::clone(&self.subscriptions);

        self.task = Some(tokio::spawn(async move {
            let mut device_events = ReceiverStream::new(device_events);
            while let Some(event) = device_events.next().await {
                let device_id = event.entity.id;
                if subscriptions.lock().contains_key(&device_id) {
                    continue;
                }

                match device_changes.watch_device(&device_id).await {
                    Ok(changes) => {
                        let queue = queue.clone();
                        let id = device_id.clone();
                        let subscription = tokio::spawn(async move {
                            let mut changes = ReceiverStream::new(changes);
                            while let Some(change_event) = changes.next().await {
                                queue
                                    .enqueue(change_event.entity.network_change_id)
                                    .await;
                            }
                            debug!("device change watch stream for {} closed", id);
                        });
                        subscriptions.lock().insert(device_id, subscription);
                    }
                    Err(e) => {
                        warn!("failed to watch device changes for {}: {}", device_id, e);
                    }
                }
            }
            debug!("device inventory watch stream closed");
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let mut subscriptions = self.subscriptions.lock();
        for (_, subscription) in subscriptions.drain() {
            subscription.abort();
        }
    }
}
