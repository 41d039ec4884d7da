//! Store contracts consumed by the controller, plus in-memory implementations.
//!
//! The replicated stores are external collaborators; the traits here are the
//! typed façades the controller programs against. The `Mem*` implementations
//! back the crate's tests and single-process deployments with the same
//! semantics: store-assigned ids and dense indexes, optimistic concurrency on
//! update, and watch streams that replay current state before going live so a
//! re-activated subscriber never resumes from a stale cursor.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use tracing::warn;

use crate::{
    error::{StoreError, StoreResult},
    types::{
        Device, DeviceChange, DeviceChangeId, DeviceId, Index, NetworkChange, NetworkChangeId,
        Revision,
    },
};

/// Capacity of each watch stream. A slow subscriber loses events rather than
/// stalling writers; the reconciler re-reads entities on every invocation, so
/// a lost event costs a backoff delay, not correctness.
const EVENT_CHANNEL_CAPACITY: usize = 128;

// ============================================================================
// Watch Events
// ============================================================================

/// How an entity arrived on a watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Pre-existing entity replayed on subscription.
    Replayed,
    Created,
    Updated,
}

/// A single watch-stream event carrying the entity's state at emission time.
#[derive(Debug, Clone)]
pub struct StoreEvent<T> {
    pub event_type: EventType,
    pub entity: T,
}

pub type NetworkChangeEvent = StoreEvent<NetworkChange>;
pub type DeviceChangeEvent = StoreEvent<DeviceChange>;
pub type DeviceEvent = StoreEvent<Device>;

/// Fan an event out to live subscribers, pruning closed ones. A full channel
/// drops the event with a warning.
fn fan_out<T: Clone>(senders: &mut Vec<mpsc::Sender<StoreEvent<T>>>, event: &StoreEvent<T>) {
    senders.retain(|tx| match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("watch subscriber is not keeping up; dropping event");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    });
}

// ============================================================================
// Store Contracts
// ============================================================================

/// Store of operator-submitted network changes.
#[async_trait]
pub trait NetworkChangeStore: Send + Sync {
    async fn get(&self, id: &NetworkChangeId) -> StoreResult<Option<NetworkChange>>;

    /// Lookup by submission ordinal. `Ok(None)` on a gap.
    async fn get_by_index(&self, index: Index) -> StoreResult<Option<NetworkChange>>;

    /// Highest index assigned so far (0 when empty).
    async fn last_index(&self) -> StoreResult<Index>;

    /// Persist a new change, assigning its id (if empty), index, and first
    /// revision in place.
    async fn create(&self, change: &mut NetworkChange) -> StoreResult<()>;

    /// Persist an update. Fails with [`StoreError::Conflict`] when the
    /// caller's revision is stale; on success the new revision is written
    /// back in place.
    async fn update(&self, change: &mut NetworkChange) -> StoreResult<()>;

    /// Subscribe to change events. Current entities are replayed in index
    /// order before live events.
    async fn watch(&self) -> StoreResult<mpsc::Receiver<NetworkChangeEvent>>;
}

/// Store of per-device change projections.
#[async_trait]
pub trait DeviceChangeStore: Send + Sync {
    async fn get(&self, id: &DeviceChangeId) -> StoreResult<Option<DeviceChange>>;

    async fn get_by_index(&self, index: Index) -> StoreResult<Option<DeviceChange>>;

    async fn last_index(&self) -> StoreResult<Index>;

    async fn create(&self, change: &mut DeviceChange) -> StoreResult<()>;

    async fn update(&self, change: &mut DeviceChange) -> StoreResult<()>;

    /// Subscribe to all device-change events.
    async fn watch(&self) -> StoreResult<mpsc::Receiver<DeviceChangeEvent>>;

    /// Subscribe to the events of a single device, with replay.
    async fn watch_device(&self, device_id: &DeviceId)
        -> StoreResult<mpsc::Receiver<DeviceChangeEvent>>;
}

/// Read-only inventory of devices known to the control plane.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get(&self, id: &DeviceId) -> StoreResult<Option<Device>>;

    async fn list(&self) -> StoreResult<Vec<Device>>;

    /// Subscribe to inventory events, with replay of current devices.
    async fn watch(&self) -> StoreResult<mpsc::Receiver<DeviceEvent>>;
}

/// Cluster leadership election for the controller.
#[async_trait]
pub trait LeadershipStore: Send + Sync {
    /// Current leadership of this process plus future flips. The receiver's
    /// current value is the snapshot at subscription time.
    async fn watch(&self) -> StoreResult<watch::Receiver<bool>>;

    async fn is_leader(&self) -> StoreResult<bool>;
}

// ============================================================================
// In-Memory Network Change Store
// ============================================================================

#[derive(Default)]
pub struct MemNetworkChangeStore {
    entities: DashMap<NetworkChangeId, NetworkChange>,
    by_index: DashMap<u64, NetworkChangeId>,
    last_index: AtomicU64,
    watchers: Mutex<Vec<mpsc::Sender<NetworkChangeEvent>>>,
}

impl MemNetworkChangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, event_type: EventType, entity: NetworkChange) {
        let event = StoreEvent { event_type, entity };
        fan_out(&mut self.watchers.lock(), &event);
    }
}

#[async_trait]
impl NetworkChangeStore for MemNetworkChangeStore {
    async fn get(&self, id: &NetworkChangeId) -> StoreResult<Option<NetworkChange>> {
        Ok(self.entities.get(id).map(|e| e.value().clone()))
    }

    async fn get_by_index(&self, index: Index) -> StoreResult<Option<NetworkChange>> {
        let Some(id) = self.by_index.get(&index.0).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        self.get(&id).await
    }

    async fn last_index(&self) -> StoreResult<Index> {
        Ok(Index(self.last_index.load(Ordering::SeqCst)))
    }

    async fn create(&self, change: &mut NetworkChange) -> StoreResult<()> {
        if change.changes.is_empty() {
            return Err(StoreError::InvalidEntity(
                "network change carries no device changes".to_string(),
            ));
        }
        if change.id.is_empty() {
            change.id = NetworkChangeId::random();
        }
        if self.entities.contains_key(&change.id) {
            return Err(StoreError::AlreadyExists(change.id.to_string()));
        }

        change.index = Index(self.last_index.fetch_add(1, Ordering::SeqCst) + 1);
        change.revision = Revision(1);
        self.by_index.insert(change.index.0, change.id.clone());
        self.entities.insert(change.id.clone(), change.clone());
        self.publish(EventType::Created, change.clone());
        Ok(())
    }

    async fn update(&self, change: &mut NetworkChange) -> StoreResult<()> {
        {
            let mut current = self
                .entities
                .get_mut(&change.id)
                .ok_or_else(|| StoreError::NotFound(change.id.to_string()))?;
            if current.revision != change.revision {
                return Err(StoreError::Conflict {
                    id: change.id.to_string(),
                    expected: current.revision.0,
                    actual: change.revision.0,
                });
            }
            change.revision.0 += 1;
            *current = change.clone();
        }
        self.publish(EventType::Updated, change.clone());
        Ok(())
    }

    async fn watch(&self) -> StoreResult<mpsc::Receiver<NetworkChangeEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        // Registration and replay happen under the registry lock so no event
        // published concurrently can fall between the snapshot and the
        // subscription.
        let mut watchers = self.watchers.lock();
        let mut snapshot: Vec<NetworkChange> =
            self.entities.iter().map(|e| e.value().clone()).collect();
        snapshot.sort_by_key(|c| c.index);
        for entity in snapshot {
            let _ = tx.try_send(StoreEvent {
                event_type: EventType::Replayed,
                entity,
            });
        }
        watchers.push(tx);
        Ok(rx)
    }
}

// ============================================================================
// In-Memory Device Change Store
// ============================================================================

#[derive(Default)]
pub struct MemDeviceChangeStore {
    entities: DashMap<DeviceChangeId, DeviceChange>,
    by_index: DashMap<u64, DeviceChangeId>,
    last_index: AtomicU64,
    watchers: Mutex<Vec<(Option<DeviceId>, mpsc::Sender<DeviceChangeEvent>)>>,
}

impl MemDeviceChangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, event_type: EventType, entity: DeviceChange) {
        let event = StoreEvent { event_type, entity };
        let mut watchers = self.watchers.lock();
        watchers.retain(|(filter, tx)| {
            if filter.as_ref().is_some_and(|d| *d != event.entity.device_id) {
                return true;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("device change watch subscriber is not keeping up; dropping event");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    fn subscribe(
        &self,
        filter: Option<DeviceId>,
    ) -> mpsc::Receiver<DeviceChangeEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut watchers = self.watchers.lock();
        let mut snapshot: Vec<DeviceChange> = self
            .entities
            .iter()
            .map(|e| e.value().clone())
            .filter(|c| filter.as_ref().is_none_or(|d| *d == c.device_id))
            .collect();
        snapshot.sort_by_key(|c| c.index);
        for entity in snapshot {
            let _ = tx.try_send(StoreEvent {
                event_type: EventType::Replayed,
                entity,
            });
        }
        watchers.push((filter, tx));
        rx
    }
}

#[async_trait]
impl DeviceChangeStore for MemDeviceChangeStore {
    async fn get(&self, id: &DeviceChangeId) -> StoreResult<Option<DeviceChange>> {
        Ok(self.entities.get(id).map(|e| e.value().clone()))
    }

    async fn get_by_index(&self, index: Index) -> StoreResult<Option<DeviceChange>> {
        let Some(id) = self.by_index.get(&index.0).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        self.get(&id).await
    }

    async fn last_index(&self) -> StoreResult<Index> {
        Ok(Index(self.last_index.load(Ordering::SeqCst)))
    }

    async fn create(&self, change: &mut DeviceChange) -> StoreResult<()> {
        if change.id.is_empty() {
            change.id = DeviceChangeId::random();
        }
        if self.entities.contains_key(&change.id) {
            return Err(StoreError::AlreadyExists(change.id.to_string()));
        }

        change.index = Index(self.last_index.fetch_add(1, Ordering::SeqCst) + 1);
        change.revision = Revision(1);
        self.by_index.insert(change.index.0, change.id.clone());
        self.entities.insert(change.id.clone(), change.clone());
        self.publish(EventType::Created, change.clone());
        Ok(())
    }

    async fn update(&self, change: &mut DeviceChange) -> StoreResult<()> {
        {
            let mut current = self
                .entities
                .get_mut(&change.id)
                .ok_or_else(|| StoreError::NotFound(change.id.to_string()))?;
            if current.revision != change.revision {
                return Err(StoreError::Conflict {
                    id: change.id.to_string(),
                    expected: current.revision.0,
                    actual: change.revision.0,
                });
            }
            change.revision.0 += 1;
            *current = change.clone();
        }
        self.publish(EventType::Updated, change.clone());
        Ok(())
    }

    async fn watch(&self) -> StoreResult<mpsc::Receiver<DeviceChangeEvent>> {
        Ok(self.subscribe(None))
    }

    async fn watch_device(
        &self,
        device_id: &DeviceId,
    ) -> StoreResult<mpsc::Receiver<DeviceChangeEvent>> {
        Ok(self.subscribe(Some(device_id.clone())))
    }
}

// ============================================================================
// In-Memory Device Inventory
// ============================================================================

#[derive(Default)]
pub struct MemDeviceStore {
    devices: DashMap<DeviceId, Device>,
    watchers: Mutex<Vec<mpsc::Sender<DeviceEvent>>>,
}

impl MemDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a device in the inventory.
    pub fn add(&self, device: Device) {
        let event_type = match self.devices.insert(device.id.clone(), device.clone()) {
            Some(_) => EventType::Updated,
            None => EventType::Created,
        };
        let event = StoreEvent {
            event_type,
            entity: device,
        };
        fan_out(&mut self.watchers.lock(), &event);
    }
}

#[async_trait]
impl DeviceStore for MemDeviceStore {
    async fn get(&self, id: &DeviceId) -> StoreResult<Option<Device>> {
        Ok(self.devices.get(id).map(|e| e.value().clone()))
    }

    async fn list(&self) -> StoreResult<Vec<Device>> {
        Ok(self.devices.iter().map(|e| e.value().clone()).collect())
    }

    async fn watch(&self) -> StoreResult<mpsc::Receiver<DeviceEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut watchers = self.watchers.lock();
        for entry in self.devices.iter() {
            let _ = tx.try_send(StoreEvent {
                event_type: EventType::Replayed,
                entity: entry.value().clone(),
            });
        }
        watchers.push(tx);
        Ok(rx)
    }
}

// ============================================================================
// In-Memory Leadership
// ============================================================================

/// Single-process leadership election stand-in. Tests flip leadership with
/// [`MemLeadershipStore::acquire`] and [`MemLeadershipStore::resign`].
pub struct MemLeadershipStore {
    leader: watch::Sender<bool>,
}

impl MemLeadershipStore {
    pub fn new(leader: bool) -> Self {
        let (tx, _rx) = watch::channel(leader);
        Self { leader: tx }
    }

    pub fn acquire(&self) {
        let _ = self.leader.send(true);
    }

    pub fn resign(&self) {
        let _ = self.leader.send(false);
    }
}

#[async_trait]
impl LeadershipStore for MemLeadershipStore {
    async fn watch(&self) -> StoreResult<watch::Receiver<bool>> {
        Ok(self.leader.subscribe())
    }

    async fn is_leader(&self) -> StoreResult<bool> {
        Ok(*self.leader.borrow())
    }
}
