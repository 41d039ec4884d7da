//! Entity model for network and device configuration changes.
//!
//! These types are the persisted wire contract shared with the replicated
//! stores: field order, names, and enum variants must stay stable across
//! releases.

use std::{collections::HashSet, time::SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Identifiers and Store-Assigned Ordinals
// ============================================================================

/// Unique identifier of a network change.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct NetworkChangeId(pub String);

impl NetworkChangeId {
    /// Generate a fresh store-assigned identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for NetworkChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NetworkChangeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier of a device change.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct DeviceChangeId(pub String);

impl DeviceChangeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for DeviceChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceChangeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a target device.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct DeviceId(pub String);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Store-assigned submission ordinal. Dense and strictly increasing per store.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
)]
pub struct Index(pub u64);

impl std::fmt::Display for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned optimistic-concurrency token, bumped on every write.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
)]
pub struct Revision(pub u64);

// ============================================================================
// Change Status
// ============================================================================

/// Direction of travel: CHANGE pushes new values, ROLLBACK reverts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Change,
    Rollback,
}

/// Position within a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum State {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
}

/// Why a change is in its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Reason {
    #[default]
    None,
    Error,
}

/// Combined phase/state/reason of a change, plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Status {
    pub phase: Phase,
    pub state: State,
    pub reason: Reason,
    pub message: String,
}

impl Status {
    /// A change is terminal once no controller will advance it further
    /// without an external write.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, State::Complete | State::Failed)
    }
}

// ============================================================================
// Configuration Payload
// ============================================================================

/// A single configuration path/value pair carried by a device change.
///
/// The value schema is opaque to the reconciliation core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathValue {
    pub path: String,
    pub value: serde_json::Value,
    pub removed: bool,
}

impl PathValue {
    pub fn new(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            path: path.into(),
            value,
            removed: false,
        }
    }
}

// ============================================================================
// Network Change
// ============================================================================

/// Per-device element of a network change.
///
/// `device_change_id` and `device_change_index` are populated by the
/// reconciler once the corresponding device change has been created; they are
/// never rewritten afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceChangeRef {
    pub device_change_id: Option<DeviceChangeId>,
    pub device_change_index: Index,
    pub device_id: DeviceId,
    pub device_version: String,
    pub values: Vec<PathValue>,
}

impl DeviceChangeRef {
    pub fn new(
        device_id: impl Into<DeviceId>,
        device_version: impl Into<String>,
        values: Vec<PathValue>,
    ) -> Self {
        Self {
            device_change_id: None,
            device_change_index: Index(0),
            device_id: device_id.into(),
            device_version: device_version.into(),
            values,
        }
    }
}

/// An operator-submitted configuration intent spanning one or more devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkChange {
    pub id: NetworkChangeId,
    pub index: Index,
    pub revision: Revision,
    pub status: Status,
    pub created: SystemTime,
    pub changes: Vec<DeviceChangeRef>,
}

impl NetworkChange {
    /// New change in the initial (CHANGE, PENDING) status. Id, index, and
    /// revision are assigned by the store at creation.
    pub fn new(changes: Vec<DeviceChangeRef>) -> Self {
        Self {
            id: NetworkChangeId::default(),
            index: Index(0),
            revision: Revision(0),
            status: Status::default(),
            created: SystemTime::now(),
            changes,
        }
    }

    /// The set of devices this change touches.
    pub fn device_ids(&self) -> HashSet<&DeviceId> {
        self.changes.iter().map(|c| &c.device_id).collect()
    }

    /// Two changes intersect iff their device-id sets share an element.
    /// Ordering and device versions are irrelevant.
    pub fn intersects(&self, other: &NetworkChange) -> bool {
        !self.device_ids().is_disjoint(&other.device_ids())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ============================================================================
// Device Change
// ============================================================================

/// The per-device projection of a network change, pushed to hardware by the
/// device controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceChange {
    pub id: DeviceChangeId,
    pub index: Index,
    pub revision: Revision,
    pub network_change_id: NetworkChangeId,
    pub device_id: DeviceId,
    pub device_version: String,
    pub values: Vec<PathValue>,
    pub status: Status,
}

impl DeviceChange {
    /// New device change in the initial (CHANGE, PENDING) status, owned by
    /// the given network change.
    pub fn new(
        network_change_id: NetworkChangeId,
        device_id: DeviceId,
        device_version: impl Into<String>,
        values: Vec<PathValue>,
    ) -> Self {
        Self {
            id: DeviceChangeId::default(),
            index: Index(0),
            revision: Revision(0),
            network_change_id,
            device_id,
            device_version: device_version.into(),
            values,
            status: Status::default(),
        }
    }
}

// ============================================================================
// Device Inventory
// ============================================================================

/// A device known to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub version: String,
    pub address: String,
}
