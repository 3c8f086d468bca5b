//! Typed cluster objects consumed and produced by the claim lifecycle.
//!
//! These mirror the orchestrator's object schemas narrowly: only the fields
//! the lifecycle state machine reads or writes are modelled.  Everything is
//! [`Serialize`]/[`Deserialize`] with camelCase field names so the objects
//! round-trip through the cluster API unchanged.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::types::{AccessMode, VolumeMode};

// ---------------------------------------------------------------------------
// Quantities
// ---------------------------------------------------------------------------

/// A storage quantity in the orchestrator's `50Gi` notation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Quantity(pub String);

impl Quantity {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The quantity in bytes, or `None` if the notation is unparseable.
    /// Binary (`Ki`, `Mi`, ...) and decimal (`K`, `M`, ...) suffixes are
    /// both understood.
    pub fn to_bytes(&self) -> Option<u128> {
        let raw = self.0.trim();
        let split = raw
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(raw.len());
        let (digits, suffix) = raw.split_at(split);
        let value: u128 = digits.parse().ok()?;
        let multiplier: u128 = match suffix {
            "" => 1,
            "Ki" => 1 << 10,
            "Mi" => 1 << 20,
            "Gi" => 1 << 30,
            "Ti" => 1 << 40,
            "Pi" => 1 << 50,
            "K" | "k" => 1_000,
            "M" => 1_000_000,
            "G" => 1_000_000_000,
            "T" => 1_000_000_000_000,
            _ => return None,
        };
        Some(value * multiplier)
    }

    /// Whether two quantities denote the same number of bytes, regardless
    /// of notation.
    pub fn same_as(&self, other: &Quantity) -> bool {
        match (self.to_bytes(), other.to_bytes()) {
            (Some(a), Some(b)) => a == b,
            _ => self.0 == other.0,
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Object metadata
// ---------------------------------------------------------------------------

/// Common object metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    /// Assigned by the cluster on creation.
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Observable phase of a volume claim.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClaimPhase {
    /// Created, not yet bound by the provisioner.
    #[default]
    Pending,
    /// Bound to a volume object.
    Bound,
    /// The bound volume disappeared.
    Lost,
    /// Released after deletion under a `Retain` reclaim policy.
    Released,
}

/// Resize-related conditions surfaced on a claim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClaimConditionType {
    /// The control plane is resizing the backend volume.
    Resizing,
    /// The volume grew; the node-side filesystem resize is outstanding.
    FileSystemResizePending,
}

/// A condition entry on a claim's status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimCondition {
    pub condition_type: ClaimConditionType,
    pub status: String,
}

/// Optional pre-population source for a new claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DataSource {
    /// Restore from a snapshot object.
    Snapshot { name: String },
    /// Clone an existing claim.
    Claim { name: String },
}

/// Desired state of a claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSpec {
    /// Requested storage.
    pub requested_storage: Quantity,
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    #[serde(default)]
    pub volume_mode: Option<VolumeMode>,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub data_source: Option<DataSource>,
    /// Pins provisioning to one availability domain.
    #[serde(default)]
    pub selector_zone: Option<String>,
    /// Name of the bound volume object, set when binding completes (or
    /// up-front for statically provisioned volumes).
    #[serde(default)]
    pub volume_name: Option<String>,
}

/// Observed state of a claim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,
    #[serde(default)]
    pub conditions: Vec<ClaimCondition>,
}

/// A request for storage, bound to a volume object by the provisioner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub meta: ObjectMeta,
    pub spec: ClaimSpec,
    #[serde(default)]
    pub status: ClaimStatus,
}

impl Claim {
    /// Builder-style mutators used when deriving claim templates.
    pub fn with_access_mode(mut self, mode: AccessMode) -> Self {
        self.spec.access_modes = vec![mode];
        self
    }

    pub fn with_volume_mode(mut self, mode: VolumeMode) -> Self {
        self.spec.volume_mode = Some(mode);
        self
    }

    pub fn with_storage_class(mut self, name: impl Into<String>) -> Self {
        self.spec.storage_class = Some(name.into());
        self
    }

    pub fn with_zone_selector(mut self, zone: impl Into<String>) -> Self {
        self.spec.selector_zone = Some(zone.into());
        self
    }

    pub fn with_data_source(mut self, source: DataSource) -> Self {
        self.spec.data_source = Some(source);
        self
    }

    pub fn with_volume_name(mut self, volume_name: impl Into<String>) -> Self {
        self.spec.volume_name = Some(volume_name.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Volumes
// ---------------------------------------------------------------------------

/// Observable phase of a volume object.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumePhase {
    #[default]
    Pending,
    /// Provisioned and waiting for a claim.
    Available,
    /// Bound to a claim.
    Bound,
    /// The claim is gone; the backend volume is kept per `Retain`.
    Released,
    /// Reclamation failed.
    Failed,
}

/// What happens to the backend volume once its claim is deleted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReclaimPolicy {
    Delete,
    Retain,
}

/// Back-pointer from a volume object to the claim it is bound to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// The CSI source block of a volume object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsiVolumeSource {
    /// Driver name, e.g. [`crate::types::SHARED_FS_DRIVER_NAME`].
    pub driver: String,
    /// Opaque backend volume handle.
    pub volume_handle: String,
    #[serde(default)]
    pub fs_type: String,
    #[serde(default)]
    pub volume_attributes: HashMap<String, String>,
}

/// Desired state of a volume object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub capacity: Quantity,
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    pub reclaim_policy: ReclaimPolicy,
    #[serde(default)]
    pub mount_options: Vec<String>,
    pub csi: CsiVolumeSource,
    #[serde(default)]
    pub volume_mode: Option<VolumeMode>,
    #[serde(default)]
    pub claim_ref: Option<ClaimRef>,
}

/// Observed state of a volume object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeStatus {
    #[serde(default)]
    pub phase: VolumePhase,
}

/// A provisioned backend volume as the cluster sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeObject {
    pub meta: ObjectMeta,
    pub spec: VolumeSpec,
    #[serde(default)]
    pub status: VolumeStatus,
}

// ---------------------------------------------------------------------------
// Nodes, pods, workloads
// ---------------------------------------------------------------------------

/// A scheduling taint on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub effect: String,
}

/// A network address attached to a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAddress {
    pub address_type: String,
    pub address: String,
}

/// A cluster worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeObject {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub unschedulable: bool,
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub addresses: Vec<NodeAddress>,
    /// Cloud-provider instance reference, e.g. `oci://ocid1.instance...`.
    #[serde(default)]
    pub provider_id: String,
}

impl NodeObject {
    /// Whether a workload can be placed on this node; control-plane taints
    /// exclude it.
    pub fn is_schedulable_worker(&self) -> bool {
        !self.unschedulable
            && !self.taints.iter().any(|taint| {
                taint.key == "node-role.kubernetes.io/master"
                    || taint.key == "node-role.kubernetes.io/control-plane"
            })
    }
}

/// Observable phase of a pod.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// A workload pod, narrowly modelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub phase: PodPhase,
}

/// Desired state of a controller-managed workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    pub replicas: u32,
    /// Label selector matching the workload's pods.
    pub selector: HashMap<String, String>,
    /// Claim mounted (or attached as a raw device) by each pod.
    pub claim_name: String,
    /// Labels the chosen node must carry.
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    /// Shell command each pod runs.
    pub command: String,
    /// Attach the claim as a raw block device instead of a filesystem.
    #[serde(default)]
    pub raw_block: bool,
}

/// Observed state of a workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default)]
    pub available_replicas: u32,
}

/// A controller-managed workload that keeps its pods rescheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub meta: ObjectMeta,
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_binary_suffixes() {
        assert_eq!(Quantity::new("50Gi").to_bytes(), Some(50 << 30));
        assert_eq!(Quantity::new("1Ki").to_bytes(), Some(1024));
        assert_eq!(Quantity::new("512").to_bytes(), Some(512));
    }

    #[test]
    fn quantity_decimal_suffixes() {
        assert_eq!(Quantity::new("2G").to_bytes(), Some(2_000_000_000));
        assert_eq!(Quantity::new("3M").to_bytes(), Some(3_000_000));
    }

    #[test]
    fn quantity_equality_across_notations() {
        assert!(Quantity::new("1Gi").same_as(&Quantity::new("1024Mi")));
        assert!(!Quantity::new("50Gi").same_as(&Quantity::new("100Gi")));
    }

    #[test]
    fn quantity_rejects_garbage() {
        assert_eq!(Quantity::new("banana").to_bytes(), None);
        assert_eq!(Quantity::new("50Xi").to_bytes(), None);
    }

    #[test]
    fn schedulable_worker_excludes_control_plane() {
        let mut node = NodeObject {
            meta: ObjectMeta {
                name: "node-1".into(),
                ..Default::default()
            },
            unschedulable: false,
            taints: Vec::new(),
            addresses: Vec::new(),
            provider_id: String::new(),
        };
        assert!(node.is_schedulable_worker());

        node.taints.push(Taint {
            key: "node-role.kubernetes.io/control-plane".into(),
            value: String::new(),
            effect: "NoSchedule".into(),
        });
        assert!(!node.is_schedulable_worker());

        node.taints.clear();
        node.unschedulable = true;
        assert!(!node.is_schedulable_worker());
    }

    #[test]
    fn claim_serde_roundtrip() {
        let claim = Claim {
            meta: ObjectMeta {
                namespace: "default".into(),
                name: "data".into(),
                ..Default::default()
            },
            spec: ClaimSpec {
                requested_storage: Quantity::new("50Gi"),
                access_modes: vec![AccessMode::ReadWriteMany],
                volume_mode: Some(VolumeMode::Filesystem),
                storage_class: Some("shared-fs".into()),
                data_source: Some(DataSource::Snapshot {
                    name: "snap-1".into(),
                }),
                selector_zone: None,
                volume_name: None,
            },
            status: ClaimStatus::default(),
        };
        let json = serde_json::to_string(&claim).expect("serialize");
        let de: Claim = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(de.meta.name, "data");
        assert!(de.spec.requested_storage.same_as(&Quantity::new("50Gi")));
        assert!(matches!(
            de.spec.data_source,
            Some(DataSource::Snapshot { .. })
        ));
    }
}
