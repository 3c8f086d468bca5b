//! Core CSI types: volume identity, capabilities, node requests, and
//! topology.
//!
//! These types form the data model shared by the CSI traits, transport
//! layer, and backend drivers.  They are all [`Serialize`]/[`Deserialize`]
//! so they can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Driver name advertised by the shared file-system (NFS-like) backend.
pub const SHARED_FS_DRIVER_NAME: &str = "fss.csi.oraclecloud.com";

/// Driver name advertised by the parallel file-system (Lustre) backend.
pub const PARALLEL_FS_DRIVER_NAME: &str = "lustre.csi.oraclecloud.com";

/// Topology key under which the node's availability domain is reported.
pub const ZONE_TOPOLOGY_KEY: &str = "topology.kubernetes.io/zone";

/// Node annotation carrying the backing compartment id.  Consumed by the
/// attachment-inspection path; its absence there is fatal.
pub const COMPARTMENT_ID_ANNOTATION: &str = "oci.oraclecloud.com/compartment-id";

/// Volume-context key enabling in-transit encryption for shared-FS volumes.
pub const ENCRYPT_IN_TRANSIT_KEY: &str = "encryptInTransit";

/// Volume-context key requesting L-net configuration for parallel-FS volumes.
pub const SETUP_LNET_KEY: &str = "setupLnet";

/// Volume-context key overriding the L-net subnet CIDR.
pub const LUSTRE_SUBNET_CIDR_KEY: &str = "lustreSubnetCidr";

/// Volume-context key carrying tuning parameters applied after the mount.
pub const LUSTRE_POST_MOUNT_PARAMETERS_KEY: &str = "lustrePostMountParameters";

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// Whether a volume is consumed as a mounted filesystem or a raw block
/// device.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeMode {
    /// The volume is mounted as a filesystem.
    #[default]
    Filesystem,
    /// The volume is exposed as a raw block device.
    Block,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Mount vs raw-block access.
    #[serde(default)]
    pub volume_mode: VolumeMode,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Filesystem type, e.g. `"nfs"` or `"lustre"`.  Empty lets the kernel
    /// pick.
    #[serde(default)]
    pub fs_type: String,
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteMany,
            volume_mode: VolumeMode::Filesystem,
            mount_flags: Vec::new(),
            fs_type: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Node requests
// ---------------------------------------------------------------------------

/// Request to stage (globally mount) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage; the handle string carries the backend endpoint.
    pub volume_id: VolumeId,
    /// Global staging mount point.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Opaque attributes carried on the volume object.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish (bind-mount) a staged volume into a workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The global staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Per-workload target path.
    pub target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Opaque attributes carried on the volume object.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. [`SHARED_FS_DRIVER_NAME`].
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// Capabilities advertised by the node service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    /// The node implements Stage/Unstage in addition to Publish/Unpublish.
    StageUnstageVolume,
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    /// Topology segments, e.g. `{"topology.kubernetes.io/zone": "AD-1"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Topology of this node; the scheduler pins volumes to the node's
    /// availability domain through it.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}

/// Usage figures for a mounted volume.  Present for wire completeness; the
/// node drivers do not implement stats reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeStats {
    /// Bytes available to the workload.
    pub available_bytes: u64,
    /// Total bytes of the volume.
    pub total_bytes: u64,
    /// Bytes in use.
    pub used_bytes: u64,
}

/// Parse a `"true"`/`"false"` volume-context value.  A missing key is
/// `false`; anything other than the two literals is an error.
pub fn parse_bool_context(
    context: &HashMap<String, String>,
    key: &str,
) -> Result<bool, crate::error::CsiError> {
    match context.get(key) {
        None => Ok(false),
        Some(raw) => raw.parse::<bool>().map_err(|_| {
            crate::error::CsiError::InvalidArgument(format!("{key} must be a boolean value"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_display() {
        let id = VolumeId("ocid1.fs.oc1..a1,10.0.0.5,/export/vol".into());
        assert_eq!(id.to_string(), "ocid1.fs.oc1..a1,10.0.0.5,/export/vol");
    }

    #[test]
    fn stage_request_serde_roundtrip() {
        let req = NodeStageVolumeRequest {
            volume_id: VolumeId("v1".into()),
            staging_target_path: "/var/lib/stage/v1".into(),
            volume_capability: VolumeCapability::default(),
            volume_context: HashMap::from([("encryptInTransit".into(), "false".into())]),
        };
        let json = serde_json::to_string(&req).expect("serialize");
        let de: NodeStageVolumeRequest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(de.volume_id, req.volume_id);
        assert_eq!(de.staging_target_path, req.staging_target_path);
    }

    #[test]
    fn parse_bool_context_values() {
        let mut ctx = HashMap::new();
        assert!(!parse_bool_context(&ctx, ENCRYPT_IN_TRANSIT_KEY).unwrap());

        ctx.insert(ENCRYPT_IN_TRANSIT_KEY.into(), "true".into());
        assert!(parse_bool_context(&ctx, ENCRYPT_IN_TRANSIT_KEY).unwrap());

        ctx.insert(ENCRYPT_IN_TRANSIT_KEY.into(), "yes".into());
        assert!(parse_bool_context(&ctx, ENCRYPT_IN_TRANSIT_KEY).is_err());
    }

    #[test]
    fn capability_default_is_mount() {
        let cap = VolumeCapability::default();
        assert_eq!(cap.volume_mode, VolumeMode::Filesystem);
        assert!(cap.fs_type.is_empty());
    }
}
