//! Narrow inspection interfaces over the cloud provider.
//!
//! The claim lifecycle cross-checks what the orchestrator reports against
//! what the cloud control plane actually did (attachment kind, in-transit
//! encryption, performance tier).  Only the queries it needs are modelled;
//! the provider SDK stays outside the crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CsiError;

/// How a block volume is attached to an instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttachmentMode {
    /// Hypervisor-mediated attachment.
    Paravirtualized,
    /// iSCSI attachment.
    Iscsi,
}

/// A volume attachment as the compute control plane reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub id: String,
    pub mode: AttachmentMode,
    /// Whether traffic to the volume is encrypted in transit.
    pub in_transit_encryption: bool,
}

/// Launch options recorded on a compute instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceLaunchOptions {
    /// Whether the instance was launched with in-transit encryption for
    /// attached volumes.
    pub in_transit_encryption: bool,
}

/// Compute control-plane queries.
#[async_trait]
pub trait Compute: Send + Sync {
    /// Find the attachment of `volume_handle` to `instance_id`, if any.
    async fn find_volume_attachment(
        &self,
        compartment_id: &str,
        volume_handle: &str,
        instance_id: &str,
    ) -> Result<Option<VolumeAttachment>, CsiError>;

    /// Launch options of an instance.
    async fn instance_launch_options(
        &self,
        instance_id: &str,
    ) -> Result<InstanceLaunchOptions, CsiError>;
}

/// Block-storage control-plane queries.
#[async_trait]
pub trait BlockStorage: Send + Sync {
    /// Provisioned performance units per GB for a volume.
    async fn volume_performance(&self, volume_handle: &str) -> Result<i64, CsiError>;
}
