//! CSI Node service.
//!
//! The Node service runs on each worker node and performs the local mount
//! operations required to make a volume available to workload containers:
//!
//! 1. **Stage** — mount the backend at a global staging path.
//! 2. **Publish** — bind-mount the staging path into the workload.
//! 3. **Unpublish** — remove the bind-mount.
//! 4. **Unstage** — unmount the staging path.
//!
//! Two drivers implement the trait: [`shared_fs::SharedFsNodeDriver`] for
//! the NFS-like shared file service and
//! [`parallel_fs::ParallelFsNodeDriver`] for the Lustre parallel file
//! system.

pub mod metadata;
pub mod parallel_fs;
pub mod shared_fs;

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
    VolumeStats,
};

/// Mode for staging and target directories the driver creates on the fly.
const TARGET_DIR_MODE: u32 = 0o750;

/// Create a missing staging/target directory.  Newer orchestrator versions
/// no longer pre-create these paths, so the driver must.
pub(crate) async fn ensure_target_dir(path: &Path) -> Result<(), CsiError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| CsiError::Internal(format!("failed to create {}: {e}", path.display())))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(TARGET_DIR_MODE))
        .await
        .map_err(|e| {
            CsiError::Internal(format!(
                "failed to set permissions on {}: {e}",
                path.display()
            ))
        })
}

pub(crate) async fn path_exists(path: &Path) -> Result<bool, CsiError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| CsiError::Internal(format!("failed to inspect {}: {e}", path.display())))
}

pub(crate) async fn remove_target_path(path: &Path) -> Result<(), CsiError> {
    tokio::fs::remove_dir_all(path)
        .await
        .map_err(|e| CsiError::Internal(format!("failed to remove {}: {e}", path.display())))
}

/// Node service — local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume: mount the backend at the global staging path.
    ///
    /// Idempotent — staging an already-staged volume succeeds without a
    /// second mount record.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume: unmount the staging path.
    ///
    /// Idempotent — a missing path succeeds, a path that is no longer a
    /// mount point is removed and succeeds.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume: bind-mount the staged path into the workload.
    ///
    /// Idempotent for the same `target_path`.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the bind-mount from the workload path.
    ///
    /// Idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Capabilities of this node service.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }

    /// Information about the node on which this service runs.  The
    /// orchestrator uses the reported topology when publishing volumes.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    /// Volume usage statistics.  Neither backend supports this.
    async fn get_volume_stats(&self, _volume_id: &VolumeId) -> Result<VolumeStats, CsiError> {
        Err(CsiError::Unimplemented("NodeGetVolumeStats".into()))
    }

    /// Node-side volume expansion.  Neither backend supports this.
    async fn expand_volume(
        &self,
        _volume_id: &VolumeId,
        _required_bytes: u64,
    ) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("NodeExpandVolume".into()))
    }
}
