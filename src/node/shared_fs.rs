//! Node driver for the shared file-system (NFS-like) backend.
//!
//! Staging mounts the export served by a mount target; publishing
//! bind-mounts the staged path per workload.  When the volume asks for
//! in-transit encryption the mount is tunnelled through a local helper and
//! the kernel records a loopback source, which is also how unstage later
//! recognises the tunnel.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::cluster::ClusterApi;
use crate::error::CsiError;
use crate::handle::{format_mount_host, SharedFsHandle};
use crate::identity::CsiIdentity;
use crate::locks::{NodeSemaphores, VolumeLocks};
use crate::mount::{Mounter, ENCRYPT_FS_TYPE, ENCRYPT_PACKAGE_NAME};
use crate::node::metadata::NodeMetadata;
use crate::node::{ensure_target_dir, path_exists, remove_target_path, CsiNode};
use crate::types::{
    parse_bool_context, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest,
    PluginCapability, PluginInfo, Topology, VolumeId, ENCRYPT_IN_TRANSIT_KEY,
    SHARED_FS_DRIVER_NAME, ZONE_TOPOLOGY_KEY,
};

/// Node driver for the shared file-system backend.
pub struct SharedFsNodeDriver {
    node_id: String,
    cluster: Arc<dyn ClusterApi>,
    mounter: Arc<dyn Mounter>,
    locks: Arc<VolumeLocks>,
    semaphores: Arc<NodeSemaphores>,
    metadata: OnceCell<NodeMetadata>,
}

impl SharedFsNodeDriver {
    /// Create a driver with the production admission bounds.
    pub fn new(
        node_id: impl Into<String>,
        cluster: Arc<dyn ClusterApi>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self::with_limits(
            node_id,
            cluster,
            mounter,
            Arc::new(VolumeLocks::new()),
            Arc::new(NodeSemaphores::default()),
        )
    }

    /// Create a driver with injected lock table and semaphores.
    pub fn with_limits(
        node_id: impl Into<String>,
        cluster: Arc<dyn ClusterApi>,
        mounter: Arc<dyn Mounter>,
        locks: Arc<VolumeLocks>,
        semaphores: Arc<NodeSemaphores>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            cluster,
            mounter,
            locks,
            semaphores,
            metadata: OnceCell::new(),
        }
    }

    async fn metadata(&self) -> Result<&NodeMetadata, CsiError> {
        self.metadata
            .get_or_try_init(|| NodeMetadata::load(self.cluster.as_ref(), &self.node_id))
            .await
    }
}

#[async_trait]
impl CsiNode for SharedFsNodeDriver {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume ID must be provided".into(),
            ));
        }
        if req.staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument(
                "staging path must be provided".into(),
            ));
        }

        let handle = SharedFsHandle::parse(&req.volume_id.0)?;

        let metadata = self.metadata().await?;
        if handle.mount_target_ip.is_ipv4() && !metadata.ipv4_enabled {
            return Err(CsiError::InvalidArgument(
                "IPv4 mount target identified in volume id, but worker node does not support the IPv4 family".into(),
            ));
        }
        if handle.mount_target_ip.is_ipv6() && !metadata.ipv6_enabled {
            return Err(CsiError::InvalidArgument(
                "IPv6 mount target identified in volume id, but worker node does not support the IPv6 family".into(),
            ));
        }

        debug!(context = ?req.volume_context, "volume context");

        let mut fs_type = req.volume_capability.fs_type.clone();
        let mut options = req.volume_capability.mount_flags.clone();

        let encrypt_in_transit = parse_bool_context(&req.volume_context, ENCRYPT_IN_TRANSIT_KEY)?;
        if encrypt_in_transit {
            let installed = self.mounter.encryption_helper_installed().map_err(|e| {
                CsiError::Internal(format!(
                    "in-transit encryption package installation check failed: {e}"
                ))
            })?;
            if !installed {
                return Err(CsiError::FailedPrecondition(format!(
                    "package {ENCRYPT_PACKAGE_NAME} not installed for in-transit encryption"
                )));
            }
            debug!("in-transit encryption enabled");
            fs_type = ENCRYPT_FS_TYPE.to_owned();
            if self.mounter.fips_enabled()? {
                // User-supplied mount flags may already request fips; a
                // duplicate flag would fail the helper.
                if !options.iter().any(|option| option == "fips") {
                    options.push("fips".to_owned());
                }
                debug!("FIPS mode enabled");
            }
        }

        let _volume_guard = self.locks.try_acquire_or_abort(&req.volume_id.0)?;
        let _permit = self.semaphores.acquire_mount().await?;

        info!("stage started");
        let start = Instant::now();

        let target = Path::new(&req.staging_target_path);
        if !path_exists(target).await? {
            info!(path = %req.staging_target_path, "staging path does not pre-exist, creating now");
            ensure_target_dir(target).await?;
        } else if self.mounter.is_mount_point(target)? {
            info!(path = %req.staging_target_path, "volume is already mounted");
            return Ok(());
        }

        let source = handle.mount_source();
        if encrypt_in_transit {
            self.mounter
                .mount_with_encrypt(&source, target, &fs_type, &options)
                .await?;
        } else {
            self.mounter
                .mount(&source, target, &fs_type, &options)
                .await?;
        }

        info!(
            mount_target = %handle.mount_target_ip,
            export_path = %handle.export_path,
            staging_target_path = %req.staging_target_path,
            stage_ms = start.elapsed().as_millis() as u64,
            "mounting the volume to the staging target path is completed"
        );
        Ok(())
    }

    #[instrument(skip(self), fields(volume_id = %volume_id))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume ID must be provided".into(),
            ));
        }
        if staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument(
                "staging path must be provided".into(),
            ));
        }

        let handle = SharedFsHandle::parse(&volume_id.0)?;

        let _volume_guard = self.locks.try_acquire_or_abort(&volume_id.0)?;
        let _permit = self.semaphores.acquire_unmount().await?;

        info!("unstage started");
        let start = Instant::now();

        let target = Path::new(staging_target_path);
        if !path_exists(target).await? {
            info!(path = %staging_target_path, "staging path does not exist");
            return Ok(());
        }
        if !self.mounter.is_mount_point(target)? {
            info!(path = %staging_target_path, "not a mount point, removing path");
            return remove_target_path(target).await;
        }

        let encrypted = self.mounter.is_encrypted_mount(
            target,
            &format_mount_host(&handle.mount_target_ip),
            &handle.export_path,
        )?;

        if encrypted {
            self.mounter.unmount_with_encrypt(target).await?;
        } else {
            self.mounter.unmount(target).await?;
        }

        info!(
            staging_target_path = %staging_target_path,
            unstage_ms = start.elapsed().as_millis() as u64,
            "unmounting volume completed"
        );
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume ID must be provided".into(),
            ));
        }
        if req.staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument(
                "staging path must be provided".into(),
            ));
        }
        if req.target_path.is_empty() {
            return Err(CsiError::InvalidArgument(
                "target path must be provided".into(),
            ));
        }

        debug!(context = ?req.volume_context, "volume context");

        let target = Path::new(&req.target_path);
        if !path_exists(target).await? {
            info!(path = %req.target_path, "target path does not exist, creating now");
            ensure_target_dir(target).await?;
        } else if self.mounter.is_mount_point(target)? {
            info!(path = %req.target_path, "volume is already mounted");
            return Ok(());
        }

        // No per-volume lock here: bind mounts are cheap and concurrent
        // publishes to distinct target paths must be permitted.
        let _permit = self.semaphores.acquire_mount().await?;

        info!("publish started");
        let start = Instant::now();

        self.mounter
            .bind_mount(
                Path::new(&req.staging_target_path),
                target,
                req.read_only,
            )
            .await?;

        info!(
            staging_target_path = %req.staging_target_path,
            target_path = %req.target_path,
            publish_ms = start.elapsed().as_millis() as u64,
            "bind mounting the volume to the target path is completed"
        );
        Ok(())
    }

    #[instrument(skip(self), fields(volume_id = %volume_id))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume ID must be provided".into(),
            ));
        }
        if target_path.is_empty() {
            return Err(CsiError::InvalidArgument(
                "target path must be provided".into(),
            ));
        }

        let target = Path::new(target_path);
        if !path_exists(target).await? {
            info!(path = %target_path, "target path does not exist");
            return Ok(());
        }
        if !self.mounter.is_mount_point(target)? {
            info!(path = %target_path, "not a mount point, removing path");
            return remove_target_path(target).await;
        }

        let _permit = self.semaphores.acquire_unmount().await?;

        info!("unmount started");
        let start = Instant::now();
        self.mounter.unmount(target).await?;
        info!(
            target_path = %target_path,
            unmount_ms = start.elapsed().as_millis() as u64,
            "unmounting volume completed"
        );
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        let metadata = self.metadata().await.map_err(|_| {
            CsiError::Internal("failed to get availability domain of node from cluster".into())
        })?;
        if metadata.availability_domain.is_empty() {
            return Err(CsiError::Internal(
                "failed to get availability domain of node from cluster".into(),
            ));
        }

        info!(
            node_id = %self.node_id,
            availability_domain = %metadata.availability_domain,
            "availability domain of node identified"
        );

        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            // The driver must only serve volumes in this particular AD.
            accessible_topology: Some(Topology {
                segments: [(
                    ZONE_TOPOLOGY_KEY.to_owned(),
                    metadata.availability_domain.clone(),
                )]
                .into(),
            }),
        })
    }
}

#[async_trait]
impl CsiIdentity for SharedFsNodeDriver {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: SHARED_FS_DRIVER_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        // Healthy when the kernel mount table is readable.
        Ok(self.mounter.is_mount_point(Path::new("/")).is_ok())
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::VolumeAccessibilityConstraints])
    }
}
