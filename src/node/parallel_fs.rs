//! Node driver for the parallel file-system (Lustre) backend.
//!
//! The Lustre client needs its network (L-net) configured for the label in
//! the volume handle before it can reach the servers; the driver performs
//! that setup on demand, applies optional post-mount tuning parameters, and
//! falls back to force-unmounts when L-net is down (regular unmounts hang
//! forever without an active network).

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::cluster::ClusterApi;
use crate::config::CsiConfig;
use crate::error::CsiError;
use crate::handle::ParallelFsHandle;
use crate::identity::CsiIdentity;
use crate::locks::{NodeSemaphores, VolumeLocks};
use crate::mount::Mounter;
use crate::node::metadata::NodeMetadata;
use crate::node::{ensure_target_dir, path_exists, remove_target_path, CsiNode};
use crate::types::{
    NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, PluginCapability, PluginInfo,
    Topology, VolumeId, LUSTRE_POST_MOUNT_PARAMETERS_KEY, LUSTRE_SUBNET_CIDR_KEY,
    PARALLEL_FS_DRIVER_NAME, SETUP_LNET_KEY, ZONE_TOPOLOGY_KEY,
};

/// The only filesystem type this driver accepts.
pub const FS_TYPE_LUSTRE: &str = "lustre";

// ---------------------------------------------------------------------------
// L-net service
// ---------------------------------------------------------------------------

/// Capability over the Lustre network-configuration tooling.
#[async_trait]
pub trait LnetService: Send + Sync {
    /// Configure L-net so the client can reach servers on `lnet_label`
    /// through the interface holding an address in `subnet_cidr`.
    async fn setup_lnet(&self, subnet_cidr: &str, lnet_label: &str) -> Result<(), CsiError>;

    /// Apply tuning parameters (`key=value` tokens) to the mounted client.
    async fn apply_parameters(&self, parameters: &str) -> Result<(), CsiError>;

    /// Whether L-net is currently configured for `lnet_label`.
    async fn is_lnet_active(&self, lnet_label: &str) -> bool;
}

/// Validate `key=value` tuning parameters before anything is mounted, so a
/// typo fails fast instead of after a rollback.
pub fn validate_parameters(parameters: &str) -> Result<(), CsiError> {
    if parameters.trim().is_empty() {
        return Err(CsiError::InvalidArgument(
            "lustre parameters must not be empty".into(),
        ));
    }
    for token in parameters.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {}
            _ => {
                return Err(CsiError::InvalidArgument(format!(
                    "lustre parameter {token:?} is not of the form key=value"
                )))
            }
        }
    }
    Ok(())
}

/// [`LnetService`] backed by the `lnetctl` / `lctl` binaries.
#[derive(Default)]
pub struct LnetctlService;

impl LnetctlService {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, CsiError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| CsiError::Internal(format!("{program}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            return Err(CsiError::Internal(format!("{program}: {stderr}")));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl LnetService for LnetctlService {
    async fn setup_lnet(&self, subnet_cidr: &str, lnet_label: &str) -> Result<(), CsiError> {
        info!(%subnet_cidr, %lnet_label, "configuring lnet");
        self.run("lnetctl", &["lnet", "configure"]).await?;
        let ip2nets = format!("{lnet_label} {subnet_cidr}");
        self.run("lnetctl", &["net", "add", "--ip2nets", ip2nets.as_str()])
            .await?;
        Ok(())
    }

    async fn apply_parameters(&self, parameters: &str) -> Result<(), CsiError> {
        for token in parameters.split_whitespace() {
            info!(parameter = token, "applying lustre parameter");
            self.run("lctl", &["set_param", token]).await?;
        }
        Ok(())
    }

    async fn is_lnet_active(&self, lnet_label: &str) -> bool {
        match self.run("lnetctl", &["net", "show", "--net", lnet_label]).await {
            Ok(output) => output.contains(lnet_label),
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Node driver for the parallel file-system backend.
pub struct ParallelFsNodeDriver {
    node_id: String,
    /// Node address used to derive the default L-net subnet.
    node_ip: IpAddr,
    cluster: Arc<dyn ClusterApi>,
    mounter: Arc<dyn Mounter>,
    lnet: Arc<dyn LnetService>,
    locks: Arc<VolumeLocks>,
    semaphores: Arc<NodeSemaphores>,
    metadata: OnceCell<NodeMetadata>,
    config: OnceCell<CsiConfig>,
}

impl ParallelFsNodeDriver {
    /// Create a driver with the production admission bounds.
    pub fn new(
        node_id: impl Into<String>,
        node_ip: IpAddr,
        cluster: Arc<dyn ClusterApi>,
        mounter: Arc<dyn Mounter>,
        lnet: Arc<dyn LnetService>,
    ) -> Self {
        Self::with_limits(
            node_id,
            node_ip,
            cluster,
            mounter,
            lnet,
            Arc::new(VolumeLocks::new()),
            Arc::new(NodeSemaphores::default()),
        )
    }

    /// Create a driver with injected lock table and semaphores.
    #[allow(clippy::too_many_arguments)]
    pub fn with_limits(
        node_id: impl Into<String>,
        node_ip: IpAddr,
        cluster: Arc<dyn ClusterApi>,
        mounter: Arc<dyn Mounter>,
        lnet: Arc<dyn LnetService>,
        locks: Arc<VolumeLocks>,
        semaphores: Arc<NodeSemaphores>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_ip,
            cluster,
            mounter,
            lnet,
            locks,
            semaphores,
            metadata: OnceCell::new(),
            config: OnceCell::new(),
        }
    }

    async fn metadata(&self) -> Result<&NodeMetadata, CsiError> {
        self.metadata
            .get_or_try_init(|| NodeMetadata::load(self.cluster.as_ref(), &self.node_id))
            .await
    }

    /// Driver configuration, fetched once and cached for the process
    /// lifetime.  A fetch failure falls back to the defaults.
    async fn csi_config(&self) -> &CsiConfig {
        self.config
            .get_or_init(|| async {
                info!("loading CSI driver configuration");
                match self.cluster.get_csi_config().await {
                    Ok(Some(config)) => config,
                    Ok(None) => CsiConfig::default(),
                    Err(e) => {
                        warn!(error = %e, "failed to load CSI configuration, using defaults");
                        CsiConfig::default()
                    }
                }
            })
            .await
    }

    async fn setup_lnet_if_requested(
        &self,
        req_context: &std::collections::HashMap<String, String>,
        handle: &ParallelFsHandle,
    ) -> Result<(), CsiError> {
        if req_context.get(SETUP_LNET_KEY).map(String::as_str) == Some("true") {
            let subnet_cidr = req_context
                .get(LUSTRE_SUBNET_CIDR_KEY)
                .cloned()
                .unwrap_or_else(|| format!("{}/32", self.node_ip));
            self.lnet
                .setup_lnet(&subnet_cidr, &handle.lnet_label)
                .await
                .map_err(|e| CsiError::Internal(format!("failed to setup lnet: {e}")))?;
        } else {
            info!("lnet setup skipped as it is disabled on the volume");
        }
        Ok(())
    }
}

#[async_trait]
impl CsiNode for ParallelFsNodeDriver {
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
        if req.volume_capability.fs_type != FS_TYPE_LUSTRE {
            return Err(CsiError::InvalidArgument(format!(
                "invalid fsType provided; only {FS_TYPE_LUSTRE:?} is supported on this driver"
            )));
        }

        let handle = ParallelFsHandle::parse(&req.volume_id.0)?;

        let config = self.csi_config().await;
        let post_mount_parameters = req.volume_context.get(LUSTRE_POST_MOUNT_PARAMETERS_KEY);
        if let Some(parameters) = post_mount_parameters {
            if !config.skip_lustre_parameters() {
                validate_parameters(parameters).map_err(|e| {
                    CsiError::InvalidArgument(format!("invalid lustre parameters provided: {e}"))
                })?;
            }
        }

        debug!(context = ?req.volume_context, "volume context");

        let _volume_guard = self.locks.try_acquire_or_abort(&req.volume_id.0)?;

        self.setup_lnet_if_requested(&req.volume_context, &handle)
            .await?;

        let _permit = self.semaphores.acquire_mount().await?;

        info!("stage started");

        let target = Path::new(&req.staging_target_path);
        if !path_exists(target).await? {
            info!(path = %req.staging_target_path, "staging path does not pre-exist, creating now");
            ensure_target_dir(target).await?;
        } else if self.mounter.is_mount_point(target)? {
            info!(path = %req.staging_target_path, "volume is already mounted");
            return Ok(());
        }

        self.mounter
            .mount(
                handle.mount_source(),
                target,
                FS_TYPE_LUSTRE,
                &req.volume_capability.mount_flags,
            )
            .await?;
        info!(
            source = handle.mount_source(),
            staging_target_path = %req.staging_target_path,
            "mounting the volume to the staging target path is completed"
        );

        if let Some(parameters) = post_mount_parameters {
            if config.skip_lustre_parameters() {
                info!(
                    parameters = %parameters,
                    "skipping application of lustre post-mount parameters per driver configuration"
                );
            } else if let Err(e) = self.lnet.apply_parameters(parameters).await {
                // Stage is failing, and unstage will never be called for a
                // failed stage; the volume must not stay mounted.
                let _ = self.mounter.unmount(target).await;
                return Err(CsiError::Internal(format!(
                    "failed to apply lustre post-mount parameters: {e}"
                )));
            }
        }

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

        let handle = ParallelFsHandle::parse(&volume_id.0)?;

        if self.csi_config().await.skip_node_unstage() {
            info!("skipping NodeUnstageVolume per driver configuration");
            return Ok(());
        }

        let _volume_guard = self.locks.try_acquire_or_abort(&volume_id.0)?;
        let _permit = self.semaphores.acquire_unmount().await?;

        info!("unstage started");

        let target = Path::new(staging_target_path);
        if !path_exists(target).await? {
            info!(path = %staging_target_path, "staging path does not exist");
            return Ok(());
        }

        if !self.lnet.is_lnet_active(&handle.lnet_label).await {
            // Regular unmounts hang forever without an active lnet.
            info!("performing force unmount as no active lnet configuration found");
            self.mounter.unmount_with_force(target).await?;
            info!(path = %staging_target_path, "unstage volume completed");
            return Ok(());
        }

        if !self.mounter.is_mount_point(target)? {
            info!(path = %staging_target_path, "not a mount point, removing path");
            return remove_target_path(target).await;
        }

        self.mounter.unmount(target).await?;
        info!(path = %staging_target_path, "unmounting volume completed");
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

        let handle = ParallelFsHandle::parse(&req.volume_id.0)?;
        debug!(context = ?req.volume_context, "volume context");

        self.setup_lnet_if_requested(&req.volume_context, &handle)
            .await?;

        let target = Path::new(&req.target_path);
        if !path_exists(target).await? {
            info!(path = %req.target_path, "target path does not exist, creating now");
            ensure_target_dir(target).await?;
        } else if self.mounter.is_mount_point(target)? {
            info!(path = %req.target_path, "volume is already mounted");
            return Ok(());
        }

        let _permit = self.semaphores.acquire_mount().await?;

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

        let handle = ParallelFsHandle::parse(&volume_id.0)?;

        info!("unmount started");

        let target = Path::new(target_path);
        if !path_exists(target).await? {
            info!(path = %target_path, "target path does not exist");
            return Ok(());
        }

        if !self.lnet.is_lnet_active(&handle.lnet_label).await {
            info!("performing force unmount as no active lnet configuration found");
            self.mounter.unmount_with_force(target).await?;
            info!(path = %target_path, "unmounting volume completed");
            return Ok(());
        }

        if !self.mounter.is_mount_point(target)? {
            info!(path = %target_path, "not a mount point, removing path");
            return remove_target_path(target).await;
        }

        let _permit = self.semaphores.acquire_unmount().await?;

        self.mounter.unmount(target).await?;
        info!(path = %target_path, "unmounting volume completed");
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

        Ok(NodeInfo {
            node_id: self.node_id.clone(),
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
impl CsiIdentity for ParallelFsNodeDriver {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: PARALLEL_FS_DRIVER_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(self.mounter.is_mount_point(Path::new("/")).is_ok())
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::VolumeAccessibilityConstraints])
    }
}
