//! Claim lifecycle state machine.
//!
//! Drives a volume claim through its full life: template → created →
//! bound → attached to a workload → data verified across a pod restart →
//! torn down.  Everything happens through the narrow [`ClusterApi`]
//! trait; the node drivers are only reached indirectly through the
//! cluster objects, exactly as in production.
//!
//! Phase observations are polls at a fixed interval against the cluster
//! API; every await is bounded by a timeout and failure is an error, not a
//! hang.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::cloud::{AttachmentMode, BlockStorage, Compute};
use crate::cluster::objects::{
    Claim, ClaimPhase, ClaimSpec, ClaimStatus, NodeObject, ObjectMeta, Quantity, ReclaimPolicy,
    VolumePhase, Workload, WorkloadSpec, WorkloadStatus,
};
use crate::cluster::ClusterApi;
use crate::error::CsiError;
use crate::types::{
    AccessMode, VolumeMode, COMPARTMENT_ID_ANNOTATION, PARALLEL_FS_DRIVER_NAME,
    SHARED_FS_DRIVER_NAME, ZONE_TOPOLOGY_KEY,
};

/// Label carrying the lifecycle instance id on every object it creates.
pub const ID_LABEL: &str = "lifecycle.remotefs.io/id";

/// Label carrying the lifecycle instance name on every object it creates.
pub const NAME_LABEL: &str = "lifecycle.remotefs.io/name";

/// Default bound on every phase await.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Fixed polling interval for phase observations.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Interval and attempt bound for capacity re-checks after an expansion.
const RESIZE_POLL_INTERVAL: Duration = Duration::from_secs(10);
const RESIZE_POLL_ATTEMPTS: u32 = 6;

/// Canary written and re-read by the filesystem persistence scenario.
const FILESYSTEM_CANARY: &str = "Data written";

/// Canary written and re-read by the raw-block persistence scenario.
const BLOCK_CANARY: &str = "Hello CSI Tester for RBV";

/// Drives claims, volumes and workloads through their lifecycle.
pub struct ClaimLifecycle {
    id: String,
    name: String,
    labels: HashMap<String, String>,
    cluster: Arc<dyn ClusterApi>,
    poll_interval: Duration,
    timeout: Duration,
    resize_interval: Duration,
    resize_attempts: u32,
    sequence: AtomicU64,
}

impl ClaimLifecycle {
    /// Allocate a lifecycle instance with the production intervals.
    pub fn new(cluster: Arc<dyn ClusterApi>, name: impl Into<String>) -> Self {
        let name = name.into();
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            labels: HashMap::from([
                (ID_LABEL.to_owned(), id.clone()),
                (NAME_LABEL.to_owned(), name.clone()),
            ]),
            id,
            name,
            cluster,
            poll_interval: POLL_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            resize_interval: RESIZE_POLL_INTERVAL,
            resize_attempts: RESIZE_POLL_ATTEMPTS,
            sequence: AtomicU64::new(0),
        }
    }

    /// Allocate a lifecycle instance with custom pacing, for tests.
    pub fn with_intervals(
        cluster: Arc<dyn ClusterApi>,
        name: impl Into<String>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        let mut lifecycle = Self::new(cluster, name);
        lifecycle.poll_interval = poll_interval;
        lifecycle.timeout = timeout;
        lifecycle.resize_interval = poll_interval;
        lifecycle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    /// A fresh claim template carrying the lifecycle labels and a unique
    /// name.  Callers refine it with the builder methods on [`Claim`].
    pub fn claim_template(&self, namespace: &str, size: &str) -> Claim {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst);
        Claim {
            meta: ObjectMeta {
                namespace: namespace.to_owned(),
                name: format!("{}-{n}", self.name),
                uid: String::new(),
                labels: self.labels.clone(),
                annotations: HashMap::new(),
            },
            spec: ClaimSpec {
                requested_storage: Quantity::new(size),
                access_modes: vec![AccessMode::ReadWriteMany],
                volume_mode: Some(VolumeMode::Filesystem),
                storage_class: None,
                data_source: None,
                selector_zone: None,
                volume_name: None,
            },
            status: ClaimStatus::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Claim operations
    // -----------------------------------------------------------------------

    /// Submit a claim, applying an optional tweak first.
    pub async fn create_claim(
        &self,
        mut claim: Claim,
        tweak: Option<&(dyn Fn(&mut Claim) + Send + Sync)>,
    ) -> Result<Claim, CsiError> {
        if let Some(tweak) = tweak {
            tweak(&mut claim);
        }
        info!(
            namespace = %claim.meta.namespace,
            name = %claim.meta.name,
            size = %claim.spec.requested_storage,
            "creating claim"
        );
        self.cluster.create_claim(claim).await
    }

    /// Submit a claim, wait for it to bind, and sanity-check the binding.
    pub async fn create_and_await_bound(
        &self,
        claim: Claim,
        tweak: Option<&(dyn Fn(&mut Claim) + Send + Sync)>,
    ) -> Result<Claim, CsiError> {
        let claim = self.create_claim(claim, tweak).await?;
        let bound = self
            .await_claim_phase(
                &claim.meta.namespace,
                &claim.meta.name,
                ClaimPhase::Bound,
                self.timeout,
            )
            .await?;
        self.sanity_check_binding(&bound).await?;
        Ok(bound)
    }

    /// Poll until the claim reports `phase`, or fail at the timeout.
    pub async fn await_claim_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: ClaimPhase,
        timeout: Duration,
    ) -> Result<Claim, CsiError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(claim) = self.cluster.get_claim(namespace, name).await? {
                if claim.status.phase == phase {
                    return Ok(claim);
                }
                debug!(
                    %namespace, %name,
                    current = ?claim.status.phase,
                    wanted = ?phase,
                    "claim not yet in wanted phase"
                );
            }
            if Instant::now() >= deadline {
                return Err(CsiError::Internal(format!(
                    "claim {namespace}/{name} not in phase {phase:?} within {timeout:?}"
                )));
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Poll until the volume reports `phase`, or fail at the timeout.
    pub async fn await_volume_phase(
        &self,
        name: &str,
        phase: VolumePhase,
        timeout: Duration,
    ) -> Result<(), CsiError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(volume) = self.cluster.get_volume(name).await? {
                if volume.status.phase == phase {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(CsiError::Internal(format!(
                    "volume {name} not in phase {phase:?} within {timeout:?}"
                )));
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Poll until the volume object is gone, or fail at the timeout.
    pub async fn await_volume_gone(&self, name: &str, timeout: Duration) -> Result<(), CsiError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.cluster.get_volume(name).await?.is_none() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CsiError::Internal(format!(
                    "volume {name} still present after {timeout:?}"
                )));
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Assert that a bound claim and its volume actually point at each
    /// other and agree on capacity and access modes.
    pub async fn sanity_check_binding(&self, claim: &Claim) -> Result<(), CsiError> {
        let claim = self
            .cluster
            .get_claim(&claim.meta.namespace, &claim.meta.name)
            .await?
            .ok_or_else(|| {
                CsiError::Internal(format!("claim {} disappeared", claim.meta.name))
            })?;

        let volume_name = claim.spec.volume_name.clone().ok_or_else(|| {
            CsiError::Internal(format!("claim {} has no bound volume", claim.meta.name))
        })?;
        let volume = self
            .cluster
            .get_volume(&volume_name)
            .await?
            .ok_or_else(|| CsiError::Internal(format!("volume {volume_name} not found")))?;

        if !volume.spec.capacity.same_as(&claim.spec.requested_storage) {
            return Err(CsiError::Internal(format!(
                "volume capacity {} does not equal claim request {}",
                volume.spec.capacity, claim.spec.requested_storage
            )));
        }

        let driver = volume.spec.csi.driver.as_str();
        if driver == SHARED_FS_DRIVER_NAME || driver == PARALLEL_FS_DRIVER_NAME {
            if volume.spec.access_modes != [AccessMode::ReadWriteMany] {
                return Err(CsiError::Internal(format!(
                    "file-system volume must carry exactly ReadWriteMany, got {:?}",
                    volume.spec.access_modes
                )));
            }
        } else {
            let allowed = [AccessMode::ReadWriteOnce, AccessMode::ReadWriteMany];
            if !volume
                .spec
                .access_modes
                .iter()
                .all(|mode| allowed.contains(mode))
            {
                return Err(CsiError::Internal(format!(
                    "block volume access modes {:?} exceed {allowed:?}",
                    volume.spec.access_modes
                )));
            }
        }

        let claim_ref = volume.spec.claim_ref.as_ref().ok_or_else(|| {
            CsiError::Internal(format!("volume {volume_name} has no claim reference"))
        })?;
        if claim_ref.name != claim.meta.name
            || claim_ref.namespace != claim.meta.namespace
            || claim_ref.uid != claim.meta.uid
        {
            return Err(CsiError::Internal(format!(
                "volume {volume_name} claim reference {claim_ref:?} does not match claim {}/{} ({})",
                claim.meta.namespace, claim.meta.name, claim.meta.uid
            )));
        }
        if volume.meta.name != volume_name {
            return Err(CsiError::Internal(format!(
                "claim volumeName {volume_name} does not match volume {}",
                volume.meta.name
            )));
        }
        Ok(())
    }

    /// Request a new size for a bound claim and wait until the volume
    /// capacity reflects it.
    pub async fn expand_claim(
        &self,
        namespace: &str,
        name: &str,
        new_size: Quantity,
    ) -> Result<Claim, CsiError> {
        let current = self
            .cluster
            .get_claim(namespace, name)
            .await?
            .ok_or_else(|| CsiError::Internal(format!("claim {namespace}/{name} not found")))?;

        let mut updated = current.clone();
        updated.spec.requested_storage = new_size.clone();
        info!(%namespace, %name, size = %new_size, "expanding claim");
        let claim = self.cluster.update_claim(updated).await?;

        let volume_name = claim.spec.volume_name.clone().ok_or_else(|| {
            CsiError::Internal(format!("claim {namespace}/{name} has no bound volume"))
        })?;

        for attempt in 0..self.resize_attempts {
            let volume = self
                .cluster
                .get_volume(&volume_name)
                .await?
                .ok_or_else(|| CsiError::Internal(format!("volume {volume_name} not found")))?;
            if volume.spec.capacity.same_as(&new_size) {
                info!(%volume_name, capacity = %volume.spec.capacity, "volume resized");
                return Ok(claim);
            }
            debug!(
                attempt,
                capacity = %volume.spec.capacity,
                wanted = %new_size,
                "volume capacity not yet updated"
            );
            sleep(self.resize_interval).await;
        }
        Err(CsiError::Internal(format!(
            "volume {volume_name} capacity did not reach {new_size} after {} attempts",
            self.resize_attempts
        )))
    }

    /// Delete a claim and wait for it to disappear.
    pub async fn delete_claim_and_await(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), CsiError> {
        info!(%namespace, %name, "deleting claim");
        self.cluster.delete_claim(namespace, name).await?;
        let deadline = Instant::now() + self.timeout;
        loop {
            if self.cluster.get_claim(namespace, name).await?.is_none() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CsiError::Internal(format!(
                    "claim {namespace}/{name} still present after {:?}",
                    self.timeout
                )));
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Verify the volume capacity recorded on the bound volume object.
    pub async fn check_volume_capacity(
        &self,
        expected: &Quantity,
        namespace: &str,
        name: &str,
    ) -> Result<(), CsiError> {
        let volume_name = self.volume_name_from_claim(namespace, name).await?;
        let volume = self
            .cluster
            .get_volume(&volume_name)
            .await?
            .ok_or_else(|| CsiError::Internal(format!("volume {volume_name} not found")))?;
        if !volume.spec.capacity.same_as(expected) {
            return Err(CsiError::Internal(format!(
                "expected volume to be {expected} but got {}",
                volume.spec.capacity
            )));
        }
        Ok(())
    }

    /// Flip a volume's reclaim policy.
    pub async fn change_reclaim_policy(
        &self,
        volume_name: &str,
        policy: ReclaimPolicy,
    ) -> Result<(), CsiError> {
        info!(%volume_name, ?policy, "changing volume reclaim policy");
        self.cluster
            .patch_volume_reclaim_policy(volume_name, policy)
            .await
    }

    /// The name of the volume bound to a claim.
    pub async fn volume_name_from_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<String, CsiError> {
        let claim = self
            .cluster
            .get_claim(namespace, name)
            .await?
            .ok_or_else(|| CsiError::Internal(format!("claim {namespace}/{name} not found")))?;
        claim.spec.volume_name.ok_or_else(|| {
            CsiError::Internal(format!("could not obtain volume name from claim {name}"))
        })
    }

    /// Schedulable worker nodes in a zone, in list order.
    pub async fn list_schedulable_nodes_in_zone(
        &self,
        zone: &str,
    ) -> Result<Vec<NodeObject>, CsiError> {
        let nodes: Vec<NodeObject> = self
            .cluster
            .list_nodes()
            .await?
            .into_iter()
            .filter(|node| {
                node.is_schedulable_worker()
                    && node.meta.labels.get(ZONE_TOPOLOGY_KEY).map(String::as_str) == Some(zone)
            })
            .collect();
        if nodes.is_empty() {
            return Err(CsiError::Internal(format!(
                "no schedulable nodes found in zone {zone}"
            )));
        }
        Ok(nodes)
    }

    // -----------------------------------------------------------------------
    // Workload scenarios
    // -----------------------------------------------------------------------

    /// Write a canary through a controller-managed workload, delete the
    /// writer pod, wait for the controller to replace it, and assert the
    /// replacement reads the canary back.
    pub async fn data_persistence_scenario(
        &self,
        namespace: &str,
        claim_name: &str,
        mode: VolumeMode,
    ) -> Result<(), CsiError> {
        let nodes = self.cluster.list_nodes().await?;
        if nodes.is_empty() {
            return Err(CsiError::Internal(
                "no worker nodes are present in the cluster".into(),
            ));
        }
        // First schedulable non-control-plane node by list order.
        let node = nodes
            .iter()
            .find(|node| node.is_schedulable_worker())
            .ok_or_else(|| CsiError::Internal("no schedulable nodes found".into()))?;

        let (canary, write_command, read_command) = match mode {
            VolumeMode::Filesystem => (
                FILESYSTEM_CANARY,
                format!("echo \"{FILESYSTEM_CANARY}\" >> /data/out.txt"),
                "cat /data/out.txt".to_owned(),
            ),
            VolumeMode::Block => (
                BLOCK_CANARY,
                format!(
                    "echo \"{BLOCK_CANARY}\" > /tmp/test.txt; dd if=/tmp/test.txt of=/dev/xvda count=1"
                ),
                "dd if=/dev/xvda bs=512 count=1".to_owned(),
            ),
        };

        let workload_name = format!("{}-persistence-{}", self.name, self.sequence.fetch_add(1, Ordering::SeqCst));
        let workload = Workload {
            meta: ObjectMeta {
                namespace: namespace.to_owned(),
                name: workload_name.clone(),
                uid: String::new(),
                labels: self.labels.clone(),
                annotations: HashMap::new(),
            },
            spec: WorkloadSpec {
                replicas: 1,
                selector: HashMap::from([("app".to_owned(), workload_name.clone())]),
                claim_name: claim_name.to_owned(),
                node_selector: node.meta.labels.clone(),
                command: "while true; do true; done".to_owned(),
                raw_block: mode == VolumeMode::Block,
            },
            status: WorkloadStatus::default(),
        };

        info!(%namespace, %workload_name, node = %node.meta.name, "creating persistence workload");
        let workload = self.cluster.create_workload(workload).await?;
        self.await_workload_available(namespace, &workload.meta.name, 1)
            .await?;

        let pods = self
            .cluster
            .list_pods(namespace, &workload.spec.selector)
            .await?;
        let writer = pods
            .first()
            .ok_or_else(|| CsiError::Internal("workload produced no pods".into()))?
            .clone();

        info!(pod = %writer.meta.name, "writing canary");
        self.cluster
            .exec(namespace, &writer.meta.name, &write_command)
            .await?;

        info!(pod = %writer.meta.name, "deleting writer pod");
        self.cluster.delete_pod(namespace, &writer.meta.name).await?;
        self.await_pod_gone(namespace, &writer.meta.name).await?;
        self.await_workload_available(namespace, &workload.meta.name, 1)
            .await?;

        let pods = self
            .cluster
            .list_pods(namespace, &workload.spec.selector)
            .await?;
        let reader = pods
            .first()
            .ok_or_else(|| CsiError::Internal("workload was not rescheduled".into()))?;

        info!(pod = %reader.meta.name, "reading canary back");
        let output = self
            .cluster
            .exec(namespace, &reader.meta.name, &read_command)
            .await?;
        if !output.trim().contains(canary) {
            return Err(CsiError::Internal(format!(
                "written data not found on the volume; wrote {canary:?}, found {:?}",
                output.trim()
            )));
        }
        Ok(())
    }

    async fn await_workload_available(
        &self,
        namespace: &str,
        name: &str,
        replicas: u32,
    ) -> Result<(), CsiError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(workload) = self.cluster.get_workload(namespace, name).await? {
                if workload.status.available_replicas >= replicas {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(CsiError::Internal(format!(
                    "workload {namespace}/{name} not available after {:?}",
                    self.timeout
                )));
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn await_pod_gone(&self, namespace: &str, name: &str) -> Result<(), CsiError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if self.cluster.get_pod(namespace, name).await?.is_none() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CsiError::Internal(format!(
                    "pod {namespace}/{name} still present after {:?}",
                    self.timeout
                )));
            }
            sleep(self.poll_interval).await;
        }
    }

    // -----------------------------------------------------------------------
    // Cloud cross-checks
    // -----------------------------------------------------------------------

    /// Determine how the claim's volume is attached to the node running
    /// `pod_name`, and cross-check it against the instance's in-transit
    /// encryption launch option.  The backend's report is authoritative,
    /// but an encryption mismatch between instance and attachment is a
    /// hard failure.
    pub async fn check_attachment_mode(
        &self,
        compute: &dyn Compute,
        namespace: &str,
        claim_name: &str,
        pod_name: &str,
        mut expected: AttachmentMode,
    ) -> Result<AttachmentMode, CsiError> {
        let pod = self
            .cluster
            .get_pod(namespace, pod_name)
            .await?
            .ok_or_else(|| CsiError::Internal(format!("pod {pod_name} not found")))?;
        let node_name = pod
            .node_name
            .ok_or_else(|| CsiError::Internal(format!("pod {pod_name} is not scheduled")))?;
        let node = self
            .cluster
            .get_node(&node_name)
            .await?
            .ok_or_else(|| CsiError::Internal(format!("node {node_name} not found")))?;

        let instance_id = node.provider_id.replace("oci://", "");
        if instance_id.is_empty() {
            return Err(CsiError::Internal("node provider id is empty".into()));
        }
        let compartment_id = node
            .meta
            .annotations
            .get(COMPARTMENT_ID_ANNOTATION)
            .ok_or_else(|| {
                CsiError::Internal("node compartment-id annotation should not be empty".into())
            })?;

        let volume_name = self.volume_name_from_claim(namespace, claim_name).await?;
        let volume = self
            .cluster
            .get_volume(&volume_name)
            .await?
            .ok_or_else(|| CsiError::Internal(format!("volume {volume_name} not found")))?;

        let attachment = compute
            .find_volume_attachment(compartment_id, &volume.spec.csi.volume_handle, &instance_id)
            .await?
            .ok_or_else(|| {
                CsiError::Internal(format!(
                    "no volume attachment found for volume {volume_name}"
                ))
            })?;

        let launch = compute.instance_launch_options(&instance_id).await?;
        // Instances launched with in-transit encryption always attach
        // paravirtualized, whatever the storage class asked for.
        if launch.in_transit_encryption {
            expected = AttachmentMode::Paravirtualized;
        }
        if attachment.mode != expected {
            return Err(CsiError::Internal(format!(
                "expected attachment mode {expected:?} but got {:?}",
                attachment.mode
            )));
        }
        if attachment.in_transit_encryption != launch.in_transit_encryption {
            return Err(CsiError::Internal(format!(
                "instance launch option has in-transit encryption {}, but volume attachment has {}",
                launch.in_transit_encryption, attachment.in_transit_encryption
            )));
        }
        Ok(attachment.mode)
    }

    /// Verify the performance tier recorded on the backend volume.
    pub async fn check_volume_performance(
        &self,
        block_storage: &dyn BlockStorage,
        namespace: &str,
        claim_name: &str,
        expected_vpus_per_gb: i64,
    ) -> Result<(), CsiError> {
        let volume_name = self.volume_name_from_claim(namespace, claim_name).await?;
        let volume = self
            .cluster
            .get_volume(&volume_name)
            .await?
            .ok_or_else(|| CsiError::Internal(format!("volume {volume_name} not found")))?;
        let actual = block_storage
            .volume_performance(&volume.spec.csi.volume_handle)
            .await?;
        if actual != expected_vpus_per_gb {
            return Err(CsiError::Internal(format!(
                "expected volume performance level {expected_vpus_per_gb} but got {actual}"
            )));
        }
        Ok(())
    }
}
