//! Shared in-memory fakes for driver and lifecycle tests.
//!
//! [`FakeMounter`] records every mount-table mutation instead of touching
//! the kernel; [`FakeCluster`] is a hash-map cluster whose optional binding
//! template plays the provisioner (and whose pod deletion plays the
//! workload controller, rescheduling a replacement).  Tests that
//! manipulate shared state keep it behind plain mutexes; nothing here is
//! performance sensitive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cloud::{BlockStorage, Compute, InstanceLaunchOptions, VolumeAttachment};
use crate::cluster::objects::{
    Claim, ClaimRef, CsiVolumeSource, NodeAddress, NodeObject, ObjectMeta, Pod, PodPhase,
    ReclaimPolicy, VolumeObject, VolumePhase, VolumeSpec, VolumeStatus, Workload,
};
use crate::cluster::ClusterApi;
use crate::config::CsiConfig;
use crate::error::CsiError;
use crate::node::parallel_fs::LnetService;
use crate::types::{AccessMode, ZONE_TOPOLOGY_KEY};

// ---------------------------------------------------------------------------
// Mounter
// ---------------------------------------------------------------------------

/// A mount-table mutation observed by [`FakeMounter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Mount {
        source: String,
        target: PathBuf,
        fs_type: String,
        options: Vec<String>,
    },
    MountEncrypt {
        source: String,
        target: PathBuf,
        fs_type: String,
        options: Vec<String>,
    },
    Bind {
        source: PathBuf,
        target: PathBuf,
        read_only: bool,
    },
    Unmount(PathBuf),
    UnmountEncrypt(PathBuf),
    UnmountForce(PathBuf),
}

/// In-memory [`crate::mount::Mounter`].
#[derive(Default)]
pub struct FakeMounter {
    table: Mutex<HashMap<PathBuf, Vec<String>>>,
    calls: Mutex<Vec<MountCall>>,
    pub helper_installed: bool,
    pub fips: bool,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the mount table, as if a previous stage succeeded.
    pub fn record_existing_mount(&self, target: &Path, source: &str) {
        self.table
            .lock()
            .unwrap()
            .entry(target.to_path_buf())
            .or_default()
            .push(source.to_owned());
    }

    pub fn calls(&self) -> Vec<MountCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sources_at(&self, target: &Path) -> Vec<String> {
        self.table
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, call: MountCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn insert(&self, target: &Path, source: String) {
        self.table
            .lock()
            .unwrap()
            .entry(target.to_path_buf())
            .or_default()
            .push(source);
    }

    fn remove(&self, target: &Path) {
        self.table.lock().unwrap().remove(target);
    }

    /// Rewrite `host:export` to the loopback endpoint the encryption helper
    /// would report.
    fn tunnel_source(source: &str) -> String {
        match source.rfind(":/") {
            Some(idx) => format!("127.0.0.1:{}", &source[idx + 1..]),
            None => format!("127.0.0.1:{source}"),
        }
    }
}

#[async_trait]
impl crate::mount::Mounter for FakeMounter {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        self.record(MountCall::Mount {
            source: source.to_owned(),
            target: target.to_path_buf(),
            fs_type: fs_type.to_owned(),
            options: options.to_vec(),
        });
        self.insert(target, source.to_owned());
        Ok(())
    }

    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), CsiError> {
        self.record(MountCall::Bind {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            read_only,
        });
        self.insert(target, source.display().to_string());
        Ok(())
    }

    async fn mount_with_encrypt(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        self.record(MountCall::MountEncrypt {
            source: source.to_owned(),
            target: target.to_path_buf(),
            fs_type: fs_type.to_owned(),
            options: options.to_vec(),
        });
        self.insert(target, Self::tunnel_source(source));
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        self.record(MountCall::Unmount(target.to_path_buf()));
        self.remove(target);
        Ok(())
    }

    async fn unmount_with_encrypt(&self, target: &Path) -> Result<(), CsiError> {
        self.record(MountCall::UnmountEncrypt(target.to_path_buf()));
        self.remove(target);
        Ok(())
    }

    async fn unmount_with_force(&self, target: &Path) -> Result<(), CsiError> {
        self.record(MountCall::UnmountForce(target.to_path_buf()));
        self.remove(target);
        Ok(())
    }

    fn is_mount_point(&self, target: &Path) -> Result<bool, CsiError> {
        Ok(self.table.lock().unwrap().contains_key(target))
    }

    fn find_mount(&self, target: &Path) -> Result<Vec<String>, CsiError> {
        Ok(self.sources_at(target))
    }

    fn encryption_helper_installed(&self) -> Result<bool, CsiError> {
        Ok(self.helper_installed)
    }

    fn fips_enabled(&self) -> Result<bool, CsiError> {
        Ok(self.fips)
    }
}

// ---------------------------------------------------------------------------
// L-net
// ---------------------------------------------------------------------------

/// In-memory [`LnetService`].
pub struct FakeLnet {
    active: AtomicBool,
    apply_fails: AtomicBool,
    setup_calls: Mutex<Vec<(String, String)>>,
    applied: Mutex<Vec<String>>,
}

impl FakeLnet {
    pub fn new(active: bool) -> Self {
        Self {
            active: AtomicBool::new(active),
            apply_fails: AtomicBool::new(false),
            setup_calls: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn fail_apply(&self) {
        self.apply_fails.store(true, Ordering::SeqCst);
    }

    pub fn setup_calls(&self) -> Vec<(String, String)> {
        self.setup_calls.lock().unwrap().clone()
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl LnetService for FakeLnet {
    async fn setup_lnet(&self, subnet_cidr: &str, lnet_label: &str) -> Result<(), CsiError> {
        self.setup_calls
            .lock()
            .unwrap()
            .push((subnet_cidr.to_owned(), lnet_label.to_owned()));
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_parameters(&self, parameters: &str) -> Result<(), CsiError> {
        if self.apply_fails.load(Ordering::SeqCst) {
            return Err(CsiError::Internal("lctl set_param failed".into()));
        }
        self.applied.lock().unwrap().push(parameters.to_owned());
        Ok(())
    }

    async fn is_lnet_active(&self, _lnet_label: &str) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// How the fake provisioner shapes volumes it binds to new claims.
#[derive(Clone)]
pub struct BindTemplate {
    pub driver: String,
    pub access_modes: Vec<AccessMode>,
    pub reclaim_policy: ReclaimPolicy,
    pub volume_handle: String,
    pub fs_type: String,
}

impl Default for BindTemplate {
    fn default() -> Self {
        Self {
            driver: crate::types::SHARED_FS_DRIVER_NAME.to_owned(),
            access_modes: vec![AccessMode::ReadWriteMany],
            reclaim_policy: ReclaimPolicy::Retain,
            volume_handle: "ocid1.fs.oc1..a1,10.0.0.5,/export/vol".to_owned(),
            fs_type: "nfs".to_owned(),
        }
    }
}

/// In-memory [`ClusterApi`] with an optional instant provisioner and a
/// workload controller that reschedules deleted pods.
#[derive(Default)]
pub struct FakeCluster {
    claims: Mutex<HashMap<(String, String), Claim>>,
    volumes: Mutex<HashMap<String, VolumeObject>>,
    nodes: Mutex<Vec<NodeObject>>,
    pods: Mutex<HashMap<(String, String), Pod>>,
    workloads: Mutex<HashMap<(String, String), Workload>>,
    config: Mutex<Option<CsiConfig>>,
    bind: Mutex<Option<BindTemplate>>,
    canary: Mutex<Option<String>>,
    counter: AtomicU64,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let claim creation bind instantly, the way a provisioner would.
    pub fn enable_binding(&self, template: BindTemplate) {
        *self.bind.lock().unwrap() = Some(template);
    }

    pub fn set_csi_config(&self, config: CsiConfig) {
        *self.config.lock().unwrap() = Some(config);
    }

    pub fn put_node(&self, node: NodeObject) {
        self.nodes.lock().unwrap().push(node);
    }

    pub fn put_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().insert(
            (pod.meta.namespace.clone(), pod.meta.name.clone()),
            pod,
        );
    }

    pub fn put_volume(&self, volume: VolumeObject) {
        self.volumes
            .lock()
            .unwrap()
            .insert(volume.meta.name.clone(), volume);
    }

    pub fn volume(&self, name: &str) -> Option<VolumeObject> {
        self.volumes.lock().unwrap().get(name).cloned()
    }

    /// A worker node with IPv4 and IPv6 addresses in the given zone.
    pub fn put_dual_stack_node(&self, name: &str, zone: &str) {
        self.put_node(simple_node(name, zone, &["10.0.1.7", "fd00::7"]));
    }

    /// A worker node with only an IPv4 address in the given zone.
    pub fn put_ipv4_node(&self, name: &str, zone: &str) {
        self.put_node(simple_node(name, zone, &["10.0.1.7"]));
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn spawn_pod_for(&self, workload: &Workload) {
        let name = format!("{}-pod-{}", workload.meta.name, self.next());
        let node_name = self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.is_schedulable_worker())
            .map(|n| n.meta.name.clone());
        let pod = Pod {
            meta: ObjectMeta {
                namespace: workload.meta.namespace.clone(),
                name: name.clone(),
                uid: format!("uid-{}", self.next()),
                labels: workload.spec.selector.clone(),
                annotations: HashMap::new(),
            },
            node_name,
            phase: PodPhase::Running,
        };
        self.pods
            .lock()
            .unwrap()
            .insert((pod.meta.namespace.clone(), name), pod);
    }
}

/// A schedulable worker node for tests.
pub fn simple_node(name: &str, zone: &str, addresses: &[&str]) -> NodeObject {
    NodeObject {
        meta: ObjectMeta {
            name: name.into(),
            labels: HashMap::from([(ZONE_TOPOLOGY_KEY.to_owned(), zone.to_owned())]),
            ..Default::default()
        },
        unschedulable: false,
        taints: Vec::new(),
        addresses: addresses
            .iter()
            .map(|a| NodeAddress {
                address_type: "InternalIP".into(),
                address: (*a).into(),
            })
            .collect(),
        provider_id: format!("oci://instance-{name}"),
    }
}

fn selector_matches(selector: &HashMap<String, String>, labels: &HashMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<Claim>, CsiError> {
        Ok(self
            .claims
            .lock()
            .unwrap()
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned())
    }

    async fn create_claim(&self, mut claim: Claim) -> Result<Claim, CsiError> {
        claim.meta.uid = format!("uid-{}", self.next());

        if let Some(template) = self.bind.lock().unwrap().clone() {
            let volume_name = format!("pv-{}", claim.meta.name);
            let volume = VolumeObject {
                meta: ObjectMeta {
                    name: volume_name.clone(),
                    uid: format!("uid-{}", self.next()),
                    ..Default::default()
                },
                spec: VolumeSpec {
                    capacity: claim.spec.requested_storage.clone(),
                    access_modes: template.access_modes.clone(),
                    reclaim_policy: template.reclaim_policy,
                    mount_options: Vec::new(),
                    csi: CsiVolumeSource {
                        driver: template.driver.clone(),
                        volume_handle: template.volume_handle.clone(),
                        fs_type: template.fs_type.clone(),
                        volume_attributes: HashMap::new(),
                    },
                    volume_mode: claim.spec.volume_mode,
                    claim_ref: Some(ClaimRef {
                        namespace: claim.meta.namespace.clone(),
                        name: claim.meta.name.clone(),
                        uid: claim.meta.uid.clone(),
                    }),
                },
                status: VolumeStatus {
                    phase: VolumePhase::Bound,
                },
            };
            self.put_volume(volume);
            claim.spec.volume_name = Some(volume_name);
            claim.status.phase = crate::cluster::objects::ClaimPhase::Bound;
        }

        self.claims.lock().unwrap().insert(
            (claim.meta.namespace.clone(), claim.meta.name.clone()),
            claim.clone(),
        );
        Ok(claim)
    }

    async fn update_claim(&self, claim: Claim) -> Result<Claim, CsiError> {
        let key = (claim.meta.namespace.clone(), claim.meta.name.clone());
        if !self.claims.lock().unwrap().contains_key(&key) {
            return Err(CsiError::ClusterError(format!(
                "claim {}/{} not found",
                key.0, key.1
            )));
        }

        // The fake resizer immediately reflects a larger request on the
        // bound volume.
        if self.bind.lock().unwrap().is_some() {
            if let Some(volume_name) = claim.spec.volume_name.as_deref() {
                if let Some(volume) = self.volumes.lock().unwrap().get_mut(volume_name) {
                    volume.spec.capacity = claim.spec.requested_storage.clone();
                }
            }
        }

        self.claims.lock().unwrap().insert(key, claim.clone());
        Ok(claim)
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), CsiError> {
        let removed = self
            .claims
            .lock()
            .unwrap()
            .remove(&(namespace.to_owned(), name.to_owned()));
        if let Some(volume_name) = removed.and_then(|c| c.spec.volume_name) {
            let mut volumes = self.volumes.lock().unwrap();
            let policy = volumes.get(&volume_name).map(|v| v.spec.reclaim_policy);
            match policy {
                Some(ReclaimPolicy::Delete) => {
                    volumes.remove(&volume_name);
                }
                Some(ReclaimPolicy::Retain) => {
                    if let Some(volume) = volumes.get_mut(&volume_name) {
                        volume.status.phase = VolumePhase::Released;
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    async fn get_volume(&self, name: &str) -> Result<Option<VolumeObject>, CsiError> {
        Ok(self.volumes.lock().unwrap().get(name).cloned())
    }

    async fn patch_volume_reclaim_policy(
        &self,
        name: &str,
        policy: ReclaimPolicy,
    ) -> Result<(), CsiError> {
        let mut volumes = self.volumes.lock().unwrap();
        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| CsiError::ClusterError(format!("volume {name} not found")))?;
        volume.spec.reclaim_policy = policy;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeObject>, CsiError> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeObject>, CsiError> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.meta.name == name)
            .cloned())
    }

    async fn create_workload(&self, mut workload: Workload) -> Result<Workload, CsiError> {
        workload.meta.uid = format!("uid-{}", self.next());
        workload.status.available_replicas = workload.spec.replicas;
        for _ in 0..workload.spec.replicas {
            self.spawn_pod_for(&workload);
        }
        self.workloads.lock().unwrap().insert(
            (workload.meta.namespace.clone(), workload.meta.name.clone()),
            workload.clone(),
        );
        Ok(workload)
    }

    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>, CsiError> {
        Ok(self
            .workloads
            .lock()
            .unwrap()
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<Pod>, CsiError> {
        let mut pods: Vec<Pod> = self
            .pods
            .lock()
            .unwrap()
            .values()
            .filter(|pod| {
                pod.meta.namespace == namespace && selector_matches(selector, &pod.meta.labels)
            })
            .cloned()
            .collect();
        pods.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));
        Ok(pods)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, CsiError> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), CsiError> {
        let removed = self
            .pods
            .lock()
            .unwrap()
            .remove(&(namespace.to_owned(), name.to_owned()));

        // Play the workload controller: a deleted pod that belonged to a
        // workload gets a replacement.
        if let Some(pod) = removed {
            let owners: Vec<Workload> = self
                .workloads
                .lock()
                .unwrap()
                .values()
                .filter(|w| {
                    w.meta.namespace == namespace
                        && selector_matches(&w.spec.selector, &pod.meta.labels)
                })
                .cloned()
                .collect();
            for workload in owners {
                self.spawn_pod_for(&workload);
            }
        }
        Ok(())
    }

    async fn exec(&self, _namespace: &str, _pod: &str, command: &str) -> Result<String, CsiError> {
        if command.contains("echo") {
            // Writer command; capture the quoted canary.
            let mut quoted = command.split('"');
            let _ = quoted.next();
            if let Some(canary) = quoted.next() {
                *self.canary.lock().unwrap() = Some(canary.to_owned());
            }
            Ok(String::new())
        } else {
            // Reader command; return whatever was written.
            Ok(self.canary.lock().unwrap().clone().unwrap_or_default())
        }
    }

    async fn get_csi_config(&self) -> Result<Option<CsiConfig>, CsiError> {
        Ok(self.config.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// Cloud
// ---------------------------------------------------------------------------

/// In-memory [`Compute`].
#[derive(Default)]
pub struct FakeCompute {
    pub attachment: Mutex<Option<VolumeAttachment>>,
    pub launch_encryption: AtomicBool,
}

#[async_trait]
impl Compute for FakeCompute {
    async fn find_volume_attachment(
        &self,
        _compartment_id: &str,
        _volume_handle: &str,
        _instance_id: &str,
    ) -> Result<Option<VolumeAttachment>, CsiError> {
        Ok(self.attachment.lock().unwrap().clone())
    }

    async fn instance_launch_options(
        &self,
        _instance_id: &str,
    ) -> Result<InstanceLaunchOptions, CsiError> {
        Ok(InstanceLaunchOptions {
            in_transit_encryption: self.launch_encryption.load(Ordering::SeqCst),
        })
    }
}

/// In-memory [`BlockStorage`].
pub struct FakeBlockStorage {
    pub vpus_per_gb: i64,
}

#[async_trait]
impl BlockStorage for FakeBlockStorage {
    async fn volume_performance(&self, _volume_handle: &str) -> Result<i64, CsiError> {
        Ok(self.vpus_per_gb)
    }
}
