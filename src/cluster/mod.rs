//! Narrow interface to the container orchestrator.
//!
//! The node drivers and the claim lifecycle never import orchestrator
//! client types; everything goes through [`ClusterApi`], a handful of
//! get/create/update/delete/list operations on the typed objects in
//! [`objects`].  Tests substitute an in-memory implementation.

pub mod objects;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::CsiConfig;
use crate::error::CsiError;
use objects::{Claim, NodeObject, Pod, ReclaimPolicy, VolumeObject, Workload};

/// Get/create/update/delete/list on the handful of typed kinds the crate
/// consumes.  All getters return `Ok(None)` for missing objects; transport
/// and server faults surface as [`CsiError::ClusterError`].
#[async_trait]
pub trait ClusterApi: Send + Sync {
    // --- Claims -----------------------------------------------------------
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<Claim>, CsiError>;
    async fn create_claim(&self, claim: Claim) -> Result<Claim, CsiError>;
    async fn update_claim(&self, claim: Claim) -> Result<Claim, CsiError>;
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), CsiError>;

    // --- Volumes ----------------------------------------------------------
    async fn get_volume(&self, name: &str) -> Result<Option<VolumeObject>, CsiError>;
    async fn patch_volume_reclaim_policy(
        &self,
        name: &str,
        policy: ReclaimPolicy,
    ) -> Result<(), CsiError>;

    // --- Nodes ------------------------------------------------------------
    async fn list_nodes(&self) -> Result<Vec<NodeObject>, CsiError>;
    async fn get_node(&self, name: &str) -> Result<Option<NodeObject>, CsiError>;

    // --- Workloads & pods -------------------------------------------------
    async fn create_workload(&self, workload: Workload) -> Result<Workload, CsiError>;
    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>, CsiError>;
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<Pod>, CsiError>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, CsiError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), CsiError>;

    /// Run a shell command inside a pod and return its stdout.
    async fn exec(&self, namespace: &str, pod: &str, command: &str) -> Result<String, CsiError>;

    // --- Config -----------------------------------------------------------
    /// The driver configuration object, if the operator created one.
    async fn get_csi_config(&self) -> Result<Option<CsiConfig>, CsiError>;
}
