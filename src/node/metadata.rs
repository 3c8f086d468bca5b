//! Cached node metadata.
//!
//! The drivers need the node's availability domain and which IP families
//! its network supports.  Both come from the node object in the cluster;
//! they are loaded on the first RPC that needs them and never change for
//! the lifetime of the process.  Drivers hold the struct behind a
//! `tokio::sync::OnceCell`, so concurrent first callers coordinate and
//! later readers see the populated value without touching the cluster.

use std::net::IpAddr;

use tracing::info;

use crate::cluster::ClusterApi;
use crate::error::CsiError;
use crate::types::ZONE_TOPOLOGY_KEY;

/// Immutable facts about the node this driver runs on.
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub node_id: String,
    /// Fault-isolation zone the node lives in.
    pub availability_domain: String,
    pub ipv4_enabled: bool,
    pub ipv6_enabled: bool,
}

impl NodeMetadata {
    /// Fetch the node object and derive the metadata.
    pub async fn load(cluster: &dyn ClusterApi, node_id: &str) -> Result<Self, CsiError> {
        let node = cluster
            .get_node(node_id)
            .await?
            .ok_or_else(|| CsiError::ClusterError(format!("node {node_id} not found")))?;

        let availability_domain = node
            .meta
            .labels
            .get(ZONE_TOPOLOGY_KEY)
            .cloned()
            .unwrap_or_default();

        let mut ipv4_enabled = false;
        let mut ipv6_enabled = false;
        for address in &node.addresses {
            match address.address.parse::<IpAddr>() {
                Ok(IpAddr::V4(_)) => ipv4_enabled = true,
                Ok(IpAddr::V6(_)) => ipv6_enabled = true,
                Err(_) => {}
            }
        }

        info!(
            %node_id,
            %availability_domain,
            ipv4_enabled,
            ipv6_enabled,
            "node metadata loaded"
        );

        Ok(Self {
            node_id: node_id.to_owned(),
            availability_domain,
            ipv4_enabled,
            ipv6_enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::objects::{NodeAddress, NodeObject, ObjectMeta};
    use crate::test_support::FakeCluster;
    use std::collections::HashMap;

    fn node(name: &str, addresses: &[&str]) -> NodeObject {
        NodeObject {
            meta: ObjectMeta {
                name: name.into(),
                labels: HashMap::from([(ZONE_TOPOLOGY_KEY.to_owned(), "AD-1".to_owned())]),
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
            provider_id: String::new(),
        }
    }

    #[tokio::test]
    async fn derives_families_from_addresses() {
        let cluster = FakeCluster::new();
        cluster.put_node(node("node-1", &["10.0.1.7", "fd00::7"]));

        let meta = NodeMetadata::load(&cluster, "node-1").await.unwrap();
        assert_eq!(meta.availability_domain, "AD-1");
        assert!(meta.ipv4_enabled);
        assert!(meta.ipv6_enabled);
    }

    #[tokio::test]
    async fn single_family_node() {
        let cluster = FakeCluster::new();
        cluster.put_node(node("node-1", &["10.0.1.7"]));

        let meta = NodeMetadata::load(&cluster, "node-1").await.unwrap();
        assert!(meta.ipv4_enabled);
        assert!(!meta.ipv6_enabled);
    }

    #[tokio::test]
    async fn missing_node_is_an_error() {
        let cluster = FakeCluster::new();
        let err = NodeMetadata::load(&cluster, "node-1").await.unwrap_err();
        assert!(matches!(err, CsiError::ClusterError(_)));
    }
}
