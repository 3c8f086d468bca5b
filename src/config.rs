//! Driver configuration distributed through the cluster.
//!
//! The config object is read once per process on first use and cached; it
//! carries operational toggles that let operators disable risky paths
//! without redeploying the driver.

use serde::{Deserialize, Serialize};

/// Driver-wide configuration, deserialized from the cluster config object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CsiConfig {
    /// Parallel-FS specific toggles.
    #[serde(default)]
    pub lustre: Option<LustreConfig>,
}

/// Toggles for the parallel-FS driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LustreConfig {
    /// When set, NodeUnstage is a no-op.
    #[serde(default)]
    pub skip_node_unstage: bool,
    /// When set, post-mount tuning parameters are neither validated nor
    /// applied.
    #[serde(default)]
    pub skip_lustre_parameters: bool,
}

impl CsiConfig {
    pub fn skip_node_unstage(&self) -> bool {
        self.lustre.as_ref().is_some_and(|l| l.skip_node_unstage)
    }

    pub fn skip_lustre_parameters(&self) -> bool {
        self.lustre
            .as_ref()
            .is_some_and(|l| l.skip_lustre_parameters)
    }
}
