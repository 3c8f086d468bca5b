//! Volume-handle codecs.
//!
//! A volume handle is an opaque string minted by the control plane that
//! carries enough information for a node to reach and mount the backend.
//! Each backend has its own encoding; parsing is pure and performs no I/O.

use std::net::IpAddr;

use tracing::debug;

use crate::error::CsiError;

/// Separator between the components of a shared-FS handle.  Chosen so that
/// IPv6 addresses (which contain colons) survive unescaped.
const SHARED_FS_SEPARATOR: char = ',';

/// Magic prefix identifying a parallel-FS handle.
pub const PARALLEL_FS_PREFIX: &str = "lustre:";

/// Format an IP address for use on the left of `host:path` mount syntax.
/// IPv6 addresses must be bracketed there; IPv4 passes through unchanged.
pub fn format_mount_host(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

// ---------------------------------------------------------------------------
// Shared FS
// ---------------------------------------------------------------------------

/// Decoded handle for a shared file-system volume.
///
/// Wire form: `<filesystem-id>,<mount-target-ip>,<export-path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFsHandle {
    /// Backend identifier of the file system; informational on the node.
    pub filesystem_id: String,
    /// IP of the mount target serving the export.
    pub mount_target_ip: IpAddr,
    /// Export path on the mount target.
    pub export_path: String,
}

impl SharedFsHandle {
    /// Parse an opaque volume-id string.  Both the mount-target IP and the
    /// export path must be present and well formed.
    pub fn parse(raw: &str) -> Result<Self, CsiError> {
        let mut parts = raw.split(SHARED_FS_SEPARATOR);
        let (filesystem_id, ip_raw, export_path) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(fs), Some(ip), Some(export), None) => (fs, ip, export),
                _ => {
                    return Err(CsiError::InvalidArgument(
                        "invalid volume ID provided".into(),
                    ))
                }
            };

        if ip_raw.is_empty() || export_path.is_empty() {
            return Err(CsiError::InvalidArgument(
                "invalid volume ID provided".into(),
            ));
        }

        let mount_target_ip: IpAddr = ip_raw.parse().map_err(|_| {
            CsiError::InvalidArgument("invalid mount target IP in volume ID".into())
        })?;

        let handle = Self {
            filesystem_id: filesystem_id.to_owned(),
            mount_target_ip,
            export_path: export_path.to_owned(),
        };
        debug!(?handle, "decoded shared-FS volume handle");
        Ok(handle)
    }

    /// The `host:export` source string handed to the kernel mount, with the
    /// host bracketed when it is IPv6.
    pub fn mount_source(&self) -> String {
        format!(
            "{}:{}",
            format_mount_host(&self.mount_target_ip),
            self.export_path
        )
    }
}

// ---------------------------------------------------------------------------
// Parallel FS
// ---------------------------------------------------------------------------

/// Decoded handle for a parallel file-system volume.
///
/// Wire form: `lustre:<endpoint>@<lnet-label>:<fs-path>`.  The remainder
/// after the magic prefix is the kernel mount source; the L-net label (the
/// network name after `@`) selects the client network configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelFsHandle {
    /// Mount source, e.g. `192.168.0.0/24@tcp1:/mnt/fs`.
    pub filesystem_id: String,
    /// L-net network label, e.g. `tcp1`.
    pub lnet_label: String,
}

impl ParallelFsHandle {
    /// Parse an opaque volume-id string.  A successful parse yields both
    /// the mount source and a non-empty L-net label.
    pub fn parse(raw: &str) -> Result<Self, CsiError> {
        let rest = raw.strip_prefix(PARALLEL_FS_PREFIX).ok_or_else(|| {
            CsiError::InvalidArgument("invalid volume handle provided".into())
        })?;

        let (endpoint, fs_path) = rest.rsplit_once(':').ok_or_else(|| {
            CsiError::InvalidArgument("invalid volume handle provided".into())
        })?;

        let (_, lnet_label) = endpoint.rsplit_once('@').ok_or_else(|| {
            CsiError::InvalidArgument("invalid volume handle provided".into())
        })?;

        if lnet_label.is_empty() || fs_path.is_empty() {
            return Err(CsiError::InvalidArgument(
                "invalid volume handle provided".into(),
            ));
        }

        let handle = Self {
            filesystem_id: rest.to_owned(),
            lnet_label: lnet_label.to_owned(),
        };
        debug!(?handle, "decoded parallel-FS volume handle");
        Ok(handle)
    }

    /// The source string handed to the kernel mount.
    pub fn mount_source(&self) -> &str {
        &self.filesystem_id
    }
}
