//! The [`Mounter`] capability — the sole interface between the node drivers
//! and the kernel mount table.
//!
//! Everything above this module treats mount errors as opaque.  The
//! authoritative mount-point test consults the kernel mount table rather
//! than `stat`, because bind mounts are invisible to device-number
//! heuristics.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::CsiError;

/// Filesystem type routed through the in-transit-encryption helper.
pub const ENCRYPT_FS_TYPE: &str = "oci-fss";

/// Package providing the in-transit-encryption helpers.
pub const ENCRYPT_PACKAGE_NAME: &str = "oci-fss-utils";

/// Mount helper installed by the in-transit-encryption package.
const ENCRYPT_MOUNT_HELPER: &str = "mount.oci-fss";

/// Unmount helper installed by the in-transit-encryption package.
const ENCRYPT_UMOUNT_HELPER: &str = "umount.oci-fss";

/// Host file whose content `1` marks the node FIPS-enabled.
const FIPS_PROC_PATH: &str = "/proc/sys/crypto/fips_enabled";

/// A record from the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    /// Path the mount is attached at.
    pub mount_point: PathBuf,
    /// Filesystem type, e.g. `nfs` or `lustre`.
    pub fs_type: String,
    /// Mount source as the kernel reports it.  The encryption helper
    /// rewrites this to a `127.0.0.1:port`-style tunnel endpoint.
    pub source: String,
}

/// Capability over kernel mount / unmount operations.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Kernel mount; creates a mount record at `target`.
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError>;

    /// Rebind an already-staged mount at a second path.
    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), CsiError>;

    /// Mount through the in-transit-encryption helper.  The resulting
    /// record carries a loopback tunnel endpoint as its source.
    async fn mount_with_encrypt(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError>;

    /// Remove the mount record at `target`.
    async fn unmount(&self, target: &Path) -> Result<(), CsiError>;

    /// Unmount a tunnel established by the encryption helper.
    async fn unmount_with_encrypt(&self, target: &Path) -> Result<(), CsiError>;

    /// Force-unmount.  Required when the backend network is unreachable and
    /// a regular unmount would hang.
    async fn unmount_with_force(&self, target: &Path) -> Result<(), CsiError>;

    /// Whether `target` appears in the kernel mount table.  Missing paths
    /// simply report `false`; the caller decides what absence means.
    fn is_mount_point(&self, target: &Path) -> Result<bool, CsiError>;

    /// All sources currently mounted at `target`.
    fn find_mount(&self, target: &Path) -> Result<Vec<String>, CsiError>;

    /// Whether the live mount at `target` goes through the encryption
    /// tunnel: some source ends with the expected export but its host
    /// prefix is not the expected backend host.
    fn is_encrypted_mount(
        &self,
        target: &Path,
        expected_host: &str,
        expected_export: &str,
    ) -> Result<bool, CsiError> {
        let sources = self.find_mount(target)?;
        debug!(?sources, %expected_host, %expected_export, "identifying in-transit encryption");
        Ok(sources.iter().any(|source| {
            source.ends_with(expected_export) && !source.starts_with(expected_host)
        }))
    }

    /// Whether the in-transit-encryption helper package is installed.
    fn encryption_helper_installed(&self) -> Result<bool, CsiError>;

    /// Whether the node runs in FIPS mode.
    fn fips_enabled(&self) -> Result<bool, CsiError>;
}

// ---------------------------------------------------------------------------
// mountinfo parsing
// ---------------------------------------------------------------------------

/// Parse the content of `/proc/self/mountinfo`.
///
/// Each line reads `id parent major:minor root mount-point options ...
/// optional-fields - fs-type source super-options`; fields are
/// space-separated with spaces inside paths octal-escaped.
pub fn parse_mountinfo(content: &str) -> Vec<MountRecord> {
    let mut records = Vec::new();
    for line in content.lines() {
        let Some((head, tail)) = line.split_once(" - ") else {
            continue;
        };
        let head: Vec<&str> = head.split(' ').collect();
        let tail: Vec<&str> = tail.split(' ').collect();
        if head.len() < 5 || tail.len() < 2 {
            continue;
        }
        records.push(MountRecord {
            mount_point: PathBuf::from(unescape_octal(head[4])),
            fs_type: tail[0].to_owned(),
            source: unescape_octal(tail[1]),
        });
    }
    records
}

/// Decode the `\040`-style octal escapes the kernel uses for spaces, tabs
/// and backslashes in mountinfo fields.
fn unescape_octal(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let bytes = field.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            if let Ok(code) = u8::from_str_radix(&field[i + 1..i + 4], 8) {
                out.push(code as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

// ---------------------------------------------------------------------------
// System implementation
// ---------------------------------------------------------------------------

/// [`Mounter`] backed by the real kernel: `mount(8)`/`umount(8)` for
/// fstype-helper mounts, direct syscalls for bind and force unmount, and
/// `/proc/self/mountinfo` for mount-table queries.
pub struct SystemMounter {
    mountinfo_path: PathBuf,
    helper_dir: PathBuf,
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self {
            mountinfo_path: PathBuf::from("/proc/self/mountinfo"),
            helper_dir: PathBuf::from("/sbin"),
        }
    }
}

impl SystemMounter {
    /// A mounter reading an alternate mount table, used by tests.
    pub fn with_mountinfo(path: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo_path: path.into(),
            ..Self::default()
        }
    }

    fn mount_table(&self) -> Result<Vec<MountRecord>, CsiError> {
        let content = std::fs::read_to_string(&self.mountinfo_path)
            .map_err(|e| CsiError::Internal(format!("read mount table: {e}")))?;
        Ok(parse_mountinfo(&content))
    }

    async fn run_mount_command(
        &self,
        program: &str,
        args: &[&str],
        target: &Path,
        unmounting: bool,
    ) -> Result<(), CsiError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| self.command_error(target, unmounting, e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            return Err(self.command_error(target, unmounting, stderr));
        }
        Ok(())
    }

    fn command_error(&self, target: &Path, unmounting: bool, reason: String) -> CsiError {
        let path = target.display().to_string();
        if unmounting {
            CsiError::UnmountFailed { path, reason }
        } else {
            CsiError::MountFailed { path, reason }
        }
    }
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        let target_str = target.display().to_string();
        let joined = options.join(",");
        let mut args: Vec<&str> = Vec::new();
        if !fs_type.is_empty() {
            args.extend(["-t", fs_type]);
        }
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([source, target_str.as_str()]);

        info!(%source, target = %target_str, %fs_type, ?options, "mounting");
        self.run_mount_command("mount", &args, target, false).await
    }

    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), CsiError> {
        let mut flags = nix::mount::MsFlags::MS_BIND;
        if read_only {
            flags |= nix::mount::MsFlags::MS_RDONLY;
        }

        nix::mount::mount(Some(source), target, None::<&str>, flags, None::<&str>).map_err(
            |e| CsiError::MountFailed {
                path: target.display().to_string(),
                reason: e.to_string(),
            },
        )?;

        // Some kernels ignore MS_RDONLY on the initial bind call; a remount
        // makes it stick.
        if read_only {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                nix::mount::MsFlags::MS_BIND
                    | nix::mount::MsFlags::MS_REMOUNT
                    | nix::mount::MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| CsiError::MountFailed {
                path: target.display().to_string(),
                reason: format!("remount read-only: {e}"),
            })?;
        }
        Ok(())
    }

    async fn mount_with_encrypt(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        info!(%source, target = %target.display(), "mounting through encryption tunnel");
        // The helper is selected by fstype; mount(8) execs
        // /sbin/mount.<fstype>, which establishes the local tunnel and
        // rewrites the source to its loopback endpoint.
        self.mount(source, target, fs_type, options).await
    }

    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        let target_str = target.display().to_string();
        info!(target = %target_str, "unmounting");
        self.run_mount_command("umount", &[target_str.as_str()], target, true)
            .await
    }

    async fn unmount_with_encrypt(&self, target: &Path) -> Result<(), CsiError> {
        let helper = self.helper_dir.join(ENCRYPT_UMOUNT_HELPER);
        let helper_str = helper.display().to_string();
        let target_str = target.display().to_string();
        info!(target = %target_str, "unmounting encryption tunnel");
        self.run_mount_command(&helper_str, &[target_str.as_str()], target, true)
            .await
    }

    async fn unmount_with_force(&self, target: &Path) -> Result<(), CsiError> {
        warn!(target = %target.display(), "force unmounting");
        nix::mount::umount2(target, nix::mount::MntFlags::MNT_FORCE).map_err(|e| {
            CsiError::UnmountFailed {
                path: target.display().to_string(),
                reason: e.to_string(),
            }
        })
    }

    fn is_mount_point(&self, target: &Path) -> Result<bool, CsiError> {
        Ok(self
            .mount_table()?
            .iter()
            .any(|record| record.mount_point == target))
    }

    fn find_mount(&self, target: &Path) -> Result<Vec<String>, CsiError> {
        Ok(self
            .mount_table()?
            .into_iter()
            .filter(|record| record.mount_point == target)
            .map(|record| record.source)
            .collect())
    }

    fn encryption_helper_installed(&self) -> Result<bool, CsiError> {
        Ok(self.helper_dir.join(ENCRYPT_MOUNT_HELPER).exists())
    }

    fn fips_enabled(&self) -> Result<bool, CsiError> {
        match std::fs::read_to_string(FIPS_PROC_PATH) {
            Ok(content) => Ok(content.contains('1')),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CsiError::Internal(format!(
                "could not verify if FIPS enabled: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\
26 21 0:23 / /sys/fs/cgroup rw,nosuid shared:9 - cgroup2 cgroup2 rw
402 29 0:55 / /var/lib/stage/v1 rw,relatime shared:200 - nfs 10.0.0.5:/export/vol rw,vers=3
403 29 0:56 / /var/lib/stage/v2 rw,relatime shared:201 - oci-fss 127.0.0.1:/export/vol rw
404 29 0:57 / /var/lib/pods/p1/with\\040space rw shared:202 - nfs 10.0.0.5:/export/vol rw
";

    fn write_mountinfo() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_mount_records() {
        let records = parse_mountinfo(SAMPLE);
        assert_eq!(records.len(), 4);
        assert_eq!(records[1].mount_point, Path::new("/var/lib/stage/v1"));
        assert_eq!(records[1].fs_type, "nfs");
        assert_eq!(records[1].source, "10.0.0.5:/export/vol");
    }

    #[test]
    fn unescapes_octal_spaces() {
        let records = parse_mountinfo(SAMPLE);
        assert_eq!(
            records[3].mount_point,
            Path::new("/var/lib/pods/p1/with space")
        );
    }

    #[test]
    fn mount_point_test_consults_table() {
        let file = write_mountinfo();
        let mounter = SystemMounter::with_mountinfo(file.path());
        assert!(mounter
            .is_mount_point(Path::new("/var/lib/stage/v1"))
            .unwrap());
        assert!(!mounter
            .is_mount_point(Path::new("/var/lib/stage/unknown"))
            .unwrap());
    }

    #[test]
    fn find_mount_returns_sources() {
        let file = write_mountinfo();
        let mounter = SystemMounter::with_mountinfo(file.path());
        let sources = mounter.find_mount(Path::new("/var/lib/stage/v2")).unwrap();
        assert_eq!(sources, vec!["127.0.0.1:/export/vol".to_owned()]);
    }

    #[test]
    fn detects_encrypted_mount_by_rewritten_source() {
        let file = write_mountinfo();
        let mounter = SystemMounter::with_mountinfo(file.path());
        // The tunnel endpoint keeps the export suffix but not the backend
        // host prefix.
        assert!(mounter
            .is_encrypted_mount(Path::new("/var/lib/stage/v2"), "10.0.0.5", "/export/vol")
            .unwrap());
        assert!(!mounter
            .is_encrypted_mount(Path::new("/var/lib/stage/v1"), "10.0.0.5", "/export/vol")
            .unwrap());
    }
}
