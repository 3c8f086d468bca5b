//! Per-volume exclusion and node-wide mount admission.
//!
//! Two concerns live here.  [`VolumeLocks`] guarantees at most one in-flight
//! node operation per volume id; contention is reported immediately so the
//! caller can surface `Aborted` and let the orchestrator retry.
//! [`NodeSemaphores`] bounds how many kernel mount / unmount operations run
//! concurrently on the node — the kernel and the encryption helper
//! serialise poorly under burst.
//!
//! Acquisition order is fixed: per-volume lock first, then the semaphore,
//! released in reverse.  Holding duplicate requests for one volume in the
//! semaphore queue would head-of-line block unrelated volumes.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::error;

use crate::error::CsiError;

/// Mount operations admitted concurrently per node.
pub const MOUNT_PERMITS: usize = 2;

/// Unmount operations admitted concurrently per node.
pub const UNMOUNT_PERMITS: usize = 4;

/// How long an RPC waits for admission before giving up.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Per-volume exclusion
// ---------------------------------------------------------------------------

/// Set of volume ids with an operation in flight on this node.
#[derive(Default, Debug)]
pub struct VolumeLocks {
    in_flight: DashMap<String, ()>,
}

/// Holds the per-volume lock; released on drop.
#[derive(Debug)]
pub struct VolumeLockGuard<'a> {
    locks: &'a VolumeLocks,
    volume_id: String,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking acquire.  Returns `None` when an operation for the same
    /// volume is already in flight.
    pub fn try_acquire(&self, volume_id: &str) -> Option<VolumeLockGuard<'_>> {
        match self.in_flight.entry(volume_id.to_owned()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(VolumeLockGuard {
                    locks: self,
                    volume_id: volume_id.to_owned(),
                })
            }
        }
    }

    /// Non-blocking acquire that maps contention to the `Aborted` RPC error.
    pub fn try_acquire_or_abort(&self, volume_id: &str) -> Result<VolumeLockGuard<'_>, CsiError> {
        self.try_acquire(volume_id).ok_or_else(|| {
            error!(%volume_id, "could not acquire per-volume lock");
            CsiError::Aborted(format!(
                "an operation with the given volume {volume_id} already exists"
            ))
        })
    }

    fn release(&self, volume_id: &str) {
        self.in_flight.remove(volume_id);
    }
}

impl Drop for VolumeLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.volume_id);
    }
}

// ---------------------------------------------------------------------------
// Node-wide admission
// ---------------------------------------------------------------------------

/// Counting semaphores bounding concurrent mount / unmount work per node.
pub struct NodeSemaphores {
    mount: Semaphore,
    unmount: Semaphore,
    acquire_timeout: Duration,
}

impl Default for NodeSemaphores {
    fn default() -> Self {
        Self::new(MOUNT_PERMITS, UNMOUNT_PERMITS)
    }
}

impl NodeSemaphores {
    pub fn new(mount_permits: usize, unmount_permits: usize) -> Self {
        Self {
            mount: Semaphore::new(mount_permits),
            unmount: Semaphore::new(unmount_permits),
            acquire_timeout: ACQUIRE_TIMEOUT,
        }
    }

    /// Constructor with a custom admission deadline, used by tests.
    pub fn with_timeout(
        mount_permits: usize,
        unmount_permits: usize,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            mount: Semaphore::new(mount_permits),
            unmount: Semaphore::new(unmount_permits),
            acquire_timeout,
        }
    }

    /// Wait for a mount slot; `Aborted` once the deadline passes.
    pub async fn acquire_mount(&self) -> Result<SemaphorePermit<'_>, CsiError> {
        Self::acquire(&self.mount, self.acquire_timeout, "mount").await
    }

    /// Wait for an unmount slot; `Aborted` once the deadline passes.
    pub async fn acquire_unmount(&self) -> Result<SemaphorePermit<'_>, CsiError> {
        Self::acquire(&self.unmount, self.acquire_timeout, "unmount").await
    }

    async fn acquire<'a>(
        semaphore: &'a Semaphore,
        deadline: Duration,
        kind: &str,
    ) -> Result<SemaphorePermit<'a>, CsiError> {
        match tokio::time::timeout(deadline, semaphore.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(CsiError::Internal(format!("{kind} semaphore closed"))),
            Err(_) => {
                error!(kind, "semaphore acquire timed out");
                Err(CsiError::Aborted(format!("too many {kind} requests")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_lock_excludes_duplicates() {
        let locks = VolumeLocks::new();
        let guard = locks.try_acquire("vol-1");
        assert!(guard.is_some());
        assert!(locks.try_acquire("vol-1").is_none());
        // A different volume is unaffected.
        assert!(locks.try_acquire("vol-2").is_some());
    }

    #[test]
    fn volume_lock_released_on_drop() {
        let locks = VolumeLocks::new();
        {
            let _guard = locks.try_acquire("vol-1").unwrap();
        }
        assert!(locks.try_acquire("vol-1").is_some());
    }

    #[test]
    fn contention_maps_to_aborted() {
        let locks = VolumeLocks::new();
        let _guard = locks.try_acquire("vol-1").unwrap();
        let err = locks.try_acquire_or_abort("vol-1").unwrap_err();
        assert!(matches!(err, CsiError::Aborted(_)));
    }

    #[tokio::test]
    async fn semaphore_admits_up_to_capacity() {
        let sems = NodeSemaphores::with_timeout(2, 4, Duration::from_millis(50));
        let _a = sems.acquire_mount().await.unwrap();
        let _b = sems.acquire_mount().await.unwrap();
        // Third waits out the deadline, then aborts.
        let err = sems.acquire_mount().await.unwrap_err();
        assert!(matches!(err, CsiError::Aborted(_)));
    }

    #[tokio::test]
    async fn semaphore_slot_frees_on_drop() {
        let sems = NodeSemaphores::with_timeout(1, 1, Duration::from_millis(50));
        {
            let _a = sems.acquire_mount().await.unwrap();
        }
        assert!(sems.acquire_mount().await.is_ok());
    }

    #[tokio::test]
    async fn unmount_semaphore_is_independent() {
        let sems = NodeSemaphores::with_timeout(1, 1, Duration::from_millis(50));
        let _m = sems.acquire_mount().await.unwrap();
        assert!(sems.acquire_unmount().await.is_ok());
    }
}
