//! # remotefs-csi — node-side CSI plugin for remote file systems
//!
//! This crate implements the node plugin of a [Container Storage
//! Interface][csi] driver for two remote file-system backends: a managed
//! NFS-like shared file service and a Lustre parallel file system.  For each
//! backend it provides the four node RPCs that take a network-reachable
//! volume and make it usable to a workload on the node — **Stage**,
//! **Publish**, **Unpublish**, **Unstage** — plus the claim-lifecycle state
//! machine that drives a volume claim from template to bound to
//! attached-to-workload and back down.
//!
//! Requests travel over QUIC (via [`quinn`]) as JSON-serialized
//! [`CsiMessage`] envelopes.  The crate follows the usual conventions: Tokio
//! async runtime, `tracing` for observability, `thiserror` for structured
//! errors.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: volume ids, capabilities, requests, node info. |
//! | [`error`] | [`CsiError`] enum and its RPC status-code mapping. |
//! | [`handle`] | Volume-handle codecs for both backends. |
//! | [`mount`] | [`Mounter`] capability over kernel mount / unmount. |
//! | [`locks`] | Per-volume exclusion and node-wide mount admission bounds. |
//! | [`config`] | Driver configuration toggles loaded from the cluster. |
//! | [`cluster`] | Narrow [`ClusterApi`] trait and the typed cluster objects. |
//! | [`cloud`] | Narrow compute / block-storage inspection interfaces. |
//! | [`node`] | [`CsiNode`] trait and the two backend node drivers. |
//! | [`lifecycle`] | [`ClaimLifecycle`] state machine over the cluster API. |
//! | [`identity`] | [`CsiIdentity`] trait — plugin discovery & health. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod cloud;
pub mod cluster;
pub mod config;
pub mod error;
pub mod handle;
pub mod identity;
pub mod lifecycle;
pub mod locks;
pub mod message;
pub mod mount;
pub mod node;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export the most commonly used items at crate root for convenience.
pub use cluster::ClusterApi;
pub use error::{CsiError, StatusCode};
pub use identity::CsiIdentity;
pub use lifecycle::ClaimLifecycle;
pub use message::CsiMessage;
pub use mount::Mounter;
pub use node::CsiNode;
pub use types::*;
