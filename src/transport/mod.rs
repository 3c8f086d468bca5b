//! QUIC transport for the CSI node surface.
//!
//! The orchestrator side opens one bi-directional stream per RPC, writes a
//! JSON-serialized [`crate::CsiMessage`] request, and reads the response.
//! TLS configuration is supplied by the caller; certificates are issued by
//! the cluster's own CA.

mod client;
mod server;

pub use client::CsiClient;
pub use server::CsiServer;

/// Upper bound on a single serialized message.  Node RPCs are small;
/// anything larger indicates a broken peer.
pub(crate) const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;
