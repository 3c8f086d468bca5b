//! CSI error types.
//!
//! All errors in the crate are represented by the [`CsiError`] enum, which
//! derives [`thiserror::Error`] for ergonomic error handling and also
//! implements [`Serialize`]/[`Deserialize`] so errors can travel across the
//! QUIC transport layer.  [`CsiError::code`] maps every variant onto the RPC
//! status code the orchestrator keys its retry behaviour on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RPC-layer status codes, as understood by the container orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusCode {
    /// Caller fault; never retried.
    InvalidArgument,
    /// Node not ready for the request; retried after remediation.
    FailedPrecondition,
    /// Contention; retried with backoff.
    Aborted,
    /// Transient infrastructure fault; retried.
    Internal,
    /// The RPC is not supported by this plugin.
    Unimplemented,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid argument (missing field, malformed
    /// volume handle, incompatible IP family, bad context value).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The node is missing a prerequisite (e.g. the in-transit-encryption
    /// helper package is not installed).
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The operation lost a race: another operation holds the per-volume
    /// lock, or the node-wide admission bound timed out.
    #[error("aborted: {0}")]
    Aborted(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The cluster API returned an error.
    #[error("cluster API error: {0}")]
    ClusterError(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The RPC is not supported by this plugin.
    #[error("{0} is not supported")]
    Unimplemented(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// The RPC status code this error maps to.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::InvalidArgument,
            Self::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            Self::Aborted(_) => StatusCode::Aborted,
            Self::Unimplemented(_) => StatusCode::Unimplemented,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::ClusterError(_)
            | Self::TransportError(_)
            | Self::Internal(_) => StatusCode::Internal,
        }
    }

    /// Create a [`CsiError::InvalidArgument`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn invalid_argument<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidArgument(e.to_string())
    }

    /// Create a [`CsiError::ClusterError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn cluster<E: std::fmt::Display>(e: E) -> Self {
        Self::ClusterError(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::InvalidArgument("volume ID must be provided".into());
        assert_eq!(
            err.to_string(),
            "invalid argument: volume ID must be provided"
        );
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::MountFailed {
            path: "/var/lib/stage/v1".into(),
            reason: "permission denied".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err.to_string(), de.to_string());
    }

    #[test]
    fn status_code_mapping() {
        assert_eq!(
            CsiError::InvalidArgument("x".into()).code(),
            StatusCode::InvalidArgument
        );
        assert_eq!(
            CsiError::FailedPrecondition("x".into()).code(),
            StatusCode::FailedPrecondition
        );
        assert_eq!(CsiError::Aborted("x".into()).code(), StatusCode::Aborted);
        assert_eq!(
            CsiError::MountFailed {
                path: "/p".into(),
                reason: "r".into()
            }
            .code(),
            StatusCode::Internal
        );
        assert_eq!(
            CsiError::Unimplemented("NodeGetVolumeStats".into()).code(),
            StatusCode::Unimplemented
        );
    }
}
