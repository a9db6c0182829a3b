use thiserror::Error;

use crate::node::ServerId;

/// Result type used throughout the balancer.
pub type Result<T> = std::result::Result<T, BalancerError>;

/// Errors reported by the ring and the balancer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BalancerError {
    /// The virtual nodes of a server could not be computed. The server contributes nothing to the ring.
    #[error("failed to build replicas for server {server}: {reason}")]
    ReplicaBuildFailed {
        /// The server that was not added.
        server: ServerId,
        /// Why its replicas could not be built.
        reason: String,
    },

    /// The server is not present in the ring.
    #[error("server not found: {0}")]
    ServerNotFound(ServerId),

    /// Every distinct server in the ring was rejected, or the ring is empty.
    #[error("no server available")]
    NoServerAvailable,

    /// A parameter string was rejected. The previous configuration stays in effect.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl BalancerError {
    pub(crate) fn replica_build_failed(server: &ServerId, reason: impl Into<String>) -> Self {
        BalancerError::ReplicaBuildFailed {
            server: server.clone(),
            reason: reason.into(),
        }
    }
}
