//! Errors surfaced by [`ClusterTransport::execute`](super::ClusterTransport::execute).

use thiserror::Error;

use super::{audit::AuditTrail, node_pool::NodePoolError, response::PipelineFailure};

/// An error returned by the transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The node pool is empty.
    #[error("No nodes available to send the request to")]
    NoNodesAvailable,

    /// The request can't be built, e.g. its path carries a query string.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The request failed and throwing on failure is enabled.
    #[error("{failure}")]
    Pipeline {
        /// The failure.
        failure: Box<PipelineFailure>,
        /// Every decision taken.
        audit_trail: AuditTrail,
    },

    /// The transport configuration is invalid.
    #[error("Invalid transport configuration: {0}")]
    Configuration(String),
}

impl TransportError {
    /// The audit trail of a failed request.
    pub fn audit_trail(&self) -> Option<&AuditTrail> {
        match self {
            TransportError::Pipeline { audit_trail, .. } => Some(audit_trail),
            _ => None,
        }
    }
}

impl From<NodePoolError> for TransportError {
    fn from(err: NodePoolError) -> Self {
        match err {
            NodePoolError::NoNodesAvailable => TransportError::NoNodesAvailable,
            NodePoolError::ReseedNotSupported => TransportError::Configuration(err.to_string()),
        }
    }
}
