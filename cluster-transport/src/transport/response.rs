//! Responses received from nodes and the outcome of a logical request.

use std::fmt;

use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use super::{audit::AuditTrail, node_pool::Node};

/// A raw reply as returned by a [`Connection`](super::connection::Connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionResponse {
    /// The status code.
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The undecoded body.
    pub body: Vec<u8>,
}

impl ConnectionResponse {
    /// A reply with the given status and body and no headers.
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// A successful reply together with the node which served it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterResponse {
    /// The status code.
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The undecoded body.
    pub body: Vec<u8>,
    /// Snapshot of the node that answered.
    pub node: Node,
}

impl ClusterResponse {
    pub(crate) fn new(response: ConnectionResponse, node: Node) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            node,
        }
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// The body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Why a logical request failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FailureReason {
    /// The request failed locally and can't be retried.
    BadRequest,
    /// The attempt budget is spent.
    MaxRetriesReached,
    /// The time budget is spent.
    MaxTimeoutReached,
    /// No node could be selected.
    NoNodesAttempted,
    /// The caller cancelled the request.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::BadRequest => "the request could not be sent",
            FailureReason::MaxRetriesReached => "maximum number of retries reached",
            FailureReason::MaxTimeoutReached => "maximum retry timeout reached",
            FailureReason::NoNodesAttempted => "no node could be attempted",
            FailureReason::Cancelled => "the request was cancelled",
        };
        f.write_str(text)
    }
}

/// A failed logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFailure {
    /// The classified reason.
    pub reason: FailureReason,
    /// The last node attempted.
    pub node: Option<Node>,
    /// The last status code received.
    pub status: Option<StatusCode>,
    /// The last failure observed.
    pub error: Option<String>,
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request failed: {}", self.reason)?;
        if let Some(node) = &self.node {
            write!(f, ", last node {}", node.url())?;
        }
        if let Some(status) = self.status {
            write!(f, ", last status {}", status.as_u16())?;
        }
        if let Some(error) = &self.error {
            write!(f, ", last error: {error}")?;
        }
        Ok(())
    }
}

/// The terminal result of a logical request, always carrying its audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// The response, or why there is none.
    pub result: Result<ClusterResponse, PipelineFailure>,
    /// Every decision taken.
    pub audit_trail: AuditTrail,
}

impl PipelineOutcome {
    /// Returns `true` for a successful outcome.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// The response of a successful outcome.
    pub fn response(&self) -> Option<&ClusterResponse> {
        self.result.as_ref().ok()
    }

    /// The failure of a failed outcome.
    pub fn failure(&self) -> Option<&PipelineFailure> {
        self.result.as_ref().err()
    }
}
