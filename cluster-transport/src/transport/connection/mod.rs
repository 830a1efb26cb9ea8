//! The collaborator performing the actual I/O of one attempt.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{request_context::RequestContext, response::ConnectionResponse};

#[cfg(feature = "reqwest")]
pub mod reqwest_connection;

#[cfg(feature = "reqwest")]
pub use reqwest_connection::ReqwestConnection;

/// The class of a [`ConnectionError`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ConnectionErrorKind {
    /// The request is malformed and would fail against any node.
    InvalidRequest,
    /// A transient local failure before anything was sent, e.g. no client could be built.
    LocalResource,
    /// No connection to the node could be established.
    Connect,
    /// The node didn't answer within the deadline.
    Timeout,
    /// The exchange failed after the request was dispatched.
    Io,
    /// The cancellation token fired.
    Cancelled,
}

impl ConnectionErrorKind {
    /// Whether the failure happened before any byte reached the network.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ConnectionErrorKind::InvalidRequest | ConnectionErrorKind::LocalResource
        )
    }
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionErrorKind::InvalidRequest => "invalid request",
            ConnectionErrorKind::LocalResource => "local resource failure",
            ConnectionErrorKind::Connect => "connection failure",
            ConnectionErrorKind::Timeout => "timeout",
            ConnectionErrorKind::Io => "i/o failure",
            ConnectionErrorKind::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// An error returned when no response could be obtained from a node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ConnectionError {
    kind: ConnectionErrorKind,
    message: String,
}

impl ConnectionError {
    /// Creates a new error.
    pub fn new(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The class of the error.
    pub fn kind(&self) -> ConnectionErrorKind {
        self.kind
    }

    /// The description of the error.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Sends one request to one node.
///
/// Implementations must honor [`RequestContext::timeout`] and should give up as soon as `token`
/// is cancelled, returning a [`ConnectionErrorKind::Cancelled`] error. Any HTTP reply, whatever
/// its status, is a response and not an error.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Performs the request described by `ctx`.
    async fn send(
        &self,
        ctx: &RequestContext,
        token: CancellationToken,
    ) -> Result<ConnectionResponse, ConnectionError>;
}
