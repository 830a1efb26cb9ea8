//! Product specific policies: health checks, topology discovery and response classification.

use std::fmt;

use http::{Method, StatusCode};

use super::{
    node_pool::Node,
    request::RequestIntent,
    request_context::RequestKind,
    response::ConnectionResponse,
};

pub mod nodes_api;

pub use nodes_api::NodesApiProduct;

/// Describes how a particular cluster product is talked to.
///
/// A product that reports ping or sniff as unsupported never sees the corresponding requests,
/// those phases are skipped.
pub trait ProductRegistration: Send + Sync + fmt::Debug {
    /// Name of the product, for diagnostics.
    fn name(&self) -> &str;

    /// Whether nodes can be health checked.
    fn supports_ping(&self) -> bool {
        false
    }

    /// Whether the topology can be discovered.
    fn supports_sniff(&self) -> bool {
        false
    }

    /// The health check request.
    fn ping_request(&self) -> RequestIntent {
        RequestIntent::head("/")
    }

    /// The topology discovery request.
    fn sniff_request(&self) -> RequestIntent {
        RequestIntent::get("/")
    }

    /// Whether a reply with `status` to a `method` request is a success.
    fn is_success_status(&self, method: &Method, status: StatusCode) -> bool {
        status.is_success() || (*method == Method::HEAD && status == StatusCode::NOT_FOUND)
    }

    /// Whether `node` may serve a request of the given kind.
    fn node_predicate(&self, _node: &Node, _kind: RequestKind) -> bool {
        true
    }

    /// Sort key of a node when sniffing, lower keys are asked first.
    fn sniff_order(&self, _node: &Node) -> i32 {
        0
    }

    /// Extracts the cluster nodes from a discovery reply sent by `answered_by`.
    fn parse_sniff_response(
        &self,
        _response: &ConnectionResponse,
        _answered_by: &Node,
    ) -> anyhow::Result<Vec<Node>> {
        anyhow::bail!("{} does not support sniffing", self.name())
    }

    /// A human readable failure reason found in an unsuccessful reply.
    fn failure_reason(&self, _response: &ConnectionResponse) -> Option<String> {
        None
    }
}

/// A product without health checks or topology discovery.
///
/// Any 2xx reply is a success, as is a 404 reply to a `HEAD` request.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProduct;

impl ProductRegistration for DefaultProduct {
    fn name(&self) -> &str {
        "default"
    }
}
