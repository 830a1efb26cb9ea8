//! A product exposing a nodes info API, such as Elasticsearch or OpenSearch.

use std::collections::BTreeMap;

use anyhow::{bail, Context};
use serde::Deserialize;

use super::ProductRegistration;
use crate::transport::{
    node_pool::{features, Node},
    request::RequestIntent,
    request_context::RequestKind,
    response::ConnectionResponse,
};

/// Path of the topology discovery endpoint.
pub const SNIFF_PATH: &str = "/_nodes/http";

#[derive(Debug, Deserialize)]
struct NodesInfoResponse {
    #[serde(default)]
    nodes: BTreeMap<String, NodeInfo>,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    http: Option<NodeInfoHttp>,
}

#[derive(Debug, Deserialize)]
struct NodeInfoHttp {
    publish_address: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Detailed {
        #[serde(rename = "type")]
        kind: String,
        reason: Option<String>,
    },
    Plain(String),
}

/// A product exposing a nodes info API: `HEAD /` as health check and `GET /_nodes/http` as
/// topology discovery.
///
/// Master only nodes are kept out of ordinary requests and asked first when sniffing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodesApiProduct;

impl ProductRegistration for NodesApiProduct {
    fn name(&self) -> &str {
        "nodes-api"
    }

    fn supports_ping(&self) -> bool {
        true
    }

    fn supports_sniff(&self) -> bool {
        true
    }

    fn ping_request(&self) -> RequestIntent {
        RequestIntent::head("/")
    }

    fn sniff_request(&self) -> RequestIntent {
        RequestIntent::get(SNIFF_PATH).with_query_param("flat_settings", "true")
    }

    fn node_predicate(&self, node: &Node, kind: RequestKind) -> bool {
        match kind {
            RequestKind::Ordinary => !node.is_master_only(),
            RequestKind::Ping | RequestKind::Sniff => true,
        }
    }

    fn sniff_order(&self, node: &Node) -> i32 {
        if node.has_feature(features::MASTER_ELIGIBLE) {
            0
        } else {
            1
        }
    }

    fn parse_sniff_response(
        &self,
        response: &ConnectionResponse,
        answered_by: &Node,
    ) -> anyhow::Result<Vec<Node>> {
        let info: NodesInfoResponse =
            serde_json::from_slice(&response.body).context("Failed to parse nodes info")?;
        let scheme = answered_by.url().scheme();
        let mut nodes = Vec::with_capacity(info.nodes.len());
        for (id, node_info) in info.nodes {
            // Nodes without a published http address can't be routed to.
            let Some(http) = node_info.http else {
                continue;
            };
            let address = publish_address_to_url(scheme, &http.publish_address)
                .with_context(|| format!("Invalid publish address of node {id}"))?;
            let node = Node::new(&address)?
                .with_id(id)
                .with_feature(features::HTTP_ENABLED)
                .with_features(role_features(&node_info.roles));
            nodes.push(node);
        }
        if nodes.is_empty() {
            bail!("Nodes info lists no node with a published http address");
        }
        Ok(nodes)
    }

    fn failure_reason(&self, response: &ConnectionResponse) -> Option<String> {
        let parsed: ErrorResponse = serde_json::from_slice(&response.body).ok()?;
        Some(match parsed.error {
            ErrorBody::Detailed {
                kind,
                reason: Some(reason),
            } => format!("{kind}: {reason}"),
            ErrorBody::Detailed { kind, reason: None } => kind,
            ErrorBody::Plain(message) => message,
        })
    }
}

fn role_features(roles: &[String]) -> Vec<&'static str> {
    let mut result = Vec::new();
    if roles.iter().any(|r| r == "master") {
        result.push(features::MASTER_ELIGIBLE);
    }
    if roles.iter().any(|r| r == "data" || r.starts_with("data_")) {
        result.push(features::HOLDS_DATA);
    }
    if roles.iter().any(|r| r == "ingest") {
        result.push(features::INGEST);
    }
    result
}

/// Publish addresses are `host:port` or `hostname/ip:port`, the hostname being preferred.
fn publish_address_to_url(scheme: &str, publish_address: &str) -> anyhow::Result<String> {
    let (host_part, port) = publish_address
        .rsplit_once(':')
        .context("Missing port in publish address")?;
    let port: u16 = port.parse().context("Invalid port in publish address")?;
    let host = match host_part.split_once('/') {
        Some((hostname, _)) if !hostname.is_empty() => hostname,
        Some((_, ip)) => ip,
        None => host_part,
    };
    if host.is_empty() {
        bail!("Missing host in publish address");
    }
    Ok(format!("{scheme}://{host}:{port}"))
}
