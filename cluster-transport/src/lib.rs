//! The `cluster-transport` crate sends HTTP requests to a cluster of interchangeable nodes and
//! keeps doing so while nodes come and go.
//!
//! ## Overview
//! A [`ClusterTransport`] owns a shared [`NodePool`](node_pool::NodePool) tracking the health of
//! every node. Each logical request runs through a request pipeline which:
//!
//! - refreshes the node list from the cluster itself ("sniffing") on startup, when it grew stale
//!   or after a connection fault,
//! - selects a node, preferring alive ones and tentatively resurrecting dead ones whose dead
//!   timeout elapsed,
//! - pings resurrected nodes before trusting them with the request,
//! - retries on other nodes while the attempt and time budgets allow, honoring cancellation.
//!
//! Every decision is recorded in an [`AuditTrail`] returned with the outcome.
//!
//! What a healthy response looks like, how a node is pinged and how the topology is discovered
//! depends on the product behind the cluster, described by a
//! [`ProductRegistration`](product::ProductRegistration). The actual I/O is done by a
//! [`Connection`](connection::Connection), by default one backed by `reqwest`.
//!
//! ## Example
//! ```rust,no_run
//! use cluster_transport::{
//!     node_pool::{Node, NodePool, SelectionStrategy},
//!     product::NodesApiProduct,
//!     request::RequestIntent,
//!     ClusterTransport,
//! };
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let seeds = vec![Node::new("http://es-1:9200")?, Node::new("http://es-2:9200")?];
//!     let transport = ClusterTransport::builder()
//!         .with_node_pool(NodePool::sniffing(seeds, SelectionStrategy::RoundRobin))
//!         .with_product(NodesApiProduct)
//!         .with_max_retry_timeout(Duration::from_secs(30))
//!         .with_throw_on_failure(true)
//!         .build()?;
//!
//!     let outcome = transport
//!         .execute(
//!             RequestIntent::post("/logs/_search", r#"{"query":{"match_all":{}}}"#),
//!             CancellationToken::new(),
//!         )
//!         .await?;
//!     if let Some(response) = outcome.response() {
//!         println!("{} from {}: {}", response.status, response.node, response.text());
//!     }
//!     Ok(())
//! }
//! ```

#![warn(
    missing_docs,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod transport;

#[doc(inline)]
pub use transport::{
    audit, connection, node_pool, product, request, request_context, response, transport_error,
    AuditEvent, AuditEventKind, AuditTrail, ClusterTransport, TransportBuilder, TransportConfig,
    TransportError,
};
