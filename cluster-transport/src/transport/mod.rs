//! The main transport module. Contains the [`ClusterTransport`] type and all associated structures.
pub mod audit;
pub(crate) mod builder;
pub mod connection;
pub mod node_pool;
pub(crate) mod pipeline;
pub mod product;
pub mod request;
pub mod request_context;
pub mod response;
pub(crate) mod transport_config;
pub mod transport_error;

pub use audit::{AuditEvent, AuditEventKind, AuditTrail};
pub use builder::TransportBuilder;
pub use transport_config::{
    NodePredicate, RequestCompletedHook, TransportConfig, DEFAULT_DEAD_TIMEOUT,
    DEFAULT_MAX_DEAD_TIMEOUT, DEFAULT_MIME_TYPE, DEFAULT_PING_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SNIFF_LIFESPAN, DEFAULT_SNIFF_TIMEOUT, DEFAULT_USER_AGENT,
};
pub use transport_error::TransportError;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod transport_test;

use std::{fmt, sync::Arc};

use http::header::HeaderValue;
use tokio_util::sync::CancellationToken;

use connection::Connection;
use node_pool::NodePool;
use pipeline::RequestPipeline;
use product::ProductRegistration;
use request::RequestIntent;
use response::PipelineOutcome;

/// Sends requests to a cluster of nodes, failing over between them.
///
/// Every call to [`execute`](Self::execute) runs its own request pipeline: it may refresh the
/// topology, selects a node, health checks it if it was dead, sends the request and retries on
/// other nodes while the attempt and time budgets allow. All pipelines of a transport (and of its
/// clones) share the same [`NodePool`], so what one request learns about node health, the
/// others see.
///
/// ```no_run
/// use cluster_transport::{
///     node_pool::{Node, NodePool, SelectionStrategy},
///     product::NodesApiProduct,
///     request::RequestIntent,
///     ClusterTransport,
/// };
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let seeds = vec![
///     Node::new("http://localhost:9200")?,
///     Node::new("http://localhost:9201")?,
/// ];
/// let transport = ClusterTransport::builder()
///     .with_node_pool(NodePool::sniffing(seeds, SelectionStrategy::RoundRobin))
///     .with_product(NodesApiProduct)
///     .build()?;
///
/// let outcome = transport
///     .execute(RequestIntent::get("/_cluster/health"), CancellationToken::new())
///     .await?;
/// println!("{}", outcome.audit_trail);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ClusterTransport {
    config: Arc<TransportConfig>,
    pool: Arc<NodePool>,
    connection: Arc<dyn Connection>,
    product: Arc<dyn ProductRegistration>,
    bootstrap: Arc<tokio::sync::Mutex<()>>,
}

impl fmt::Debug for ClusterTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterTransport")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("connection", &self.connection)
            .field("product", &self.product)
            .finish_non_exhaustive()
    }
}

impl ClusterTransport {
    /// Create an instance of a [`TransportBuilder`] for building a [`ClusterTransport`].
    pub fn builder() -> TransportBuilder {
        Default::default()
    }

    /// Create an instance of a [`ClusterTransport`].
    pub fn new(
        config: TransportConfig,
        pool: Arc<NodePool>,
        connection: Arc<dyn Connection>,
        product: Arc<dyn ProductRegistration>,
    ) -> Result<Self, TransportError> {
        validate(&config)?;
        Ok(Self {
            config: Arc::new(config),
            pool,
            connection,
            product,
            bootstrap: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// The configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// The shared node pool.
    pub fn node_pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    /// The product policy.
    pub fn product(&self) -> &Arc<dyn ProductRegistration> {
        &self.product
    }

    /// Executes a logical request.
    ///
    /// The outcome, successful or not, carries the audit trail of every decision taken. A failed
    /// outcome is returned as [`TransportError::Pipeline`] instead when throwing on failure is
    /// enabled, by the configuration or by the request. An empty node pool and a malformed
    /// request always fail with an error.
    pub async fn execute(
        &self,
        intent: RequestIntent,
        token: CancellationToken,
    ) -> Result<PipelineOutcome, TransportError> {
        let throw = intent
            .config
            .throw_on_failure
            .unwrap_or(self.config.throw_on_failure);
        let outcome = RequestPipeline::new(self, &intent, token).run().await?;
        if let Some(hook) = &self.config.on_request_completed {
            hook(&outcome);
        }
        match outcome.result {
            Err(failure) if throw => Err(TransportError::Pipeline {
                failure: Box::new(failure),
                audit_trail: outcome.audit_trail,
            }),
            result => Ok(PipelineOutcome {
                result,
                audit_trail: outcome.audit_trail,
            }),
        }
    }
}

fn validate(config: &TransportConfig) -> Result<(), TransportError> {
    let headers = [
        ("user agent", Some(&config.user_agent)),
        ("content type", config.content_type.as_ref()),
        ("accept", config.accept.as_ref()),
    ];
    for (name, value) in headers {
        if let Some(value) = value {
            HeaderValue::from_str(value).map_err(|_| {
                TransportError::Configuration(format!("invalid {name} {value:?}"))
            })?;
        }
    }
    if let Some(authentication) = &config.authentication {
        authentication.header_value().map_err(|_| {
            TransportError::Configuration("invalid authentication credentials".to_string())
        })?;
    }
    if config.dead_timeout.base > config.dead_timeout.max {
        return Err(TransportError::Configuration(format!(
            "dead timeout {:?} exceeds the max dead timeout {:?}",
            config.dead_timeout.base, config.dead_timeout.max
        )));
    }
    Ok(())
}
