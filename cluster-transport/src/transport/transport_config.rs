use std::{fmt, sync::Arc, time::Duration};

use http::header::{HeaderName, HeaderValue};
use indexmap::IndexMap;
use url::Url;

use super::{
    node_pool::{DeadTimeout, Node},
    request::{Authentication, ClientCertificate},
    response::PipelineOutcome,
};

/// Timeout of a single attempt when neither the call nor the configuration sets one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout of a single ping when neither the call nor the configuration sets one.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);
/// Timeout of a single sniff request.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(40);
/// Dead timeout after the first failure of a node.
pub const DEFAULT_DEAD_TIMEOUT: Duration = Duration::from_secs(60);
/// Upper bound of the dead timeout.
pub const DEFAULT_MAX_DEAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// How long a sniffed topology stays fresh.
pub const DEFAULT_SNIFF_LIFESPAN: Duration = Duration::from_secs(60 * 60);
/// Content type and accepted media type.
pub const DEFAULT_MIME_TYPE: &str = "application/json";
/// Value of the `User-Agent` header.
pub const DEFAULT_USER_AGENT: &str = concat!("cluster-transport/", env!("CARGO_PKG_VERSION"));

/// A filter deciding which nodes ordinary requests may be sent to.
pub type NodePredicate = Arc<dyn Fn(&Node) -> bool + Send + Sync>;

/// A callback invoked with every completed outcome.
pub type RequestCompletedHook = Arc<dyn Fn(&PipelineOutcome) + Send + Sync>;

/// A configuration for a transport.
#[derive(Clone)]
pub struct TransportConfig {
    /// See [`with_header`](super::TransportBuilder::with_header).
    pub headers: IndexMap<HeaderName, HeaderValue>,
    /// See [`with_query_param`](super::TransportBuilder::with_query_param).
    pub query: IndexMap<String, String>,
    /// See [`with_request_timeout`](super::TransportBuilder::with_request_timeout).
    pub request_timeout: Option<Duration>,
    /// See [`with_ping_timeout`](super::TransportBuilder::with_ping_timeout).
    pub ping_timeout: Option<Duration>,
    /// See [`with_sniff_timeout`](super::TransportBuilder::with_sniff_timeout).
    pub sniff_timeout: Option<Duration>,
    /// See [`with_max_retries`](super::TransportBuilder::with_max_retries).
    pub max_retries: Option<usize>,
    /// See [`with_max_retry_timeout`](super::TransportBuilder::with_max_retry_timeout).
    pub max_retry_timeout: Option<Duration>,
    /// See [`with_content_type`](super::TransportBuilder::with_content_type).
    pub content_type: Option<String>,
    /// See [`with_accept`](super::TransportBuilder::with_accept).
    pub accept: Option<String>,
    /// See [`with_authentication`](super::TransportBuilder::with_authentication).
    pub authentication: Option<Authentication>,
    /// See [`with_proxy`](super::TransportBuilder::with_proxy).
    pub proxy: Option<Url>,
    /// See [`with_client_certificate`](super::TransportBuilder::with_client_certificate).
    pub client_certificate: Option<ClientCertificate>,
    /// See [`with_user_agent`](super::TransportBuilder::with_user_agent).
    pub user_agent: String,
    /// See [`with_sniff_on_startup`](super::TransportBuilder::with_sniff_on_startup).
    pub sniff_on_startup: bool,
    /// See [`with_sniff_on_connection_fault`](super::TransportBuilder::with_sniff_on_connection_fault).
    pub sniff_on_connection_fault: bool,
    /// See [`with_sniff_lifespan`](super::TransportBuilder::with_sniff_lifespan).
    pub sniff_lifespan: Option<Duration>,
    /// See [`with_dead_timeout`](super::TransportBuilder::with_dead_timeout).
    pub dead_timeout: DeadTimeout,
    /// See [`with_throw_on_failure`](super::TransportBuilder::with_throw_on_failure).
    pub throw_on_failure: bool,
    /// See [`with_disable_pings`](super::TransportBuilder::with_disable_pings).
    pub disable_pings: bool,
    /// See [`with_node_predicate`](super::TransportBuilder::with_node_predicate).
    pub node_predicate: Option<NodePredicate>,
    /// See [`with_retry_on_local_failure`](super::TransportBuilder::with_retry_on_local_failure).
    pub retry_on_local_failure: bool,
    /// See [`with_reuse_nodes_on_exhaustion`](super::TransportBuilder::with_reuse_nodes_on_exhaustion).
    pub reuse_nodes_on_exhaustion: bool,
    /// See [`with_wait_for_startup_sniff`](super::TransportBuilder::with_wait_for_startup_sniff).
    pub wait_for_startup_sniff: bool,
    /// See [`with_request_completed_hook`](super::TransportBuilder::with_request_completed_hook).
    pub on_request_completed: Option<RequestCompletedHook>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            headers: IndexMap::new(),
            query: IndexMap::new(),
            request_timeout: None,
            ping_timeout: None,
            sniff_timeout: None,
            max_retries: None,
            max_retry_timeout: None,
            content_type: None,
            accept: None,
            authentication: None,
            proxy: None,
            client_certificate: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            sniff_on_startup: true,
            sniff_on_connection_fault: true,
            sniff_lifespan: Some(DEFAULT_SNIFF_LIFESPAN),
            dead_timeout: DeadTimeout::new(DEFAULT_DEAD_TIMEOUT, DEFAULT_MAX_DEAD_TIMEOUT),
            throw_on_failure: false,
            disable_pings: false,
            node_predicate: None,
            retry_on_local_failure: false,
            reuse_nodes_on_exhaustion: false,
            wait_for_startup_sniff: true,
            on_request_completed: None,
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("headers", &self.headers)
            .field("query", &self.query)
            .field("request_timeout", &self.request_timeout)
            .field("ping_timeout", &self.ping_timeout)
            .field("sniff_timeout", &self.sniff_timeout)
            .field("max_retries", &self.max_retries)
            .field("max_retry_timeout", &self.max_retry_timeout)
            .field("content_type", &self.content_type)
            .field("accept", &self.accept)
            .field("authentication", &self.authentication)
            .field("proxy", &self.proxy)
            .field("client_certificate", &self.client_certificate)
            .field("user_agent", &self.user_agent)
            .field("sniff_on_startup", &self.sniff_on_startup)
            .field("sniff_on_connection_fault", &self.sniff_on_connection_fault)
            .field("sniff_lifespan", &self.sniff_lifespan)
            .field("dead_timeout", &self.dead_timeout)
            .field("throw_on_failure", &self.throw_on_failure)
            .field("disable_pings", &self.disable_pings)
            .field("node_predicate", &self.node_predicate.is_some())
            .field("retry_on_local_failure", &self.retry_on_local_failure)
            .field("reuse_nodes_on_exhaustion", &self.reuse_nodes_on_exhaustion)
            .field("wait_for_startup_sniff", &self.wait_for_startup_sniff)
            .field("on_request_completed", &self.on_request_completed.is_some())
            .finish()
    }
}
