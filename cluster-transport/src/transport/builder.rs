use std::{sync::Arc, time::Duration};

use http::header::{HeaderName, HeaderValue};
use url::Url;

use super::{
    connection::Connection,
    node_pool::{DeadTimeout, Node, NodePool},
    product::{DefaultProduct, ProductRegistration},
    request::{Authentication, ClientCertificate},
    response::PipelineOutcome,
    transport_config::TransportConfig,
    ClusterTransport, TransportError,
};

/// A builder for a [`ClusterTransport`].
pub struct TransportBuilder {
    config: TransportConfig,
    pool: Option<Arc<NodePool>>,
    connection: Option<Arc<dyn Connection>>,
    product: Arc<dyn ProductRegistration>,
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self {
            config: Default::default(),
            pool: None,
            connection: None,
            product: Arc::new(DefaultProduct),
        }
    }
}

impl TransportBuilder {
    /// Create an instance of [`ClusterTransport`] with the information from this builder.
    ///
    /// Without an explicit connection a [`ReqwestConnection`](super::connection::ReqwestConnection)
    /// is created when the `reqwest` feature is enabled.
    pub fn build(self) -> Result<ClusterTransport, TransportError> {
        let pool = self
            .pool
            .ok_or_else(|| TransportError::Configuration("no node pool was set".to_string()))?;
        let connection = match self.connection {
            Some(connection) => connection,
            None => default_connection()?,
        };
        ClusterTransport::new(self.config, pool, connection, self.product)
    }

    /// Sends requests to the nodes of `pool`.
    pub fn with_node_pool(self, pool: NodePool) -> Self {
        self.with_arc_node_pool(Arc::new(pool))
    }

    /// Same as [`with_node_pool`](Self::with_node_pool), sharing the pool with other transports.
    pub fn with_arc_node_pool(self, pool: Arc<NodePool>) -> Self {
        TransportBuilder {
            pool: Some(pool),
            ..self
        }
    }

    /// Sends requests to a single node.
    pub fn with_url<S: AsRef<str>>(self, url: S) -> Result<Self, TransportError> {
        let node =
            Node::new(url).map_err(|err| TransportError::Configuration(err.to_string()))?;
        Ok(self.with_node_pool(NodePool::single(node)))
    }

    /// Performs the I/O through `connection`.
    pub fn with_connection<C: 'static + Connection>(self, connection: C) -> Self {
        self.with_arc_connection(Arc::new(connection))
    }

    /// Same as [`with_connection`](Self::with_connection), passing the shared pointer directly.
    pub fn with_arc_connection(self, connection: Arc<dyn Connection>) -> Self {
        TransportBuilder {
            connection: Some(connection),
            ..self
        }
    }

    /// Talks to the cluster as `product` does. By default, [`DefaultProduct`] is used.
    pub fn with_product<P: 'static + ProductRegistration>(self, product: P) -> Self {
        TransportBuilder {
            product: Arc::new(product),
            ..self
        }
    }

    /// Replaces the whole configuration.
    pub fn with_config(self, config: TransportConfig) -> Self {
        TransportBuilder { config, ..self }
    }

    /// Adds a header sent with every request.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.headers.insert(name, value);
        self
    }

    /// Adds a query parameter sent with every request.
    pub fn with_query_param<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.config.query.insert(key.into(), value.into());
        self
    }

    /// Timeout of a single attempt. By default, 60 seconds.
    pub fn with_request_timeout(self, timeout: Duration) -> Self {
        TransportBuilder {
            config: TransportConfig {
                request_timeout: Some(timeout),
                ..self.config
            },
            ..self
        }
    }

    /// Timeout of a single ping. By default, 2 seconds.
    pub fn with_ping_timeout(self, timeout: Duration) -> Self {
        TransportBuilder {
            config: TransportConfig {
                ping_timeout: Some(timeout),
                ..self.config
            },
            ..self
        }
    }

    /// Timeout of a single sniff request. By default, 40 seconds.
    pub fn with_sniff_timeout(self, timeout: Duration) -> Self {
        TransportBuilder {
            config: TransportConfig {
                sniff_timeout: Some(timeout),
                ..self.config
            },
            ..self
        }
    }

    /// Retries allowed per request. By default, one less than the number of nodes.
    pub fn with_max_retries(self, max_retries: usize) -> Self {
        TransportBuilder {
            config: TransportConfig {
                max_retries: Some(max_retries),
                ..self.config
            },
            ..self
        }
    }

    /// Time budget of a request, retries included. By default, the request timeout.
    pub fn with_max_retry_timeout(self, timeout: Duration) -> Self {
        TransportBuilder {
            config: TransportConfig {
                max_retry_timeout: Some(timeout),
                ..self.config
            },
            ..self
        }
    }

    /// Value of the `Content-Type` header. By default, `application/json`.
    pub fn with_content_type<S: Into<String>>(self, content_type: S) -> Self {
        TransportBuilder {
            config: TransportConfig {
                content_type: Some(content_type.into()),
                ..self.config
            },
            ..self
        }
    }

    /// Value of the `Accept` header. By default, `application/json`.
    pub fn with_accept<S: Into<String>>(self, accept: S) -> Self {
        TransportBuilder {
            config: TransportConfig {
                accept: Some(accept.into()),
                ..self.config
            },
            ..self
        }
    }

    /// Credentials sent with every request.
    pub fn with_authentication(self, authentication: Authentication) -> Self {
        TransportBuilder {
            config: TransportConfig {
                authentication: Some(authentication),
                ..self.config
            },
            ..self
        }
    }

    /// Proxy every request goes through.
    pub fn with_proxy(self, proxy: Url) -> Self {
        TransportBuilder {
            config: TransportConfig {
                proxy: Some(proxy),
                ..self.config
            },
            ..self
        }
    }

    /// TLS client certificate presented to the nodes.
    pub fn with_client_certificate(self, certificate: ClientCertificate) -> Self {
        TransportBuilder {
            config: TransportConfig {
                client_certificate: Some(certificate),
                ..self.config
            },
            ..self
        }
    }

    /// Value of the `User-Agent` header.
    pub fn with_user_agent<S: Into<String>>(self, user_agent: S) -> Self {
        TransportBuilder {
            config: TransportConfig {
                user_agent: user_agent.into(),
                ..self.config
            },
            ..self
        }
    }

    /// Refreshes the topology before the first request. Enabled by default.
    pub fn with_sniff_on_startup(self, enabled: bool) -> Self {
        TransportBuilder {
            config: TransportConfig {
                sniff_on_startup: enabled,
                ..self.config
            },
            ..self
        }
    }

    /// Refreshes the topology after a failed attempt. Enabled by default.
    pub fn with_sniff_on_connection_fault(self, enabled: bool) -> Self {
        TransportBuilder {
            config: TransportConfig {
                sniff_on_connection_fault: enabled,
                ..self.config
            },
            ..self
        }
    }

    /// Refreshes a topology older than `lifespan` before a request. By default, one hour.
    pub fn with_sniff_lifespan(self, lifespan: Option<Duration>) -> Self {
        TransportBuilder {
            config: TransportConfig {
                sniff_lifespan: lifespan,
                ..self.config
            },
            ..self
        }
    }

    /// Dead timeout after a first failure and its upper bound. By default, 1 and 30 minutes.
    pub fn with_dead_timeout(self, base: Duration, max: Duration) -> Self {
        TransportBuilder {
            config: TransportConfig {
                dead_timeout: DeadTimeout::new(base, max),
                ..self.config
            },
            ..self
        }
    }

    /// Surfaces failed outcomes as [`TransportError::Pipeline`]. Disabled by default.
    pub fn with_throw_on_failure(self, enabled: bool) -> Self {
        TransportBuilder {
            config: TransportConfig {
                throw_on_failure: enabled,
                ..self.config
            },
            ..self
        }
    }

    /// Never pings resurrected nodes.
    pub fn with_disable_pings(self, disabled: bool) -> Self {
        TransportBuilder {
            config: TransportConfig {
                disable_pings: disabled,
                ..self.config
            },
            ..self
        }
    }

    /// Only sends ordinary requests to nodes matching `predicate`.
    pub fn with_node_predicate<F>(self, predicate: F) -> Self
    where
        F: Fn(&Node) -> bool + Send + Sync + 'static,
    {
        TransportBuilder {
            config: TransportConfig {
                node_predicate: Some(Arc::new(predicate)),
                ..self.config
            },
            ..self
        }
    }

    /// Tries another node after a transient local failure instead of failing the request.
    pub fn with_retry_on_local_failure(self, enabled: bool) -> Self {
        TransportBuilder {
            config: TransportConfig {
                retry_on_local_failure: enabled,
                ..self.config
            },
            ..self
        }
    }

    /// Lets retries go back to already tried nodes once every node was tried.
    pub fn with_reuse_nodes_on_exhaustion(self, enabled: bool) -> Self {
        TransportBuilder {
            config: TransportConfig {
                reuse_nodes_on_exhaustion: enabled,
                ..self.config
            },
            ..self
        }
    }

    /// Makes requests racing the startup sniff wait for it rather than proceed with the seed nodes.
    pub fn with_wait_for_startup_sniff(self, enabled: bool) -> Self {
        TransportBuilder {
            config: TransportConfig {
                wait_for_startup_sniff: enabled,
                ..self.config
            },
            ..self
        }
    }

    /// Invokes `hook` with every outcome, before a failure is surfaced as an error.
    pub fn with_request_completed_hook<F>(self, hook: F) -> Self
    where
        F: Fn(&PipelineOutcome) + Send + Sync + 'static,
    {
        TransportBuilder {
            config: TransportConfig {
                on_request_completed: Some(Arc::new(hook)),
                ..self.config
            },
            ..self
        }
    }
}

#[cfg(feature = "reqwest")]
fn default_connection() -> Result<Arc<dyn Connection>, TransportError> {
    let connection = super::connection::ReqwestConnection::new()
        .map_err(|err| TransportError::Configuration(err.to_string()))?;
    Ok(Arc::new(connection))
}

#[cfg(not(feature = "reqwest"))]
fn default_connection() -> Result<Arc<dyn Connection>, TransportError> {
    Err(TransportError::Configuration(
        "no connection was set".to_string(),
    ))
}
