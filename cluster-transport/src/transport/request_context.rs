//! Resolution of global configuration and per-call overrides into per-attempt contexts.

use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use http::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Method,
};
use indexmap::IndexMap;
use url::Url;

use super::{
    node_pool::Node,
    request::{AllowedStatusCodes, Authentication, ClientCertificate, RequestIntent},
    transport_config::{
        TransportConfig, DEFAULT_MIME_TYPE, DEFAULT_PING_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
        DEFAULT_SNIFF_TIMEOUT,
    },
    transport_error::TransportError,
};

/// Name of the header carrying the opaque id.
pub const OPAQUE_ID_HEADER: &str = "x-opaque-id";

/// What a context was produced for.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RequestKind {
    /// A caller request.
    Ordinary,
    /// A node health check.
    Ping,
    /// A topology discovery request.
    Sniff,
}

/// Per-call value if present, else global value, else the hard-coded default.
fn resolve<T: Clone>(per_call: Option<&T>, global: Option<&T>, default: T) -> T {
    per_call.or(global).cloned().unwrap_or(default)
}

/// Global entries first, per-call entries overlaid. Conflicting keys keep their global position.
fn merge<K, V>(global: &IndexMap<K, V>, per_call: &IndexMap<K, V>) -> IndexMap<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    let mut merged = global.clone();
    for (key, value) in per_call {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value)
        .map_err(|_| TransportError::InvalidRequest(format!("invalid {name} header value {value:?}")))
}

/// The node independent part of a request, resolved once per logical request.
#[derive(Debug)]
struct ResolvedRequest {
    kind: RequestKind,
    method: Method,
    path: String,
    body: Option<Arc<[u8]>>,
    headers: IndexMap<HeaderName, HeaderValue>,
    query: IndexMap<String, String>,
    request_timeout: Duration,
    ping_timeout: Duration,
    sniff_timeout: Duration,
    content_type: HeaderValue,
    accept: HeaderValue,
    user_agent: HeaderValue,
    authentication: Option<Authentication>,
    authorization: Option<HeaderValue>,
    opaque_id: Option<HeaderValue>,
    proxy: Option<Url>,
    client_certificate: Option<ClientCertificate>,
    allowed_status_codes: Option<AllowedStatusCodes>,
}

/// Merges a [`RequestIntent`] with the [`TransportConfig`] and binds the result to nodes.
///
/// The merge runs once, in [`new`](Self::new); every [`bind`](Self::bind) reuses it, so
/// contexts built for successive attempts only differ by their node.
#[derive(Debug, Clone)]
pub struct RequestContextBuilder {
    resolved: Arc<ResolvedRequest>,
}

impl RequestContextBuilder {
    /// Resolves the node independent part of the request.
    ///
    /// Fails if the path carries a query string or if a resolved header value is invalid.
    pub fn new(
        config: &TransportConfig,
        intent: &RequestIntent,
        kind: RequestKind,
    ) -> Result<Self, TransportError> {
        if intent.path.contains('?') {
            return Err(TransportError::InvalidRequest(format!(
                "path {:?} must not contain a query string, use query parameters instead",
                intent.path
            )));
        }
        let call = &intent.config;

        let content_type = resolve(
            call.content_type.as_ref(),
            config.content_type.as_ref(),
            DEFAULT_MIME_TYPE.to_string(),
        );
        let accept = resolve(
            call.accept.as_ref(),
            config.accept.as_ref(),
            DEFAULT_MIME_TYPE.to_string(),
        );
        let authentication = call
            .authentication
            .as_ref()
            .or(config.authentication.as_ref())
            .cloned();
        let authorization = authentication
            .as_ref()
            .map(|auth| {
                auth.header_value().map_err(|_| {
                    TransportError::InvalidRequest("invalid authorization header value".to_string())
                })
            })
            .transpose()?;
        let opaque_id = call
            .opaque_id
            .as_deref()
            .map(|id| header_value(OPAQUE_ID_HEADER, id))
            .transpose()?;

        let resolved = ResolvedRequest {
            kind,
            method: intent.method.clone(),
            path: intent.path.clone(),
            body: intent.body.clone(),
            headers: merge(&config.headers, &call.headers),
            query: merge(&config.query, &call.query),
            request_timeout: resolve(
                call.request_timeout.as_ref(),
                config.request_timeout.as_ref(),
                DEFAULT_REQUEST_TIMEOUT,
            ),
            ping_timeout: resolve(
                call.ping_timeout.as_ref(),
                config.ping_timeout.as_ref(),
                DEFAULT_PING_TIMEOUT,
            ),
            sniff_timeout: resolve(None, config.sniff_timeout.as_ref(), DEFAULT_SNIFF_TIMEOUT),
            content_type: header_value(header::CONTENT_TYPE.as_str(), &content_type)?,
            accept: header_value(header::ACCEPT.as_str(), &accept)?,
            user_agent: header_value(header::USER_AGENT.as_str(), &config.user_agent)?,
            authentication,
            authorization,
            opaque_id,
            proxy: call.proxy.as_ref().or(config.proxy.as_ref()).cloned(),
            client_certificate: call
                .client_certificate
                .as_ref()
                .or(config.client_certificate.as_ref())
                .cloned(),
            allowed_status_codes: call.allowed_status_codes.clone(),
        };
        Ok(Self {
            resolved: Arc::new(resolved),
        })
    }

    /// Produces the context of one attempt against `node`.
    pub fn bind(&self, node: Node) -> RequestContext {
        RequestContext {
            resolved: Arc::clone(&self.resolved),
            node,
            uri: OnceLock::new(),
        }
    }
}

/// The immutable snapshot of one physical attempt.
#[derive(Debug, Clone)]
pub struct RequestContext {
    resolved: Arc<ResolvedRequest>,
    node: Node,
    uri: OnceLock<Url>,
}

impl RequestContext {
    /// Binds the context to another node. The target address is recomputed only if the node changed.
    pub fn rebind(&mut self, node: Node) {
        if node.id() != self.node.id() || node.url() != self.node.url() {
            self.uri = OnceLock::new();
        }
        self.node = node;
    }

    /// The bound node.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// What the context was produced for.
    pub fn kind(&self) -> RequestKind {
        self.resolved.kind
    }

    /// The HTTP method.
    pub fn method(&self) -> &Method {
        &self.resolved.method
    }

    /// The path relative to the node base address.
    pub fn path(&self) -> &str {
        &self.resolved.path
    }

    /// The serialized body.
    pub fn body(&self) -> Option<&[u8]> {
        self.resolved.body.as_deref()
    }

    /// Global headers overlaid with per-call headers.
    pub fn headers(&self) -> &IndexMap<HeaderName, HeaderValue> {
        &self.resolved.headers
    }

    /// Global query parameters overlaid with per-call parameters.
    pub fn query(&self) -> &IndexMap<String, String> {
        &self.resolved.query
    }

    /// The fully qualified target address, computed on first use.
    pub fn uri(&self) -> &Url {
        self.uri.get_or_init(|| {
            let mut uri = self.node.url().clone();
            let path = format!(
                "{}{}",
                uri.path(),
                self.resolved.path.trim_start_matches('/')
            );
            uri.set_path(&path);
            if !self.resolved.query.is_empty() {
                uri.query_pairs_mut().extend_pairs(&self.resolved.query);
            }
            uri
        })
    }

    /// Timeout of the request itself, depending on its kind.
    pub fn timeout(&self) -> Duration {
        match self.resolved.kind {
            RequestKind::Ordinary => self.resolved.request_timeout,
            RequestKind::Ping => self.resolved.ping_timeout,
            RequestKind::Sniff => self.resolved.sniff_timeout,
        }
    }

    /// Timeout of an ordinary attempt.
    pub fn request_timeout(&self) -> Duration {
        self.resolved.request_timeout
    }

    /// Timeout of a ping.
    pub fn ping_timeout(&self) -> Duration {
        self.resolved.ping_timeout
    }

    /// The `Content-Type` header value.
    pub fn content_type(&self) -> &HeaderValue {
        &self.resolved.content_type
    }

    /// The `Accept` header value.
    pub fn accept(&self) -> &HeaderValue {
        &self.resolved.accept
    }

    /// The resolved credentials.
    pub fn authentication(&self) -> Option<&Authentication> {
        self.resolved.authentication.as_ref()
    }

    /// The proxy to send the request through.
    pub fn proxy(&self) -> Option<&Url> {
        self.resolved.proxy.as_ref()
    }

    /// The TLS client certificate to present.
    pub fn client_certificate(&self) -> Option<&ClientCertificate> {
        self.resolved.client_certificate.as_ref()
    }

    /// Per-call success override.
    pub fn allowed_status_codes(&self) -> Option<&AllowedStatusCodes> {
        self.resolved.allowed_status_codes.as_ref()
    }

    /// Every header to put on the wire.
    pub fn header_map(&self) -> HeaderMap {
        let resolved = &self.resolved;
        let mut map = HeaderMap::with_capacity(resolved.headers.len() + 5);
        map.insert(header::ACCEPT, resolved.accept.clone());
        map.insert(header::USER_AGENT, resolved.user_agent.clone());
        if resolved.body.is_some() {
            map.insert(header::CONTENT_TYPE, resolved.content_type.clone());
        }
        if let Some(authorization) = &resolved.authorization {
            map.insert(header::AUTHORIZATION, authorization.clone());
        }
        if let Some(opaque_id) = &resolved.opaque_id {
            map.insert(HeaderName::from_static(OPAQUE_ID_HEADER), opaque_id.clone());
        }
        for (name, value) in &resolved.headers {
            map.insert(name.clone(), value.clone());
        }
        map
    }
}
