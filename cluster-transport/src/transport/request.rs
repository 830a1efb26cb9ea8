//! Caller-supplied descriptions of logical requests and their per-call overrides.

use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine};
use http::{
    header::{HeaderName, HeaderValue, InvalidHeaderValue},
    Method, StatusCode,
};
use indexmap::IndexMap;
use url::Url;

/// Credentials sent in the `Authorization` header.
#[derive(Clone, PartialEq, Eq)]
pub enum Authentication {
    /// HTTP basic authentication.
    Basic {
        /// The user name.
        username: String,
        /// The password.
        password: String,
    },
    /// An API key, already encoded the way the cluster expects it.
    ApiKey(String),
    /// A bearer token.
    Bearer(String),
}

impl Authentication {
    /// The value of the `Authorization` header carrying these credentials.
    pub fn header_value(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let raw = match self {
            Authentication::Basic { username, password } => {
                format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
            }
            Authentication::ApiKey(key) => format!("ApiKey {key}"),
            Authentication::Bearer(token) => format!("Bearer {token}"),
        };
        let mut value = HeaderValue::from_str(&raw)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authentication::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Authentication::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Authentication::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

/// A TLS client certificate selection, carried through to the connection.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ClientCertificate {
    pem: Arc<[u8]>,
}

impl ClientCertificate {
    /// Wraps a PEM encoded certificate and private key.
    pub fn from_pem(pem: impl Into<Vec<u8>>) -> Self {
        Self {
            pem: pem.into().into(),
        }
    }

    /// The PEM bytes.
    pub fn pem(&self) -> &[u8] {
        &self.pem
    }
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientCertificate({} bytes)", self.pem.len())
    }
}

/// Status codes a caller accepts as success, overriding the product classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedStatusCodes {
    /// Every status code is a success.
    Any,
    /// Only the listed status codes are successes.
    Codes(BTreeSet<u16>),
}

impl AllowedStatusCodes {
    /// Accepts exactly the given status codes.
    pub fn codes<I: IntoIterator<Item = u16>>(codes: I) -> Self {
        AllowedStatusCodes::Codes(codes.into_iter().collect())
    }

    /// Whether `status` counts as success.
    pub fn allows(&self, status: StatusCode) -> bool {
        match self {
            AllowedStatusCodes::Any => true,
            AllowedStatusCodes::Codes(codes) => codes.contains(&status.as_u16()),
        }
    }
}

/// Per-call overrides. Every field left unset falls back to the transport configuration.
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    /// Headers overlaid on the configured default headers.
    pub headers: IndexMap<HeaderName, HeaderValue>,
    /// Query parameters overlaid on the configured default query parameters.
    pub query: IndexMap<String, String>,
    /// Timeout of a single attempt.
    pub request_timeout: Option<Duration>,
    /// Timeout of a single ping.
    pub ping_timeout: Option<Duration>,
    /// Value of the `Content-Type` header.
    pub content_type: Option<String>,
    /// Value of the `Accept` header.
    pub accept: Option<String>,
    /// Credentials replacing the configured ones.
    pub authentication: Option<Authentication>,
    /// Proxy to send the request through.
    pub proxy: Option<Url>,
    /// TLS client certificate to present.
    pub client_certificate: Option<ClientCertificate>,
    /// Status codes accepted as success regardless of the product classification.
    pub allowed_status_codes: Option<AllowedStatusCodes>,
    /// Retries allowed for this call.
    pub max_retries: Option<usize>,
    /// Skip pinging resurrected nodes.
    pub disable_ping: bool,
    /// Skip every topology refresh.
    pub disable_sniff: bool,
    /// Send the request to this node only, bypassing selection.
    pub force_node: Option<Url>,
    /// Surface a failed outcome as an error.
    pub throw_on_failure: Option<bool>,
    /// Sent as the `x-opaque-id` header to correlate the request server side.
    pub opaque_id: Option<String>,
}

/// A logical request: what to call and how, independently of the node it ends up on.
#[derive(Debug, Clone)]
pub struct RequestIntent {
    /// The HTTP method.
    pub method: Method,
    /// The path relative to the node base address, without a query string.
    pub path: String,
    /// The already serialized body.
    pub body: Option<Arc<[u8]>>,
    /// Per-call overrides.
    pub config: RequestConfig,
}

impl RequestIntent {
    /// Creates a request without body or overrides.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            config: RequestConfig::default(),
        }
    }

    /// A `GET` request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// A `HEAD` request.
    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    /// A `POST` request carrying `body`.
    pub fn post(path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into().into());
        self
    }

    /// Replaces all per-call overrides.
    pub fn with_config(mut self, config: RequestConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a header, replacing a configured one with the same name.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.headers.insert(name, value);
        self
    }

    /// Adds a query parameter, replacing a configured one with the same key.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.query.insert(key.into(), value.into());
        self
    }

    /// Sets the timeout of a single attempt.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Accepts the given status codes as success.
    pub fn with_allowed_status_codes(mut self, codes: AllowedStatusCodes) -> Self {
        self.config.allowed_status_codes = Some(codes);
        self
    }

    /// Sets the retries allowed for this call.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.config.max_retries = Some(max_retries);
        self
    }

    /// Sends the request to the given node only.
    pub fn with_force_node(mut self, node: Url) -> Self {
        self.config.force_node = Some(node);
        self
    }

    /// Overrides whether a failed outcome surfaces as an error.
    pub fn with_throw_on_failure(mut self, throw: bool) -> Self {
        self.config.throw_on_failure = Some(throw);
        self
    }

    /// Sets the opaque id.
    pub fn with_opaque_id(mut self, opaque_id: impl Into<String>) -> Self {
        self.config.opaque_id = Some(opaque_id.into());
        self
    }

    /// Replaces the configured credentials.
    pub fn with_authentication(mut self, authentication: Authentication) -> Self {
        self.config.authentication = Some(authentication);
        self
    }
}
