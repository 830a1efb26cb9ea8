//! A cluster node: address, features and health.

use std::{collections::BTreeSet, fmt, time::Duration};

use thiserror::Error;
use tokio::time::Instant;
use url::Url;

/// Well-known node feature names.
pub mod features {
    /// The node may be elected as cluster master.
    pub const MASTER_ELIGIBLE: &str = "master_eligible";
    /// The node stores data.
    pub const HOLDS_DATA: &str = "holds_data";
    /// The node runs ingest pipelines.
    pub const INGEST: &str = "ingest";
    /// The node exposes the HTTP interface.
    pub const HTTP_ENABLED: &str = "http_enabled";
}

/// An error returned when a node address can't be used for routing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidNodeError {
    /// The address couldn't be parsed.
    #[error("Invalid node address {address}: {reason}")]
    Malformed {
        /// The rejected address.
        address: String,
        /// Why parsing failed.
        reason: String,
    },
    /// The scheme is neither `http` nor `https`.
    #[error("Unsupported scheme {0} for a node address, expected http or https")]
    UnsupportedScheme(String),
    /// The address carries a query string or fragment.
    #[error("Node address {0} must not contain a query string or a fragment")]
    UnexpectedQuery(String),
}

/// Exponential dead-timeout policy applied when a node is marked dead.
///
/// The delay for the `n`th consecutive failure is `base * 2^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadTimeout {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound of the delay.
    pub max: Duration,
}

impl DeadTimeout {
    /// Creates a new policy.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Returns the delay for the given count of consecutive failures.
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Health bookkeeping of a node. Only the node pool mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeHealth {
    pub(crate) alive: bool,
    pub(crate) dead_until: Option<Instant>,
    pub(crate) failed_attempts: u32,
    /// Set while the node hasn't been contacted since it was added or resurrected.
    pub(crate) resurrected: bool,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self {
            alive: true,
            dead_until: None,
            failed_attempts: 0,
            resurrected: true,
        }
    }
}

/// One endpoint of the cluster.
///
/// A `Node` is a value: the ones handed out by a [`NodePool`](super::NodePool) are snapshots of
/// the pooled entry taken at selection time, changing them never changes the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    id: String,
    url: Url,
    features: BTreeSet<String>,
    pub(crate) health: NodeHealth,
}

impl Node {
    /// Creates a node from its base address. The identifier defaults to the normalized address.
    pub fn new(address: impl AsRef<str>) -> Result<Self, InvalidNodeError> {
        let url = parse_base_url(address.as_ref())?;
        Ok(Self {
            id: url.as_str().to_string(),
            url,
            features: BTreeSet::new(),
            health: NodeHealth::default(),
        })
    }

    /// Sets a stable identifier, e.g. the one reported by cluster discovery.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Adds a named feature flag.
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }

    /// Adds several named feature flags.
    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features.extend(features.into_iter().map(Into::into));
        self
    }

    /// The stable identifier of the node.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The base address (scheme, host, port and path prefix).
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The named feature flags.
    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }

    /// Whether the node carries the given feature flag.
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Master eligible nodes which hold no data.
    pub fn is_master_only(&self) -> bool {
        self.has_feature(features::MASTER_ELIGIBLE) && !self.has_feature(features::HOLDS_DATA)
    }

    /// Whether the node was alive when this snapshot was taken.
    pub fn is_alive(&self) -> bool {
        self.health.alive
    }

    /// When a dead node becomes eligible again.
    pub fn dead_until(&self) -> Option<Instant> {
        self.health.dead_until
    }

    /// Consecutive failures since the last success.
    pub fn failed_attempts(&self) -> u32 {
        self.health.failed_attempts
    }

    /// Whether the node hasn't been contacted since it joined the pool or was resurrected.
    pub fn is_resurrected(&self) -> bool {
        self.health.resurrected
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id == self.url.as_str() {
            write!(f, "{}", self.url)
        } else {
            write!(f, "{} ({})", self.id, self.url)
        }
    }
}

fn parse_base_url(address: &str) -> Result<Url, InvalidNodeError> {
    let mut url = Url::parse(address).map_err(|err| InvalidNodeError::Malformed {
        address: address.to_string(),
        reason: err.to_string(),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(InvalidNodeError::UnsupportedScheme(url.scheme().to_string()));
    }
    if url.host_str().is_none() {
        return Err(InvalidNodeError::Malformed {
            address: address.to_string(),
            reason: "missing host".to_string(),
        });
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(InvalidNodeError::UnexpectedQuery(address.to_string()));
    }
    // The path prefix always ends with a slash, so joining request paths is uniform.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
