//! The ordered record of every decision taken while executing a logical request.

use std::{fmt, slice};

use http::StatusCode;
use tokio::time::Instant;

use super::node_pool::Node;

/// What an [`AuditEvent`] records.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AuditEventKind {
    /// A topology refresh started because the pool was never refreshed.
    SniffOnStartup,
    /// A topology refresh started because an attempt failed.
    SniffOnFail,
    /// A topology refresh started because the topology is older than the sniff lifespan.
    SniffOnStaleCluster,
    /// A node answered a sniff and the pool was reseeded.
    SniffSuccess,
    /// A node failed to answer a sniff.
    SniffFailure,
    /// A node answered a ping.
    PingSuccess,
    /// A node failed to answer a ping, it was marked dead.
    PingFailure,
    /// A dead node whose dead timeout elapsed was selected again.
    Resurrection,
    /// Every candidate node was dead, one was selected as a last resort.
    AllNodesDead,
    /// An attempt was classified as successful.
    HealthyResponse,
    /// An attempt received an unsuccessful reply or failed after dispatch.
    BadResponse,
    /// An attempt failed locally before anything was sent.
    BadRequest,
    /// The attempt budget is spent.
    MaxRetriesReached,
    /// The time budget is spent.
    MaxTimeoutReached,
    /// No node could be selected before the first attempt.
    NoNodesAttempted,
    /// Every distinct node of the pool was tried without success.
    FailedOverAllNodes,
    /// The caller cancelled the request.
    CancellationRequested,
}

impl AuditEventKind {
    /// Whether the event concludes one attempt (a ping or a physical call).
    pub fn is_attempt_outcome(&self) -> bool {
        matches!(
            self,
            AuditEventKind::HealthyResponse
                | AuditEventKind::BadResponse
                | AuditEventKind::BadRequest
                | AuditEventKind::PingSuccess
                | AuditEventKind::PingFailure
        )
    }
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One record of an [`AuditTrail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// What happened.
    pub kind: AuditEventKind,
    /// When it happened.
    pub timestamp: Instant,
    /// The node involved, if any.
    pub node: Option<Node>,
    /// Why it failed, if it did.
    pub reason: Option<String>,
    /// The status code received, if any.
    pub status: Option<StatusCode>,
}

impl AuditEvent {
    pub(crate) fn new(kind: AuditEventKind) -> Self {
        Self {
            kind,
            timestamp: Instant::now(),
            node: None,
            reason: None,
            status: None,
        }
    }

    pub(crate) fn with_node(mut self, node: &Node) -> Self {
        self.node = Some(node.clone());
        self
    }

    pub(crate) fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub(crate) fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }
}

/// Append-only sequence of [`AuditEvent`]s of one logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditTrail {
    started_at: Instant,
    events: Vec<AuditEvent>,
}

impl AuditTrail {
    pub(crate) fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            events: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, event: AuditEvent) {
        self.events.push(event);
    }

    /// When the logical request started.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// The recorded events, oldest first.
    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    /// The kinds of the recorded events, oldest first.
    pub fn kinds(&self) -> Vec<AuditEventKind> {
        self.events.iter().map(|e| e.kind).collect()
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The most recent event.
    pub fn last(&self) -> Option<&AuditEvent> {
        self.events.last()
    }

    /// Iterates over the events, oldest first.
    pub fn iter(&self) -> slice::Iter<'_, AuditEvent> {
        self.events.iter()
    }
}

impl<'a> IntoIterator for &'a AuditTrail {
    type Item = &'a AuditEvent;
    type IntoIter = slice::Iter<'a, AuditEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for AuditTrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Audit trail ({} events)", self.events.len())?;
        for (idx, event) in self.events.iter().enumerate() {
            let offset = event.timestamp.saturating_duration_since(self.started_at);
            write!(
                f,
                "\n  #{} +{:.3}s {}",
                idx + 1,
                offset.as_secs_f64(),
                event.kind
            )?;
            if let Some(node) = &event.node {
                write!(f, " node={}", node.url())?;
            }
            if let Some(status) = event.status {
                write!(f, " status={}", status.as_u16())?;
            }
            if let Some(reason) = &event.reason {
                write!(f, " reason={reason}")?;
            }
        }
        Ok(())
    }
}
