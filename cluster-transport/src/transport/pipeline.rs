//! The state machine driving one logical request: sniff, select, ping, attempt, retry.

use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    audit::{AuditEvent, AuditEventKind, AuditTrail},
    connection::{ConnectionError, ConnectionErrorKind},
    node_pool::{Node, Selection, SelectionKind},
    request::RequestIntent,
    request_context::{RequestContext, RequestContextBuilder, RequestKind},
    response::{
        ClusterResponse, ConnectionResponse, FailureReason, PipelineFailure, PipelineOutcome,
    },
    transport_config::DEFAULT_REQUEST_TIMEOUT,
    transport_error::TransportError,
    ClusterTransport,
};

const REQUEST_PIPELINE: &str = "RequestPipeline";

/// How a ping ended.
enum PingOutcome {
    Alive,
    Dead,
    Cancelled,
}

/// How an attempt ended.
enum AttemptOutcome {
    Success(ClusterResponse),
    /// The node was marked dead, another one may be tried.
    Retry,
    /// A transient local failure, another node may be tried.
    LocalRetry,
    Fatal(FailureReason),
}

/// What is known about the last failure, reported when the request fails.
#[derive(Default)]
struct LastFailure {
    node: Option<Node>,
    status: Option<http::StatusCode>,
    error: Option<String>,
}

/// One execution of a logical request. Attempts are strictly sequential.
pub(crate) struct RequestPipeline<'a> {
    transport: &'a ClusterTransport,
    intent: &'a RequestIntent,
    token: CancellationToken,
    started_at: Instant,
    budget: Duration,
    audit: AuditTrail,
    last: LastFailure,
    clamped_to_pool: bool,
}

impl<'a> RequestPipeline<'a> {
    pub(crate) fn new(
        transport: &'a ClusterTransport,
        intent: &'a RequestIntent,
        token: CancellationToken,
    ) -> Self {
        let started_at = Instant::now();
        let config = &transport.config;
        let budget = config
            .max_retry_timeout
            .or(intent.config.request_timeout)
            .or(config.request_timeout)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        Self {
            transport,
            intent,
            token,
            started_at,
            budget,
            audit: AuditTrail::new(started_at),
            last: LastFailure::default(),
            clamped_to_pool: false,
        }
    }

    /// Runs the request to completion.
    ///
    /// Only usage errors are returned as `Err`, every other failure is part of the outcome.
    pub(crate) async fn run(mut self) -> Result<PipelineOutcome, TransportError> {
        let request =
            RequestContextBuilder::new(&self.transport.config, self.intent, RequestKind::Ordinary)?;
        let result = match self.intent.config.force_node.clone() {
            Some(url) => self.execute_on_forced_node(&request, &url).await?,
            None => self.execute(&request).await?,
        };
        Ok(PipelineOutcome {
            result,
            audit_trail: self.audit,
        })
    }

    async fn execute(
        &mut self,
        request: &RequestContextBuilder,
    ) -> Result<Result<ClusterResponse, PipelineFailure>, TransportError> {
        if self.transport.pool.is_empty() {
            return Err(TransportError::NoNodesAvailable);
        }
        self.sniff_on_startup().await;
        self.sniff_on_stale_cluster().await;

        let max_attempts = self.max_attempts();
        let mut attempts = 0;
        let mut tried = HashSet::new();
        loop {
            if let Some(reason) = self.interrupted(attempts, max_attempts) {
                return Ok(Err(self.fail(reason)));
            }
            let Some(selection) = self.select_node(&mut tried)? else {
                let reason = if attempts == 0 {
                    FailureReason::NoNodesAttempted
                } else {
                    FailureReason::MaxRetriesReached
                };
                return Ok(Err(self.fail(reason)));
            };
            let node = selection.node;
            match selection.kind {
                SelectionKind::Alive => {}
                SelectionKind::Resurrected => self
                    .audit
                    .push(AuditEvent::new(AuditEventKind::Resurrection).with_node(&node)),
                SelectionKind::LastResort => self
                    .audit
                    .push(AuditEvent::new(AuditEventKind::AllNodesDead).with_node(&node)),
            }

            if self.should_ping(&node) {
                match self.ping(&node).await {
                    PingOutcome::Alive => {}
                    PingOutcome::Dead => {
                        self.sniff_on_connection_fault().await;
                        continue;
                    }
                    PingOutcome::Cancelled => return Ok(Err(self.fail(FailureReason::Cancelled))),
                }
            }

            let Some(remaining) = self.remaining() else {
                return Ok(Err(self.fail(FailureReason::MaxTimeoutReached)));
            };
            attempts += 1;
            match self.attempt(request, node, remaining).await {
                AttemptOutcome::Success(response) => return Ok(Ok(response)),
                AttemptOutcome::Retry => self.sniff_on_connection_fault().await,
                AttemptOutcome::LocalRetry => {}
                AttemptOutcome::Fatal(reason) => return Ok(Err(self.fail(reason))),
            }
        }
    }

    async fn execute_on_forced_node(
        &mut self,
        request: &RequestContextBuilder,
        url: &Url,
    ) -> Result<Result<ClusterResponse, PipelineFailure>, TransportError> {
        let forced = Node::new(url.as_str())
            .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
        let node = self
            .transport
            .pool
            .nodes()
            .into_iter()
            .find(|node| node.url() == forced.url())
            .unwrap_or(forced);
        if self.token.is_cancelled() {
            return Ok(Err(self.fail(FailureReason::Cancelled)));
        }
        let Some(remaining) = self.remaining() else {
            return Ok(Err(self.fail(FailureReason::MaxTimeoutReached)));
        };
        Ok(match self.attempt(request, node, remaining).await {
            AttemptOutcome::Success(response) => Ok(response),
            AttemptOutcome::Retry | AttemptOutcome::LocalRetry => {
                Err(self.fail(FailureReason::MaxRetriesReached))
            }
            AttemptOutcome::Fatal(reason) => Err(self.fail(reason)),
        })
    }

    /// Attempts allowed for this request: the retries plus one, at most one per node unless
    /// nodes may be reused.
    fn max_attempts(&mut self) -> usize {
        let pool = &self.transport.pool;
        let config = &self.transport.config;
        let max_retries = self
            .intent
            .config
            .max_retries
            .or(config.max_retries)
            .unwrap_or_else(|| pool.max_retries());
        let requested = max_retries.saturating_add(1);
        if config.reuse_nodes_on_exhaustion {
            return requested;
        }
        let distinct = pool.len().max(1);
        self.clamped_to_pool = requested > distinct;
        requested.min(distinct)
    }

    /// Checks, in order, cancellation, the attempt budget and the time budget.
    fn interrupted(&mut self, attempts: usize, max_attempts: usize) -> Option<FailureReason> {
        if self.token.is_cancelled() {
            return Some(FailureReason::Cancelled);
        }
        if attempts >= max_attempts {
            if self.clamped_to_pool {
                self.audit
                    .push(AuditEvent::new(AuditEventKind::FailedOverAllNodes));
            }
            return Some(FailureReason::MaxRetriesReached);
        }
        if self.remaining().is_none() {
            return Some(FailureReason::MaxTimeoutReached);
        }
        None
    }

    fn remaining(&self) -> Option<Duration> {
        self.budget
            .checked_sub(self.started_at.elapsed())
            .filter(|remaining| !remaining.is_zero())
    }

    // Tried nodes are tracked by address, discovery may rename them between attempts.
    fn is_candidate(&self, node: &Node, tried: &HashSet<Url>) -> bool {
        !tried.contains(node.url())
            && self
                .transport
                .product
                .node_predicate(node, RequestKind::Ordinary)
            && self
                .transport
                .config
                .node_predicate
                .as_ref()
                .map_or(true, |predicate| predicate(node))
    }

    fn select_node(
        &self,
        tried: &mut HashSet<Url>,
    ) -> Result<Option<Selection>, TransportError> {
        let pool = &self.transport.pool;
        let mut selection =
            pool.select_node(Instant::now(), |node| self.is_candidate(node, tried))?;
        if selection.is_none()
            && self.transport.config.reuse_nodes_on_exhaustion
            && !tried.is_empty()
        {
            debug!("{REQUEST_PIPELINE}: every node was tried, reusing nodes");
            tried.clear();
            selection = pool.select_node(Instant::now(), |node| self.is_candidate(node, tried))?;
        }
        if let Some(selection) = &selection {
            tried.insert(selection.node.url().clone());
        }
        Ok(selection)
    }

    fn should_ping(&self, node: &Node) -> bool {
        let transport = self.transport;
        node.is_resurrected()
            && transport.product.supports_ping()
            && transport.pool.supports_pinging()
            && !transport.config.disable_pings
            && !self.intent.config.disable_ping
    }

    async fn ping(&mut self, node: &Node) -> PingOutcome {
        let transport = self.transport;
        let intent = transport.product.ping_request();
        let ctx = match RequestContextBuilder::new(&transport.config, &intent, RequestKind::Ping) {
            Ok(builder) => builder.bind(node.clone()),
            Err(err) => {
                warn!("{REQUEST_PIPELINE}: skipping ping, the ping request is invalid: {err}");
                return PingOutcome::Alive;
            }
        };
        let Some(remaining) = self.remaining() else {
            // The time budget check at the top of the loop reports the exhaustion.
            return PingOutcome::Dead;
        };
        let result = self.send(&ctx, remaining).await;
        self.last.node = Some(node.clone());
        match result {
            Ok(response)
                if transport
                    .product
                    .is_success_status(ctx.method(), response.status) =>
            {
                transport.pool.mark_alive(node);
                self.audit.push(
                    AuditEvent::new(AuditEventKind::PingSuccess)
                        .with_node(node)
                        .with_status(response.status),
                );
                PingOutcome::Alive
            }
            Err(err) if self.is_cancellation(&err) => {
                self.last.error = Some(err.to_string());
                PingOutcome::Cancelled
            }
            result => {
                transport
                    .pool
                    .mark_dead(node, Instant::now(), &transport.config.dead_timeout);
                let event = self.failure_event(AuditEventKind::PingFailure, node, &result);
                debug!("{REQUEST_PIPELINE}: ping of {node} failed");
                self.audit.push(event);
                PingOutcome::Dead
            }
        }
    }

    async fn attempt(
        &mut self,
        request: &RequestContextBuilder,
        node: Node,
        remaining: Duration,
    ) -> AttemptOutcome {
        let transport = self.transport;
        let ctx = request.bind(node);
        debug!(
            "{REQUEST_PIPELINE}: {} {} on {}",
            ctx.method(),
            ctx.path(),
            ctx.node()
        );
        let result = self.send(&ctx, remaining).await;
        let node = ctx.node();
        self.last.node = Some(node.clone());
        match result {
            Ok(response) if self.is_success(&ctx, &response) => {
                transport.pool.mark_alive(node);
                self.audit.push(
                    AuditEvent::new(AuditEventKind::HealthyResponse)
                        .with_node(node)
                        .with_status(response.status),
                );
                let served_by = transport.pool.current(node).unwrap_or_else(|| node.clone());
                AttemptOutcome::Success(ClusterResponse::new(response, served_by))
            }
            Err(err) if self.is_cancellation(&err) => {
                self.last.error = Some(err.to_string());
                AttemptOutcome::Fatal(FailureReason::Cancelled)
            }
            Err(err) if err.kind().is_local() => {
                let retry = err.kind() == ConnectionErrorKind::LocalResource
                    && transport.config.retry_on_local_failure;
                let event = self.failure_event(AuditEventKind::BadRequest, node, &Err(err));
                self.audit.push(event);
                if retry {
                    warn!("{REQUEST_PIPELINE}: local failure on {node}, trying another node");
                    AttemptOutcome::LocalRetry
                } else {
                    AttemptOutcome::Fatal(FailureReason::BadRequest)
                }
            }
            result => {
                transport
                    .pool
                    .mark_dead(node, Instant::now(), &transport.config.dead_timeout);
                let event = self.failure_event(AuditEventKind::BadResponse, node, &result);
                self.audit.push(event);
                AttemptOutcome::Retry
            }
        }
    }

    /// Sends `ctx` with a deadline no later than the remaining time budget.
    async fn send(
        &self,
        ctx: &RequestContext,
        remaining: Duration,
    ) -> Result<ConnectionResponse, ConnectionError> {
        let timeout = ctx.timeout().min(remaining);
        let send = self.transport.connection.send(ctx, self.token.clone());
        match tokio::time::timeout(timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::new(
                ConnectionErrorKind::Timeout,
                format!("no response within {timeout:?}"),
            )),
        }
    }

    fn is_success(&self, ctx: &RequestContext, response: &ConnectionResponse) -> bool {
        match ctx.allowed_status_codes() {
            Some(allowed) => allowed.allows(response.status),
            None => self
                .transport
                .product
                .is_success_status(ctx.method(), response.status),
        }
    }

    fn is_cancellation(&self, err: &ConnectionError) -> bool {
        err.kind() == ConnectionErrorKind::Cancelled || self.token.is_cancelled()
    }

    /// Builds the terminal event of a failed ping or attempt and remembers the failure.
    fn failure_event(
        &mut self,
        kind: AuditEventKind,
        node: &Node,
        result: &Result<ConnectionResponse, ConnectionError>,
    ) -> AuditEvent {
        let event = AuditEvent::new(kind).with_node(node);
        match result {
            Ok(response) => {
                let reason = self.transport.product.failure_reason(response);
                self.last.status = Some(response.status);
                self.last.error = reason.clone();
                let event = event.with_status(response.status);
                match reason {
                    Some(reason) => event.with_reason(reason),
                    None => event,
                }
            }
            Err(err) => {
                self.last.status = None;
                self.last.error = Some(err.to_string());
                event.with_reason(err.to_string())
            }
        }
    }

    fn fail(&mut self, reason: FailureReason) -> PipelineFailure {
        let kind = match reason {
            FailureReason::MaxRetriesReached => Some(AuditEventKind::MaxRetriesReached),
            FailureReason::MaxTimeoutReached => Some(AuditEventKind::MaxTimeoutReached),
            FailureReason::NoNodesAttempted => Some(AuditEventKind::NoNodesAttempted),
            FailureReason::Cancelled => Some(AuditEventKind::CancellationRequested),
            // The attempt already recorded its BadRequest event.
            FailureReason::BadRequest => None,
        };
        if let Some(kind) = kind {
            let mut event = AuditEvent::new(kind);
            if let (FailureReason::Cancelled, Some(node)) = (reason, &self.last.node) {
                event = event.with_node(node);
            }
            self.audit.push(event);
        }
        warn!(
            "{REQUEST_PIPELINE}: {} {} failed after {:?}: {reason}",
            self.intent.method,
            self.intent.path,
            self.started_at.elapsed()
        );
        PipelineFailure {
            reason,
            node: self.last.node.take(),
            status: self.last.status.take(),
            error: self.last.error.take(),
        }
    }

    fn can_sniff(&self) -> bool {
        self.transport.pool.supports_reseeding()
            && self.transport.product.supports_sniff()
            && !self.intent.config.disable_sniff
    }

    async fn sniff_on_startup(&mut self) {
        let transport = self.transport;
        let pool = &transport.pool;
        if !transport.config.sniff_on_startup
            || !self.can_sniff()
            || pool.sniffed_on_startup()
            || pool.last_update().is_some()
        {
            return;
        }
        let bootstrap = Arc::clone(&transport.bootstrap);
        let guard = if transport.config.wait_for_startup_sniff {
            tokio::select! {
                guard = bootstrap.lock() => Some(guard),
                _ = self.token.cancelled() => None,
            }
        } else {
            bootstrap.try_lock().ok()
        };
        let Some(_guard) = guard else {
            return;
        };
        // Another request may have finished the startup sniff while this one waited.
        if pool.sniffed_on_startup() {
            return;
        }
        self.sniff(AuditEventKind::SniffOnStartup).await;
        pool.set_sniffed_on_startup();
    }

    async fn sniff_on_stale_cluster(&mut self) {
        let Some(lifespan) = self.transport.config.sniff_lifespan else {
            return;
        };
        let Some(last_update) = self.transport.pool.last_update() else {
            return;
        };
        if self.can_sniff() && last_update.elapsed() > lifespan {
            self.sniff(AuditEventKind::SniffOnStaleCluster).await;
        }
    }

    async fn sniff_on_connection_fault(&mut self) {
        if self.transport.config.sniff_on_connection_fault && self.can_sniff() {
            self.sniff(AuditEventKind::SniffOnFail).await;
        }
    }

    /// Asks the nodes for the cluster topology, alive ones first then in product order, until one
    /// answers.
    ///
    /// Failures are recorded but never fail the request, nor do they mark nodes dead.
    async fn sniff(&mut self, trigger: AuditEventKind) {
        let transport = self.transport;
        let product = &transport.product;
        self.audit.push(AuditEvent::new(trigger));
        let intent = product.sniff_request();
        let builder =
            match RequestContextBuilder::new(&transport.config, &intent, RequestKind::Sniff) {
                Ok(builder) => builder,
                Err(err) => {
                    self.audit
                        .push(AuditEvent::new(AuditEventKind::SniffFailure).with_reason(err.to_string()));
                    return;
                }
            };
        let mut nodes: Vec<_> = transport
            .pool
            .nodes()
            .into_iter()
            .filter(|node| product.node_predicate(node, RequestKind::Sniff))
            .collect();
        nodes.sort_by_key(|node| (!node.is_alive(), product.sniff_order(node)));

        for node in nodes {
            if self.token.is_cancelled() {
                return;
            }
            let Some(remaining) = self.remaining() else {
                return;
            };
            let ctx = builder.bind(node);
            let reason = match self.send(&ctx, remaining).await {
                Ok(response) if product.is_success_status(ctx.method(), response.status) => {
                    match product.parse_sniff_response(&response, ctx.node()) {
                        Ok(discovered) => {
                            let count = discovered.len();
                            match transport.pool.reseed(discovered) {
                                Ok(true) => {
                                    info!(
                                        "{REQUEST_PIPELINE}: sniff on {} discovered {count} node(s)",
                                        ctx.node()
                                    );
                                    self.audit.push(
                                        AuditEvent::new(AuditEventKind::SniffSuccess)
                                            .with_node(ctx.node())
                                            .with_status(response.status),
                                    );
                                    return;
                                }
                                Ok(false) => "the sniff response lists no node".to_string(),
                                Err(err) => err.to_string(),
                            }
                        }
                        Err(err) => format!("{err:#}"),
                    }
                }
                Ok(response) => product
                    .failure_reason(&response)
                    .unwrap_or_else(|| format!("unexpected status {}", response.status)),
                Err(err) => err.to_string(),
            };
            warn!("{REQUEST_PIPELINE}: sniff on {} failed: {reason}", ctx.node());
            self.audit.push(
                AuditEvent::new(AuditEventKind::SniffFailure)
                    .with_node(ctx.node())
                    .with_reason(reason),
            );
        }
    }
}
