use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::future::join_all;
use http::{Method, StatusCode};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    connection::ConnectionErrorKind,
    node_pool::{features, Node, NodePool, SelectionStrategy},
    product::{NodesApiProduct, ProductRegistration},
    request::{AllowedStatusCodes, RequestIntent},
    request_context::RequestKind,
    response::{ConnectionResponse, FailureReason},
    test_utils::{node, nodes, setup_tracing, sniff_body, ConnectionMock, Reply, TestProduct},
    AuditEventKind::*,
    ClusterTransport, TransportBuilder, TransportError,
};

fn static_pool(names: &[&str]) -> NodePool {
    NodePool::static_pool(nodes(names), SelectionStrategy::Sticky)
}

fn sniffing_pool(names: &[&str]) -> NodePool {
    NodePool::sniffing(nodes(names), SelectionStrategy::Sticky)
}

fn builder(pool: NodePool, connection: &Arc<ConnectionMock>) -> TransportBuilder {
    ClusterTransport::builder()
        .with_node_pool(pool)
        .with_arc_connection(connection.clone())
}

fn pooled(transport: &ClusterTransport, name: &str) -> Node {
    transport
        .node_pool()
        .nodes()
        .into_iter()
        .find(|node| node.url().host_str() == Some(name))
        .unwrap()
}

fn hosts(transport: &ClusterTransport) -> Vec<String> {
    transport
        .node_pool()
        .nodes()
        .iter()
        .map(|node| node.url().host_str().unwrap().to_string())
        .collect()
}

async fn get(transport: &ClusterTransport) -> super::response::PipelineOutcome {
    transport
        .execute(RequestIntent::get("/_search"), CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_fails_over_to_the_next_node() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.always("a", RequestKind::Ordinary, Reply::Status(502));
    connection.always("b", RequestKind::Ordinary, Reply::Status(503));
    let transport = builder(static_pool(&["a", "b", "c"]), &connection)
        .build()
        .unwrap();

    // Act.
    let outcome = get(&transport).await;

    // Assert.
    assert!(outcome.is_success());
    assert_eq!(
        outcome.audit_trail.kinds(),
        vec![BadResponse, BadResponse, HealthyResponse]
    );
    let response = outcome.response().unwrap();
    assert_eq!(response.node.url().host_str(), Some("c"));
    for name in ["a", "b"] {
        let node = pooled(&transport, name);
        assert!(!node.is_alive());
        assert_eq!(node.failed_attempts(), 1);
    }
    assert!(pooled(&transport, "c").is_alive());
    let statuses: Vec<_> = outcome
        .audit_trail
        .iter()
        .map(|event| event.status.map(|status| status.as_u16()))
        .collect();
    assert_eq!(statuses, vec![Some(502), Some(503), Some(200)]);
}

#[tokio::test]
async fn test_failed_ping_leaves_no_node_to_attempt() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.always("a", RequestKind::Ping, Reply::Status(503));
    let transport = builder(static_pool(&["a"]), &connection)
        .with_product(TestProduct::pinging())
        .build()
        .unwrap();

    // Act.
    let outcome = get(&transport).await;

    // Assert.
    assert_eq!(
        outcome.audit_trail.kinds(),
        vec![PingFailure, NoNodesAttempted]
    );
    assert_eq!(
        outcome.failure().unwrap().reason,
        FailureReason::NoNodesAttempted
    );
    assert!(connection.hosts_called(RequestKind::Ordinary).is_empty());
    assert!(!pooled(&transport, "a").is_alive());
}

#[tokio::test]
async fn test_attempts_are_bounded_by_max_retries() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    for name in ["a", "b", "c"] {
        connection.always(name, RequestKind::Ordinary, Reply::Status(502));
    }
    let transport = builder(static_pool(&["a", "b", "c"]), &connection)
        .with_max_retries(1)
        .build()
        .unwrap();

    // Act.
    let outcome = get(&transport).await;

    // Assert.
    assert_eq!(
        outcome.audit_trail.kinds(),
        vec![BadResponse, BadResponse, MaxRetriesReached]
    );
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.reason, FailureReason::MaxRetriesReached);
    assert_eq!(failure.node.as_ref().unwrap().url().host_str(), Some("b"));
    assert_eq!(failure.status.map(|status| status.as_u16()), Some(502));
    assert_eq!(connection.hosts_called(RequestKind::Ordinary), vec!["a", "b"]);
}

#[tokio::test]
async fn test_attempts_are_bounded_by_the_pool_size() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    for name in ["a", "b"] {
        connection.always(name, RequestKind::Ordinary, Reply::Status(502));
    }
    let transport = builder(static_pool(&["a", "b"]), &connection)
        .with_max_retries(5)
        .build()
        .unwrap();

    // Act.
    let outcome = get(&transport).await;

    // Assert.
    assert_eq!(
        outcome.audit_trail.kinds(),
        vec![BadResponse, BadResponse, FailedOverAllNodes, MaxRetriesReached]
    );
    assert_eq!(connection.calls().len(), 2);
}

#[tokio::test]
async fn test_nodes_are_reused_on_exhaustion_when_enabled() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.script("a", RequestKind::Ordinary, vec![Reply::Status(502)]);
    connection.always("b", RequestKind::Ordinary, Reply::Status(502));
    let transport = builder(static_pool(&["a", "b"]), &connection)
        .with_max_retries(2)
        .with_reuse_nodes_on_exhaustion(true)
        .build()
        .unwrap();

    // Act.
    let outcome = get(&transport).await;

    // Assert.
    assert_eq!(
        outcome.audit_trail.kinds(),
        vec![BadResponse, BadResponse, AllNodesDead, HealthyResponse]
    );
    assert_eq!(
        connection.hosts_called(RequestKind::Ordinary),
        vec!["a", "b", "a"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_time_budget_ends_the_request() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    for name in ["a", "b", "c"] {
        connection.always(
            name,
            RequestKind::Ordinary,
            Reply::delayed(Duration::from_secs(3), Reply::Status(502)),
        );
    }
    let transport = builder(static_pool(&["a", "b", "c"]), &connection)
        .with_max_retries(5)
        .with_max_retry_timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    // Act.
    let outcome = get(&transport).await;

    // Assert.
    assert_eq!(
        outcome.audit_trail.kinds(),
        vec![BadResponse, BadResponse, MaxTimeoutReached]
    );
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.reason, FailureReason::MaxTimeoutReached);
    // The second attempt was cut short by the remaining budget.
    assert_eq!(failure.status, None);
    assert!(failure.error.is_some());
    assert_eq!(connection.hosts_called(RequestKind::Ordinary), vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_the_request() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.always("a", RequestKind::Ordinary, Reply::Status(502));
    connection.always("b", RequestKind::Ordinary, Reply::Hang);
    let transport = builder(static_pool(&["a", "b", "c"]), &connection)
        .build()
        .unwrap();
    let token = CancellationToken::new();

    // Act.
    let (outcome, _) = tokio::join!(
        transport.execute(RequestIntent::get("/_search"), token.clone()),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        }
    );

    // Assert.
    let outcome = outcome.unwrap();
    assert_eq!(
        outcome.audit_trail.kinds(),
        vec![BadResponse, CancellationRequested]
    );
    let last = outcome.audit_trail.last().unwrap();
    assert_eq!(last.node.as_ref().unwrap().url().host_str(), Some("b"));
    assert_eq!(outcome.failure().unwrap().reason, FailureReason::Cancelled);
    assert_eq!(connection.hosts_called(RequestKind::Ordinary), vec!["a", "b"]);
    // A cancelled attempt says nothing about the node.
    assert!(pooled(&transport, "b").is_alive());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    let transport = builder(static_pool(&["a"]), &connection).build().unwrap();
    let token = CancellationToken::new();
    token.cancel();

    // Act.
    let outcome = transport
        .execute(RequestIntent::get("/"), token)
        .await
        .unwrap();

    // Assert.
    assert_eq!(outcome.audit_trail.kinds(), vec![CancellationRequested]);
    assert!(connection.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_startup_sniff_happens_once() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.script(
        "a",
        RequestKind::Sniff,
        vec![Reply::delayed(
            Duration::from_millis(100),
            sniff_body(&["a", "b", "c"]),
        )],
    );
    let transport = builder(sniffing_pool(&["a", "b"]), &connection)
        .with_product(TestProduct::sniffing())
        .build()
        .unwrap();

    // Act.
    let outcomes = join_all((0..5).map(|_| get(&transport))).await;

    // Assert.
    assert!(outcomes.iter().all(|outcome| outcome.is_success()));
    let startup_sniffs = outcomes
        .iter()
        .filter(|outcome| outcome.audit_trail.kinds().contains(&SniffOnStartup))
        .count();
    assert_eq!(startup_sniffs, 1);
    assert_eq!(connection.hosts_called(RequestKind::Sniff), vec!["a"]);
    assert_eq!(hosts(&transport), vec!["a", "b", "c"]);
    assert!(transport.node_pool().last_update().is_some());

    // Later requests don't sniff again.
    let outcome = get(&transport).await;
    assert_eq!(outcome.audit_trail.kinds(), vec![HealthyResponse]);
}

#[tokio::test(start_paused = true)]
async fn test_startup_sniff_losers_proceed_with_the_seeds() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.script(
        "a",
        RequestKind::Sniff,
        vec![Reply::delayed(
            Duration::from_millis(100),
            sniff_body(&["a", "b", "c"]),
        )],
    );
    let transport = builder(sniffing_pool(&["a", "b"]), &connection)
        .with_product(TestProduct::sniffing())
        .with_wait_for_startup_sniff(false)
        .build()
        .unwrap();

    // Act.
    let outcomes = join_all((0..5).map(|_| get(&transport))).await;

    // Assert.
    assert!(outcomes.iter().all(|outcome| outcome.is_success()));
    let (sniffed, proceeded): (Vec<_>, Vec<_>) = outcomes
        .iter()
        .partition(|outcome| outcome.audit_trail.kinds().contains(&SniffOnStartup));
    assert_eq!(sniffed.len(), 1);
    assert_eq!(proceeded.len(), 4);
    for outcome in proceeded {
        let trail = &outcome.audit_trail;
        assert_eq!(trail.kinds(), vec![HealthyResponse]);
        // Answered before the startup sniff completed.
        let answered = trail.last().unwrap().timestamp;
        assert_eq!(answered.duration_since(trail.started_at()), Duration::ZERO);
        let host = outcome.response().unwrap().node.url().host_str().unwrap().to_string();
        assert!(host == "a" || host == "b");
    }
    assert_eq!(connection.hosts_called(RequestKind::Sniff), vec!["a"]);
    assert_eq!(hosts(&transport), vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_ping_exhausts_the_time_budget() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.always(
        "a",
        RequestKind::Ping,
        Reply::delayed(Duration::from_secs(5), Reply::Status(200)),
    );
    let transport = builder(static_pool(&["a", "b"]), &connection)
        .with_product(TestProduct::pinging())
        .with_max_retry_timeout(Duration::from_secs(1))
        .build()
        .unwrap();

    // Act.
    let outcome = get(&transport).await;

    // Assert.
    assert_eq!(
        outcome.audit_trail.kinds(),
        vec![PingFailure, MaxTimeoutReached]
    );
    assert_eq!(
        outcome.failure().unwrap().reason,
        FailureReason::MaxTimeoutReached
    );
    assert_eq!(connection.hosts_called(RequestKind::Ping), vec!["a"]);
    assert!(connection.hosts_called(RequestKind::Ordinary).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stale_cluster_is_sniffed_again() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.script(
        "a",
        RequestKind::Sniff,
        vec![sniff_body(&["a", "b"]), sniff_body(&["a", "b", "c"])],
    );
    let transport = builder(sniffing_pool(&["a"]), &connection)
        .with_product(TestProduct::sniffing())
        .with_sniff_lifespan(Some(Duration::from_secs(3600)))
        .build()
        .unwrap();
    let first = get(&transport).await;
    assert_eq!(
        first.audit_trail.kinds(),
        vec![SniffOnStartup, SniffSuccess, HealthyResponse]
    );

    // Act.
    tokio::time::advance(Duration::from_secs(2 * 3600)).await;
    let second = get(&transport).await;

    // Assert.
    assert_eq!(
        second.audit_trail.kinds(),
        vec![SniffOnStaleCluster, SniffSuccess, HealthyResponse]
    );
    assert_eq!(hosts(&transport), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_connection_fault_triggers_a_sniff() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.always("a", RequestKind::Ordinary, Reply::Status(502));
    // The alive node is asked first and answers with something unparsable.
    connection.script(
        "b",
        RequestKind::Sniff,
        vec![Reply::Body(200, "<html>".to_string())],
    );
    connection.script("a", RequestKind::Sniff, vec![sniff_body(&["b", "c"])]);
    let transport = builder(sniffing_pool(&["a", "b"]), &connection)
        .with_product(TestProduct::sniffing())
        .with_sniff_on_startup(false)
        .build()
        .unwrap();

    // Act.
    let outcome = get(&transport).await;

    // Assert.
    assert_eq!(
        outcome.audit_trail.kinds(),
        vec![
            BadResponse,
            SniffOnFail,
            SniffFailure,
            SniffSuccess,
            HealthyResponse
        ]
    );
    assert_eq!(connection.hosts_called(RequestKind::Sniff), vec!["b", "a"]);
    assert_eq!(hosts(&transport), vec!["b", "c"]);
    assert_eq!(
        outcome.response().unwrap().node.url().host_str(),
        Some("b")
    );
}

#[tokio::test]
async fn test_renamed_nodes_keep_their_health_across_a_sniff() {
    // Setup.
    setup_tracing();
    let nodes_info = r#"{"nodes":{
        "n1":{"roles":["data"],"http":{"publish_address":"a:9200"}},
        "n2":{"roles":["data"],"http":{"publish_address":"b:9200"}}
    }}"#;
    let connection = ConnectionMock::new();
    connection.always("a", RequestKind::Ordinary, Reply::Status(502));
    connection.always("b", RequestKind::Sniff, Reply::Body(200, nodes_info.to_string()));
    let transport = builder(sniffing_pool(&["a", "b"]), &connection)
        .with_product(NodesApiProduct)
        .with_sniff_on_startup(false)
        .with_max_retries(1)
        .build()
        .unwrap();

    // Act.
    let outcome = get(&transport).await;

    // Assert.
    assert_eq!(
        outcome.audit_trail.kinds(),
        vec![
            PingSuccess,
            BadResponse,
            SniffOnFail,
            SniffSuccess,
            PingSuccess,
            HealthyResponse
        ]
    );
    assert_eq!(connection.hosts_called(RequestKind::Ordinary), vec!["a", "b"]);
    assert_eq!(connection.hosts_called(RequestKind::Sniff), vec!["b"]);
    let a = pooled(&transport, "a");
    assert_eq!(a.id(), "n1");
    assert!(!a.is_alive());
    assert_eq!(a.failed_attempts(), 1);
    assert_eq!(outcome.response().unwrap().node.id(), "n2");
}

/// Sniffs with `POST /_topology`, whose only success status is 201.
#[derive(Debug)]
struct PostSniffProduct;

impl ProductRegistration for PostSniffProduct {
    fn name(&self) -> &str {
        "post-sniff"
    }

    fn supports_sniff(&self) -> bool {
        true
    }

    fn sniff_request(&self) -> RequestIntent {
        RequestIntent::post("/_topology", "{}")
    }

    fn is_success_status(&self, method: &Method, status: StatusCode) -> bool {
        match *method {
            Method::POST => status == StatusCode::CREATED,
            _ => status.is_success(),
        }
    }

    fn parse_sniff_response(
        &self,
        response: &ConnectionResponse,
        answered_by: &Node,
    ) -> anyhow::Result<Vec<Node>> {
        TestProduct::sniffing().parse_sniff_response(response, answered_by)
    }
}

#[tokio::test]
async fn test_sniff_reply_is_classified_with_the_sniff_method() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.script(
        "a",
        RequestKind::Sniff,
        vec![sniff_body(&["a", "b"]), Reply::Body(201, r#"["http://c:9200"]"#.to_string())],
    );
    connection.script(
        "a",
        RequestKind::Ordinary,
        vec![Reply::Status(200), Reply::Status(502)],
    );
    let transport = builder(sniffing_pool(&["a"]), &connection)
        .with_product(PostSniffProduct)
        .with_sniff_lifespan(None)
        .build()
        .unwrap();

    // Act.
    let rejected = get(&transport).await;
    let accepted = get(&transport).await;

    // Assert.
    assert_eq!(
        rejected.audit_trail.kinds(),
        vec![SniffOnStartup, SniffFailure, HealthyResponse]
    );
    assert_eq!(
        accepted.audit_trail.kinds(),
        vec![BadResponse, SniffOnFail, SniffSuccess, MaxRetriesReached]
    );
    assert_eq!(hosts(&transport), vec!["c"]);
}

#[tokio::test]
async fn test_sniff_disabled_per_request() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    let transport = builder(sniffing_pool(&["a"]), &connection)
        .with_product(TestProduct::sniffing())
        .build()
        .unwrap();
    let mut intent = RequestIntent::get("/");
    intent.config.disable_sniff = true;

    // Act.
    let outcome = transport
        .execute(intent, CancellationToken::new())
        .await
        .unwrap();

    // Assert.
    assert_eq!(outcome.audit_trail.kinds(), vec![HealthyResponse]);
    assert!(connection.hosts_called(RequestKind::Sniff).is_empty());
}

#[tokio::test]
async fn test_throw_on_failure() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.always("a", RequestKind::Ordinary, Reply::Status(500));
    let transport = builder(static_pool(&["a"]), &connection)
        .with_throw_on_failure(true)
        .build()
        .unwrap();

    // Act.
    let thrown = transport
        .execute(RequestIntent::get("/"), CancellationToken::new())
        .await
        .unwrap_err();
    let returned = transport
        .execute(
            RequestIntent::get("/").with_throw_on_failure(false),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // Assert.
    match &thrown {
        TransportError::Pipeline { failure, .. } => {
            assert_eq!(failure.reason, FailureReason::MaxRetriesReached)
        }
        err => panic!("unexpected error {err}"),
    }
    assert_eq!(
        thrown.audit_trail().unwrap().kinds(),
        vec![BadResponse, MaxRetriesReached]
    );
    assert!(!returned.is_success());
}

#[tokio::test]
async fn test_usage_errors() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    let empty = builder(static_pool(&[]), &connection).build().unwrap();
    let transport = builder(static_pool(&["a"]), &connection).build().unwrap();

    // Act.
    let no_nodes = empty
        .execute(RequestIntent::get("/"), CancellationToken::new())
        .await;
    let query_in_path = transport
        .execute(RequestIntent::get("/_search?q=x"), CancellationToken::new())
        .await;

    // Assert.
    assert!(matches!(no_nodes, Err(TransportError::NoNodesAvailable)));
    assert!(matches!(
        query_in_path,
        Err(TransportError::InvalidRequest(_))
    ));
    assert!(connection.calls().is_empty());
}

#[tokio::test]
async fn test_allowed_status_codes_override_the_product() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.always("a", RequestKind::Ordinary, Reply::Status(404));
    let transport = builder(static_pool(&["a", "b"]), &connection)
        .build()
        .unwrap();

    // Act.
    let outcome = transport
        .execute(
            RequestIntent::get("/index/_doc/1")
                .with_allowed_status_codes(AllowedStatusCodes::codes([404])),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // Assert.
    assert_eq!(outcome.audit_trail.kinds(), vec![HealthyResponse]);
    assert_eq!(outcome.response().unwrap().status.as_u16(), 404);
    assert!(pooled(&transport, "a").is_alive());
}

#[tokio::test]
async fn test_dead_node_is_used_as_a_last_resort() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.script("a", RequestKind::Ordinary, vec![Reply::Status(502)]);
    connection.always("b", RequestKind::Ordinary, Reply::Status(502));
    let transport = builder(static_pool(&["a", "b"]), &connection)
        .build()
        .unwrap();
    let first = get(&transport).await;
    assert!(!first.is_success());

    // Act.
    let outcome = get(&transport).await;

    // Assert.
    assert_eq!(
        outcome.audit_trail.kinds(),
        vec![AllNodesDead, HealthyResponse]
    );
    let a = pooled(&transport, "a");
    assert!(a.is_alive());
    assert_eq!(a.failed_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_resurrected_node_is_pinged() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.script("a", RequestKind::Ordinary, vec![Reply::Status(502)]);
    let transport = builder(static_pool(&["a"]), &connection)
        .with_product(TestProduct::pinging())
        .with_dead_timeout(Duration::from_secs(60), Duration::from_secs(1800))
        .build()
        .unwrap();
    let first = get(&transport).await;
    assert_eq!(
        first.audit_trail.kinds(),
        vec![PingSuccess, BadResponse, MaxRetriesReached]
    );

    // Act.
    tokio::time::advance(Duration::from_secs(61)).await;
    let outcome = get(&transport).await;

    // Assert.
    assert_eq!(
        outcome.audit_trail.kinds(),
        vec![Resurrection, PingSuccess, HealthyResponse]
    );
    assert_eq!(
        connection.hosts_called(RequestKind::Ping),
        vec!["a", "a"]
    );
}

#[tokio::test]
async fn test_disabled_pings() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    let transport = builder(static_pool(&["a"]), &connection)
        .with_product(TestProduct::pinging())
        .with_disable_pings(true)
        .build()
        .unwrap();

    // Act.
    let outcome = get(&transport).await;

    // Assert.
    assert_eq!(outcome.audit_trail.kinds(), vec![HealthyResponse]);
    assert!(connection.hosts_called(RequestKind::Ping).is_empty());
}

#[tokio::test]
async fn test_request_completed_hook() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.always("a", RequestKind::Ordinary, Reply::Status(500));
    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();
    let transport = builder(static_pool(&["a"]), &connection)
        .with_throw_on_failure(true)
        .with_request_completed_hook(move |outcome| {
            assert!(!outcome.is_success());
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    // Act.
    let result = transport
        .execute(RequestIntent::get("/"), CancellationToken::new())
        .await;

    // Assert.
    assert!(result.is_err());
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_forced_node() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.always("c", RequestKind::Ordinary, Reply::Status(502));
    let transport = builder(static_pool(&["a", "b", "c"]), &connection)
        .build()
        .unwrap();

    // Act.
    let pooled_node = transport
        .execute(
            RequestIntent::get("/").with_force_node(Url::parse("http://b:9200/").unwrap()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let outside_node = transport
        .execute(
            RequestIntent::get("/").with_force_node(Url::parse("http://z:9200/").unwrap()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let failing_node = transport
        .execute(
            RequestIntent::get("/").with_force_node(Url::parse("http://c:9200/").unwrap()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // Assert.
    assert_eq!(pooled_node.audit_trail.kinds(), vec![HealthyResponse]);
    assert_eq!(outside_node.audit_trail.kinds(), vec![HealthyResponse]);
    assert_eq!(
        failing_node.audit_trail.kinds(),
        vec![BadResponse, MaxRetriesReached]
    );
    assert_eq!(
        connection.hosts_called(RequestKind::Ordinary),
        vec!["b", "z", "c"]
    );
}

#[tokio::test]
async fn test_local_failure_retries_when_enabled() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    connection.always(
        "a",
        RequestKind::Ordinary,
        Reply::Error(ConnectionErrorKind::LocalResource),
    );
    let retrying = builder(static_pool(&["a", "b"]), &connection)
        .with_retry_on_local_failure(true)
        .build()
        .unwrap();
    let failing = builder(static_pool(&["a", "b"]), &connection)
        .build()
        .unwrap();

    // Act.
    let retried = get(&retrying).await;
    let failed = get(&failing).await;

    // Assert.
    assert_eq!(retried.audit_trail.kinds(), vec![BadRequest, HealthyResponse]);
    assert_eq!(failed.audit_trail.kinds(), vec![BadRequest]);
    assert_eq!(failed.failure().unwrap().reason, FailureReason::BadRequest);
    // Local failures never mark a node dead.
    assert!(pooled(&failing, "a").is_alive());
}

#[tokio::test]
async fn test_node_predicates() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    let master = node("m").with_feature(features::MASTER_ELIGIBLE);
    let data = node("d").with_feature(features::HOLDS_DATA);
    let pool = NodePool::static_pool(vec![master, data], SelectionStrategy::Sticky);
    let nodes_api = builder(pool, &connection)
        .with_product(NodesApiProduct)
        .build()
        .unwrap();
    let filtered = builder(static_pool(&["a", "b"]), &connection)
        .with_node_predicate(|node| node.url().host_str() != Some("a"))
        .build()
        .unwrap();

    // Act.
    let outcome = get(&nodes_api).await;
    let filtered_outcome = get(&filtered).await;

    // Assert.
    assert_eq!(
        outcome.audit_trail.kinds(),
        vec![PingSuccess, HealthyResponse]
    );
    assert_eq!(filtered_outcome.audit_trail.kinds(), vec![HealthyResponse]);
    assert_eq!(
        connection.hosts_called(RequestKind::Ordinary),
        vec!["d", "b"]
    );
    assert_eq!(connection.hosts_called(RequestKind::Ping), vec!["d"]);
}

#[tokio::test]
async fn test_requests_are_resolved_against_the_node() {
    // Setup.
    setup_tracing();
    let connection = ConnectionMock::new();
    let transport = builder(static_pool(&["a"]), &connection)
        .with_query_param("pretty", "true")
        .build()
        .unwrap();

    // Act.
    transport
        .execute(
            RequestIntent::get("/_cluster/health").with_query_param("level", "indices"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // Assert.
    let calls = connection.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].uri,
        "http://a:9200/_cluster/health?pretty=true&level=indices"
    );
}
