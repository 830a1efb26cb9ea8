use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, Once},
    time::Duration,
};

use async_trait::async_trait;
use http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::transport::{
    connection::{Connection, ConnectionError, ConnectionErrorKind},
    node_pool::Node,
    product::ProductRegistration,
    request_context::{RequestContext, RequestKind},
    response::ConnectionResponse,
};

static TRACING_INIT: Once = Once::new();

pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        FmtSubscriber::builder().with_max_level(Level::TRACE).init();
    });
}

pub fn node(name: &str) -> Node {
    Node::new(format!("http://{name}:9200")).unwrap()
}

pub fn nodes(names: &[&str]) -> Vec<Node> {
    names.iter().map(|name| node(name)).collect()
}

/// Scripted behavior of a node for one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    Body(u16, String),
    Error(ConnectionErrorKind),
    Delayed(Duration, Box<Reply>),
    /// Never answers, gives up when the token is cancelled.
    Hang,
}

impl Reply {
    pub fn delayed(delay: Duration, reply: Reply) -> Self {
        Reply::Delayed(delay, Box::new(reply))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub host: String,
    pub kind: RequestKind,
    pub uri: String,
}

#[derive(Debug, Default)]
pub struct ConnectionMock {
    // Replies consumed in order, per host and request kind.
    scripted: Mutex<HashMap<(String, RequestKind), VecDeque<Reply>>>,
    // Reply used once the scripted ones are consumed. Defaults to 200.
    fallback: Mutex<HashMap<(String, RequestKind), Reply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ConnectionMock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, host: &str, kind: RequestKind, replies: Vec<Reply>) {
        self.scripted
            .lock()
            .unwrap()
            .entry((host.to_string(), kind))
            .or_default()
            .extend(replies);
    }

    pub fn always(&self, host: &str, kind: RequestKind, reply: Reply) {
        self.fallback
            .lock()
            .unwrap()
            .insert((host.to_string(), kind), reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn hosts_called(&self, kind: RequestKind) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.kind == kind)
            .map(|call| call.host)
            .collect()
    }

    fn next_reply(&self, host: &str, kind: RequestKind) -> Reply {
        let key = (host.to_string(), kind);
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        scripted
            .or_else(|| self.fallback.lock().unwrap().get(&key).cloned())
            .unwrap_or(Reply::Status(200))
    }
}

#[async_trait]
impl Connection for ConnectionMock {
    async fn send(
        &self,
        ctx: &RequestContext,
        token: CancellationToken,
    ) -> Result<ConnectionResponse, ConnectionError> {
        let host = ctx.node().url().host_str().unwrap().to_string();
        self.calls.lock().unwrap().push(RecordedCall {
            host: host.clone(),
            kind: ctx.kind(),
            uri: ctx.uri().to_string(),
        });
        let mut reply = self.next_reply(&host, ctx.kind());
        loop {
            reply = match reply {
                Reply::Status(status) => {
                    return Ok(ConnectionResponse::new(
                        StatusCode::from_u16(status).unwrap(),
                        "",
                    ))
                }
                Reply::Body(status, body) => {
                    return Ok(ConnectionResponse::new(
                        StatusCode::from_u16(status).unwrap(),
                        body,
                    ))
                }
                Reply::Error(kind) => {
                    return Err(ConnectionError::new(kind, format!("{host} failed")))
                }
                Reply::Delayed(delay, next) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => *next,
                        _ = token.cancelled() => return Err(cancelled(&host)),
                    }
                }
                Reply::Hang => {
                    token.cancelled().await;
                    return Err(cancelled(&host));
                }
            };
        }
    }
}

fn cancelled(host: &str) -> ConnectionError {
    ConnectionError::new(ConnectionErrorKind::Cancelled, format!("{host} cancelled"))
}

/// A product whose sniff reply is a JSON array of node addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct TestProduct {
    pub ping: bool,
    pub sniff: bool,
}

impl TestProduct {
    pub fn pinging() -> Self {
        Self {
            ping: true,
            sniff: false,
        }
    }

    pub fn sniffing() -> Self {
        Self {
            ping: false,
            sniff: true,
        }
    }
}

impl ProductRegistration for TestProduct {
    fn name(&self) -> &str {
        "test"
    }

    fn supports_ping(&self) -> bool {
        self.ping
    }

    fn supports_sniff(&self) -> bool {
        self.sniff
    }

    fn parse_sniff_response(
        &self,
        response: &ConnectionResponse,
        _answered_by: &Node,
    ) -> anyhow::Result<Vec<Node>> {
        let addresses: Vec<String> = serde_json::from_slice(&response.body)?;
        addresses
            .iter()
            .map(|address| Ok(Node::new(address)?))
            .collect()
    }

    fn failure_reason(&self, response: &ConnectionResponse) -> Option<String> {
        (!response.body.is_empty()).then(|| String::from_utf8_lossy(&response.body).into_owned())
    }
}

pub fn sniff_body(names: &[&str]) -> Reply {
    let addresses: Vec<_> = names
        .iter()
        .map(|name| format!("http://{name}:9200"))
        .collect();
    Reply::Body(200, serde_json::to_string(&addresses).unwrap())
}
