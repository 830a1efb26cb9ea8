//! A [`Connection`] that sends requests using a [`reqwest`] client.
#![cfg(feature = "reqwest")]

pub use reqwest;

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Body, Client, Identity, Proxy, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use super::{Connection, ConnectionError, ConnectionErrorKind};
use crate::transport::{
    request::ClientCertificate, request_context::RequestContext, response::ConnectionResponse,
};

const REQWEST_CONNECTION: &str = "ReqwestConnection";

type ClientKey = (Option<Url>, Option<ClientCertificate>);

/// A [`Connection`] using [`reqwest`] to make HTTP calls.
///
/// One client is kept per proxy and client certificate pair, the direct client being created
/// with the connection.
#[derive(Debug)]
pub struct ReqwestConnection {
    client: Client,
    clients: Mutex<HashMap<ClientKey, Client>>,
    max_response_body_size: Option<usize>,
}

impl ReqwestConnection {
    /// Creates a connection with a default client.
    pub fn new() -> Result<Self, ConnectionError> {
        Ok(Self::with_client(build_client(None, None)?))
    }

    /// Creates a connection sending direct requests through `client`.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            clients: Mutex::new(HashMap::new()),
            max_response_body_size: None,
        }
    }

    /// Sets a max response body size limit.
    pub fn with_max_response_body_size(self, max_response_body_size: usize) -> Self {
        ReqwestConnection {
            max_response_body_size: Some(max_response_body_size),
            ..self
        }
    }

    fn client_for(&self, ctx: &RequestContext) -> Result<Client, ConnectionError> {
        if ctx.proxy().is_none() && ctx.client_certificate().is_none() {
            return Ok(self.client.clone());
        }
        let key = (ctx.proxy().cloned(), ctx.client_certificate().cloned());
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(key.0.as_ref(), key.1.as_ref())?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    async fn request(&self, ctx: &RequestContext) -> Result<ConnectionResponse, ConnectionError> {
        let client = self.client_for(ctx)?;
        let mut http_request = Request::new(ctx.method().clone(), ctx.uri().clone());
        *http_request.headers_mut() = ctx.header_map();
        *http_request.timeout_mut() = Some(ctx.timeout());
        *http_request.body_mut() = ctx.body().map(|body| Body::from(body.to_vec()));

        trace!("{REQWEST_CONNECTION}: {} {}", ctx.method(), ctx.uri());
        let response = client.execute(http_request).await.map_err(map_error)?;

        let status = response.status();
        let headers = response.headers().clone();

        let body = read_body(response, self.max_response_body_size).await?;

        Ok(ConnectionResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Connection for ReqwestConnection {
    async fn send(
        &self,
        ctx: &RequestContext,
        token: CancellationToken,
    ) -> Result<ConnectionResponse, ConnectionError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ConnectionError::new(
                ConnectionErrorKind::Cancelled,
                format!("request to {} was cancelled", ctx.node()),
            )),
            result = self.request(ctx) => result,
        }
    }
}

fn build_client(
    proxy: Option<&Url>,
    certificate: Option<&ClientCertificate>,
) -> Result<Client, ConnectionError> {
    let local = |err: reqwest::Error| {
        ConnectionError::new(ConnectionErrorKind::LocalResource, err.to_string())
    };
    let mut builder = Client::builder().use_rustls_tls();
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy.as_str()).map_err(local)?);
    }
    if let Some(certificate) = certificate {
        builder = builder.identity(Identity::from_pem(certificate.pem()).map_err(local)?);
    }
    builder.build().map_err(local)
}

fn map_error(err: reqwest::Error) -> ConnectionError {
    let kind = if err.is_builder() {
        ConnectionErrorKind::InvalidRequest
    } else if err.is_timeout() {
        ConnectionErrorKind::Timeout
    } else if err.is_connect() {
        ConnectionErrorKind::Connect
    } else {
        ConnectionErrorKind::Io
    };
    ConnectionError::new(kind, err.to_string())
}

/// Collects the body, giving up as soon as it is known to exceed `limit`.
async fn read_body(response: Response, limit: Option<usize>) -> Result<Vec<u8>, ConnectionError> {
    let limit = limit.unwrap_or(usize::MAX);
    let announced = response
        .content_length()
        .map(|len| usize::try_from(len).unwrap_or(usize::MAX));
    if announced.is_some_and(|len| len > limit) {
        return Err(body_too_large(limit));
    }
    let mut body = Vec::new();
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(map_error)?;
        if body.len().saturating_add(chunk.len()) > limit {
            return Err(body_too_large(limit));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn body_too_large(limit: usize) -> ConnectionError {
    ConnectionError::new(
        ConnectionErrorKind::Io,
        format!("response body exceeds {limit} bytes"),
    )
}
