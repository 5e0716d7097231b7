//! Origin client.
//!
//! [`Origin`] is the seam between the proxy and the upstream server; the
//! production implementation is [`ReqwestOrigin`], a pooled client that
//! enforces separate connect, first-byte and between-bytes timeouts.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, Method, StatusCode, header};
use bytes::{Bytes, BytesMut};
use reqwest::{Client, Url, redirect};
use thiserror::Error;
use tracing::debug;

use crate::config::OriginSettings;

use super::error::InfraError;

/// Headers that describe a single transport hop and are never forwarded.
static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Request forwarded to the origin.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    /// Origin-form target: path plus optional query.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Fully buffered origin response.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Which wait ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    FirstByte,
    BetweenBytes,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("connect"),
            Self::FirstByte => f.write_str("first byte"),
            Self::BetweenBytes => f.write_str("between bytes"),
        }
    }
}

/// Origin failures. `Clone` so every coalesced waiter can receive the same one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OriginError {
    #[error("origin unreachable: {0}")]
    Connect(String),
    #[error("origin timed out waiting for {phase}")]
    Timeout { phase: TimeoutPhase },
    #[error("origin transport failure: {0}")]
    Transport(String),
    #[error("request cannot be forwarded: {0}")]
    InvalidRequest(String),
}

impl OriginError {
    /// Status delivered to the client when this error ends a request.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Connect(_) | Self::Transport(_) | Self::InvalidRequest(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Timeout { .. } => "timeout",
            Self::Transport(_) => "transport",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        // The client only carries a connect timeout; the other phases are
        // timed around `send` and `chunk`.
        if err.is_timeout() {
            Self::Timeout {
                phase: TimeoutPhase::Connect,
            }
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub trait Origin: Send + Sync {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse, OriginError>;
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Timeouts applied to every origin exchange.
#[derive(Debug, Clone, Copy)]
pub struct OriginTimeouts {
    pub connect: Duration,
    pub first_byte: Duration,
    pub between_bytes: Duration,
}

/// Pooled HTTP client bound to one origin.
#[derive(Debug, Clone)]
pub struct ReqwestOrigin {
    client: Client,
    base: Url,
    timeouts: OriginTimeouts,
}

impl ReqwestOrigin {
    pub fn new(settings: &OriginSettings) -> Result<Self, InfraError> {
        let base = Url::parse(&format!(
            "{}://{}:{}/",
            settings.scheme, settings.host, settings.port
        ))
        .map_err(|err| InfraError::configuration(format!("invalid origin address: {err}")))?;

        let timeouts = OriginTimeouts {
            connect: settings.connect_timeout,
            first_byte: settings.first_byte_timeout,
            between_bytes: settings.between_bytes_timeout,
        };

        let client = Client::builder()
            .user_agent(concat!("cachet/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeouts.connect)
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|err| InfraError::configuration(format!("origin client: {err}")))?;

        Ok(Self {
            client,
            base,
            timeouts,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn target(&self, path_and_query: &str) -> Result<Url, OriginError> {
        if !path_and_query.starts_with('/') {
            return Err(OriginError::InvalidRequest(format!(
                "target `{path_and_query}` is not origin-form"
            )));
        }
        let mut url = self.base.clone();
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };
        url.set_path(path);
        url.set_query(query);
        Ok(url)
    }
}

#[async_trait]
impl Origin for ReqwestOrigin {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse, OriginError> {
        let url = self.target(&request.path_and_query)?;

        let mut headers = request.headers;
        strip_hop_headers(&mut headers);
        // The client derives Host from the origin URL.
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let mut response = tokio::time::timeout(self.timeouts.first_byte, builder.send())
            .await
            .map_err(|_| OriginError::Timeout {
                phase: TimeoutPhase::FirstByte,
            })?
            .map_err(|err| OriginError::from_reqwest(&err))?;

        let status = response.status();
        let mut headers = std::mem::take(response.headers_mut());
        strip_hop_headers(&mut headers);

        let mut body = BytesMut::new();
        loop {
            let chunk = tokio::time::timeout(self.timeouts.between_bytes, response.chunk())
                .await
                .map_err(|_| OriginError::Timeout {
                    phase: TimeoutPhase::BetweenBytes,
                })?
                .map_err(|err| OriginError::Transport(err.to_string()))?;
            match chunk {
                Some(chunk) => body.extend_from_slice(&chunk),
                None => break,
            }
        }

        debug!(
            method = %request.method,
            target = %request.path_and_query,
            status = status.as_u16(),
            bytes = body.len(),
            "Origin response received"
        );

        Ok(OriginResponse {
            status,
            headers,
            body: body.freeze(),
        })
    }
}
