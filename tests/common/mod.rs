//! Shared fixtures for the proxy integration tests.
#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode},
};
use bytes::Bytes;
use cachet::{
    application::proxy::CacheProxy,
    cache::{CacheConfig, PolicyConfig},
    infra::{
        http,
        origin::{Origin, OriginError, OriginRequest, OriginResponse},
    },
};
use tower::ServiceExt;

type Responder =
    dyn Fn(&OriginRequest, usize) -> Result<OriginResponse, OriginError> + Send + Sync;

/// In-process origin that counts fetches and records what it was sent.
pub struct FakeOrigin {
    calls: AtomicUsize,
    seen: Mutex<Vec<OriginRequest>>,
    delay: Duration,
    respond: Box<Responder>,
}

impl FakeOrigin {
    /// `respond` receives the request and its zero-based call index.
    pub fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&OriginRequest, usize) -> Result<OriginResponse, OriginError>
            + Send
            + Sync
            + 'static,
    {
        Self::with_delay(Duration::ZERO, respond)
    }

    pub fn with_delay<F>(delay: Duration, respond: F) -> Arc<Self>
    where
        F: Fn(&OriginRequest, usize) -> Result<OriginResponse, OriginError>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            delay,
            respond: Box::new(respond),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<OriginRequest> {
        self.seen.lock().expect("seen lock").clone()
    }
}

#[async_trait]
impl Origin for FakeOrigin {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse, OriginError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().expect("seen lock").push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(&request, index)
    }
}

/// 200 response with the given body and headers.
pub fn ok(body: &str, headers: &[(&'static str, &'static str)]) -> OriginResponse {
    let mut map = HeaderMap::new();
    for &(name, value) in headers {
        map.append(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    OriginResponse {
        status: StatusCode::OK,
        headers: map,
        body: Bytes::from(body.to_string()),
    }
}

pub struct Harness {
    pub proxy: Arc<CacheProxy>,
    pub router: Router,
    pub origin: Arc<FakeOrigin>,
}

impl Harness {
    pub fn new(origin: Arc<FakeOrigin>) -> Self {
        Self::with_config(origin, CacheConfig::default(), 1024 * 1024)
    }

    /// Build the proxy and spawn its refresh worker on the current runtime.
    pub fn with_config(origin: Arc<FakeOrigin>, cache: CacheConfig, max_body_bytes: usize) -> Self {
        let (proxy, worker) = CacheProxy::new(
            &PolicyConfig::default(),
            &cache,
            max_body_bytes,
            Arc::clone(&origin) as Arc<dyn Origin>,
        );
        tokio::spawn(worker.run());
        let proxy = Arc::new(proxy);
        let router = http::build_proxy_router(Arc::clone(&proxy));
        Self {
            proxy,
            router,
            origin,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond")
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(request(Method::GET, uri)).await
    }

    /// Wait until no background refresh is queued or running.
    pub async fn settle_refreshes(&self) {
        while self.proxy.stats().pending_refreshes > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

pub fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build")
}

pub fn cache_status(response: &Response<Body>) -> String {
    response
        .headers()
        .get("x-cache")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub async fn body(response: Response<Body>) -> Bytes {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should collect")
}
