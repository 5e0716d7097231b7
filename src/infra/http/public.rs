use std::sync::Arc;

use axum::{Router, body::Body, extract::State, http::Request, middleware, response::Response};

use crate::application::proxy::CacheProxy;

use super::middleware::{log_responses, set_request_context};

/// Every path on the proxy listener goes through the cache.
pub fn build_proxy_router(proxy: Arc<CacheProxy>) -> Router {
    Router::new()
        .fallback(proxy_request)
        .with_state(proxy)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn proxy_request(State(proxy): State<Arc<CacheProxy>>, request: Request<Body>) -> Response {
    proxy.handle(request).await
}
