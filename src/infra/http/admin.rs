use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use serde::Deserialize;
use tracing::info;

use crate::application::{
    error::HttpError,
    proxy::{CacheProxy, ProxyStats},
};

use super::middleware::{log_responses, set_request_context};

const SOURCE: &str = "infra::http::admin";

pub fn build_admin_router(proxy: Arc<CacheProxy>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cache/stats", get(cache_stats))
        .route("/cache", delete(invalidate_key))
        .route("/cache/all", delete(invalidate_all))
        .with_state(proxy)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

#[derive(Debug, Deserialize)]
struct InvalidateQuery {
    url: String,
    method: Option<String>,
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn cache_stats(State(proxy): State<Arc<CacheProxy>>) -> Json<ProxyStats> {
    Json(proxy.stats())
}

async fn invalidate_key(
    State(proxy): State<Arc<CacheProxy>>,
    Query(query): Query<InvalidateQuery>,
) -> Result<Response, HttpError> {
    let method = match query.method.as_deref().map(str::to_ascii_uppercase).as_deref() {
        None | Some("GET") => Method::GET,
        Some("HEAD") => Method::HEAD,
        Some(other) => {
            return Err(HttpError::new(
                SOURCE,
                StatusCode::BAD_REQUEST,
                "Only GET and HEAD objects are cached",
                format!("cannot invalidate method `{other}`"),
            ));
        }
    };
    if !query.url.starts_with('/') {
        return Err(HttpError::new(
            SOURCE,
            StatusCode::BAD_REQUEST,
            "url must be an origin-form path",
            format!("`{}` does not start with `/`", query.url),
        ));
    }

    if proxy.invalidate(method.clone(), &query.url) {
        info!(source = SOURCE, method = %method, url = %query.url, "Cache entry invalidated");
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Ok(StatusCode::NOT_FOUND.into_response())
    }
}

async fn invalidate_all(State(proxy): State<Arc<CacheProxy>>) -> StatusCode {
    let removed = proxy.invalidate_all();
    info!(source = SOURCE, removed, "Cache cleared");
    StatusCode::NO_CONTENT
}
