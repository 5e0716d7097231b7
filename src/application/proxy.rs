//! Per-request proxy flow.
//!
//! `Received → Classified → (PassThrough → ForwardDirect)` or
//! `(Cacheable → KeyComputed → Lookup{Fresh | Stale | Miss})`. Fresh and stale
//! hits are answered from the store (a stale hit also schedules a background
//! refresh); misses go through the coalesced origin fetch, which stores the
//! shaped response before any waiter is released. Client validators and
//! `Range` never reach the origin on this path; they are answered from the
//! complete response that is delivered.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use metrics::counter;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    cache::{
        CacheConfig, CacheEntry, CacheKey, CacheOverrides, CacheStats, Classification,
        ClientConditions, InFlight,
        Lookup, METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_PASS, METRIC_CACHE_STALE_HIT,
        METRIC_ORIGIN_ERROR, Policy, PolicyConfig, RefreshJob, RefreshWorker, Refresher,
        ResponseStore, Role, Storability, shape,
    },
    infra::origin::{Origin, OriginError, OriginRequest, OriginResponse, strip_hop_headers},
};

use super::error::ProxyError;

const SOURCE: &str = "application::proxy";
const STATUS_MISS: &str = "MISS";

/// Methods accepted from clients; anything else is a malformed request.
static ACCEPTED_METHODS: [Method; 9] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::OPTIONS,
    Method::TRACE,
    Method::CONNECT,
];

/// Result of one coalesced origin fetch, shared by every waiter.
#[derive(Debug)]
struct Fetched {
    response: OriginResponse,
    /// Followers may reuse the leader's response.
    shareable: bool,
}

type FetchResult = Result<Arc<Fetched>, OriginError>;

/// Response ready for delivery plus the hit count to report, if served from cache.
struct Delivery {
    response: OriginResponse,
    hits: Option<u64>,
}

impl Delivery {
    fn from_origin(response: OriginResponse) -> Self {
        Self {
            response,
            hits: None,
        }
    }

    fn from_entry(entry: &CacheEntry, hits: u64) -> Self {
        Self {
            response: OriginResponse {
                status: entry.status(),
                headers: entry.headers().clone(),
                body: entry.body().clone(),
            },
            hits: Some(hits),
        }
    }

    fn answering(self, method: &Method, conditions: &ClientConditions) -> Self {
        Self {
            response: conditions.answer(method, self.response),
            hits: self.hits,
        }
    }
}

/// Cache and in-flight counters reported by the admin listener.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProxyStats {
    #[serde(flatten)]
    pub cache: CacheStats,
    pub in_flight: usize,
    pub pending_refreshes: usize,
}

/// The caching reverse proxy.
pub struct CacheProxy {
    policy: Policy,
    status_header: HeaderName,
    diagnostic_headers: Vec<HeaderName>,
    max_body_bytes: usize,
    store: Arc<ResponseStore>,
    inflight: Arc<InFlight<FetchResult>>,
    refresher: Refresher,
    origin: Arc<dyn Origin>,
}

impl CacheProxy {
    /// Build the proxy and the refresh worker that must be spawned alongside it.
    pub fn new(
        policy: &PolicyConfig,
        cache: &CacheConfig,
        max_body_bytes: usize,
        origin: Arc<dyn Origin>,
    ) -> (Self, RefreshWorker) {
        let store = Arc::new(ResponseStore::new(cache));
        let (refresher, worker) = Refresher::new(cache, Arc::clone(&store), Arc::clone(&origin));
        let proxy = Self {
            policy: Policy::new(policy),
            status_header: policy.status_header.clone(),
            diagnostic_headers: policy.diagnostic_headers.clone(),
            max_body_bytes,
            store,
            inflight: Arc::new(InFlight::new()),
            refresher,
            origin,
        };
        (proxy, worker)
    }

    pub fn store(&self) -> &Arc<ResponseStore> {
        &self.store
    }

    pub fn sweep_interval(&self) -> Duration {
        self.store.config().sweep_interval
    }

    /// Drop entries whose grace window has closed.
    pub fn sweep(&self) -> usize {
        self.store.purge_expired(Instant::now())
    }

    pub fn invalidate(&self, method: Method, url: &str) -> bool {
        self.store.invalidate(&CacheKey::new(method, url))
    }

    pub fn invalidate_all(&self) -> usize {
        self.store.invalidate_all()
    }

    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            cache: self.store.stats(),
            in_flight: self.inflight.len(),
            pending_refreshes: self.refresher.pending(),
        }
    }

    /// Serve one client request. Always yields a response carrying the
    /// cache-status header and none of the diagnostic headers.
    pub async fn handle(&self, request: Request<Body>) -> Response {
        let (mut response, hits) = match self.serve(request).await {
            Ok(delivery) => (build_response(delivery.response), delivery.hits),
            Err(err) => (err.into_response(), None),
        };
        self.finalize_headers(response.headers_mut(), hits);
        response
    }

    async fn serve(&self, request: Request<Body>) -> Result<Delivery, ProxyError> {
        let (parts, body) = request.into_parts();
        let method = accepted_method(&parts.method)?;
        let url = origin_form(&parts.uri)?;
        let body = read_body(body, self.max_body_bytes).await?;

        let mut headers = parts.headers;
        let classification = self.policy.classify(&method, &url, &headers);
        classification.apply_to(&mut headers);

        match classification {
            Classification::PassThrough { rule } => {
                let request = OriginRequest {
                    method,
                    path_and_query: url,
                    headers,
                    body,
                };
                self.pass(request, rule).await
            }
            Classification::Cacheable { rule, overrides } => {
                let conditions = ClientConditions::take_from(&mut headers);
                let request = OriginRequest {
                    method: method.clone(),
                    path_and_query: url,
                    headers,
                    body,
                };
                let delivery = self.lookup_or_fetch(request, rule, overrides).await?;
                Ok(delivery.answering(&method, &conditions))
            }
        }
    }

    async fn pass(&self, request: OriginRequest, rule: &'static str) -> Result<Delivery, ProxyError> {
        counter!(METRIC_CACHE_PASS).increment(1);
        debug!(
            source = SOURCE,
            method = %request.method,
            url = %request.path_and_query,
            rule,
            "Passing request through"
        );
        let response = fetch_direct(self.origin.as_ref(), request).await?;
        Ok(Delivery::from_origin(response))
    }

    async fn lookup_or_fetch(
        &self,
        request: OriginRequest,
        rule: &'static str,
        overrides: CacheOverrides,
    ) -> Result<Delivery, ProxyError> {
        let key = CacheKey::new(request.method.clone(), request.path_and_query.clone());

        match self.store.lookup(&key, Instant::now()) {
            Lookup::Fresh(entry) => {
                let hits = entry.record_hit();
                counter!(METRIC_CACHE_HIT).increment(1);
                debug!(source = SOURCE, key = %key, rule, hits, "Cache hit");
                Ok(Delivery::from_entry(&entry, hits))
            }
            Lookup::Stale(entry) => {
                let hits = entry.record_hit();
                counter!(METRIC_CACHE_STALE_HIT).increment(1);
                let schedule = self.refresher.schedule(RefreshJob {
                    key: key.clone(),
                    request: OriginRequest {
                        body: Bytes::new(),
                        ..request
                    },
                    stale: Arc::clone(&entry),
                    overrides,
                });
                debug!(
                    source = SOURCE,
                    key = %key,
                    rule,
                    hits,
                    refresh = ?schedule,
                    "Stale hit served"
                );
                Ok(Delivery::from_entry(&entry, hits))
            }
            Lookup::Miss => {
                counter!(METRIC_CACHE_MISS).increment(1);
                debug!(source = SOURCE, key = %key, rule, "Cache miss");
                self.fetch_coalesced(key, request, overrides).await
            }
        }
    }

    async fn fetch_coalesced(
        &self,
        key: CacheKey,
        request: OriginRequest,
        overrides: CacheOverrides,
    ) -> Result<Delivery, ProxyError> {
        let store = Arc::clone(&self.store);
        let origin = Arc::clone(&self.origin);
        let forwarded = request.clone();
        let fetch_key = key.clone();

        let (outcome, role) = self
            .inflight
            .run(&key, move || {
                fetch_and_store(store, origin, fetch_key, forwarded, overrides)
            })
            .await;
        let fetched = outcome.ok_or(ProxyError::FetchAborted)??;

        if role == Role::Follower && !fetched.shareable {
            debug!(
                source = SOURCE,
                key = %key,
                "Coalesced response is private to its requester, fetching separately"
            );
            let response = fetch_direct(self.origin.as_ref(), request).await?;
            return Ok(Delivery::from_origin(response));
        }

        Ok(Delivery::from_origin(fetched.response.clone()))
    }

    fn finalize_headers(&self, headers: &mut HeaderMap, hits: Option<u64>) {
        strip_hop_headers(headers);
        for name in &self.diagnostic_headers {
            headers.remove(name);
        }
        match hits {
            Some(hits) => {
                if let Ok(value) = HeaderValue::from_str(&format!("HIT ({hits})")) {
                    headers.insert(self.status_header.clone(), value);
                }
            }
            None => {
                if !headers.contains_key(&self.status_header) {
                    headers.insert(
                        self.status_header.clone(),
                        HeaderValue::from_static(STATUS_MISS),
                    );
                }
            }
        }
    }
}

async fn fetch_direct(
    origin: &dyn Origin,
    request: OriginRequest,
) -> Result<OriginResponse, ProxyError> {
    origin.fetch(request).await.map_err(|err| {
        counter!(METRIC_ORIGIN_ERROR).increment(1);
        ProxyError::from(err)
    })
}

/// Leader side of a cold miss: fetch, shape, store. Runs detached from the
/// requesting client.
async fn fetch_and_store(
    store: Arc<ResponseStore>,
    origin: Arc<dyn Origin>,
    key: CacheKey,
    request: OriginRequest,
    overrides: CacheOverrides,
) -> FetchResult {
    let mut response = match origin.fetch(request).await {
        Ok(response) => response,
        Err(err) => {
            counter!(METRIC_ORIGIN_ERROR).increment(1);
            debug!(source = SOURCE, key = %key, error = %err, "Origin fetch failed");
            return Err(err);
        }
    };

    let decision = shape(
        response.status,
        &mut response.headers,
        &overrides,
        store.config().default_lifetime(),
    );
    let stored = match decision {
        Storability::Store(lifetime) => {
            let entry = CacheEntry::new(
                response.status,
                response.headers.clone(),
                response.body.clone(),
                lifetime,
            );
            store.insert(key.clone(), entry)
        }
        Storability::Skip(reason) => {
            debug!(source = SOURCE, key = %key, reason, "Origin response not stored");
            false
        }
    };

    let shareable = stored || !is_private(&response.headers);
    Ok(Arc::new(Fetched {
        response,
        shareable,
    }))
}

fn is_private(headers: &HeaderMap) -> bool {
    headers.contains_key(header::SET_COOKIE)
        || headers
            .get_all(header::CACHE_CONTROL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|directive| directive.trim().eq_ignore_ascii_case("private"))
}

fn accepted_method(method: &Method) -> Result<Method, ProxyError> {
    if ACCEPTED_METHODS.contains(method) {
        Ok(method.clone())
    } else {
        Err(ProxyError::bad_request(format!(
            "unsupported method `{method}`"
        )))
    }
}

/// Path plus query of the request target; the authority of an absolute-form
/// target is ignored.
fn origin_form(uri: &Uri) -> Result<String, ProxyError> {
    let path = uri.path();
    if !path.starts_with('/') {
        return Err(ProxyError::bad_request(format!(
            "request target `{uri}` has no absolute path"
        )));
    }
    Ok(match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    })
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes, ProxyError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.is::<LengthLimitError>() => Err(ProxyError::PayloadTooLarge { limit }),
        Err(err) => Err(ProxyError::Body(err.to_string())),
    }
}

fn build_response(origin: OriginResponse) -> Response {
    let mut response = Response::new(Body::from(origin.body));
    *response.status_mut() = origin.status;
    *response.headers_mut() = origin.headers;
    response
}
