//! Background refresh of stale entries.
//!
//! A stale hit enqueues at most one refresh per key. The worker drains the
//! bounded queue with a fixed number of concurrent origin fetches. A failed
//! refresh leaves the stale entry in place and widens its grace window with
//! an exponential backoff.
//!
//! Refreshes revalidate with the stored entry's own `ETag` / `Last-Modified`;
//! whatever validators or range the triggering client sent are dropped. A
//! `304` renews the stored object instead of replacing it.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode, header};
use dashmap::DashSet;
use metrics::counter;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::infra::origin::{Origin, OriginError, OriginRequest, OriginResponse};

use super::conditional::ClientConditions;
use super::config::CacheConfig;
use super::directives::{self, Storability};
use super::entry::CacheEntry;
use super::keys::CacheKey;
use super::policy::CacheOverrides;
use super::stats::{METRIC_REFRESH_DROPPED, METRIC_REFRESH_FAILURE, METRIC_REFRESH_SUCCESS};
use super::store::ResponseStore;

/// A pending refresh of one stale object.
#[derive(Debug, Clone)]
pub struct RefreshJob {
    pub key: CacheKey,
    pub request: OriginRequest,
    pub stale: Arc<CacheEntry>,
    pub overrides: CacheOverrides,
}

/// Result of asking for a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Queued,
    /// A refresh for this key is already queued or running.
    AlreadyPending,
    /// The entry is backing off after a failed refresh.
    Deferred,
    /// Queue full or worker gone.
    Dropped,
}

/// Handle used by request handlers to enqueue refreshes.
#[derive(Clone)]
pub struct Refresher {
    sender: mpsc::Sender<RefreshJob>,
    pending: Arc<DashSet<CacheKey>>,
}

/// Consumes the refresh queue.
pub struct RefreshWorker {
    receiver: mpsc::Receiver<RefreshJob>,
    pending: Arc<DashSet<CacheKey>>,
    store: Arc<ResponseStore>,
    origin: Arc<dyn Origin>,
    config: CacheConfig,
}

/// Removes the key from the pending set once its refresh is finished.
struct PendingGuard {
    pending: Arc<DashSet<CacheKey>>,
    key: CacheKey,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

impl Refresher {
    pub fn new(
        config: &CacheConfig,
        store: Arc<ResponseStore>,
        origin: Arc<dyn Origin>,
    ) -> (Self, RefreshWorker) {
        let (sender, receiver) = mpsc::channel(config.refresh_queue_capacity.max(1));
        let pending = Arc::new(DashSet::new());
        let refresher = Self {
            sender,
            pending: Arc::clone(&pending),
        };
        let worker = RefreshWorker {
            receiver,
            pending,
            store,
            origin,
            config: config.clone(),
        };
        (refresher, worker)
    }

    /// Enqueue a refresh unless one is pending or the entry is backing off.
    pub fn schedule(&self, job: RefreshJob) -> Schedule {
        if !job.stale.refresh_due(Instant::now()) {
            return Schedule::Deferred;
        }
        if !self.pending.insert(job.key.clone()) {
            return Schedule::AlreadyPending;
        }

        match self.sender.try_send(job) {
            Ok(()) => Schedule::Queued,
            Err(err) => {
                let job = match err {
                    mpsc::error::TrySendError::Full(job) => job,
                    mpsc::error::TrySendError::Closed(job) => job,
                };
                self.pending.remove(&job.key);
                counter!(METRIC_REFRESH_DROPPED).increment(1);
                warn!(key = %job.key, "Refresh queue unavailable, dropping refresh");
                Schedule::Dropped
            }
        }
    }

    /// Refreshes queued or running.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.pending.contains(key)
    }
}

impl RefreshWorker {
    /// Run until every [`Refresher`] handle is dropped.
    pub async fn run(mut self) {
        let permits = Arc::new(Semaphore::new(self.config.refresh_concurrency.max(1)));
        info!(
            concurrency = self.config.refresh_concurrency,
            "Refresh worker started"
        );

        while let Some(job) = self.receiver.recv().await {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let guard = PendingGuard {
                pending: Arc::clone(&self.pending),
                key: job.key.clone(),
            };
            let store = Arc::clone(&self.store);
            let origin = Arc::clone(&self.origin);
            let config = self.config.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                refresh(job, &store, origin.as_ref(), &config).await;
            });
        }

        info!("Refresh worker stopped");
    }
}

async fn refresh(job: RefreshJob, store: &ResponseStore, origin: &dyn Origin, config: &CacheConfig) {
    let RefreshJob {
        key,
        mut request,
        stale,
        overrides,
    } = job;

    ClientConditions::take_from(&mut request.headers);
    add_validators(&mut request.headers, &stale);

    let response = match origin.fetch(request).await {
        Ok(response) if response.status.is_server_error() => {
            Err(format!("origin answered {}", response.status))
        }
        Ok(response) if response.status == StatusCode::NOT_MODIFIED => {
            debug!(key = %key, "Origin confirmed stored entry");
            Ok(renewed(&stale, &response.headers))
        }
        Ok(response) => Ok(response),
        Err(err) => Err(describe(&err)),
    };

    let mut response = match response {
        Ok(response) => response,
        Err(reason) => {
            counter!(METRIC_REFRESH_FAILURE).increment(1);
            match stale.record_refresh_failure(Instant::now(), config) {
                Some(backoff) => warn!(
                    key = %key,
                    reason = %reason,
                    attempt = stale.refresh_failures(),
                    backoff_secs = backoff.as_secs(),
                    "Refresh failed, serving stale entry longer"
                ),
                None => warn!(
                    key = %key,
                    reason = %reason,
                    attempt = stale.refresh_failures(),
                    "Refresh failed, retry budget spent; entry will expire"
                ),
            }
            return;
        }
    };

    counter!(METRIC_REFRESH_SUCCESS).increment(1);
    match directives::shape(
        response.status,
        &mut response.headers,
        &overrides,
        config.default_lifetime(),
    ) {
        Storability::Store(lifetime) => {
            let entry = CacheEntry::new(response.status, response.headers, response.body, lifetime);
            if store.insert(key.clone(), entry) {
                debug!(key = %key, ttl_secs = lifetime.ttl.as_secs(), "Refreshed entry");
            } else {
                store.invalidate_entry(&key, &stale);
            }
        }
        Storability::Skip(reason) => {
            store.invalidate_entry(&key, &stale);
            debug!(key = %key, reason, "Refreshed response is not storable, entry dropped");
        }
    }
}

/// Ask the origin to confirm the stored representation.
fn add_validators(headers: &mut HeaderMap, stale: &CacheEntry) {
    if let Some(etag) = stale.headers().get(header::ETAG) {
        headers.insert(header::IF_NONE_MATCH, etag.clone());
    }
    if let Some(modified) = stale.headers().get(header::LAST_MODIFIED) {
        headers.insert(header::IF_MODIFIED_SINCE, modified.clone());
    }
}

/// The stored object with header fields updated from a `304`. The stored
/// `Content-Length` describes the stored body and is kept.
fn renewed(stale: &CacheEntry, update: &HeaderMap) -> OriginResponse {
    let mut headers = stale.headers().clone();
    for name in update.keys() {
        if name == header::CONTENT_LENGTH {
            continue;
        }
        headers.remove(name);
        for value in update.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    OriginResponse {
        status: stale.status(),
        headers,
        body: stale.body().clone(),
    }
}

fn describe(err: &OriginError) -> String {
    format!("{} ({})", err, err.kind())
}
