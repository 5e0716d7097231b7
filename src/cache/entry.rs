//! Stored objects.
//!
//! An entry's response data never changes after creation; replacing an
//! object means swapping in a new `Arc<CacheEntry>`. Only the hit counter and
//! the refresh bookkeeping are mutable, and both are atomics.

use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use axum::http::{HeaderMap, StatusCode, header};
use bytes::Bytes;
use tokio::time::Instant;

use super::config::CacheConfig;
use super::directives::Lifetime;

/// Where an entry sits in its lifecycle at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `age < ttl`
    Fresh,
    /// Past TTL, still inside grace (plus any extension).
    Stale,
    /// Past grace; unusable.
    Expired,
}

#[derive(Debug)]
pub struct CacheEntry {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    created: Instant,
    lifetime: Lifetime,
    hits: AtomicU64,
    grace_extension_ms: AtomicU64,
    refresh_failures: AtomicU32,
    refresh_not_before_ms: AtomicU64,
}

impl CacheEntry {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes, lifetime: Lifetime) -> Self {
        Self::created_at(status, headers, body, lifetime, Instant::now())
    }

    pub fn created_at(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        lifetime: Lifetime,
        created: Instant,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            created,
            lifetime,
            hits: AtomicU64::new(0),
            grace_extension_ms: AtomicU64::new(0),
            refresh_failures: AtomicU32::new(0),
            refresh_not_before_ms: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Body size used for store accounting.
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Acquire)
    }

    /// Count a delivery from cache and return the cumulative hit count.
    pub fn record_hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created)
    }

    /// Grace added by failed refreshes.
    pub fn grace_extension(&self) -> Duration {
        Duration::from_millis(self.grace_extension_ms.load(Ordering::Acquire))
    }

    /// End of the usable window: `created + ttl + grace + extension`.
    pub fn expires_at(&self) -> Instant {
        self.created + self.lifetime.ttl + self.lifetime.grace + self.grace_extension()
    }

    pub fn freshness(&self, now: Instant) -> Freshness {
        let age = self.age(now);
        if age < self.lifetime.ttl {
            Freshness::Fresh
        } else if now < self.expires_at() {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// A stored `Content-Length` that disagrees with the stored body marks a
    /// torn or truncated object. Bodiless entries (HEAD, 204, 304) are exempt.
    pub fn is_consistent(&self) -> bool {
        if self.body.is_empty() {
            return true;
        }
        match self.headers.get(header::CONTENT_LENGTH) {
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .is_some_and(|declared| declared == self.size()),
            None => true,
        }
    }

    /// Whether a background refresh may be attempted now.
    pub fn refresh_due(&self, now: Instant) -> bool {
        let not_before =
            Duration::from_millis(self.refresh_not_before_ms.load(Ordering::Acquire));
        self.age(now) >= not_before
    }

    pub fn refresh_failures(&self) -> u32 {
        self.refresh_failures.load(Ordering::Acquire)
    }

    /// Record a failed refresh. Blocks further attempts for the backoff and
    /// keeps the entry servable until one backoff past the next attempt.
    /// Returns the backoff, or `None` when the attempt budget is spent and the
    /// entry is left to expire on its current schedule.
    pub fn record_refresh_failure(&self, now: Instant, config: &CacheConfig) -> Option<Duration> {
        let attempt = self.refresh_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let backoff = config.refresh_backoff(attempt)?;

        let age = self.age(now);
        self.refresh_not_before_ms
            .fetch_max(millis(age + backoff), Ordering::AcqRel);

        let base_window = self.lifetime.ttl + self.lifetime.grace;
        let wanted_window = age + backoff * 2;
        if let Some(extension) = wanted_window.checked_sub(base_window) {
            self.grace_extension_ms
                .fetch_max(millis(extension), Ordering::AcqRel);
        }
        Some(backoff)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
