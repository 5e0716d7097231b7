//! Freshness decisions for origin responses.
//!
//! Forced lifetimes from policy win for complete (`200`) responses; everything else
//! follows the origin's `Cache-Control` / `Expires` headers with configured
//! defaults when the origin says nothing.

use std::time::{Duration, SystemTime};

use axum::http::{HeaderMap, StatusCode, header};

use super::policy::CacheOverrides;

/// Statuses that may be stored when the origin permits it. `206` and `304`
/// describe a client-specific exchange, never the resource itself.
const STORABLE_STATUSES: &[u16] = &[200, 203, 204, 300, 301, 302, 307, 404, 410, 414];

/// TTL and grace of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
    pub ttl: Duration,
    pub grace: Duration,
}

impl Lifetime {
    pub const fn new(ttl: Duration, grace: Duration) -> Self {
        Self { ttl, grace }
    }

    pub fn is_zero(&self) -> bool {
        self.ttl.is_zero() && self.grace.is_zero()
    }
}

/// Whether and for how long a response may be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storability {
    Store(Lifetime),
    Skip(&'static str),
}

/// Decide the storage lifetime for a response.
pub fn decide(
    status: StatusCode,
    headers: &HeaderMap,
    overrides: &CacheOverrides,
    defaults: Lifetime,
) -> Storability {
    if let Some(forced) = forced_lifetime(status, overrides) {
        return Storability::Store(forced);
    }

    if !STORABLE_STATUSES.contains(&status.as_u16()) {
        return Storability::Skip("status");
    }

    let control = CacheControl::parse(headers);
    if control.no_store || control.private || control.no_cache {
        return Storability::Skip("cache-control");
    }
    if headers.contains_key(header::SET_COOKIE) {
        return Storability::Skip("set-cookie");
    }

    let ttl = control
        .s_maxage
        .or(control.max_age)
        .or_else(|| expires_ttl(headers))
        .unwrap_or(defaults.ttl)
        .saturating_sub(age(headers));
    let grace = control.stale_while_revalidate.unwrap_or(defaults.grace);

    let lifetime = Lifetime::new(ttl, grace);
    if lifetime.is_zero() {
        return Storability::Skip("zero-lifetime");
    }
    Storability::Store(lifetime)
}

/// Decide storability and prepare `headers` for storage and delivery.
///
/// When a forced lifetime applies, `Set-Cookie` is dropped from the response
/// so the shared object carries no per-client state.
pub fn shape(
    status: StatusCode,
    headers: &mut HeaderMap,
    overrides: &CacheOverrides,
    defaults: Lifetime,
) -> Storability {
    let decision = decide(status, headers, overrides, defaults);
    if overrides.strip_cookie && forced_lifetime(status, overrides).is_some() {
        headers.remove(header::SET_COOKIE);
    }
    decision
}

fn forced_lifetime(status: StatusCode, overrides: &CacheOverrides) -> Option<Lifetime> {
    overrides.lifetime.filter(|_| status == StatusCode::OK)
}

#[derive(Debug, Default)]
struct CacheControl {
    no_store: bool,
    no_cache: bool,
    private: bool,
    max_age: Option<Duration>,
    s_maxage: Option<Duration>,
    stale_while_revalidate: Option<Duration>,
}

impl CacheControl {
    fn parse(headers: &HeaderMap) -> Self {
        let mut control = Self::default();
        for value in headers.get_all(header::CACHE_CONTROL) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for directive in value.split(',') {
                let directive = directive.trim();
                let (name, argument) = match directive.split_once('=') {
                    Some((name, argument)) => (name.trim(), Some(argument.trim().trim_matches('"'))),
                    None => (directive, None),
                };
                match name.to_ascii_lowercase().as_str() {
                    "no-store" => control.no_store = true,
                    "no-cache" => control.no_cache = true,
                    "private" => control.private = true,
                    "max-age" => control.max_age = argument.and_then(parse_seconds),
                    "s-maxage" => control.s_maxage = argument.and_then(parse_seconds),
                    "stale-while-revalidate" => {
                        control.stale_while_revalidate = argument.and_then(parse_seconds)
                    }
                    _ => {}
                }
            }
        }
        control
    }
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    raw.parse::<u64>().ok().map(Duration::from_secs)
}

fn expires_ttl(headers: &HeaderMap) -> Option<Duration> {
    let expires = headers.get(header::EXPIRES)?.to_str().ok()?;
    // An unparseable Expires (commonly "0") means already expired.
    let Ok(expires) = httpdate::parse_http_date(expires) else {
        return Some(Duration::ZERO);
    };
    let date = headers
        .get(header::DATE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
        .unwrap_or_else(SystemTime::now);
    Some(expires.duration_since(date).unwrap_or(Duration::ZERO))
}

fn age(headers: &HeaderMap) -> Duration {
    headers
        .get(header::AGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_seconds(value.trim()))
        .unwrap_or(Duration::ZERO)
}
