//! Cachet cache layer.
//!
//! Everything between "this request may be cached" and "here are the bytes":
//!
//! - **Policy**: ordered rules that classify a request and pick overrides
//! - **Directives**: storage decisions from origin response headers
//! - **Conditional**: client validators and ranges, answered from full objects
//! - **Store**: bounded in-memory objects with TTL, grace and hit counts
//! - **In-flight**: coalescing of concurrent cold misses
//! - **Refresh**: background revalidation of stale objects
//!
//! ## Configuration
//!
//! Limits and lifetimes come from the `[cache]` section, rules from `[policy]`:
//!
//! ```toml
//! [cache]
//! max_entries = 10000
//! eviction = "lru"
//! default_ttl_seconds = 120
//! # ... see config.rs for all options
//! ```

mod conditional;
mod config;
mod directives;
mod entry;
mod inflight;
mod keys;
mod lock;
mod policy;
mod refresh;
mod stats;
mod store;

pub use conditional::ClientConditions;
pub use config::{CacheConfig, EvictionPolicy};
pub use directives::{Lifetime, Storability, decide, shape};
pub use entry::{CacheEntry, Freshness};
pub use inflight::{InFlight, Role};
pub use keys::CacheKey;
pub use policy::{
    CacheOverrides, Classification, Policy, PolicyConfig, PolicyRule, RuleAction, RuleMatch,
};
pub use refresh::{RefreshJob, RefreshWorker, Refresher, Schedule};
pub use stats::CacheStats;
pub(crate) use stats::{
    METRIC_CACHE_BYTES, METRIC_CACHE_ENTRIES, METRIC_CACHE_EVICT, METRIC_CACHE_HIT,
    METRIC_CACHE_MISS, METRIC_CACHE_PASS, METRIC_CACHE_STALE_HIT, METRIC_CACHE_STORE,
    METRIC_COALESCED_WAIT, METRIC_ORIGIN_ERROR, METRIC_REFRESH_DROPPED, METRIC_REFRESH_FAILURE,
    METRIC_REFRESH_SUCCESS,
};
pub use store::{Lookup, ResponseStore};
