//! Cache metric names and the stats snapshot served by the admin API.

use serde::Serialize;

pub(crate) const METRIC_CACHE_HIT: &str = "cachet_cache_hit_total";
pub(crate) const METRIC_CACHE_STALE_HIT: &str = "cachet_cache_stale_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "cachet_cache_miss_total";
pub(crate) const METRIC_CACHE_PASS: &str = "cachet_cache_pass_total";
pub(crate) const METRIC_CACHE_EVICT: &str = "cachet_cache_evict_total";
pub(crate) const METRIC_CACHE_STORE: &str = "cachet_cache_store_total";
pub(crate) const METRIC_COALESCED_WAIT: &str = "cachet_coalesced_wait_total";
pub(crate) const METRIC_REFRESH_SUCCESS: &str = "cachet_refresh_success_total";
pub(crate) const METRIC_REFRESH_FAILURE: &str = "cachet_refresh_failure_total";
pub(crate) const METRIC_REFRESH_DROPPED: &str = "cachet_refresh_dropped_total";
pub(crate) const METRIC_ORIGIN_ERROR: &str = "cachet_origin_error_total";
pub(crate) const METRIC_CACHE_ENTRIES: &str = "cachet_cache_entries";
pub(crate) const METRIC_CACHE_BYTES: &str = "cachet_cache_bytes";

/// Point-in-time view of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub max_entries: usize,
    pub max_total_bytes: u64,
    pub eviction: &'static str,
}
