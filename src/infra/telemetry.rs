use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_CACHE_BYTES, METRIC_CACHE_ENTRIES, METRIC_CACHE_EVICT, METRIC_CACHE_HIT,
    METRIC_CACHE_MISS, METRIC_CACHE_PASS, METRIC_CACHE_STALE_HIT, METRIC_CACHE_STORE,
    METRIC_COALESCED_WAIT, METRIC_ORIGIN_ERROR, METRIC_REFRESH_DROPPED, METRIC_REFRESH_FAILURE,
    METRIC_REFRESH_SUCCESS,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Requests served from a fresh cache entry."
        );
        describe_counter!(
            METRIC_CACHE_STALE_HIT,
            Unit::Count,
            "Requests served from a stale entry inside its grace window."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Cacheable requests that required an origin fetch."
        );
        describe_counter!(
            METRIC_CACHE_PASS,
            Unit::Count,
            "Requests forwarded without consulting the cache."
        );
        describe_counter!(
            METRIC_CACHE_EVICT,
            Unit::Count,
            "Entries evicted to stay within the store limits."
        );
        describe_counter!(
            METRIC_CACHE_STORE,
            Unit::Count,
            "Origin responses written to the store."
        );
        describe_counter!(
            METRIC_COALESCED_WAIT,
            Unit::Count,
            "Cold misses that joined an origin fetch already in flight."
        );
        describe_counter!(
            METRIC_REFRESH_SUCCESS,
            Unit::Count,
            "Background refreshes that reached the origin."
        );
        describe_counter!(
            METRIC_REFRESH_FAILURE,
            Unit::Count,
            "Background refreshes that failed and extended grace."
        );
        describe_counter!(
            METRIC_REFRESH_DROPPED,
            Unit::Count,
            "Background refreshes dropped because the queue was full."
        );
        describe_counter!(
            METRIC_ORIGIN_ERROR,
            Unit::Count,
            "Client-facing origin fetches that failed."
        );
        describe_gauge!(
            METRIC_CACHE_ENTRIES,
            Unit::Count,
            "Current number of stored entries."
        );
        describe_gauge!(
            METRIC_CACHE_BYTES,
            Unit::Bytes,
            "Current summed body size of stored entries."
        );
    });
}
