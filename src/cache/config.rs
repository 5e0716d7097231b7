//! Cache configuration.
//!
//! Controls store limits, default lifetimes and the background refresher via
//! the `[cache]` section of `cachet.toml`.

use std::{fmt, num::NonZeroUsize, str::FromStr, time::Duration};

use super::directives::Lifetime;

// Default values for cache configuration
const DEFAULT_MAX_ENTRIES: usize = 10_000;
const DEFAULT_MAX_TOTAL_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_MAX_OBJECT_BYTES: u64 = 16 * 1024 * 1024;
const DEFAULT_TTL_SECS: u64 = 120;
const DEFAULT_GRACE_SECS: u64 = 10;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
const DEFAULT_REFRESH_CONCURRENCY: usize = 8;
const DEFAULT_REFRESH_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_REFRESH_BACKOFF_BASE_SECS: u64 = 5;
const DEFAULT_REFRESH_BACKOFF_MAX_SECS: u64 = 60;
const DEFAULT_REFRESH_MAX_ATTEMPTS: u32 = 5;

/// Which entry to drop first when the store is over its limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Least recently used: hits promote an entry.
    #[default]
    Lru,
    /// Insertion order: hits do not promote.
    Fifo,
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "fifo" => Ok(Self::Fifo),
            other => Err(format!("unknown eviction policy `{other}` (expected lru|fifo)")),
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lru => f.write_str("lru"),
            Self::Fifo => f.write_str("fifo"),
        }
    }
}

/// Runtime cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of stored entries.
    pub max_entries: usize,
    /// Upper bound on the summed body size of stored entries.
    pub max_total_bytes: u64,
    /// Bodies larger than this are delivered but never stored.
    pub max_object_bytes: u64,
    pub eviction: EvictionPolicy,
    /// TTL used when the origin supplies no freshness information.
    pub default_ttl: Duration,
    /// Grace used when the origin supplies no `stale-while-revalidate`.
    pub default_grace: Duration,
    /// Cadence of the expired-entry sweeper.
    pub sweep_interval: Duration,
    /// Maximum concurrent background refreshes.
    pub refresh_concurrency: usize,
    /// Pending refreshes beyond this are dropped.
    pub refresh_queue_capacity: usize,
    /// First grace extension after a failed refresh; doubles per failure.
    pub refresh_backoff_base: Duration,
    /// Ceiling for a single grace extension.
    pub refresh_backoff_max: Duration,
    /// Failed refreshes that may extend grace before the entry is left to expire.
    pub refresh_max_attempts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            max_object_bytes: DEFAULT_MAX_OBJECT_BYTES,
            eviction: EvictionPolicy::Lru,
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            default_grace: Duration::from_secs(DEFAULT_GRACE_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            refresh_concurrency: DEFAULT_REFRESH_CONCURRENCY,
            refresh_queue_capacity: DEFAULT_REFRESH_QUEUE_CAPACITY,
            refresh_backoff_base: Duration::from_secs(DEFAULT_REFRESH_BACKOFF_BASE_SECS),
            refresh_backoff_max: Duration::from_secs(DEFAULT_REFRESH_BACKOFF_MAX_SECS),
            refresh_max_attempts: DEFAULT_REFRESH_MAX_ATTEMPTS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            max_entries: settings.max_entries.get(),
            max_total_bytes: settings.max_total_bytes.get(),
            max_object_bytes: settings.max_object_bytes.get(),
            eviction: settings.eviction,
            default_ttl: settings.default_ttl,
            default_grace: settings.default_grace,
            sweep_interval: settings.sweep_interval,
            refresh_concurrency: settings.refresh_concurrency.get(),
            refresh_queue_capacity: settings.refresh_queue_capacity.get(),
            refresh_backoff_base: settings.refresh_backoff_base,
            refresh_backoff_max: settings.refresh_backoff_max,
            refresh_max_attempts: settings.refresh_max_attempts,
        }
    }
}

impl CacheConfig {
    /// Returns the entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Lifetime applied when the origin sends no freshness information.
    pub fn default_lifetime(&self) -> Lifetime {
        Lifetime::new(self.default_ttl, self.default_grace)
    }

    /// Grace extension granted after the `attempt`-th consecutive refresh failure
    /// (1-based), or `None` once the attempt budget is spent.
    pub fn refresh_backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.refresh_max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let backoff = self
            .refresh_backoff_base
            .checked_mul(factor)
            .unwrap_or(self.refresh_backoff_max);
        Some(backoff.min(self.refresh_backoff_max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, 10_000);
        assert_eq!(config.max_object_bytes, 16 * 1024 * 1024);
        assert_eq!(config.eviction, EvictionPolicy::Lru);
        assert_eq!(config.default_ttl, Duration::from_secs(120));
        assert_eq!(config.default_grace, Duration::from_secs(10));
        assert_eq!(config.refresh_max_attempts, 5);
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert_eq!(config.max_entries_non_zero().get(), 1);
    }

    #[test]
    fn eviction_policy_parses_case_insensitively() {
        assert_eq!("LRU".parse::<EvictionPolicy>(), Ok(EvictionPolicy::Lru));
        assert_eq!(" fifo ".parse::<EvictionPolicy>(), Ok(EvictionPolicy::Fifo));
        assert!("random".parse::<EvictionPolicy>().is_err());
    }

    #[test]
    fn refresh_backoff_doubles_until_capped() {
        let config = CacheConfig {
            refresh_backoff_base: Duration::from_secs(5),
            refresh_backoff_max: Duration::from_secs(30),
            refresh_max_attempts: 4,
            ..Default::default()
        };

        assert_eq!(config.refresh_backoff(1), Some(Duration::from_secs(5)));
        assert_eq!(config.refresh_backoff(2), Some(Duration::from_secs(10)));
        assert_eq!(config.refresh_backoff(3), Some(Duration::from_secs(20)));
        assert_eq!(config.refresh_backoff(4), Some(Duration::from_secs(30)));
        assert_eq!(config.refresh_backoff(5), None);
        assert_eq!(config.refresh_backoff(0), None);
    }
}
