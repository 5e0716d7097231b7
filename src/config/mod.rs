//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU64, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use axum::http::HeaderName;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::EvictionPolicy;

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cachet";
const ENV_PREFIX: &str = "CACHET";
const LIST_KEYS: &[&str] = &[
    "policy.bypass_prefixes",
    "policy.static_extensions",
    "policy.presigned_markers",
    "policy.diagnostic_headers",
];

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 6081;
const DEFAULT_ADMIN_PORT: u16 = 6082;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_MAX_REQUEST_BODY_BYTES: u64 = 10 * 1024 * 1024;

const DEFAULT_ORIGIN_SCHEME: &str = "http";
const DEFAULT_ORIGIN_HOST: &str = "127.0.0.1";
const DEFAULT_ORIGIN_PORT: u16 = 9000;
const DEFAULT_ORIGIN_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_ORIGIN_FIRST_BYTE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ORIGIN_BETWEEN_BYTES_TIMEOUT_SECS: u64 = 10;
const DEFAULT_ORIGIN_POOL_MAX_IDLE_PER_HOST: usize = 32;

const DEFAULT_CACHE_MAX_ENTRIES: u64 = 10_000;
const DEFAULT_CACHE_MAX_TOTAL_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_CACHE_MAX_OBJECT_BYTES: u64 = 16 * 1024 * 1024;
const DEFAULT_CACHE_TTL_SECS: u64 = 120;
const DEFAULT_CACHE_GRACE_SECS: u64 = 10;
const DEFAULT_CACHE_SWEEP_INTERVAL_SECS: u64 = 30;
const DEFAULT_REFRESH_CONCURRENCY: u64 = 8;
const DEFAULT_REFRESH_QUEUE_CAPACITY: u64 = 1024;
const DEFAULT_REFRESH_BACKOFF_BASE_SECS: u64 = 5;
const DEFAULT_REFRESH_BACKOFF_MAX_SECS: u64 = 60;
const DEFAULT_REFRESH_MAX_ATTEMPTS: u32 = 5;

const DEFAULT_BYPASS_PREFIXES: &[&str] = &["/upload", "/api/"];
const DEFAULT_STATIC_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "webp", "gif", "ico", "svg", "css", "js"];
const DEFAULT_PRESIGNED_MARKERS: &[&str] = &["X-Amz-Signature="];
const DEFAULT_STATIC_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_STATIC_GRACE_SECS: u64 = 60 * 60;
const DEFAULT_STATUS_HEADER: &str = "x-cache";
const DEFAULT_DIAGNOSTIC_HEADERS: &[&str] = &["via", "x-varnish"];

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub origin: OriginSettings,
    pub cache: CacheSettings,
    pub policy: PolicySettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
    pub max_request_body_bytes: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub first_byte_timeout: Duration,
    pub between_bytes_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_entries: NonZeroUsize,
    pub max_total_bytes: NonZeroU64,
    pub max_object_bytes: NonZeroU64,
    pub eviction: EvictionPolicy,
    pub default_ttl: Duration,
    pub default_grace: Duration,
    pub sweep_interval: Duration,
    pub refresh_concurrency: NonZeroUsize,
    pub refresh_queue_capacity: NonZeroUsize,
    pub refresh_backoff_base: Duration,
    pub refresh_backoff_max: Duration,
    pub refresh_max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub bypass_prefixes: Vec<String>,
    pub static_extensions: Vec<String>,
    pub presigned_markers: Vec<String>,
    pub static_ttl: Duration,
    pub static_grace: Duration,
    pub pass_authorized: bool,
    pub status_header: HeaderName,
    pub diagnostic_headers: Vec<HeaderName>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    let mut environment = Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .list_separator(",");
    for key in LIST_KEYS {
        environment = environment.with_list_parse_key(key);
    }
    builder = builder.add_source(environment);

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) | Some(Command::CheckConfig(args)) => {
            raw.apply_serve_overrides(&args.overrides)
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    origin: RawOriginSettings,
    cache: RawCacheSettings,
    policy: RawPolicySettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.port {
            self.server.port = Some(port);
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(bytes) = overrides.server_max_request_body_bytes {
            self.server.max_request_body_bytes = Some(bytes);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(scheme) = overrides.origin_scheme.as_ref() {
            self.origin.scheme = Some(scheme.clone());
        }
        if let Some(host) = overrides.origin_host.as_ref() {
            self.origin.host = Some(host.clone());
        }
        if let Some(port) = overrides.origin_port {
            self.origin.port = Some(port);
        }
        if let Some(seconds) = overrides.origin_connect_timeout_seconds {
            self.origin.connect_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.origin_first_byte_timeout_seconds {
            self.origin.first_byte_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.origin_between_bytes_timeout_seconds {
            self.origin.between_bytes_timeout_seconds = Some(seconds);
        }
        if let Some(count) = overrides.cache_max_entries {
            self.cache.max_entries = Some(count as u64);
        }
        if let Some(bytes) = overrides.cache_max_total_bytes {
            self.cache.max_total_bytes = Some(bytes);
        }
        if let Some(policy) = overrides.cache_eviction.as_ref() {
            self.cache.eviction = Some(policy.clone());
        }
        if let Some(seconds) = overrides.cache_default_ttl_seconds {
            self.cache.default_ttl_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.cache_default_grace_seconds {
            self.cache.default_grace_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            origin,
            cache,
            policy,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let origin = build_origin_settings(origin)?;
        let cache = build_cache_settings(cache)?;
        let policy = build_policy_settings(policy)?;

        Ok(Self {
            server,
            logging,
            origin,
            cache,
            policy,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let port = non_zero_port(server.port.unwrap_or(DEFAULT_PORT), "server.port")?;
    let admin_port = non_zero_port(
        server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT),
        "server.admin_port",
    )?;

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;
    if addr == admin_addr {
        return Err(LoadError::invalid(
            "server.admin_port",
            "admin listener must not share the proxy address",
        ));
    }

    let graceful_shutdown = seconds(
        server
            .graceful_shutdown_seconds
            .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS),
        "server.graceful_shutdown_seconds",
    )?;

    let max_request_body_bytes = non_zero_usize(
        server
            .max_request_body_bytes
            .unwrap_or(DEFAULT_MAX_REQUEST_BODY_BYTES),
        "server.max_request_body_bytes",
    )?;

    Ok(ServerSettings {
        addr,
        admin_addr,
        graceful_shutdown,
        max_request_body_bytes,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let scheme = origin
        .scheme
        .unwrap_or_else(|| DEFAULT_ORIGIN_SCHEME.to_string())
        .trim()
        .to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(LoadError::invalid(
            "origin.scheme",
            format!("unsupported scheme `{scheme}` (expected http|https)"),
        ));
    }

    let host = origin
        .host
        .unwrap_or_else(|| DEFAULT_ORIGIN_HOST.to_string())
        .trim()
        .to_string();
    if host.is_empty() || host.contains('/') {
        return Err(LoadError::invalid(
            "origin.host",
            "must be a bare host name or address",
        ));
    }

    let port = non_zero_port(origin.port.unwrap_or(DEFAULT_ORIGIN_PORT), "origin.port")?;

    Ok(OriginSettings {
        scheme,
        host,
        port,
        connect_timeout: seconds(
            origin
                .connect_timeout_seconds
                .unwrap_or(DEFAULT_ORIGIN_CONNECT_TIMEOUT_SECS),
            "origin.connect_timeout_seconds",
        )?,
        first_byte_timeout: seconds(
            origin
                .first_byte_timeout_seconds
                .unwrap_or(DEFAULT_ORIGIN_FIRST_BYTE_TIMEOUT_SECS),
            "origin.first_byte_timeout_seconds",
        )?,
        between_bytes_timeout: seconds(
            origin
                .between_bytes_timeout_seconds
                .unwrap_or(DEFAULT_ORIGIN_BETWEEN_BYTES_TIMEOUT_SECS),
            "origin.between_bytes_timeout_seconds",
        )?,
        pool_max_idle_per_host: origin
            .pool_max_idle_per_host
            .unwrap_or(DEFAULT_ORIGIN_POOL_MAX_IDLE_PER_HOST),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let max_entries = non_zero_usize(
        cache.max_entries.unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
        "cache.max_entries",
    )?;
    let max_total_bytes = non_zero_u64(
        cache.max_total_bytes.unwrap_or(DEFAULT_CACHE_MAX_TOTAL_BYTES),
        "cache.max_total_bytes",
    )?;
    let max_object_bytes = non_zero_u64(
        cache
            .max_object_bytes
            .unwrap_or(DEFAULT_CACHE_MAX_OBJECT_BYTES),
        "cache.max_object_bytes",
    )?;
    if max_object_bytes > max_total_bytes {
        return Err(LoadError::invalid(
            "cache.max_object_bytes",
            "must not exceed cache.max_total_bytes",
        ));
    }

    let eviction = match cache.eviction {
        Some(value) => EvictionPolicy::from_str(&value)
            .map_err(|reason| LoadError::invalid("cache.eviction", reason))?,
        None => EvictionPolicy::default(),
    };

    let refresh_backoff_base = seconds(
        cache
            .refresh_backoff_base_seconds
            .unwrap_or(DEFAULT_REFRESH_BACKOFF_BASE_SECS),
        "cache.refresh_backoff_base_seconds",
    )?;
    let refresh_backoff_max = seconds(
        cache
            .refresh_backoff_max_seconds
            .unwrap_or(DEFAULT_REFRESH_BACKOFF_MAX_SECS),
        "cache.refresh_backoff_max_seconds",
    )?;
    if refresh_backoff_base > refresh_backoff_max {
        return Err(LoadError::invalid(
            "cache.refresh_backoff_base_seconds",
            "must not exceed cache.refresh_backoff_max_seconds",
        ));
    }

    Ok(CacheSettings {
        max_entries,
        max_total_bytes,
        max_object_bytes,
        eviction,
        default_ttl: Duration::from_secs(
            cache.default_ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS),
        ),
        default_grace: Duration::from_secs(
            cache
                .default_grace_seconds
                .unwrap_or(DEFAULT_CACHE_GRACE_SECS),
        ),
        sweep_interval: seconds(
            cache
                .sweep_interval_seconds
                .unwrap_or(DEFAULT_CACHE_SWEEP_INTERVAL_SECS),
            "cache.sweep_interval_seconds",
        )?,
        refresh_concurrency: non_zero_usize(
            cache
                .refresh_concurrency
                .unwrap_or(DEFAULT_REFRESH_CONCURRENCY),
            "cache.refresh_concurrency",
        )?,
        refresh_queue_capacity: non_zero_usize(
            cache
                .refresh_queue_capacity
                .unwrap_or(DEFAULT_REFRESH_QUEUE_CAPACITY),
            "cache.refresh_queue_capacity",
        )?,
        refresh_backoff_base,
        refresh_backoff_max,
        refresh_max_attempts: cache
            .refresh_max_attempts
            .unwrap_or(DEFAULT_REFRESH_MAX_ATTEMPTS),
    })
}

fn build_policy_settings(policy: RawPolicySettings) -> Result<PolicySettings, LoadError> {
    let bypass_prefixes = policy
        .bypass_prefixes
        .unwrap_or_else(|| to_strings(DEFAULT_BYPASS_PREFIXES));
    if let Some(bad) = bypass_prefixes.iter().find(|prefix| !prefix.starts_with('/')) {
        return Err(LoadError::invalid(
            "policy.bypass_prefixes",
            format!("prefix `{bad}` must start with `/`"),
        ));
    }

    let static_extensions = policy
        .static_extensions
        .unwrap_or_else(|| to_strings(DEFAULT_STATIC_EXTENSIONS))
        .into_iter()
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect();

    let presigned_markers: Vec<String> = policy
        .presigned_markers
        .unwrap_or_else(|| to_strings(DEFAULT_PRESIGNED_MARKERS));
    if presigned_markers.iter().any(|marker| marker.is_empty()) {
        return Err(LoadError::invalid(
            "policy.presigned_markers",
            "markers must not be empty",
        ));
    }

    let status_header = parse_header_name(
        policy
            .status_header
            .as_deref()
            .unwrap_or(DEFAULT_STATUS_HEADER),
        "policy.status_header",
    )?;

    let diagnostic_headers = policy
        .diagnostic_headers
        .unwrap_or_else(|| to_strings(DEFAULT_DIAGNOSTIC_HEADERS))
        .iter()
        .map(|name| parse_header_name(name, "policy.diagnostic_headers"))
        .collect::<Result<Vec<_>, _>>()?;
    if diagnostic_headers.contains(&status_header) {
        return Err(LoadError::invalid(
            "policy.diagnostic_headers",
            "must not include the status header",
        ));
    }

    Ok(PolicySettings {
        bypass_prefixes,
        static_extensions,
        presigned_markers,
        static_ttl: Duration::from_secs(
            policy
                .static_ttl_seconds
                .unwrap_or(DEFAULT_STATIC_TTL_SECS),
        ),
        static_grace: Duration::from_secs(
            policy
                .static_grace_seconds
                .unwrap_or(DEFAULT_STATIC_GRACE_SECS),
        ),
        pass_authorized: policy.pass_authorized.unwrap_or(true),
        status_header,
        diagnostic_headers,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    admin_host: Option<String>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    max_request_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    scheme: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    connect_timeout_seconds: Option<u64>,
    first_byte_timeout_seconds: Option<u64>,
    between_bytes_timeout_seconds: Option<u64>,
    pool_max_idle_per_host: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    max_entries: Option<u64>,
    max_total_bytes: Option<u64>,
    max_object_bytes: Option<u64>,
    eviction: Option<String>,
    default_ttl_seconds: Option<u64>,
    default_grace_seconds: Option<u64>,
    sweep_interval_seconds: Option<u64>,
    refresh_concurrency: Option<u64>,
    refresh_queue_capacity: Option<u64>,
    refresh_backoff_base_seconds: Option<u64>,
    refresh_backoff_max_seconds: Option<u64>,
    refresh_max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPolicySettings {
    bypass_prefixes: Option<Vec<String>>,
    static_extensions: Option<Vec<String>>,
    presigned_markers: Option<Vec<String>>,
    static_ttl_seconds: Option<u64>,
    static_grace_seconds: Option<u64>,
    pass_authorized: Option<bool>,
    status_header: Option<String>,
    diagnostic_headers: Option<Vec<String>>,
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_header_name(value: &str, key: &'static str) -> Result<HeaderName, LoadError> {
    HeaderName::from_bytes(value.trim().as_bytes())
        .map_err(|err| LoadError::invalid(key, format!("invalid header name `{value}`: {err}")))
}

fn non_zero_port(port: u16, key: &'static str) -> Result<u16, LoadError> {
    if port == 0 {
        return Err(LoadError::invalid(key, "port must be greater than zero"));
    }
    Ok(port)
}

fn seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
