use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the cachet binary.
#[derive(Debug, Parser)]
#[command(name = "cachet", version, about = "Caching reverse proxy")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CACHET_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the proxy and admin listeners.
    Serve(Box<ServeArgs>),
    /// Load and validate configuration, print the resolved settings, and exit.
    #[command(name = "check-config")]
    CheckConfig(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the proxy listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the proxy listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the inbound request body limit in bytes.
    #[arg(long = "server-max-request-body-bytes", value_name = "BYTES")]
    pub server_max_request_body_bytes: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the origin scheme (http|https).
    #[arg(long = "origin-scheme", value_name = "SCHEME")]
    pub origin_scheme: Option<String>,

    /// Override the origin host.
    #[arg(long = "origin-host", value_name = "HOST")]
    pub origin_host: Option<String>,

    /// Override the origin port.
    #[arg(long = "origin-port", value_name = "PORT")]
    pub origin_port: Option<u16>,

    /// Override the origin connect timeout.
    #[arg(long = "origin-connect-timeout-seconds", value_name = "SECONDS")]
    pub origin_connect_timeout_seconds: Option<u64>,

    /// Override the origin first-byte timeout.
    #[arg(long = "origin-first-byte-timeout-seconds", value_name = "SECONDS")]
    pub origin_first_byte_timeout_seconds: Option<u64>,

    /// Override the origin between-bytes timeout.
    #[arg(long = "origin-between-bytes-timeout-seconds", value_name = "SECONDS")]
    pub origin_between_bytes_timeout_seconds: Option<u64>,

    /// Override the maximum number of stored objects.
    #[arg(long = "cache-max-entries", value_name = "COUNT")]
    pub cache_max_entries: Option<usize>,

    /// Override the total size budget of stored bodies in bytes.
    #[arg(long = "cache-max-total-bytes", value_name = "BYTES")]
    pub cache_max_total_bytes: Option<u64>,

    /// Override the eviction policy (lru|fifo).
    #[arg(long = "cache-eviction", value_name = "POLICY")]
    pub cache_eviction: Option<String>,

    /// Override the default TTL for responses without freshness headers.
    #[arg(long = "cache-default-ttl-seconds", value_name = "SECONDS")]
    pub cache_default_ttl_seconds: Option<u64>,

    /// Override the default grace for responses without stale-while-revalidate.
    #[arg(long = "cache-default-grace-seconds", value_name = "SECONDS")]
    pub cache_default_grace_seconds: Option<u64>,
}
