use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mcp_redis_ops::config::{
    redact_url, ConnectionConfig, Endpoint, RedisMode, ScanSettings, Settings,
};
use mcp_redis_ops::error::RedisOpsError;
use mcp_redis_ops::safety::SafetyPolicy;
use mcp_redis_ops::server;
use rmcp::{transport::stdio, ServiceExt};
use tracing_subscriber::EnvFilter;

/// MCP server for Redis operations: large keys, guarded commands, pipelines,
/// database and cluster introspection
#[derive(Parser, Debug)]
#[command(name = "mcp-redis-ops", version, about)]
struct Cli {
    /// Redis URL (single mode). Takes precedence over host, port, db and password.
    /// Example: redis://:secret@127.0.0.1:6379/0
    #[arg(long, env = "REDIS_URL", hide_env_values = true)]
    url: Option<String>,

    #[arg(long, env = "REDIS_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    port: u16,

    /// Initial database index (single mode)
    #[arg(long, env = "REDIS_DB", default_value_t = 0)]
    db: i64,

    #[arg(long, env = "REDIS_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "REDIS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Deployment topology
    #[arg(long, env = "REDIS_MODE", value_enum, default_value_t = RedisMode::Single)]
    mode: RedisMode,

    /// Comma separated cluster seed nodes (host:port)
    #[arg(long, env = "REDIS_CLUSTER_NODES")]
    cluster_nodes: Option<String>,

    /// Comma separated sentinels (host:port)
    #[arg(long, env = "REDIS_SENTINEL_HOSTS")]
    sentinel_hosts: Option<String>,

    #[arg(long, env = "REDIS_SENTINEL_SERVICE", default_value = "mymaster")]
    sentinel_service: String,

    /// Number of databases the server is configured with
    #[arg(long, env = "REDIS_DATABASES", default_value_t = 16)]
    databases: i64,

    #[arg(long, env = "REDIS_MAX_CONNECTIONS", default_value_t = 20)]
    max_connections: usize,

    /// Seconds to wait for a free pooled connection
    #[arg(long, env = "REDIS_POOL_TIMEOUT", default_value_t = 5)]
    pool_timeout: u64,

    /// Seconds allowed for establishing a connection
    #[arg(long, env = "REDIS_SOCKET_CONNECT_TIMEOUT", default_value_t = 5)]
    connect_timeout: u64,

    /// Seconds allowed for any single command or pipeline
    #[arg(long, env = "COMMAND_TIMEOUT", default_value_t = 30)]
    command_timeout: u64,

    /// Reconnect attempts before a connection error is reported
    #[arg(long, env = "REDIS_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Keys at or above this many bytes are reported as large
    #[arg(long, env = "LARGE_KEY_THRESHOLD", default_value_t = 1024 * 1024)]
    large_key_threshold: u64,

    /// COUNT hint for each SCAN call
    #[arg(long, env = "SCAN_COUNT", default_value_t = 1000)]
    scan_count: usize,

    /// Upper bound on keys examined by one analysis
    #[arg(long, env = "MAX_SCAN_KEYS", default_value_t = 100_000)]
    max_scan_keys: usize,

    /// Upper bound on the length of the large-key list
    #[arg(long, env = "MAX_LARGE_KEYS", default_value_t = 100)]
    max_large_keys: usize,

    /// Allow FLUSHALL, CONFIG, EVAL and the other blocked commands
    #[arg(long, env = "ENABLE_DANGEROUS_COMMANDS")]
    enable_dangerous_commands: bool,

    /// Extra command names to block, comma separated
    #[arg(long, env = "EXTRA_DANGEROUS_COMMANDS", value_delimiter = ',')]
    extra_dangerous_commands: Vec<String>,
}

impl Cli {
    fn into_settings(self) -> Result<Settings, RedisOpsError> {
        let mut connection = match (self.mode, &self.url) {
            (RedisMode::Single, Some(url)) => ConnectionConfig::from_url(url)?,
            _ => {
                let mut config = ConnectionConfig::single(Endpoint::new(&self.host, self.port));
                config.database = self.db;
                config
            }
        };
        connection.mode = self.mode;
        match self.mode {
            RedisMode::Single => {}
            RedisMode::Cluster => {
                connection.endpoints =
                    Endpoint::parse_list(self.cluster_nodes.as_deref().unwrap_or_default())?;
                connection.database = 0;
            }
            RedisMode::Sentinel => {
                connection.endpoints =
                    Endpoint::parse_list(self.sentinel_hosts.as_deref().unwrap_or_default())?;
                connection.database = 0;
            }
        }
        if connection.username.is_none() {
            connection.username = self.username;
        }
        if connection.password.is_none() {
            connection.password = self.password;
        }
        connection.sentinel_service = self.sentinel_service;
        connection.database_count = self.databases;
        connection.max_connections = self.max_connections;
        connection.pool_timeout = Duration::from_secs(self.pool_timeout);
        connection.connect_timeout = Duration::from_secs(self.connect_timeout);
        connection.command_timeout = Duration::from_secs(self.command_timeout);
        connection.max_retries = self.max_retries;
        connection.validate()?;

        Ok(Settings {
            connection,
            safety: SafetyPolicy::new(
                self.enable_dangerous_commands,
                self.extra_dangerous_commands,
            ),
            scan: ScanSettings {
                large_key_threshold: self.large_key_threshold,
                scan_count: self.scan_count.max(1),
                max_scan_keys: self.max_scan_keys.max(1),
                max_large_keys: self.max_large_keys.max(1),
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Some(url) = &cli.url {
        tracing::info!(url = %redact_url(url), "Using REDIS_URL");
    }
    let settings = cli.into_settings().context("invalid configuration")?;

    if settings.safety.allow_dangerous() {
        tracing::warn!("Dangerous commands are enabled for this server");
    }
    tracing::info!(
        mode = %settings.connection.mode,
        destination = %settings.connection.describe(),
        large_key_threshold = settings.scan.large_key_threshold,
        max_connections = settings.connection.max_connections,
        "Starting mcp-redis-ops server"
    );

    let service = server::McpRedisServer::new(settings);
    service
        .manager()
        .connect()
        .await
        .context("cannot connect to Redis")?;

    let running = service.serve(stdio()).await?;
    running.waiting().await?;

    Ok(())
}
