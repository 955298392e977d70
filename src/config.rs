//! Startup configuration.
//!
//! The CLI in `main.rs` is turned into one immutable [`Settings`] value which
//! is shared by reference with every component.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::RedisOpsError;
use crate::safety::SafetyPolicy;

pub const DEFAULT_PORT: u16 = 6379;

/// Deployment topology the server talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RedisMode {
    Single,
    Cluster,
    Sentinel,
}

impl fmt::Display for RedisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedisMode::Single => write!(f, "single"),
            RedisMode::Cluster => write!(f, "cluster"),
            RedisMode::Sentinel => write!(f, "sentinel"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, `[v6]:port` or a bare host (default port).
    pub fn parse(s: &str) -> Result<Self, RedisOpsError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RedisOpsError::Validation("empty endpoint".to_string()));
        }
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| RedisOpsError::Validation(format!("malformed endpoint '{s}'")))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p, s)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => {
                    return Err(RedisOpsError::Validation(format!(
                        "malformed endpoint '{s}'"
                    )))
                }
            };
            return Ok(Self::new(host, port));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => Ok(Self::new(host, parse_port(port, s)?)),
            Some(_) => Ok(Self::new(s, DEFAULT_PORT)),
            None => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }

    /// Parse a comma separated endpoint list, ignoring blank entries.
    pub fn parse_list(s: &str) -> Result<Vec<Self>, RedisOpsError> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Build a `redis://` URL for this endpoint with credentials and db.
    pub fn to_url(
        &self,
        username: Option<&str>,
        password: Option<&str>,
        db: i64,
    ) -> Result<String, RedisOpsError> {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let mut url = url::Url::parse(&format!("redis://{}:{}/{}", host, self.port, db))
            .map_err(|e| RedisOpsError::Validation(format!("invalid endpoint {self}: {e}")))?;
        if let Some(user) = username {
            let _ = url.set_username(user);
        }
        if let Some(pass) = password {
            let _ = url.set_password(Some(pass));
        }
        Ok(url.to_string())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(port: &str, whole: &str) -> Result<u16, RedisOpsError> {
    port.trim()
        .parse()
        .map_err(|_| RedisOpsError::Validation(format!("invalid port in endpoint '{whole}'")))
}

/// Everything needed to reach the deployment. Immutable after construction.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub mode: RedisMode,
    /// Single: the server. Cluster: seed nodes. Sentinel: the sentinels.
    pub endpoints: Vec<Endpoint>,
    pub sentinel_service: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Initial database index (single mode only).
    pub database: i64,
    pub database_count: i64,
    pub max_connections: usize,
    pub pool_timeout: Duration,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub max_retries: u32,
}

impl ConnectionConfig {
    /// Defaults for a single server at `endpoint`.
    pub fn single(endpoint: Endpoint) -> Self {
        Self {
            mode: RedisMode::Single,
            endpoints: vec![endpoint],
            sentinel_service: "mymaster".to_string(),
            username: None,
            password: None,
            database: 0,
            database_count: 16,
            max_connections: 20,
            pool_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }

    /// Single-mode config from a `redis://[user:pass@]host[:port][/db]` URL.
    pub fn from_url(url_str: &str) -> Result<Self, RedisOpsError> {
        let parsed = url::Url::parse(url_str)
            .map_err(|e| RedisOpsError::Validation(format!("invalid Redis URL: {e}")))?;
        if parsed.scheme() != "redis" && parsed.scheme() != "rediss" {
            return Err(RedisOpsError::Validation(format!(
                "unsupported URL scheme '{}'",
                parsed.scheme()
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| RedisOpsError::Validation("Redis URL has no host".to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let mut config = Self::single(Endpoint::new(host, parsed.port().unwrap_or(DEFAULT_PORT)));

        let db = parsed.path().trim_start_matches('/');
        if !db.is_empty() {
            config.database = db
                .parse()
                .map_err(|_| RedisOpsError::Validation(format!("invalid database '{db}'")))?;
        }
        if !parsed.username().is_empty() {
            config.username = Some(parsed.username().to_string());
        }
        config.password = parsed.password().map(str::to_string);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RedisOpsError> {
        if self.endpoints.is_empty() {
            let what = match self.mode {
                RedisMode::Single => "a server endpoint",
                RedisMode::Cluster => "at least one cluster node",
                RedisMode::Sentinel => "at least one sentinel host",
            };
            return Err(RedisOpsError::Validation(format!(
                "{} mode requires {}",
                self.mode, what
            )));
        }
        if self.database_count < 1 {
            return Err(RedisOpsError::Validation(
                "database count must be at least 1".to_string(),
            ));
        }
        if self.mode == RedisMode::Single
            && (self.database < 0 || self.database >= self.database_count)
        {
            return Err(RedisOpsError::Validation(format!(
                "database {} is outside 0..{}",
                self.database, self.database_count
            )));
        }
        if self.max_connections == 0 {
            return Err(RedisOpsError::Validation(
                "max connections must be at least 1".to_string(),
            ));
        }
        if self.mode == RedisMode::Sentinel && self.sentinel_service.trim().is_empty() {
            return Err(RedisOpsError::Validation(
                "sentinel mode requires a service name".to_string(),
            ));
        }
        Ok(())
    }

    /// Human readable target with the password masked.
    pub fn describe(&self) -> String {
        let nodes: Vec<String> = self.endpoints.iter().map(|e| e.to_string()).collect();
        match self.mode {
            RedisMode::Single => format!("{}/{}", nodes.join(","), self.database),
            RedisMode::Cluster => format!("cluster[{}]", nodes.join(",")),
            RedisMode::Sentinel => {
                format!("sentinel[{}] service={}", nodes.join(","), self.sentinel_service)
            }
        }
    }
}

/// Knobs for the large-key scanner.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub large_key_threshold: u64,
    /// COUNT hint per SCAN call.
    pub scan_count: usize,
    /// Hard cap on keys examined per analysis when no limit is given.
    pub max_scan_keys: usize,
    /// Cap on the large-key list length.
    pub max_large_keys: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            large_key_threshold: 1024 * 1024,
            scan_count: 1000,
            max_scan_keys: 100_000,
            max_large_keys: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub connection: ConnectionConfig,
    pub safety: SafetyPolicy,
    pub scan: ScanSettings,
}

/// A config pointing at a port nothing listens on, with no retries and
/// short deadlines, for tests that must never reach a server.
#[cfg(test)]
pub(crate) fn offline_config(mode: RedisMode) -> ConnectionConfig {
    let mut config = ConnectionConfig::single(Endpoint::new("127.0.0.1", 1));
    config.mode = mode;
    config.max_retries = 0;
    config.connect_timeout = Duration::from_millis(300);
    config.command_timeout = Duration::from_millis(300);
    config.pool_timeout = Duration::from_millis(300);
    config
}

/// Mask the password in a URL for display.
pub fn redact_url(url_str: &str) -> String {
    match url::Url::parse(url_str) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => url_str.to_string(),
    }
}
