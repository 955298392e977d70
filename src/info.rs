//! Server, database and cluster introspection reports.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::cluster::{unreachable_masters, ClusterTopologySnapshot, NodeFailure};
use crate::config::RedisMode;
use crate::connection::ConnectionManager;
use crate::error::RedisOpsError;
use crate::format::{format_bytes, format_duration};

/// `INFO` output: section name (lowercase) to its fields.
pub type InfoSections = BTreeMap<String, BTreeMap<String, String>>;

/// Parse `INFO` text. Fields before any `# Section` header land in
/// `"default"`.
pub fn parse_info(raw: &str) -> InfoSections {
    let mut sections = InfoSections::new();
    let mut current = "default".to_string();
    for line in raw.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('#') {
            current = header.trim().to_ascii_lowercase();
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            sections
                .entry(current.clone())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
    }
    sections
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyspaceStats {
    pub keys: u64,
    pub expires: u64,
    pub avg_ttl: u64,
}

/// Parse one keyspace value, e.g. `keys=12,expires=3,avg_ttl=1200`.
pub fn parse_keyspace_line(value: &str) -> Option<KeyspaceStats> {
    let mut stats = KeyspaceStats::default();
    let mut saw_keys = false;
    for part in value.split(',') {
        let (name, number) = part.split_once('=')?;
        let number: u64 = number.trim().parse().ok()?;
        match name.trim() {
            "keys" => {
                stats.keys = number;
                saw_keys = true;
            }
            "expires" => stats.expires = number,
            "avg_ttl" => stats.avg_ttl = number,
            _ => {}
        }
    }
    saw_keys.then_some(stats)
}

/// `db<N>` entries of the keyspace section.
pub fn keyspace_by_db(sections: &InfoSections) -> BTreeMap<i64, KeyspaceStats> {
    sections
        .get("keyspace")
        .into_iter()
        .flatten()
        .filter_map(|(name, value)| {
            let index: i64 = name.strip_prefix("db")?.parse().ok()?;
            Some((index, parse_keyspace_line(value)?))
        })
        .collect()
}

fn field<'a>(sections: &'a InfoSections, section: &str, key: &str) -> Option<&'a str> {
    sections.get(section)?.get(key).map(String::as_str)
}

fn number(sections: &InfoSections, section: &str, key: &str) -> Option<u64> {
    field(sections, section, key)?.parse().ok()
}

/// Selected fields of one section; integers and floats become JSON numbers.
fn pick(sections: &InfoSections, section: &str, keys: &[&str]) -> Map<String, Value> {
    let mut out = Map::new();
    for key in keys {
        if let Some(raw) = field(sections, section, key) {
            let value = if let Ok(i) = raw.parse::<i64>() {
                json!(i)
            } else if let Ok(f) = raw.parse::<f64>() {
                json!(f)
            } else {
                json!(raw)
            };
            out.insert(key.to_string(), value);
        }
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSummary {
    pub index: i64,
    pub keys: u64,
    pub expires: u64,
    pub avg_ttl: u64,
    pub is_current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfoReport {
    pub mode: RedisMode,
    pub current_database: i64,
    pub database_count: i64,
    pub databases: Vec<DatabaseSummary>,
    pub total_keys: u64,
    pub total_expires: u64,
    pub non_empty_databases: usize,
    /// Masters whose keys are missing from the totals (cluster mode).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_nodes: Vec<NodeFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterInfoReport {
    #[serde(flatten)]
    pub topology: ClusterTopologySnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_state: Option<String>,
    pub cluster_info: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_info_error: Option<String>,
}

const CLIENT_FIELDS: &[&str] = &["connected_clients", "blocked_clients", "maxclients"];
const REPLICATION_FIELDS: &[&str] = &[
    "role",
    "connected_slaves",
    "master_host",
    "master_port",
    "master_link_status",
];

pub struct InfoAggregator {
    manager: Arc<ConnectionManager>,
}

impl InfoAggregator {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Server, memory, client, replication, stats and keyspace sections in
    /// one report.
    pub async fn get_redis_info(&self) -> Result<Value, RedisOpsError> {
        let (raw, source) = self.read_info(None).await?;
        let sections = parse_info(&raw);

        let mut server = pick(
            &sections,
            "server",
            &[
                "redis_version",
                "redis_mode",
                "os",
                "arch_bits",
                "process_id",
                "tcp_port",
                "uptime_in_seconds",
            ],
        );
        if let Some(uptime) = number(&sections, "server", "uptime_in_seconds") {
            server.insert("uptime_formatted".into(), json!(format_duration(uptime as f64)));
        }

        let mut memory = pick(
            &sections,
            "memory",
            &[
                "used_memory",
                "used_memory_peak",
                "used_memory_rss",
                "maxmemory",
                "maxmemory_policy",
                "mem_fragmentation_ratio",
            ],
        );
        for key in ["used_memory", "used_memory_peak", "maxmemory"] {
            if let Some(bytes) = number(&sections, "memory", key) {
                memory.insert(format!("{key}_formatted"), json!(format_bytes(bytes)));
            }
        }

        let mut stats = pick(
            &sections,
            "stats",
            &[
                "total_connections_received",
                "total_commands_processed",
                "instantaneous_ops_per_sec",
                "keyspace_hits",
                "keyspace_misses",
                "expired_keys",
                "evicted_keys",
            ],
        );
        let hits = number(&sections, "stats", "keyspace_hits").unwrap_or(0);
        let misses = number(&sections, "stats", "keyspace_misses").unwrap_or(0);
        if hits + misses > 0 {
            let rate = hits as f64 / (hits + misses) as f64 * 100.0;
            stats.insert("hit_rate_percent".into(), json!((rate * 100.0).round() / 100.0));
        }

        let keyspace: BTreeMap<String, KeyspaceStats> = keyspace_by_db(&sections)
            .into_iter()
            .map(|(db, s)| (format!("db{db}"), s))
            .collect();

        let current_database = self.manager.current_database().await;
        Ok(json!({
            "mode": self.manager.mode(),
            "current_database": current_database,
            "source_node": source,
            "server": server,
            "memory": memory,
            "clients": pick(&sections, "clients", CLIENT_FIELDS),
            "replication": pick(&sections, "replication", REPLICATION_FIELDS),
            "stats": stats,
            "keyspace": keyspace,
        }))
    }

    /// Per-database key counts from a single `INFO keyspace` call.
    pub async fn get_database_info(&self) -> Result<DatabaseInfoReport, RedisOpsError> {
        let mode = self.manager.mode();
        let current = self.manager.current_database().await;

        let mut failed_nodes = Vec::new();
        let (database_count, per_db) = match mode {
            RedisMode::Single => {
                let (raw, _) = self.read_info(Some("keyspace")).await?;
                (self.manager.database_count(), keyspace_by_db(&parse_info(&raw)))
            }
            RedisMode::Sentinel => {
                let (raw, _) = self.read_info(Some("keyspace")).await?;
                let db0 = keyspace_by_db(&parse_info(&raw))
                    .remove(&0)
                    .unwrap_or_default();
                (1, BTreeMap::from([(0, db0)]))
            }
            RedisMode::Cluster => {
                let masters = self.manager.master_addresses().await?;
                let (total, failures) = self.keyspace_of_masters(masters).await;
                if total.is_none() && !failures.is_empty() {
                    return Err(unreachable_masters(&failures));
                }
                failed_nodes = failures;
                (1, BTreeMap::from([(0, total.unwrap_or_default())]))
            }
        };

        let databases: Vec<DatabaseSummary> = (0..database_count)
            .map(|index| {
                let stats = per_db.get(&index).copied().unwrap_or_default();
                DatabaseSummary {
                    index,
                    keys: stats.keys,
                    expires: stats.expires,
                    avg_ttl: stats.avg_ttl,
                    is_current: index == current,
                }
            })
            .collect();

        Ok(DatabaseInfoReport {
            mode,
            current_database: current,
            database_count,
            total_keys: databases.iter().map(|d| d.keys).sum(),
            total_expires: databases.iter().map(|d| d.expires).sum(),
            non_empty_databases: databases.iter().filter(|d| d.keys > 0).count(),
            databases,
            failed_nodes,
        })
    }

    /// Each master holds its own share of the one logical database. Returns
    /// the summed db0 stats of the masters that answered (`None` if none
    /// did) and the ones that did not.
    async fn keyspace_of_masters(
        &self,
        masters: Vec<String>,
    ) -> (Option<KeyspaceStats>, Vec<NodeFailure>) {
        let mut total: Option<KeyspaceStats> = None;
        let mut failures = Vec::new();
        for address in masters {
            let mut cmd = redis::cmd("INFO");
            cmd.arg("keyspace");
            let raw = match self.manager.node_handle(&address).await {
                Ok(mut lease) => lease.query::<String>(&cmd).await,
                Err(e) => Err(e),
            };
            match raw {
                Ok(raw) => {
                    let sum = total.get_or_insert_with(KeyspaceStats::default);
                    if let Some(stats) = keyspace_by_db(&parse_info(&raw)).remove(&0) {
                        sum.keys += stats.keys;
                        sum.expires += stats.expires;
                        sum.avg_ttl = sum.avg_ttl.max(stats.avg_ttl);
                    }
                }
                Err(e) => {
                    tracing::warn!(node = %address, error = %e, "Master keyspace unavailable");
                    failures.push(NodeFailure::new(address, &e));
                }
            }
        }
        (total, failures)
    }

    /// Topology, per-node reachability and a health verdict. Unreachable
    /// nodes are reported, never raised.
    pub async fn get_cluster_info(&self) -> Result<ClusterInfoReport, RedisOpsError> {
        let nodes = self.manager.cluster_nodes().await?;

        let mut probes = tokio::task::JoinSet::new();
        for node in nodes.iter().filter(|n| n.has_address() && !n.is_failed()) {
            let manager = Arc::clone(&self.manager);
            let address = node.address.clone();
            probes.spawn(async move {
                let reachable = manager.ping_node(&address).await;
                (address, reachable)
            });
        }
        let mut probe_failures = HashSet::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((address, false)) => {
                    tracing::warn!(node = %address, "Cluster node unreachable");
                    probe_failures.insert(address);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Node probe task failed"),
            }
        }

        let mut cmd = redis::cmd("CLUSTER");
        cmd.arg("INFO");
        let (cluster_info, cluster_info_error) =
            match self.manager.query_read::<String>(&cmd).await {
                Ok(raw) => (
                    parse_info(&raw).remove("default").unwrap_or_default(),
                    None,
                ),
                Err(e) => (BTreeMap::new(), Some(e.to_string())),
            };

        Ok(ClusterInfoReport {
            topology: ClusterTopologySnapshot::assess(&nodes, &probe_failures),
            cluster_state: cluster_info.get("cluster_state").cloned(),
            cluster_info,
            cluster_info_error,
        })
    }

    /// `INFO [section]` from the active handle, or from the first master that
    /// answers in cluster mode. Returns the text and the node it came from.
    async fn read_info(
        &self,
        section: Option<&str>,
    ) -> Result<(String, Option<String>), RedisOpsError> {
        let mut cmd = redis::cmd("INFO");
        if let Some(section) = section {
            cmd.arg(section);
        }
        if self.manager.mode() != RedisMode::Cluster {
            return Ok((self.manager.query_read(&cmd).await?, None));
        }

        let mut last_error = None;
        for address in self.manager.master_addresses().await? {
            let attempt = match self.manager.node_handle(&address).await {
                Ok(mut lease) => lease.query::<String>(&cmd).await,
                Err(e) => Err(e),
            };
            match attempt {
                Ok(raw) => return Ok((raw, Some(address))),
                Err(e) => {
                    tracing::warn!(node = %address, error = %e, "INFO failed on master");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            RedisOpsError::Connection("no reachable master in the cluster".to_string())
        }))
    }
}
