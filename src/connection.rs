//! Connection management for single, cluster and sentinel deployments.
//!
//! [`ConnectionManager`] owns exactly one active [`RedisHandle`] for the
//! configured topology. Handles are cheap clones of a multiplexed
//! connection; the pool bound is enforced with a semaphore, and every caller
//! holds a [`Lease`] (handle + permit) for the duration of its work.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::{ConnectionManager as ManagedConnection, MultiplexedConnection};
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, FromRedisValue, Pipeline, Value};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::cluster::{parse_cluster_nodes, ClusterNode};
use crate::config::{ConnectionConfig, Endpoint, RedisMode};
use crate::error::RedisOpsError;

const BASE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Delay before retry number `attempt` (0-based): 100ms doubling, capped.
pub fn backoff(attempt: u32) -> Duration {
    BASE_BACKOFF
        .checked_mul(2u32.saturating_pow(attempt))
        .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}

/// Run a Redis future under a deadline; expiry is a connection error.
pub async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, RedisOpsError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(RedisOpsError::from),
        Err(_) => Err(RedisOpsError::Connection(format!(
            "{what} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// An established client session for the active mode.
#[derive(Clone)]
pub enum RedisHandle {
    /// Auto-reconnecting connection to a single server or a sentinel-elected master.
    Managed(ManagedConnection),
    /// Slot-routing cluster connection.
    Cluster(ClusterConnection),
    /// Direct connection to one node (cluster masters, other databases).
    Direct(MultiplexedConnection),
}

impl RedisHandle {
    pub async fn query<T: FromRedisValue>(&mut self, cmd: &Cmd) -> redis::RedisResult<T> {
        match self {
            RedisHandle::Managed(conn) => cmd.query_async(conn).await,
            RedisHandle::Cluster(conn) => cmd.query_async(conn).await,
            RedisHandle::Direct(conn) => cmd.query_async(conn).await,
        }
    }

    pub async fn query_pipeline(&mut self, pipe: &Pipeline) -> redis::RedisResult<Vec<Value>> {
        match self {
            RedisHandle::Managed(conn) => pipe.query_async(conn).await,
            RedisHandle::Cluster(conn) => pipe.query_async(conn).await,
            RedisHandle::Direct(conn) => pipe.query_async(conn).await,
        }
    }
}

/// A handle checked out of the pool. The permit is released on drop.
pub struct Lease {
    handle: RedisHandle,
    timeout: Duration,
    generation: u64,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// Run one command under the configured command timeout.
    pub async fn query<T: FromRedisValue>(&mut self, cmd: &Cmd) -> Result<T, RedisOpsError> {
        let limit = self.timeout;
        bounded(limit, "command", self.handle.query(cmd)).await
    }

    /// Send a pipeline as one round trip under the command timeout.
    pub async fn pipeline(&mut self, pipe: &Pipeline) -> Result<Vec<Value>, RedisOpsError> {
        let limit = self.timeout;
        bounded(limit, "pipeline", self.handle.query_pipeline(pipe)).await
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for Lease {
    type Target = RedisHandle;

    fn deref(&self) -> &RedisHandle {
        &self.handle
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut RedisHandle {
        &mut self.handle
    }
}

struct State {
    handle: Option<RedisHandle>,
    stale: bool,
    /// Bumped whenever the handle is replaced.
    generation: u64,
    current_db: i64,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    state: Mutex<State>,
    pool: Arc<Semaphore>,
}

impl ConnectionManager {
    /// Create a manager. No connection is made until `connect` or the first
    /// `get_handle`.
    pub fn new(config: ConnectionConfig) -> Self {
        let current_db = match config.mode {
            RedisMode::Single => config.database,
            RedisMode::Cluster | RedisMode::Sentinel => 0,
        };
        Self {
            pool: Arc::new(Semaphore::new(config.max_connections.max(1))),
            state: Mutex::new(State {
                handle: None,
                stale: false,
                generation: 0,
                current_db,
            }),
            config,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn mode(&self) -> RedisMode {
        self.config.mode
    }

    pub fn database_count(&self) -> i64 {
        self.config.database_count
    }

    pub async fn current_database(&self) -> i64 {
        self.state.lock().await.current_db
    }

    /// Open (or reopen) the handle for the configured mode.
    pub async fn connect(&self) -> Result<(), RedisOpsError> {
        let mut state = self.state.lock().await;
        let handle = self.open_with_retry(state.current_db).await?;
        Self::install(&mut state, handle);
        tracing::info!(
            mode = %self.config.mode,
            destination = %self.config.describe(),
            "Connected to Redis"
        );
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        if state.handle.take().is_some() {
            state.generation += 1;
            tracing::info!("Disconnected from Redis");
        }
    }

    /// PING over the current handle, without reconnecting.
    pub async fn is_connected(&self) -> bool {
        let handle = {
            let state = self.state.lock().await;
            match (&state.handle, state.stale) {
                (Some(handle), false) => handle.clone(),
                _ => return false,
            }
        };
        let mut handle = handle;
        bounded(
            self.config.command_timeout,
            "PING",
            handle.query::<String>(&redis::cmd("PING")),
        )
        .await
        .is_ok()
    }

    /// Check out the current handle, reconnecting first if it is missing or
    /// stale. Fails with a connection error once the retry budget is spent.
    pub async fn get_handle(&self) -> Result<Lease, RedisOpsError> {
        let permit = self.acquire_permit().await?;
        let mut state = self.state.lock().await;
        let live = match (&state.handle, state.stale) {
            (Some(handle), false) => Some(handle.clone()),
            _ => None,
        };
        let handle = match live {
            Some(handle) => handle,
            None => {
                if state.stale {
                    tracing::warn!(mode = %self.config.mode, "Handle is stale, reconnecting");
                }
                let handle = self.open_with_retry(state.current_db).await?;
                Self::install(&mut state, handle.clone());
                handle
            }
        };
        Ok(Lease {
            handle,
            timeout: self.config.command_timeout,
            generation: state.generation,
            _permit: permit,
        })
    }

    /// Mark the handle issued under `generation` as unusable.
    pub async fn mark_stale(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation == generation && !state.stale {
            state.stale = true;
            tracing::warn!(mode = %self.config.mode, "Connection marked stale");
        }
    }

    /// Record the outcome of a call made with a lease of `generation`.
    pub async fn observe(&self, generation: u64, err: &RedisOpsError) {
        if err.is_connection() {
            self.mark_stale(generation).await;
        }
    }

    /// Switch the current database (single mode only). The handle is
    /// replaced by one bound to `db`; returns `(previous, current)`.
    pub async fn switch_database(&self, db: i64) -> Result<(i64, i64), RedisOpsError> {
        if self.config.mode != RedisMode::Single {
            return Err(RedisOpsError::UnsupportedOperation(format!(
                "database switching is only supported in single mode, not {} mode",
                self.config.mode
            )));
        }
        self.check_database(db)?;

        let mut state = self.state.lock().await;
        let previous = state.current_db;
        if previous == db && state.handle.is_some() && !state.stale {
            return Ok((previous, db));
        }
        let handle = self.open_with_retry(db).await?;
        Self::install(&mut state, handle);
        state.current_db = db;
        tracing::info!(from = previous, to = db, "Switched database");
        Ok((previous, db))
    }

    /// Validate a database index against the configured range.
    pub fn check_database(&self, db: i64) -> Result<(), RedisOpsError> {
        if db < 0 || db >= self.config.database_count {
            return Err(RedisOpsError::Validation(format!(
                "database number must be between 0 and {}, got {db}",
                self.config.database_count - 1
            )));
        }
        Ok(())
    }

    /// Idempotent read: retried with backoff on connection errors.
    pub async fn query_read<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, RedisOpsError> {
        let mut attempt = 0;
        loop {
            let mut lease = self.get_handle().await?;
            let generation = lease.generation();
            let result = lease.query(cmd).await;
            drop(lease);
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_connection() && attempt < self.config.max_retries => {
                    self.mark_stale(generation).await;
                    let delay = backoff(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Read failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.observe(generation, &e).await;
                    return Err(e);
                }
            }
        }
    }

    /// Single attempt, for anything that may mutate state.
    pub async fn query_once<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, RedisOpsError> {
        let mut lease = self.get_handle().await?;
        let result = lease.query(cmd).await;
        if let Err(e) = &result {
            self.observe(lease.generation(), e).await;
        }
        result
    }

    /// Parsed `CLUSTER NODES` from the cluster handle.
    pub async fn cluster_nodes(&self) -> Result<Vec<ClusterNode>, RedisOpsError> {
        if self.config.mode != RedisMode::Cluster {
            return Err(RedisOpsError::UnsupportedOperation(format!(
                "cluster topology is only available in cluster mode, not {} mode",
                self.config.mode
            )));
        }
        let mut cmd = redis::cmd("CLUSTER");
        cmd.arg("NODES");
        let raw: String = self.query_read(&cmd).await?;
        let mut nodes = parse_cluster_nodes(&raw)?;
        resolve_own_host(&mut nodes, &self.config.endpoints);
        Ok(nodes)
    }

    /// Addresses of the masters that are not flagged as failed.
    pub async fn master_addresses(&self) -> Result<Vec<String>, RedisOpsError> {
        Ok(self
            .cluster_nodes()
            .await?
            .into_iter()
            .filter(|n| n.is_master() && n.has_address() && !n.is_failed())
            .map(|n| n.address)
            .collect())
    }

    /// A fresh direct connection to one node, given as `host:port`. Only the
    /// pool permit is shared with other callers.
    pub async fn node_handle(&self, address: &str) -> Result<Lease, RedisOpsError> {
        let endpoint = Endpoint::parse(address)?;
        let permit = self.acquire_permit().await?;
        let conn = self.open_direct(&endpoint, 0).await?;
        Ok(Lease {
            handle: RedisHandle::Direct(conn),
            timeout: self.config.command_timeout,
            generation: u64::MAX,
            _permit: permit,
        })
    }

    /// A fresh direct connection to another database of the single server,
    /// holding one pool permit. The manager's own handle and current index
    /// are left untouched.
    pub async fn database_handle(&self, db: i64) -> Result<Lease, RedisOpsError> {
        if self.config.mode != RedisMode::Single {
            return Err(RedisOpsError::UnsupportedOperation(format!(
                "multiple databases are not available in {} mode",
                self.config.mode
            )));
        }
        self.check_database(db)?;
        let endpoint = self.primary_endpoint()?.clone();
        let permit = self.acquire_permit().await?;
        let conn = self.open_direct(&endpoint, db).await?;
        Ok(Lease {
            handle: RedisHandle::Direct(conn),
            timeout: self.config.command_timeout,
            generation: u64::MAX,
            _permit: permit,
        })
    }

    /// PING one node directly; any failure means unreachable.
    pub async fn ping_node(&self, address: &str) -> bool {
        match self.node_handle(address).await {
            Ok(mut lease) => lease.query::<String>(&redis::cmd("PING")).await.is_ok(),
            Err(_) => false,
        }
    }

    fn install(state: &mut State, handle: RedisHandle) {
        state.handle = Some(handle);
        state.stale = false;
        state.generation += 1;
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, RedisOpsError> {
        let acquire = self.pool.clone().acquire_owned();
        match tokio::time::timeout(self.config.pool_timeout, acquire).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(RedisOpsError::Connection(
                "connection pool is closed".to_string(),
            )),
            Err(_) => Err(RedisOpsError::Connection(format!(
                "no pooled connection available within {}ms ({} max)",
                self.config.pool_timeout.as_millis(),
                self.config.max_connections
            ))),
        }
    }

    fn primary_endpoint(&self) -> Result<&Endpoint, RedisOpsError> {
        self.config.endpoints.first().ok_or_else(|| {
            RedisOpsError::Validation(format!(
                "{} mode has no endpoint configured",
                self.config.mode
            ))
        })
    }

    async fn open_with_retry(&self, db: i64) -> Result<RedisHandle, RedisOpsError> {
        let mut attempt = 0;
        loop {
            match self.open_handle(db).await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_connection() && attempt < self.config.max_retries => {
                    let delay = backoff(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        destination = %self.config.describe(),
                        error = %e,
                        "Failed to connect to Redis"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn open_handle(&self, db: i64) -> Result<RedisHandle, RedisOpsError> {
        match self.config.mode {
            RedisMode::Single => {
                let endpoint = self.primary_endpoint()?.clone();
                self.open_managed(&endpoint, db).await
            }
            RedisMode::Sentinel => {
                let master = self.resolve_sentinel_master().await?;
                tracing::info!(
                    master = %master,
                    service = %self.config.sentinel_service,
                    "Resolved sentinel master"
                );
                self.open_managed(&master, 0).await
            }
            RedisMode::Cluster => self.open_cluster().await,
        }
    }

    fn endpoint_url(&self, endpoint: &Endpoint, db: i64) -> Result<String, RedisOpsError> {
        endpoint.to_url(
            self.config.username.as_deref(),
            self.config.password.as_deref(),
            db,
        )
    }

    async fn open_managed(
        &self,
        endpoint: &Endpoint,
        db: i64,
    ) -> Result<RedisHandle, RedisOpsError> {
        let client = redis::Client::open(self.endpoint_url(endpoint, db)?.as_str())
            .map_err(|e| connect_error(endpoint, e))?;
        let mut conn = bounded(
            self.config.connect_timeout,
            "connect",
            ManagedConnection::new(client),
        )
        .await
        .map_err(|e| reclassify(endpoint, e))?;
        let _: String = bounded(
            self.config.command_timeout,
            "PING",
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .map_err(|e| reclassify(endpoint, e))?;
        Ok(RedisHandle::Managed(conn))
    }

    async fn open_direct(
        &self,
        endpoint: &Endpoint,
        db: i64,
    ) -> Result<MultiplexedConnection, RedisOpsError> {
        let client = redis::Client::open(self.endpoint_url(endpoint, db)?.as_str())
            .map_err(|e| connect_error(endpoint, e))?;
        bounded(
            self.config.connect_timeout,
            "connect",
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|e| reclassify(endpoint, e))
    }

    async fn open_cluster(&self) -> Result<RedisHandle, RedisOpsError> {
        // Credentials travel in the seed URLs; the client discovers the
        // remaining nodes and the slot map from them.
        let seeds = self
            .config
            .endpoints
            .iter()
            .map(|endpoint| self.endpoint_url(endpoint, 0))
            .collect::<Result<Vec<_>, _>>()?;
        let client = redis::cluster::ClusterClient::new(seeds)
            .map_err(|e| RedisOpsError::Connection(format!("invalid cluster configuration: {e}")))?;
        let mut conn = bounded(
            self.config.connect_timeout,
            "cluster connect",
            client.get_async_connection(),
        )
        .await
        .map_err(|e| RedisOpsError::Connection(format!("cluster unavailable: {e}")))?;
        let _: String = bounded(
            self.config.command_timeout,
            "PING",
            redis::cmd("PING").query_async(&mut conn),
        )
        .await?;
        Ok(RedisHandle::Cluster(conn))
    }

    /// Ask every sentinel for the master of the configured service and
    /// accept the address a majority of them agree on.
    async fn resolve_sentinel_master(&self) -> Result<Endpoint, RedisOpsError> {
        let mut answers = Vec::new();
        for sentinel in &self.config.endpoints {
            match self.ask_sentinel(sentinel).await {
                Ok(Some(master)) => answers.push(master),
                Ok(None) => tracing::warn!(
                    sentinel = %sentinel,
                    service = %self.config.sentinel_service,
                    "Sentinel does not know the service"
                ),
                Err(e) => tracing::warn!(sentinel = %sentinel, error = %e, "Sentinel unavailable"),
            }
        }
        elect_master(&answers, self.config.endpoints.len()).ok_or_else(|| {
            RedisOpsError::Connection(format!(
                "no sentinel quorum for service '{}': {} of {} sentinels answered",
                self.config.sentinel_service,
                answers.len(),
                self.config.endpoints.len()
            ))
        })
    }

    async fn ask_sentinel(&self, sentinel: &Endpoint) -> Result<Option<Endpoint>, RedisOpsError> {
        let mut conn = self.open_direct(sentinel, 0).await?;
        let mut cmd = redis::cmd("SENTINEL");
        cmd.arg("get-master-addr-by-name")
            .arg(&self.config.sentinel_service);
        let addr: Option<(String, u16)> = bounded(
            self.config.command_timeout,
            "SENTINEL",
            cmd.query_async(&mut conn),
        )
        .await?;
        Ok(addr.map(|(host, port)| Endpoint::new(host, port)))
    }
}

/// The master reported by a strict majority of the `configured` sentinels.
pub fn elect_master(answers: &[Endpoint], configured: usize) -> Option<Endpoint> {
    let quorum = configured / 2 + 1;
    let mut best: Option<(&Endpoint, usize)> = None;
    for candidate in answers {
        let votes = answers.iter().filter(|a| *a == candidate).count();
        if best.map_or(true, |(_, most)| votes > most) {
            best = Some((candidate, votes));
        }
    }
    best.filter(|(_, votes)| *votes >= quorum)
        .map(|(endpoint, _)| endpoint.clone())
}

fn connect_error(endpoint: &Endpoint, e: redis::RedisError) -> RedisOpsError {
    RedisOpsError::Connection(format!("cannot connect to {endpoint}: {e}"))
}

/// Anything failing while a connection is being established is a
/// connection problem, whatever the server said.
fn reclassify(endpoint: &Endpoint, e: RedisOpsError) -> RedisOpsError {
    match e {
        RedisOpsError::Command(msg) | RedisOpsError::Connection(msg) => {
            RedisOpsError::Connection(format!("cannot connect to {endpoint}: {msg}"))
        }
        other => other,
    }
}

/// A node that has not learned its own IP lists itself as `:port`. Give it
/// the host of the seed on that port, or of the first seed.
fn resolve_own_host(nodes: &mut [ClusterNode], seeds: &[Endpoint]) {
    for node in nodes.iter_mut().filter(|n| n.is_self_without_host()) {
        let port = node.address.trim_start_matches(':').parse::<u16>().ok();
        let seed = seeds
            .iter()
            .find(|seed| Some(seed.port) == port)
            .or_else(|| seeds.first());
        if let Some(seed) = seed {
            tracing::debug!(node = %node.id, host = %seed.host, "Cluster node reports no host");
            node.assign_host(&seed.host);
        }
    }
}
