//! Guarded command execution: single commands, sequential batches,
//! pipelines, and the confirmed database clear.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::Value;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cluster::{NodeFailure, unreachable_masters};
use crate::config::RedisMode;
use crate::connection::{ConnectionManager, Lease};
use crate::error::{ErrorPayload, RedisOpsError};
use crate::safety::{CommandVerdict, SafetyPolicy};

/// Commands that change the state of the shared connection itself. They
/// would desynchronize the manager's view of it, so they are refused.
const SESSION_COMMANDS: &[&str] = &[
    "SELECT",
    "QUIT",
    "RESET",
    "HELLO",
    "MULTI",
    "EXEC",
    "DISCARD",
    "WATCH",
    "UNWATCH",
    "SUBSCRIBE",
    "PSUBSCRIBE",
    "SSUBSCRIBE",
    "UNSUBSCRIBE",
    "PUNSUBSCRIBE",
    "SUNSUBSCRIBE",
];

/// One entry of a batch: `"SET k v"` or `["SET", "k", "v"]`.
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(untagged)]
pub enum BatchCommand {
    Line(String),
    Parts(Vec<String>),
}

impl BatchCommand {
    /// Command name and arguments, or `None` for an empty entry.
    pub fn split(&self) -> Option<(String, Vec<String>)> {
        let mut parts: Vec<String> = match self {
            BatchCommand::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            BatchCommand::Parts(parts) => parts.clone(),
        };
        if parts.first().map_or(true, |name| name.trim().is_empty()) {
            return None;
        }
        let name = parts.remove(0);
        Some((name, parts))
    }
}

impl fmt::Display for BatchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchCommand::Line(line) => write!(f, "{}", line.trim()),
            BatchCommand::Parts(parts) => write!(f, "{}", parts.join(" ")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub command: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub elapsed_ms: f64,
}

impl CommandOutcome {
    fn succeeded(
        command: String,
        value: &Value,
        warning: Option<String>,
        elapsed_ms: f64,
    ) -> Self {
        Self {
            command,
            success: true,
            result: Some(normalize_value(value)),
            error: None,
            warning,
            elapsed_ms,
        }
    }

    fn failed(command: String, err: &RedisOpsError, elapsed_ms: f64) -> Self {
        Self {
            command,
            success: false,
            result: None,
            error: Some(err.payload()),
            warning: None,
            elapsed_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub results: Vec<CommandOutcome>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: f64,
    pub pipeline: bool,
}

impl BatchResult {
    fn new(results: Vec<CommandOutcome>, elapsed: Duration, pipeline: bool) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            failed: results.len() - succeeded,
            succeeded,
            results,
            elapsed_ms: millis(elapsed),
            pipeline,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearOutcome {
    pub mode: RedisMode,
    pub database: i64,
    pub keys_deleted: i64,
    pub keys_remaining: i64,
    /// Masters flushed (cluster mode only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
    /// Masters that could not be flushed and still hold their keys.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_nodes: Vec<NodeFailure>,
}

/// What the server itself says about a command (`COMMAND INFO`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerCommandInfo {
    pub arity: i64,
    pub flags: Vec<String>,
    pub first_key: i64,
    pub last_key: i64,
    pub step: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandInfoReport {
    #[serde(flatten)]
    pub verdict: CommandVerdict,
    pub known_to_server: Option<bool>,
    pub server_info: Option<ServerCommandInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_error: Option<String>,
    pub dangerous_commands: Vec<String>,
}

struct Prepared {
    text: String,
    name: String,
    args: Vec<String>,
    warning: Option<String>,
}

impl Prepared {
    fn to_cmd(&self) -> redis::Cmd {
        let mut cmd = redis::cmd(&self.name);
        for arg in &self.args {
            cmd.arg(arg);
        }
        cmd
    }
}

pub struct CommandExecutor {
    manager: Arc<ConnectionManager>,
    policy: SafetyPolicy,
}

impl CommandExecutor {
    pub fn new(manager: Arc<ConnectionManager>, policy: SafetyPolicy) -> Self {
        Self { manager, policy }
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// Run one command. Blocked commands fail before anything is sent.
    pub async fn execute_single(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<CommandOutcome, RedisOpsError> {
        // A bare "GET key" line is accepted as well as name plus args.
        let entry = if args.is_empty() {
            BatchCommand::Line(command.to_string())
        } else {
            let mut parts = vec![command.to_string()];
            parts.extend(args.iter().cloned());
            BatchCommand::Parts(parts)
        };
        let prepared = self.prepare(&entry)?;

        let started = Instant::now();
        let value: Value = self.manager.query_once(&prepared.to_cmd()).await?;
        let elapsed = started.elapsed();
        tracing::debug!(
            command = %prepared.name,
            elapsed_ms = millis(elapsed),
            "Executed command"
        );
        Ok(CommandOutcome::succeeded(
            prepared.text,
            &value,
            prepared.warning,
            millis(elapsed),
        ))
    }

    /// Run a batch. The result always has one outcome per submitted entry.
    pub async fn execute_batch(
        &self,
        commands: &[BatchCommand],
        use_pipeline: bool,
    ) -> Result<BatchResult, RedisOpsError> {
        if commands.is_empty() {
            return Err(RedisOpsError::Validation(
                "batch must contain at least one command".to_string(),
            ));
        }
        if use_pipeline {
            self.run_pipeline(commands).await
        } else {
            Ok(self.run_sequential(commands).await)
        }
    }

    async fn run_sequential(&self, commands: &[BatchCommand]) -> BatchResult {
        let started = Instant::now();
        let mut results = Vec::with_capacity(commands.len());
        for entry in commands {
            let outcome = match self.prepare(entry) {
                Ok(prepared) => self.dispatch(prepared).await,
                Err(e) => CommandOutcome::failed(entry.to_string(), &e, 0.0),
            };
            results.push(outcome);
        }
        BatchResult::new(results, started.elapsed(), false)
    }

    async fn dispatch(&self, prepared: Prepared) -> CommandOutcome {
        let started = Instant::now();
        let result: Result<Value, _> = self.manager.query_once(&prepared.to_cmd()).await;
        let elapsed = millis(started.elapsed());
        match result {
            Ok(value) => {
                CommandOutcome::succeeded(prepared.text, &value, prepared.warning, elapsed)
            }
            Err(e) => CommandOutcome::failed(prepared.text, &e, elapsed),
        }
    }

    async fn run_pipeline(&self, commands: &[BatchCommand]) -> Result<BatchResult, RedisOpsError> {
        // Every entry is checked before anything is queued.
        let mut prepared = Vec::with_capacity(commands.len());
        for (index, entry) in commands.iter().enumerate() {
            let checked = self.prepare(entry).map_err(|e| match e {
                RedisOpsError::SafetyViolation(msg) => RedisOpsError::SafetyViolation(format!(
                    "pipeline aborted at command #{}, nothing was sent: {msg}",
                    index + 1
                )),
                RedisOpsError::Validation(msg) => RedisOpsError::Validation(format!(
                    "pipeline aborted at command #{}: {msg}",
                    index + 1
                )),
                other => other,
            })?;
            prepared.push(checked);
        }

        let mut pipe = redis::pipe();
        for p in &prepared {
            pipe.cmd(&p.name);
            for arg in &p.args {
                pipe.arg(arg);
            }
        }

        let mut lease = self.manager.get_handle().await?;
        let started = Instant::now();
        let reply = lease.pipeline(&pipe).await;
        let elapsed = started.elapsed();
        if let Err(e) = &reply {
            self.manager.observe(lease.generation(), e).await;
        }
        drop(lease);

        let per_command = millis(elapsed) / prepared.len() as f64;
        let results = match reply {
            Ok(values) => prepared
                .into_iter()
                .enumerate()
                .map(|(index, p)| match values.get(index) {
                    Some(value) => CommandOutcome::succeeded(p.text, value, p.warning, per_command),
                    None => CommandOutcome::failed(
                        p.text,
                        &RedisOpsError::Command("no reply received for this command".to_string()),
                        per_command,
                    ),
                })
                .collect(),
            // The client reports a pipeline failure as a whole, so no single
            // entry can be credited with success.
            Err(e) => {
                tracing::warn!(commands = prepared.len(), error = %e, "Pipeline failed");
                prepared
                    .into_iter()
                    .map(|p| CommandOutcome::failed(p.text, &e, per_command))
                    .collect()
            }
        };
        Ok(BatchResult::new(results, elapsed, true))
    }

    /// Parse, validate and gate one entry.
    fn prepare(&self, entry: &BatchCommand) -> Result<Prepared, RedisOpsError> {
        let (name, args) = entry
            .split()
            .ok_or_else(|| RedisOpsError::Validation("command must not be empty".to_string()))?;
        let upper = name.trim().to_ascii_uppercase();
        if SESSION_COMMANDS.contains(&upper.as_str()) {
            let hint = if upper == "SELECT" {
                "; use switch_database instead"
            } else {
                ""
            };
            return Err(RedisOpsError::UnsupportedOperation(format!(
                "{upper} changes the state of the shared connection{hint}"
            )));
        }
        let warning = self.gate(&upper)?;
        Ok(Prepared {
            text: entry.to_string(),
            name: upper,
            args,
            warning,
        })
    }

    /// Returns a warning when a dangerous command passes under the override.
    fn gate(&self, name: &str) -> Result<Option<String>, RedisOpsError> {
        let Some(category) = self.policy.category(name) else {
            return Ok(None);
        };
        if !self.policy.allow_dangerous() {
            return Err(RedisOpsError::SafetyViolation(format!(
                "{name} is blocked: {}",
                category.rationale()
            )));
        }
        tracing::warn!(command = %name, "Executing dangerous command under override");
        Ok(Some(format!(
            "{name} is a dangerous command ({}); allowed by override",
            category.rationale()
        )))
    }

    /// Delete every key of a database. Requires `confirm`; the clear itself
    /// bypasses the classifier and is never retried.
    pub async fn clear_database(
        &self,
        db: Option<i64>,
        confirm: bool,
    ) -> Result<ClearOutcome, RedisOpsError> {
        if !confirm {
            return Err(RedisOpsError::ConfirmationRequired(
                "clear_database deletes every key in the database; call again with confirm=true"
                    .to_string(),
            ));
        }

        let mode = self.manager.mode();
        if mode != RedisMode::Single && db.is_some_and(|d| d != 0) {
            return Err(RedisOpsError::UnsupportedOperation(format!(
                "{mode} mode has a single logical database (0)"
            )));
        }

        let outcome = match mode {
            RedisMode::Single => {
                let current = self.manager.current_database().await;
                let target = db.unwrap_or(current);
                self.manager.check_database(target)?;
                let (deleted, remaining) = if target == current {
                    let mut lease = self.manager.get_handle().await?;
                    let result = flush(&mut lease).await;
                    if let Err(e) = &result {
                        self.manager.observe(lease.generation(), e).await;
                    }
                    result?
                } else {
                    let mut lease = self.manager.database_handle(target).await?;
                    flush(&mut lease).await?
                };
                ClearOutcome {
                    mode,
                    database: target,
                    keys_deleted: deleted,
                    keys_remaining: remaining,
                    nodes: Vec::new(),
                    failed_nodes: Vec::new(),
                }
            }
            RedisMode::Sentinel => {
                let mut lease = self.manager.get_handle().await?;
                let result = flush(&mut lease).await;
                if let Err(e) = &result {
                    self.manager.observe(lease.generation(), e).await;
                }
                let (deleted, remaining) = result?;
                ClearOutcome {
                    mode,
                    database: 0,
                    keys_deleted: deleted,
                    keys_remaining: remaining,
                    nodes: Vec::new(),
                    failed_nodes: Vec::new(),
                }
            }
            RedisMode::Cluster => {
                let masters = self.manager.master_addresses().await?;
                let outcome = self.flush_masters(masters).await;
                if outcome.nodes.is_empty() && !outcome.failed_nodes.is_empty() {
                    return Err(unreachable_masters(&outcome.failed_nodes));
                }
                outcome
            }
        };

        tracing::info!(
            mode = %outcome.mode,
            database = outcome.database,
            keys_deleted = outcome.keys_deleted,
            failed_nodes = outcome.failed_nodes.len(),
            "Database cleared"
        );
        Ok(outcome)
    }

    /// FLUSHDB on every master in turn. A master that fails is recorded and
    /// the rest are still flushed, so the outcome names exactly which nodes
    /// were cleared.
    async fn flush_masters(&self, masters: Vec<String>) -> ClearOutcome {
        let mut outcome = ClearOutcome {
            mode: RedisMode::Cluster,
            database: 0,
            keys_deleted: 0,
            keys_remaining: 0,
            nodes: Vec::new(),
            failed_nodes: Vec::new(),
        };
        for address in masters {
            let result = match self.manager.node_handle(&address).await {
                Ok(mut lease) => flush(&mut lease).await,
                Err(e) => Err(e),
            };
            match result {
                Ok((deleted, remaining)) => {
                    outcome.keys_deleted += deleted;
                    outcome.keys_remaining += remaining;
                    outcome.nodes.push(address);
                }
                Err(e) => {
                    tracing::warn!(node = %address, error = %e, "Master not flushed");
                    outcome.failed_nodes.push(NodeFailure::new(address, &e));
                }
            }
        }
        outcome
    }

    /// Classification plus what the server reports for `command`.
    pub async fn command_info(&self, command: &str) -> Result<CommandInfoReport, RedisOpsError> {
        let name = command.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(RedisOpsError::Validation(
                "command must be a single command name".to_string(),
            ));
        }
        let verdict = self.policy.verdict(name);

        let mut cmd = redis::cmd("COMMAND");
        cmd.arg("INFO").arg(&verdict.command);
        let (known_to_server, server_info, server_error) =
            match self.manager.query_read::<Value>(&cmd).await {
                Ok(reply) => {
                    let info = parse_command_info(&reply);
                    (Some(info.is_some()), info, None)
                }
                Err(e) => {
                    tracing::debug!(command = %verdict.command, error = %e, "COMMAND INFO failed");
                    (None, None, Some(e.to_string()))
                }
            };

        Ok(CommandInfoReport {
            verdict,
            known_to_server,
            server_info,
            server_error,
            dangerous_commands: self.policy.blocked_commands(),
        })
    }
}

async fn flush(lease: &mut Lease) -> Result<(i64, i64), RedisOpsError> {
    let before: i64 = lease.query(&redis::cmd("DBSIZE")).await?;
    let _: Value = lease.query(&redis::cmd("FLUSHDB")).await?;
    let after: i64 = lease.query(&redis::cmd("DBSIZE")).await?;
    Ok((before, after))
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Convert a reply into JSON. Text stays text; bytes that are not UTF-8
/// are described instead of decoded.
pub fn normalize_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Int(i) => json!(i),
        Value::BulkString(bytes) => bytes_to_json(bytes),
        Value::SimpleString(s) => serde_json::Value::String(s.clone()),
        Value::Okay => serde_json::Value::String("OK".to_string()),
        Value::Array(items) | Value::Set(items) => {
            serde_json::Value::Array(items.iter().map(normalize_value).collect())
        }
        Value::Map(pairs) => {
            let object = pairs
                .iter()
                .map(|(k, v)| {
                    let key = value_text(k).unwrap_or_else(|| normalize_value(k).to_string());
                    (key, normalize_value(v))
                })
                .collect();
            serde_json::Value::Object(object)
        }
        Value::Double(d) => json!(d),
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::VerbatimString { text, .. } => serde_json::Value::String(text.clone()),
        other => serde_json::Value::String(format!("{other:?}")),
    }
}

fn bytes_to_json(bytes: &[u8]) -> serde_json::Value {
    match std::str::from_utf8(bytes) {
        Ok(text) => serde_json::Value::String(text.to_string()),
        Err(_) => json!({
            "binary": true,
            "byte_length": bytes.len(),
            "content": format!("<binary data: {} bytes>", bytes.len()),
        }),
    }
}

pub(crate) fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => std::str::from_utf8(bytes).ok().map(str::to_string),
        Value::SimpleString(s) => Some(s.clone()),
        Value::VerbatimString { text, .. } => Some(text.clone()),
        Value::Okay => Some("OK".to_string()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

fn value_int(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Int(i)) => Some(*i),
        _ => None,
    }
}

/// First entry of a `COMMAND INFO` reply; `None` when the server does not
/// know the command.
pub fn parse_command_info(reply: &Value) -> Option<ServerCommandInfo> {
    let Value::Array(entries) = reply else {
        return None;
    };
    let Some(Value::Array(fields)) = entries.first() else {
        return None;
    };
    let flags = match fields.get(2) {
        Some(Value::Array(flags)) | Some(Value::Set(flags)) => {
            flags.iter().filter_map(value_text).collect()
        }
        _ => Vec::new(),
    };
    Some(ServerCommandInfo {
        arity: value_int(fields.get(1))?,
        flags,
        first_key: value_int(fields.get(3)).unwrap_or(0),
        last_key: value_int(fields.get(4)).unwrap_or(0),
        step: value_int(fields.get(5)).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::offline_config;
    use crate::error::ErrorKind;

    fn offline_executor(mode: RedisMode, allow_dangerous: bool) -> CommandExecutor {
        let manager = Arc::new(ConnectionManager::new(offline_config(mode)));
        CommandExecutor::new(
            manager,
            SafetyPolicy::new(allow_dangerous, std::iter::empty::<&str>()),
        )
    }

    fn line(s: &str) -> BatchCommand {
        BatchCommand::Line(s.to_string())
    }

    #[test]
    fn test_batch_command_split() {
        assert_eq!(
            line("  SET  user:1 alice ").split(),
            Some(("SET".to_string(), vec!["user:1".to_string(), "alice".to_string()]))
        );
        let parts = BatchCommand::Parts(vec!["SET".into(), "k".into(), "two words".into()]);
        assert_eq!(parts.split().unwrap().1, vec!["k", "two words"]);
        assert_eq!(line("   ").split(), None);
        assert_eq!(BatchCommand::Parts(vec![]).split(), None);
    }

    #[test]
    fn test_batch_command_deserializes_both_shapes() {
        let commands: Vec<BatchCommand> =
            serde_json::from_str(r#"["PING", ["SET", "k", "v"]]"#).unwrap();
        assert!(matches!(commands[0], BatchCommand::Line(_)));
        assert!(matches!(commands[1], BatchCommand::Parts(_)));
        assert_eq!(commands[1].to_string(), "SET k v");
    }

    #[tokio::test]
    async fn test_blocked_commands_never_reach_the_network() {
        let executor = offline_executor(RedisMode::Single, false);
        for name in executor.policy().blocked_commands() {
            let err = executor.execute_single(&name.to_lowercase(), &[]).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SafetyViolation, "{name}: {err}");
        }
    }

    #[tokio::test]
    async fn test_override_passes_the_gate() {
        let executor = offline_executor(RedisMode::Single, true);
        // Past the gate the offline manager fails to connect.
        let err = executor.execute_single("FLUSHALL", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionError, "{err}");
    }

    #[tokio::test]
    async fn test_select_is_refused() {
        let executor = offline_executor(RedisMode::Single, true);
        let err = executor
            .execute_single("select", &["2".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert!(err.to_string().contains("switch_database"));
    }

    #[tokio::test]
    async fn test_empty_command_is_validation_error() {
        let executor = offline_executor(RedisMode::Single, false);
        let err = executor.execute_single(" ", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_pipeline_with_blocked_command_aborts_before_sending() {
        let executor = offline_executor(RedisMode::Single, false);
        let batch = vec![line("SET a 1"), line("FLUSHALL"), line("GET a")];
        // A connection error here would mean the pipeline was dispatched.
        let err = executor.execute_batch(&batch, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SafetyViolation, "{err}");
        assert!(err.to_string().contains("#2"));
    }

    #[tokio::test]
    async fn test_sequential_batch_keeps_one_outcome_per_entry() {
        let executor = offline_executor(RedisMode::Single, false);
        let batch = vec![
            line("GET a"),
            line("FLUSHALL"),
            line(""),
            BatchCommand::Parts(vec!["SET".into(), "b".into(), "1".into()]),
        ];
        let result = executor.execute_batch(&batch, false).await.unwrap();
        assert_eq!(result.results.len(), batch.len());
        assert_eq!(result.total, 4);
        assert_eq!(result.succeeded, 0);
        assert_eq!(result.failed, 4);
        let kinds: Vec<ErrorKind> = result
            .results
            .iter()
            .map(|r| r.error.as_ref().unwrap().kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ErrorKind::ConnectionError,
                ErrorKind::SafetyViolation,
                ErrorKind::ValidationError,
                ErrorKind::ConnectionError,
            ]
        );
        assert_eq!(result.results[3].command, "SET b 1");
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let executor = offline_executor(RedisMode::Single, false);
        for pipeline in [false, true] {
            let err = executor.execute_batch(&[], pipeline).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValidationError);
        }
    }

    #[tokio::test]
    async fn test_clear_without_confirmation_is_refused() {
        for mode in [RedisMode::Single, RedisMode::Cluster, RedisMode::Sentinel] {
            let executor = offline_executor(mode, false);
            for db in [None, Some(0), Some(5)] {
                let err = executor.clear_database(db, false).await.unwrap_err();
                assert_eq!(err.kind(), ErrorKind::ConfirmationRequired, "{mode} {db:?}");
            }
        }
    }

    #[tokio::test]
    async fn test_clear_other_database_unsupported_outside_single_mode() {
        for mode in [RedisMode::Cluster, RedisMode::Sentinel] {
            let executor = offline_executor(mode, false);
            let err = executor.clear_database(Some(3), true).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        }
    }

    #[tokio::test]
    async fn test_clear_validates_database_range() {
        let executor = offline_executor(RedisMode::Single, false);
        let err = executor.clear_database(Some(16), true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_cluster_clear_records_each_unreachable_master() {
        let executor = offline_executor(RedisMode::Cluster, false);
        let masters = vec!["127.0.0.1:1".to_string(), "127.0.0.1:2".to_string()];
        let outcome = executor.flush_masters(masters).await;
        assert!(outcome.nodes.is_empty());
        assert_eq!(outcome.keys_deleted, 0);
        let failed: Vec<&str> = outcome.failed_nodes.iter().map(|f| f.node.as_str()).collect();
        assert_eq!(failed, vec!["127.0.0.1:1", "127.0.0.1:2"]);
        assert!(outcome.failed_nodes.iter().all(|f| !f.error.is_empty()));

        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json.get("nodes").is_none());
        assert_eq!(json["failed_nodes"][1]["node"], "127.0.0.1:2");
    }

    #[tokio::test]
    async fn test_command_info_reports_server_error_without_failing() {
        let executor = offline_executor(RedisMode::Single, false);
        let report = executor.command_info("flushdb").await.unwrap();
        assert!(report.verdict.blocked);
        assert!(report.server_info.is_none());
        assert!(report.server_error.is_some());
        assert!(report.dangerous_commands.contains(&"FLUSHDB".to_string()));
    }

    #[test]
    fn test_normalize_value() {
        assert_eq!(normalize_value(&Value::Nil), serde_json::Value::Null);
        assert_eq!(normalize_value(&Value::Okay), json!("OK"));
        assert_eq!(normalize_value(&Value::Int(7)), json!(7));
        assert_eq!(
            normalize_value(&Value::BulkString(b"hello".to_vec())),
            json!("hello")
        );
        let nested = Value::Array(vec![
            Value::BulkString(b"a".to_vec()),
            Value::Array(vec![Value::Int(1), Value::Nil]),
        ]);
        assert_eq!(normalize_value(&nested), json!(["a", [1, null]]));
        let map = Value::Map(vec![(Value::SimpleString("field".into()), Value::Int(3))]);
        assert_eq!(normalize_value(&map), json!({"field": 3}));
    }

    #[test]
    fn test_binary_reply_is_described() {
        let value = normalize_value(&Value::BulkString(vec![0xff, 0xfe, 0x00, 0x01]));
        assert_eq!(value["binary"], json!(true));
        assert_eq!(value["byte_length"], json!(4));
    }

    #[test]
    fn test_parse_command_info() {
        let reply = Value::Array(vec![Value::Array(vec![
            Value::BulkString(b"get".to_vec()),
            Value::Int(2),
            Value::Array(vec![
                Value::SimpleString("readonly".into()),
                Value::SimpleString("fast".into()),
            ]),
            Value::Int(1),
            Value::Int(1),
            Value::Int(1),
        ])]);
        let info = parse_command_info(&reply).unwrap();
        assert_eq!(info.arity, 2);
        assert_eq!(info.flags, vec!["readonly", "fast"]);
        assert_eq!(info.first_key, 1);

        assert_eq!(parse_command_info(&Value::Array(vec![Value::Nil])), None);
    }
}
