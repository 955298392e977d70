use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::{schemars, tool, tool_handler, tool_router, ServerHandler};
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::connection::ConnectionManager;
use crate::error::RedisOpsError;
use crate::executor::{BatchCommand, CommandExecutor};
use crate::info::InfoAggregator;
use crate::scanner::KeyScanner;

#[derive(Clone)]
pub struct McpRedisServer {
    settings: Arc<Settings>,
    manager: Arc<ConnectionManager>,
    executor: Arc<CommandExecutor>,
    scanner: Arc<KeyScanner>,
    info: Arc<InfoAggregator>,
    tool_router: ToolRouter<Self>,
}

// -- Tool parameter types --

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct AnalyzeParams {
    #[schemars(description = "Key pattern to match (glob: *, ?, [abc]). Default: *")]
    #[serde(default)]
    pub pattern: Option<String>,

    #[schemars(
        description = "Maximum number of keys to examine, matching or not. Default: the server's configured scan cap"
    )]
    #[serde(default)]
    pub limit: Option<usize>,

    #[schemars(
        description = "Size keys with MEMORY USAGE (default true). When false, sizes are cheaper estimates from lengths and sampled elements"
    )]
    #[serde(default)]
    pub include_memory_usage: Option<bool>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CommandParams {
    #[schemars(description = "Command name, e.g. 'GET' (a full line like 'GET user:1' is also accepted)")]
    pub command: String,

    #[schemars(description = "Command arguments")]
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct BatchParams {
    #[schemars(
        description = "Commands to run, each either a string ('SET k v') or an argument list (['SET', 'k', 'v'])"
    )]
    pub commands: Vec<BatchCommand>,

    #[schemars(
        description = "Send all commands in one round trip (default false). Any blocked command aborts the whole pipeline before sending"
    )]
    #[serde(default)]
    pub use_pipeline: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SwitchDatabaseParams {
    #[schemars(description = "Database index to switch to (single mode only)")]
    pub db_number: i64,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct KeyParams {
    #[schemars(description = "Key name to inspect")]
    pub key: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ClearDatabaseParams {
    #[schemars(description = "Database index to clear. Default: the current database")]
    #[serde(default)]
    pub db_number: Option<i64>,

    #[schemars(description = "Must be true; the clear deletes every key and cannot be undone")]
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CommandInfoParams {
    #[schemars(description = "Command name to classify, e.g. 'FLUSHALL'")]
    pub command: String,
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, ErrorData> {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string());
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

impl McpRedisServer {
    pub fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let manager = Arc::new(ConnectionManager::new(settings.connection.clone()));
        Self {
            executor: Arc::new(CommandExecutor::new(
                Arc::clone(&manager),
                settings.safety.clone(),
            )),
            scanner: Arc::new(KeyScanner::new(Arc::clone(&manager), settings.scan.clone())),
            info: Arc::new(InfoAggregator::new(Arc::clone(&manager))),
            manager,
            settings,
            tool_router: Self::tool_router(),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    fn err(&self, e: RedisOpsError) -> ErrorData {
        e.to_mcp_error()
    }
}

// -- Public methods for testability --

impl McpRedisServer {
    pub async fn do_get_redis_info(&self) -> Result<CallToolResult, ErrorData> {
        let report = self.info.get_redis_info().await.map_err(|e| self.err(e))?;
        json_result(&report)
    }

    pub async fn do_analyze_large_keys(
        &self,
        params: AnalyzeParams,
    ) -> Result<CallToolResult, ErrorData> {
        let pattern = params.pattern.as_deref().unwrap_or("*");
        let report = self
            .scanner
            .analyze(
                pattern,
                params.limit,
                params.include_memory_usage.unwrap_or(true),
            )
            .await
            .map_err(|e| self.err(e))?;
        json_result(&report)
    }

    pub async fn do_execute_command(
        &self,
        params: CommandParams,
    ) -> Result<CallToolResult, ErrorData> {
        let outcome = self
            .executor
            .execute_single(&params.command, &params.args)
            .await
            .map_err(|e| self.err(e))?;
        json_result(&outcome)
    }

    pub async fn do_execute_batch_commands(
        &self,
        params: BatchParams,
    ) -> Result<CallToolResult, ErrorData> {
        let result = self
            .executor
            .execute_batch(&params.commands, params.use_pipeline)
            .await
            .map_err(|e| self.err(e))?;
        json_result(&result)
    }

    pub async fn do_switch_database(
        &self,
        params: SwitchDatabaseParams,
    ) -> Result<CallToolResult, ErrorData> {
        let (previous, current) = self
            .manager
            .switch_database(params.db_number)
            .await
            .map_err(|e| self.err(e))?;
        json_result(&serde_json::json!({
            "success": true,
            "previous_database": previous,
            "current_database": current,
        }))
    }

    pub async fn do_get_database_info(&self) -> Result<CallToolResult, ErrorData> {
        let report = self
            .info
            .get_database_info()
            .await
            .map_err(|e| self.err(e))?;
        json_result(&report)
    }

    pub async fn do_get_key_details(&self, params: KeyParams) -> Result<CallToolResult, ErrorData> {
        let details = self
            .scanner
            .get_key_details(&params.key)
            .await
            .map_err(|e| self.err(e))?;
        json_result(&details)
    }

    pub async fn do_get_cluster_info(&self) -> Result<CallToolResult, ErrorData> {
        let report = self
            .info
            .get_cluster_info()
            .await
            .map_err(|e| self.err(e))?;
        json_result(&report)
    }

    pub async fn do_clear_database(
        &self,
        params: ClearDatabaseParams,
    ) -> Result<CallToolResult, ErrorData> {
        let outcome = self
            .executor
            .clear_database(params.db_number, params.confirm)
            .await
            .map_err(|e| self.err(e))?;
        json_result(&serde_json::json!({
            "success": true,
            "result": outcome,
        }))
    }

    pub async fn do_get_command_info(
        &self,
        params: CommandInfoParams,
    ) -> Result<CallToolResult, ErrorData> {
        let report = self
            .executor
            .command_info(&params.command)
            .await
            .map_err(|e| self.err(e))?;
        json_result(&report)
    }
}

// -- MCP tool handlers (thin wrappers) --

#[tool_router]
impl McpRedisServer {
    #[tool(
        name = "get_redis_info",
        description = "Server, memory, clients, replication, stats and keyspace summary of the connected Redis deployment"
    )]
    async fn get_redis_info(&self) -> Result<CallToolResult, ErrorData> {
        self.do_get_redis_info().await
    }

    #[tool(
        name = "analyze_large_keys",
        description = "Scan keys matching a pattern with SCAN (non-blocking) and report keys at or above the large-key threshold, largest first, plus per-type totals. Sizes are estimates"
    )]
    async fn analyze_large_keys(
        &self,
        Parameters(params): Parameters<AnalyzeParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.do_analyze_large_keys(params).await
    }

    #[tool(
        name = "execute_command",
        description = "Execute one Redis command. Dangerous commands (FLUSHALL, CONFIG, EVAL, ...) are refused unless the server runs with the override enabled"
    )]
    async fn execute_command(
        &self,
        Parameters(params): Parameters<CommandParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.do_execute_command(params).await
    }

    #[tool(
        name = "execute_batch_commands",
        description = "Execute several commands in order, either one by one (failures are recorded per command) or as a single pipeline"
    )]
    async fn execute_batch_commands(
        &self,
        Parameters(params): Parameters<BatchParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.do_execute_batch_commands(params).await
    }

    #[tool(
        name = "switch_database",
        description = "Switch the current database (single mode only)"
    )]
    async fn switch_database(
        &self,
        Parameters(params): Parameters<SwitchDatabaseParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.do_switch_database(params).await
    }

    #[tool(
        name = "get_database_info",
        description = "Key and expiry counts for every configured database, with the current database marked"
    )]
    async fn get_database_info(&self) -> Result<CallToolResult, ErrorData> {
        self.do_get_database_info().await
    }

    #[tool(
        name = "get_key_details",
        description = "Type, size, TTL, encoding and a short preview of one key"
    )]
    async fn get_key_details(
        &self,
        Parameters(params): Parameters<KeyParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.do_get_key_details(params).await
    }

    #[tool(
        name = "get_cluster_info",
        description = "Cluster topology, per-node reachability, slot coverage and an overall health verdict (cluster mode only)"
    )]
    async fn get_cluster_info(&self) -> Result<CallToolResult, ErrorData> {
        self.do_get_cluster_info().await
    }

    #[tool(
        name = "clear_database",
        description = "Delete every key in a database. Requires confirm=true"
    )]
    async fn clear_database(
        &self,
        Parameters(params): Parameters<ClearDatabaseParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.do_clear_database(params).await
    }

    #[tool(
        name = "get_command_info",
        description = "Whether a command is classified as dangerous and why, with the server's own COMMAND INFO when available"
    )]
    async fn get_command_info(
        &self,
        Parameters(params): Parameters<CommandInfoParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.do_get_command_info(params).await
    }
}

#[tool_handler]
impl ServerHandler for McpRedisServer {
    fn get_info(&self) -> ServerInfo {
        let override_note = if self.settings.safety.allow_dangerous() {
            "Dangerous commands are ENABLED on this server."
        } else {
            "Dangerous commands are blocked."
        };
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "mcp-redis-ops".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(format!(
                "Redis operations server ({} mode). Tools: get_redis_info (server summary), \
                 analyze_large_keys (find big keys), get_key_details (inspect one key), \
                 execute_command / execute_batch_commands (guarded execution), \
                 switch_database, get_database_info, get_cluster_info, \
                 clear_database (requires confirm=true), get_command_info (safety \
                 classification). {}",
                self.settings.connection.mode, override_note
            )),
        }
    }
}
