//! Tool execution router.
//!
//! Resolves a tool name to either a built-in tool or a tool on an active MCP
//! server, runs it with bounded retries and records every attempt in
//! [`ToolStats`].
//!
//! Server tools are addressed as `mcp:{server_id}:{tool}`. A bare name is
//! looked up among built-ins first, then among active servers in id order.

use crate::error::{McpError, McpResult};
use crate::manager::ConnectionManager;
use crate::protocol::ToolDescriptor;
use crate::stats::{ToolStat, ToolStats};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Prefix of namespaced server tools.
pub const MCP_TOOL_PREFIX: &str = "mcp";

/// A tool implemented in-process.
#[async_trait]
pub trait BuiltinTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn input_schema(&self) -> Value;

    async fn call(&self, args: Value) -> McpResult<Value>;
}

/// Attempt count, backoff and per-attempt deadline.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// The wait after attempt `n` is `n * base_delay`.
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Format the routed name of a server tool.
pub fn namespaced(server_id: &str, tool: &str) -> String {
    format!("{MCP_TOOL_PREFIX}:{server_id}:{tool}")
}

/// Split `mcp:{server_id}:{tool}`. The tool part may itself contain `:`.
fn parse_namespaced(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(MCP_TOOL_PREFIX)?.strip_prefix(':')?;
    let (server_id, tool) = rest.split_once(':')?;
    if server_id.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server_id, tool))
}

enum Target {
    Builtin(Arc<dyn BuiltinTool>),
    Server { id: String, tool: String },
}

/// Routes tool calls and keeps execution statistics.
pub struct ToolRouter {
    manager: ConnectionManager,
    builtins: HashMap<String, Arc<dyn BuiltinTool>>,
    policy: RetryPolicy,
    stats: Mutex<ToolStats>,
}

impl ToolRouter {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            builtins: HashMap::new(),
            policy: RetryPolicy::default(),
            stats: Mutex::new(ToolStats::new()),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register a built-in tool. A later tool with the same name replaces
    /// the earlier one.
    pub fn register(&mut self, tool: Arc<dyn BuiltinTool>) {
        self.builtins.insert(tool.name().to_string(), tool);
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Every callable tool: built-ins, then server tools under their
    /// namespaced names.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut builtins: Vec<ToolDescriptor> = self
            .builtins
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect();
        builtins.sort_by(|a, b| a.name.cmp(&b.name));

        let mut tools = builtins;
        for server in self.manager.active_tools().await {
            tools.extend(server.tools.into_iter().map(|tool| ToolDescriptor {
                name: namespaced(&server.id, &tool.name),
                description: format!("[{}] {}", server.name, tool.description),
                input_schema: tool.input_schema,
            }));
        }
        tools
    }

    async fn resolve(&self, name: &str) -> McpResult<Target> {
        if let Some((id, tool)) = parse_namespaced(name) {
            return Ok(Target::Server {
                id: id.to_string(),
                tool: tool.to_string(),
            });
        }

        if let Some(builtin) = self.builtins.get(name) {
            return Ok(Target::Builtin(builtin.clone()));
        }

        self.manager
            .active_tools()
            .await
            .into_iter()
            .find(|server| server.tools.iter().any(|t| t.name == name))
            .map(|server| Target::Server {
                id: server.id,
                tool: name.to_string(),
            })
            .ok_or_else(|| McpError::UnknownTool(name.to_string()))
    }

    /// Run a tool, retrying failed or timed out attempts.
    ///
    /// Returns the first successful result, or [`McpError::ToolFailed`]
    /// carrying the last error once every attempt has failed.
    pub async fn execute(&self, name: &str, args: Value) -> McpResult<Value> {
        let target = self.resolve(name).await?;
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            let outcome =
                tokio::time::timeout(self.policy.attempt_timeout, self.run(&target, args.clone()))
                    .await;

            let error = match outcome {
                Ok(Ok(value)) => {
                    self.stats
                        .lock()
                        .await
                        .record_success(name, started.elapsed());
                    debug!(tool = name, attempt, "Tool succeeded");
                    return Ok(value);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "attempt timed out after {}s",
                    self.policy.attempt_timeout.as_secs()
                ),
            };

            warn!(tool = name, attempt, max_attempts, error = %error, "Tool attempt failed");
            self.stats.lock().await.record_failure(name, error.clone());
            last_error = error;

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }

        info!(tool = name, attempts = max_attempts, "Tool failed on every attempt");
        Err(McpError::ToolFailed {
            tool: name.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }

    async fn run(&self, target: &Target, args: Value) -> McpResult<Value> {
        match target {
            Target::Builtin(tool) => tool.call(args).await,
            Target::Server { id, tool } => {
                let result = self.manager.execute(id, tool, args).await?;
                Ok(serde_json::to_value(result)?)
            }
        }
    }

    /// Copy of the execution statistics, keyed by requested tool name.
    pub async fn stats(&self) -> BTreeMap<String, ToolStat> {
        self.stats.lock().await.snapshot()
    }
}

/// Built-in that reports every registered server and its state.
pub struct ServersTool {
    manager: ConnectionManager,
}

impl ServersTool {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl BuiltinTool for ServersTool {
    fn name(&self) -> &str {
        "mcp_servers"
    }

    fn description(&self) -> &str {
        "List registered MCP servers with their status and tool count"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _args: Value) -> McpResult<Value> {
        Ok(serde_json::to_value(self.manager.list().await)?)
    }
}
