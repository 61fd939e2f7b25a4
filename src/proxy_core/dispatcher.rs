//! Execution dispatcher: routes a call to a runtime adapter or a server.
//!
//! The route is resolved under the state read lock and the lock is released
//! before any work starts. The work itself runs in a spawned task, so a
//! process or container is always torn down even if the caller goes away.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::aggregator::Aggregator;
use super::errors::ProxyError;
use super::types::{ExecutionRecord, Route, Tool, ToolKind};
use crate::mcp_client::types::error_codes;
use crate::mcp_client::{McpClient, McpError, ServerDescriptor};
use crate::runtime::RuntimeAdapter;

/// A resolved execution target, detached from the state lock.
enum Target {
    Local {
        tool: Tool,
        kind: ToolKind,
        adapter: RuntimeAdapter,
    },
    Remote {
        tool: Tool,
        server: String,
        descriptor: ServerDescriptor,
    },
}

impl Target {
    fn tool(&self) -> &Tool {
        match self {
            Self::Local { tool, .. } | Self::Remote { tool, .. } => tool,
        }
    }

    fn route(&self) -> Route {
        match self {
            Self::Local { kind, .. } => Route::Adapter { kind: *kind },
            Self::Remote { server, .. } => Route::Proxied {
                server: server.clone(),
            },
        }
    }
}

/// Routes execution requests against current state.
pub struct Dispatcher {
    agg: Arc<Aggregator>,
    client: Arc<McpClient>,
    default_timeout_ms: u64,
}

impl Dispatcher {
    pub fn new(agg: Arc<Aggregator>, client: Arc<McpClient>, default_timeout_ms: u64) -> Self {
        Self {
            agg,
            client,
            default_timeout_ms,
        }
    }

    /// Execute a local tool.
    ///
    /// Discovered tools are not addressable here; use [`Self::execute_proxy`].
    pub async fn execute(
        &self,
        tool_id: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ProxyError> {
        let target = self.resolve(tool_id, &params, false).await?;
        self.run(target, params).await
    }

    /// Execute any tool, forwarding discovered ones to their server.
    pub async fn execute_proxy(
        &self,
        tool_id: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ProxyError> {
        let target = self.resolve(tool_id, &params, true).await?;
        self.run(target, params).await
    }

    /// Map a tool reference to an id: an exact id first, else a name that
    /// matches exactly one enabled tool.
    pub async fn resolve_reference(&self, reference: &str) -> Result<String, ProxyError> {
        let state = self.agg.read().await;
        if state.find_tool(reference).is_some() {
            return Ok(reference.to_string());
        }
        let matches: Vec<String> = state
            .all_tools()
            .into_iter()
            .filter(|t| t.enabled && t.name == reference)
            .map(|t| t.id)
            .collect();
        match matches.as_slice() {
            [only] => Ok(only.clone()),
            [] => Err(ProxyError::tool_not_found(reference)),
            _ => Err(ProxyError::InvalidSpec {
                reason: format!(
                    "tool name '{reference}' is ambiguous; use one of: {}",
                    matches.join(", ")
                ),
            }),
        }
    }

    async fn resolve(
        &self,
        tool_id: &str,
        params: &serde_json::Value,
        allow_remote: bool,
    ) -> Result<Target, ProxyError> {
        let state = self.agg.read().await;
        let tool = state
            .find_tool(tool_id)
            .filter(|t| allow_remote || t.is_local())
            .ok_or_else(|| ProxyError::tool_not_found(tool_id))?;

        if !tool.enabled {
            return Err(ProxyError::Disabled {
                tool_id: tool_id.to_string(),
            });
        }
        let missing = tool.input_schema.missing_required(params);
        if !missing.is_empty() {
            return Err(ProxyError::InvalidParameters {
                tool_id: tool_id.to_string(),
                reason: format!("missing required fields: {}", missing.join(", ")),
            });
        }

        match (tool.kind, tool.server_id()) {
            (Some(kind), None) => Ok(Target::Local {
                kind,
                adapter: RuntimeAdapter::for_kind(kind, self.agg.runtimes()),
                tool: tool.clone(),
            }),
            (_, Some(server)) => {
                let descriptor = state
                    .servers
                    .get(server)
                    .map(|s| s.descriptor.clone())
                    .ok_or_else(|| ProxyError::server_not_found(server))?;
                Ok(Target::Remote {
                    server: server.to_string(),
                    descriptor,
                    tool: tool.clone(),
                })
            }
            (None, None) => Err(ProxyError::InvalidSpec {
                reason: format!("tool '{tool_id}' has no execution kind"),
            }),
        }
    }

    async fn run(
        &self,
        target: Target,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ProxyError> {
        let tool_id = target.tool().id.clone();
        let route = target.route();
        let timeout = Duration::from_millis(
            target.tool().timeout_ms.unwrap_or(self.default_timeout_ms),
        );
        let client = Arc::clone(&self.client);
        let start = Instant::now();

        let task = tokio::spawn(async move {
            match target {
                Target::Local { tool, adapter, .. } => {
                    tracing::debug!(tool_id = %tool.id, backend = adapter.backend(), "invoking local tool");
                    adapter.invoke(&tool, &params, timeout).await
                }
                Target::Remote {
                    tool,
                    server,
                    descriptor,
                } => client
                    .call_tool(&server, &descriptor, &tool.entry_point, params, timeout)
                    .await
                    .map(|call| call.result)
                    .map_err(|e| remote_error(&tool.id, &server, e)),
            }
        });

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(ProxyError::RuntimeFailure {
                tool_id: tool_id.clone(),
                reason: format!("execution task failed: {e}"),
            }),
        };

        ExecutionRecord {
            tool_id,
            route,
            error: outcome.as_ref().err().map(ProxyError::kind),
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
        .log();
        outcome
    }
}

/// Classify a failed downstream `tools/call`.
fn remote_error(tool_id: &str, server: &str, err: McpError) -> ProxyError {
    match err {
        McpError::ServerError { code, message, .. } if code == error_codes::INVALID_PARAMS => {
            ProxyError::InvalidParameters {
                tool_id: tool_id.to_string(),
                reason: message,
            }
        }
        McpError::ServerError { code, message, .. } => ProxyError::RuntimeFailure {
            tool_id: tool_id.to_string(),
            reason: format!("[{code}] {message}"),
        },
        McpError::Timeout { timeout_ms, .. } => ProxyError::Timeout {
            tool_id: tool_id.to_string(),
            timeout_ms,
        },
        other => ProxyError::from_mcp(server, other),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
