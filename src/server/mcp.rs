//! MCP server methods, so an assistant client can use the proxy directly.
//!
//! Tools are published under their ids. `tools/call` also accepts a unique
//! tool name.

use serde::{Deserialize, Serialize};

use super::RpcError;
use crate::commands::{ExecuteToolRequest, ToolProxy};
use crate::mcp_client::types::PROTOCOL_VERSION;
use crate::proxy_core::InputSchema;

/// A tool entry as published in `tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedTool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: InputSchema,
}

#[derive(Debug, Serialize)]
pub struct ToolListResult {
    pub tools: Vec<PublishedTool>,
}

#[derive(Debug, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default = "empty_object")]
    pub arguments: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

pub fn initialize_result() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Every enabled tool, local and discovered.
pub async fn list_tools(proxy: &ToolProxy) -> ToolListResult {
    let tools = proxy
        .list_all_server_tools()
        .await
        .into_iter()
        .filter(|t| t.enabled)
        .map(|t| PublishedTool {
            description: if t.description.is_empty() {
                t.name.clone()
            } else {
                t.description
            },
            name: t.id,
            input_schema: t.input_schema,
        })
        .collect();
    ToolListResult { tools }
}

/// Run a tool. Execution failures are reported in the result with
/// `isError`, as MCP expects; an unknown tool is a request error.
pub async fn call_tool(
    proxy: &ToolProxy,
    params: CallToolParams,
) -> Result<serde_json::Value, RpcError> {
    let tool_id = proxy.resolve_tool(&params.name).await?;
    let outcome = proxy
        .execute_proxy_tool(ExecuteToolRequest {
            tool_id: tool_id.clone(),
            parameters: params.arguments,
        })
        .await;

    Ok(match outcome {
        Ok(result) if is_tool_result(&result) => result,
        Ok(result) => {
            let mut wrapped = serde_json::json!({
                "content": [{ "type": "text", "text": render(&result) }],
            });
            // MCP only allows an object here.
            if result.is_object() {
                wrapped["structuredContent"] = result;
            }
            wrapped
        }
        Err(e) => {
            tracing::debug!(tool_id = %tool_id, kind = ?e.kind, "tools/call failed");
            serde_json::json!({
                "content": [{ "type": "text", "text": e.message }],
                "isError": true,
            })
        }
    })
}

/// Downstream servers already answer in MCP result shape; relay those as-is.
fn is_tool_result(value: &serde_json::Value) -> bool {
    value.get("content").is_some_and(|c| c.is_array())
}

fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
