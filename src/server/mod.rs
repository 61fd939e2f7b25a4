//! Line-delimited JSON-RPC 2.0 front end.
//!
//! Each incoming line is one request, handled in its own task. Responses go
//! through a single writer task so concurrent replies never interleave.
//! Method names are the operation names of [`ToolProxy`] plus the MCP
//! methods in [`mcp`].

pub mod mcp;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::commands::{CommandError, ToolProxy};
use crate::mcp_client::types::error_codes;

/// An incoming request or notification (no `id`).
#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<serde_json::Value>,
    method: String,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl RpcResponse {
    fn reply(id: serde_json::Value, outcome: Result<serde_json::Value, RpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            jsonrpc: "2.0",
            id,
            result,
            error,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self::new(error_codes::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    fn invalid_params(reason: impl std::fmt::Display) -> Self {
        Self::new(error_codes::INVALID_PARAMS, format!("invalid params: {reason}"))
    }
}

impl From<CommandError> for RpcError {
    fn from(e: CommandError) -> Self {
        Self {
            code: error_codes::PROXY_ERROR,
            data: Some(serde_json::json!({ "kind": e.kind })),
            message: e.message,
        }
    }
}

/// Serve requests from `input` until it closes, writing replies to `output`.
pub async fn serve<R, W>(proxy: Arc<ToolProxy>, mut input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut handlers = tokio::task::JoinSet::new();
    loop {
        // Raw bytes: a line that is not UTF-8 is a parse error for that
        // request only.
        let mut line = Vec::new();
        if input.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let proxy = Arc::clone(&proxy);
        let tx = tx.clone();
        handlers.spawn(async move {
            if let Some(response) = handle_line(&proxy, &line).await {
                match serde_json::to_string(&response) {
                    Ok(text) => {
                        let _ = tx.send(text);
                    }
                    Err(e) => tracing::error!(error = %e, "failed to serialize response"),
                }
            }
        });
        // Reap finished handlers so the set stays small on long sessions.
        while handlers.try_join_next().is_some() {}
    }

    tracing::info!("input closed, draining in-flight requests");
    while handlers.join_next().await.is_some() {}
    drop(tx);
    match writer.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(e)),
    }
}

/// Handle one raw line. Notifications produce no response.
async fn handle_line(proxy: &ToolProxy, line: &[u8]) -> Option<RpcResponse> {
    let request: RpcRequest = match serde_json::from_slice(line) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable request line");
            return Some(RpcResponse::reply(
                serde_json::Value::Null,
                Err(RpcError::new(error_codes::PARSE_ERROR, format!("parse error: {e}"))),
            ));
        }
    };

    let Some(id) = request.id else {
        tracing::debug!(method = %request.method, "notification received");
        return None;
    };

    tracing::debug!(method = %request.method, "request received");
    let params = request
        .params
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
    let outcome = dispatch(proxy, &request.method, params).await;
    if let Err(e) = &outcome {
        tracing::debug!(method = %request.method, code = e.code, message = %e.message, "request failed");
    }
    Some(RpcResponse::reply(id, outcome))
}

fn parse<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(RpcError::invalid_params)
}

fn to_value<T: Serialize>(value: T) -> Result<serde_json::Value, RpcError> {
    serde_json::to_value(value)
        .map_err(|e| RpcError::new(error_codes::INTERNAL_ERROR, e.to_string()))
}

/// Route a method call to its operation.
async fn dispatch(
    proxy: &ToolProxy,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    match method {
        "register_tool" => to_value(proxy.register_tool(parse(params)?).await?),
        "list_tools" => to_value(proxy.list_tools().await),
        "execute_tool" => Ok(proxy.execute_tool(parse(params)?).await?),
        "update_tool_status" => to_value(proxy.update_tool_status(parse(params)?).await?),
        "uninstall_tool" => to_value(proxy.uninstall_tool(parse(params)?).await?),
        "update_tool_config" => to_value(proxy.update_tool_config(parse(params)?).await?),
        "discover_tools" => to_value(proxy.discover_tools(parse(params)?).await?),
        "list_all_server_tools" => to_value(proxy.list_all_server_tools().await),
        "execute_proxy_tool" => Ok(proxy.execute_proxy_tool(parse(params)?).await?),
        "get_derived_config" => to_value(proxy.get_derived_config().await),
        "get_all_state" => to_value(proxy.get_all_state().await),
        "register_server" => to_value(proxy.register_server(parse(params)?).await?),
        "remove_server" => to_value(proxy.remove_server(parse(params)?).await?),
        "list_servers" => to_value(proxy.list_servers().await),
        "restart_server" => to_value(proxy.restart_server(parse(params)?).await?),
        "check_database_exists" => to_value(proxy.check_database_exists().await?),
        "clear_database" => to_value(proxy.clear_database().await?),
        "ping" => Ok(serde_json::json!({})),
        "initialize" => Ok(mcp::initialize_result()),
        "tools/list" => to_value(mcp::list_tools(proxy).await),
        "tools/call" => mcp::call_tool(proxy, parse(params)?).await,
        other => Err(RpcError::method_not_found(other)),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
