//! MCP client: a pool of live downstream server connections.
//!
//! Connections are opened lazily, reused across discovery and tool calls,
//! and discarded when an error leaves them in an unknown state. The next
//! request to that server reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::errors::McpError;
use super::http::HttpTransport;
use super::lifecycle::{self, ManagedServer};
use super::transport::extract_result;
use super::types::{JsonRpcResponse, McpToolDefinition, ServerDescriptor};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for the initialize handshake (ms).
pub const DEFAULT_INIT_TIMEOUT_MS: u64 = 30_000;

// ─── Connections ─────────────────────────────────────────────────────────────

/// An established, initialized connection to one downstream server.
pub enum ServerConnection {
    Stdio(ManagedServer),
    Http(HttpTransport),
}

impl ServerConnection {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        match self {
            Self::Stdio(server) => server.transport.request(method, params).await,
            Self::Http(transport) => transport.request(method, params).await,
        }
    }

    async fn is_alive(&self) -> bool {
        match self {
            Self::Stdio(server) => server.is_alive().await,
            Self::Http(_) => true,
        }
    }

    async fn close(&self) {
        if let Self::Stdio(server) = self {
            server.shutdown().await;
        }
    }
}

/// Raw result of a downstream `tools/call`.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub server: String,
    pub tool_name: String,
    pub result: serde_json::Value,
    pub execution_time_ms: u64,
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// One server's connection slot. Locking it serializes connects to that
/// server without blocking the others.
type Slot = Arc<Mutex<Option<Arc<ServerConnection>>>>;

/// Connection pool over all downstream servers the proxy talks to.
pub struct McpClient {
    slots: Mutex<HashMap<String, Slot>>,
    init_timeout: Duration,
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new(DEFAULT_INIT_TIMEOUT_MS)
    }
}

impl McpClient {
    /// Create an empty pool.
    pub fn new(init_timeout_ms: u64) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            init_timeout: Duration::from_millis(init_timeout_ms),
        }
    }

    // ─── Connections ─────────────────────────────────────────────────────

    async fn slot(&self, server: &str) -> Slot {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(server.to_string()).or_default())
    }

    /// Return the live connection for `server`, opening one if needed.
    pub async fn connect(
        &self,
        server: &str,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<ServerConnection>, McpError> {
        let slot = self.slot(server).await;
        let mut current = slot.lock().await;

        if let Some(existing) = current.as_ref() {
            if existing.is_alive().await {
                return Ok(Arc::clone(existing));
            }
            tracing::info!(server, "server connection is dead, reconnecting");
            *current = None;
        }

        let connection = Arc::new(self.open(server, descriptor).await?);
        *current = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn open(
        &self,
        server: &str,
        descriptor: &ServerDescriptor,
    ) -> Result<ServerConnection, McpError> {
        tracing::debug!(server, transport = descriptor.transport_name(), "connecting");
        match descriptor {
            ServerDescriptor::Stdio(config) => {
                let managed = lifecycle::spawn_server(server, config, self.init_timeout).await?;
                Ok(ServerConnection::Stdio(managed))
            }
            ServerDescriptor::Http(config) => {
                let transport = HttpTransport::new(server, config)?;
                let handshake = async {
                    let result = extract_result(
                        transport
                            .request("initialize", Some(lifecycle::initialize_params()))
                            .await?,
                    )?;
                    lifecycle::parse_initialize_result(server, result)?;
                    transport.notify("notifications/initialized", None).await
                };
                match tokio::time::timeout(self.init_timeout, handshake).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e @ McpError::ConnectFailed { .. })) => return Err(e),
                    Ok(Err(e)) => {
                        return Err(McpError::InitFailed {
                            name: server.to_string(),
                            reason: e.to_string(),
                        })
                    }
                    Err(_) => {
                        return Err(McpError::InitFailed {
                            name: server.to_string(),
                            reason: format!(
                                "initialization timed out after {}ms",
                                self.init_timeout.as_millis()
                            ),
                        })
                    }
                }
                tracing::info!(server, url = %config.url, "server initialized");
                Ok(ServerConnection::Http(transport))
            }
        }
    }

    /// Drop and shut down the connection to `server`, if any.
    pub async fn disconnect(&self, server: &str) {
        let slot = self.slots.lock().await.remove(server);
        if let Some(slot) = slot {
            let taken = slot.lock().await.take();
            if let Some(connection) = taken {
                connection.close().await;
            }
        }
    }

    /// Shut down every pooled connection.
    pub async fn shutdown_all(&self) {
        let drained: Vec<_> = self.slots.lock().await.drain().collect();
        for (_, slot) in drained {
            let taken = slot.lock().await.take();
            if let Some(connection) = taken {
                connection.close().await;
            }
        }
    }

    /// Names of servers with an open connection.
    pub async fn connected_servers(&self) -> Vec<String> {
        let slots: Vec<_> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect();
        let mut connected = Vec::new();
        for (name, slot) in slots {
            if slot.lock().await.is_some() {
                connected.push(name);
            }
        }
        connected
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Send one request over a pooled connection, bounded by `timeout`.
    ///
    /// Connection-fatal errors evict the connection. A timeout does not: the
    /// stdio transport skips the late response when it eventually arrives.
    async fn request(
        &self,
        server: &str,
        descriptor: &ServerDescriptor,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let connection = self.connect(server, descriptor).await?;

        let outcome = match tokio::time::timeout(timeout, connection.request(method, params)).await
        {
            Ok(Ok(response)) => extract_result(response),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(McpError::Timeout {
                server: server.to_string(),
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        if let Err(e) = &outcome {
            if e.is_connection_fatal() {
                tracing::warn!(server, method, error = %e, "dropping server connection");
                self.evict(server, &connection).await;
            }
        }
        outcome
    }

    async fn evict(&self, server: &str, connection: &Arc<ServerConnection>) {
        let slot = self.slot(server).await;
        {
            let mut current = slot.lock().await;
            if current
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, connection))
            {
                *current = None;
            }
        }
        connection.close().await;
    }

    /// Fetch the server's raw tool catalog entries.
    ///
    /// Entries are returned unparsed so the caller can validate and skip
    /// malformed ones individually.
    pub async fn list_tools(
        &self,
        server: &str,
        descriptor: &ServerDescriptor,
        timeout: Duration,
    ) -> Result<Vec<serde_json::Value>, McpError> {
        let result = self
            .request(server, descriptor, "tools/list", Some(serde_json::json!({})), timeout)
            .await?;
        extract_tool_entries(server, result)
    }

    /// Invoke `tool_name` on the server and return its result payload.
    pub async fn call_tool(
        &self,
        server: &str,
        descriptor: &ServerDescriptor,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolCallResult, McpError> {
        let start = Instant::now();
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let result = self
            .request(server, descriptor, "tools/call", Some(params), timeout)
            .await?;

        Ok(ToolCallResult {
            server: server.to_string(),
            tool_name: tool_name.to_string(),
            result,
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }
}

// ─── Catalog Parsing ─────────────────────────────────────────────────────────

/// Locate the tool array in a `tools/list` result.
///
/// Accepts `{"tools": [...]}`, a bare array, or `{"result": {"tools": [...]}}`
/// from servers that double-wrap their payload.
pub fn extract_tool_entries(
    server: &str,
    result: serde_json::Value,
) -> Result<Vec<serde_json::Value>, McpError> {
    match result {
        serde_json::Value::Array(entries) => Ok(entries),
        serde_json::Value::Object(mut map) => {
            if let Some(serde_json::Value::Array(entries)) = map.remove("tools") {
                return Ok(entries);
            }
            if let Some(inner) = map.remove("result") {
                return extract_tool_entries(server, inner);
            }
            Err(McpError::ProtocolError {
                server: server.to_string(),
                reason: "tools/list result has no tools array".into(),
            })
        }
        other => Err(McpError::ProtocolError {
            server: server.to_string(),
            reason: format!("tools/list returned unexpected payload: {other}"),
        }),
    }
}

/// Parse one catalog entry, rejecting entries without a usable name.
pub fn parse_tool_entry(entry: serde_json::Value) -> Result<McpToolDefinition, String> {
    let def: McpToolDefinition =
        serde_json::from_value(entry).map_err(|e| format!("malformed tool entry: {e}"))?;
    if def.name.trim().is_empty() {
        return Err("tool entry has an empty name".into());
    }
    if let Some(schema) = &def.input_schema {
        if !schema.is_object() {
            return Err(format!("tool '{}' has a non-object inputSchema", def.name));
        }
    }
    Ok(def)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
