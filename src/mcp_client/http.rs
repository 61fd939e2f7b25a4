//! JSON-RPC over streamable HTTP transport.
//!
//! Each request is a `POST` of one JSON-RPC message. Servers may answer with a
//! plain JSON body or with an SSE stream whose `data:` lines carry the
//! response. The `Mcp-Session-Id` header handed out during `initialize` is
//! echoed on every later request.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::Mutex;

use super::errors::McpError;
use super::transport::next_request_id;
use super::types::{HttpServerConfig, JsonRpcRequest, JsonRpcResponse};

const SESSION_HEADER: &str = "mcp-session-id";

/// JSON-RPC transport to a downstream server over HTTP.
pub struct HttpTransport {
    server_name: String,
    url: String,
    client: reqwest::Client,
    session_id: Mutex<Option<String>>,
}

impl HttpTransport {
    /// Build a transport for the given server. Does not touch the network.
    pub fn new(server_name: &str, config: &HttpServerConfig) -> Result<Self, McpError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                McpError::ConnectFailed {
                    name: server_name.to_string(),
                    reason: format!("invalid header name '{key}': {e}"),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| McpError::ConnectFailed {
                name: server_name.to_string(),
                reason: format!("invalid value for header '{key}': {e}"),
            })?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| McpError::ConnectFailed {
                name: server_name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server_name: server_name.to_string(),
            url: config.url.clone(),
            client,
            session_id: Mutex::new(None),
        })
    }

    /// Send a JSON-RPC request and return the server's response.
    ///
    /// HTTP pairs each response with its request, so the response id is not
    /// compared against the request id.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let req = JsonRpcRequest::new(next_request_id(), method, params);
        let body = serde_json::to_value(&req).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;

        let response = self.post(&body).await?;
        self.remember_session(response.headers()).await;

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let text = response.text().await.map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to read response body: {e}"),
        })?;

        if is_sse {
            parse_sse_response(&text).ok_or_else(|| McpError::ProtocolError {
                server: self.server_name.clone(),
                reason: "event stream carried no JSON-RPC response".into(),
            })
        } else {
            serde_json::from_str::<JsonRpcResponse>(&text).map_err(|e| McpError::ProtocolError {
                server: self.server_name.clone(),
                reason: format!("invalid JSON-RPC response: {e}"),
            })
        }
    }

    /// Send a JSON-RPC notification. The body of the reply is ignored.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut body = serde_json::json!({ "jsonrpc": "2.0", "method": method });
        if let Some(params) = params {
            body["params"] = params;
        }
        self.post(&body).await.map(|_| ())
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, McpError> {
        let session = self.session_id.lock().await.clone();
        let mut builder = self.client.post(&self.url).json(body);
        if let Some(session) = session.as_deref() {
            builder = builder.header(SESSION_HEADER, session);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                McpError::ConnectFailed {
                    name: self.server_name.clone(),
                    reason: e.to_string(),
                }
            } else {
                McpError::TransportError {
                    server: self.server_name.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        // A 404 on a session-bound request means the server dropped the
        // session; the connection must be initialized again.
        if status == StatusCode::NOT_FOUND && session.is_some() {
            *self.session_id.lock().await = None;
            return Err(McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("session expired (HTTP {status})"),
            });
        }
        if status.is_server_error() {
            return Err(McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::ProtocolError {
                server: self.server_name.clone(),
                reason: format!("HTTP {status}: {}", body.trim()),
            });
        }
        Ok(response)
    }

    async fn remember_session(&self, headers: &HeaderMap) {
        if let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            let mut session = self.session_id.lock().await;
            if session.as_deref() != Some(id) {
                tracing::debug!(server = %self.server_name, session = id, "MCP session assigned");
                *session = Some(id.to_string());
            }
        }
    }
}

/// Pull the first JSON-RPC response out of an SSE body.
fn parse_sse_response(body: &str) -> Option<JsonRpcResponse> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .find_map(|data| serde_json::from_str::<JsonRpcResponse>(data).ok())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
