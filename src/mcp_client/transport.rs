//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with downstream server child processes:
//! - Writing JSON-RPC requests to stdin
//! - Reading JSON-RPC responses from stdout
//! - Line-delimited JSON protocol (one JSON object per line)

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

struct StdioPipes {
    writer: ChildStdin,
    reader: BufReader<ChildStdout>,
}

/// Bi-directional JSON-RPC transport over a child process's stdio.
///
/// One exchange (write request, read its response) runs at a time. A
/// request abandoned mid-read (caller timeout) leaves its late response in
/// the pipe; the next exchange skips it because the id does not match.
pub struct StdioTransport {
    server_name: String,
    pipes: Mutex<StdioPipes>,
}

impl StdioTransport {
    /// Create a new transport from a child process's stdin/stdout.
    pub fn new(server_name: &str, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            server_name: server_name.to_string(),
            pipes: Mutex::new(StdioPipes {
                writer: stdin,
                reader: BufReader::new(stdout),
            }),
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&req).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        json.push('\n');

        let mut pipes = self.pipes.lock().await;
        self.write_line(&mut pipes.writer, &json).await?;

        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = pipes
                .reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| McpError::TransportError {
                    server: self.server_name.clone(),
                    reason: format!("failed to read from stdout: {e}"),
                })?;

            if bytes_read == 0 {
                return Err(McpError::TransportError {
                    server: self.server_name.clone(),
                    reason: "server stdout closed (process may have exited)".into(),
                });
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == id => return Ok(resp),
                Ok(resp) => {
                    tracing::debug!(
                        server = %self.server_name,
                        expected = id,
                        got = resp.id,
                        "skipping stale response"
                    );
                }
                Err(_) => {
                    // Server log output or a server-initiated notification.
                    tracing::trace!(server = %self.server_name, line = trimmed, "non-response line");
                }
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let mut json = serde_json::to_string(&notification).map_err(|e| {
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        json.push('\n');

        let mut pipes = self.pipes.lock().await;
        self.write_line(&mut pipes.writer, &json).await
    }

    async fn write_line(&self, writer: &mut ChildStdin, line: &str) -> Result<(), McpError> {
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::JsonRpcError;

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_extract_result_success() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: Some(serde_json::json!({"text": "hello"})),
            error: None,
        };
        let result = extract_result(resp).unwrap();
        assert_eq!(result["text"], "hello");
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: None,
        };
        let err = extract_result(resp).unwrap_err();
        assert!(matches!(err, McpError::ServerError { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_skips_log_lines_and_stale_ids() {
        use std::process::Stdio;

        // Replies with a log line, a stale id, then echoes the real id back.
        let script = r#"
            IFS= read -r line
            id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
            echo "booting..."
            printf '{"jsonrpc":"2.0","id":0,"result":{}}\n'
            printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id"
        "#;
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let transport = StdioTransport::new(
            "fixture",
            child.stdin.take().unwrap(),
            child.stdout.take().unwrap(),
        );

        let resp = transport.request("ping", None).await.unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_reports_closed_stdout() {
        use std::process::Stdio;

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("read -r line; exit 0")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let transport = StdioTransport::new(
            "fixture",
            child.stdin.take().unwrap(),
            child.stdout.take().unwrap(),
        );

        let err = transport.request("ping", None).await.unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
    }
}
