//! MCP client error types.

use thiserror::Error;

/// Errors that can occur while talking to a downstream MCP server.
#[derive(Debug, Error)]
pub enum McpError {
    /// A stdio server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// An HTTP server could not be reached.
    #[error("failed to connect to server '{name}': {reason}")]
    ConnectFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// I/O failure on an established connection (closed pipe, reset socket).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server answered with something that is not valid JSON-RPC / MCP.
    #[error("protocol error from server '{server}': {reason}")]
    ProtocolError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request did not complete in time.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },
}

impl McpError {
    /// Whether the connection that produced this error should be discarded.
    ///
    /// Broken pipes and failed handshakes leave the stream in an unknown
    /// state; server-level errors do not.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            McpError::SpawnFailed { .. }
                | McpError::ConnectFailed { .. }
                | McpError::InitFailed { .. }
                | McpError::TransportError { .. }
        )
    }
}
