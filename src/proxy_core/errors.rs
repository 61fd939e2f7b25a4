//! Proxy core error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mcp_client::McpError;

/// Errors surfaced by registry, discovery and execution operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A registration or server descriptor is malformed.
    #[error("invalid spec: {reason}")]
    InvalidSpec { reason: String },

    /// Unknown tool or server id.
    #[error("{what} not found: '{id}'")]
    NotFound { what: &'static str, id: String },

    /// The tool exists but is disabled.
    #[error("tool '{tool_id}' is disabled")]
    Disabled { tool_id: String },

    /// Required input fields are missing, or the server rejected the input.
    #[error("invalid parameters for tool '{tool_id}': {reason}")]
    InvalidParameters { tool_id: String, reason: String },

    /// Execution exceeded its time bound.
    #[error("tool '{tool_id}' timed out after {timeout_ms}ms")]
    Timeout { tool_id: String, timeout_ms: u64 },

    /// The tool ran and failed.
    #[error("tool '{tool_id}' failed: {reason}")]
    RuntimeFailure { tool_id: String, reason: String },

    /// The interpreter or container engine could not be used.
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// A downstream server could not be reached.
    #[error("server '{server}' unreachable: {reason}")]
    ServerUnreachable { server: String, reason: String },

    /// A downstream server answered with something unusable.
    #[error("server '{server}' protocol error: {reason}")]
    ServerProtocolError { server: String, reason: String },

    /// Persistence failed.
    #[error("storage error: {reason}")]
    Storage { reason: String },
}

/// Machine-readable error category, carried across the request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidSpec,
    NotFound,
    Disabled,
    InvalidParameters,
    Timeout,
    RuntimeFailure,
    BackendUnavailable,
    ServerUnreachable,
    ServerProtocolError,
    Storage,
}

impl ProxyError {
    /// The error's category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSpec { .. } => ErrorKind::InvalidSpec,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Disabled { .. } => ErrorKind::Disabled,
            Self::InvalidParameters { .. } => ErrorKind::InvalidParameters,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RuntimeFailure { .. } => ErrorKind::RuntimeFailure,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::ServerUnreachable { .. } => ErrorKind::ServerUnreachable,
            Self::ServerProtocolError { .. } => ErrorKind::ServerProtocolError,
            Self::Storage { .. } => ErrorKind::Storage,
        }
    }

    pub(crate) fn tool_not_found(id: &str) -> Self {
        Self::NotFound {
            what: "tool",
            id: id.to_string(),
        }
    }

    pub(crate) fn server_not_found(id: &str) -> Self {
        Self::NotFound {
            what: "server",
            id: id.to_string(),
        }
    }

    /// Classify a downstream client error. Anything that prevented a
    /// usable exchange is `ServerUnreachable`; a well-formed exchange with
    /// an unusable answer is `ServerProtocolError`.
    pub(crate) fn from_mcp(server: &str, err: McpError) -> Self {
        match err {
            McpError::ServerError { code, message, .. } => Self::ServerProtocolError {
                server: server.to_string(),
                reason: format!("[{code}] {message}"),
            },
            McpError::ProtocolError { reason, .. } => Self::ServerProtocolError {
                server: server.to_string(),
                reason,
            },
            other @ (McpError::SpawnFailed { .. }
            | McpError::ConnectFailed { .. }
            | McpError::InitFailed { .. }
            | McpError::TransportError { .. }
            | McpError::Timeout { .. }) => Self::ServerUnreachable {
                server: server.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<rusqlite::Error> for ProxyError {
    fn from(e: rusqlite::Error) -> Self {
        ProxyError::Storage {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        ProxyError::Storage {
            reason: format!("serialization: {e}"),
        }
    }
}
