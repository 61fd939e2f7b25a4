//! MCP client: downstream connections to MCP tool servers.
//!
//! This module handles:
//! - Spawning stdio server child processes and the `initialize` handshake
//! - JSON-RPC 2.0 over process stdio and over streamable HTTP
//! - A connection pool reused across discovery and proxied tool calls
//! - Parsing `tools/list` catalogs into tool definitions

pub mod client;
pub mod errors;
pub mod http;
pub mod lifecycle;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{McpClient, ToolCallResult};
pub use errors::McpError;
pub use types::{HttpServerConfig, McpToolDefinition, ServerConfig, ServerDescriptor};
