//! Shared types for the proxy core.
//!
//! Tools, servers, registration requests, execution records and the
//! aggregate snapshot served to front ends.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{ErrorKind, ProxyError};
use crate::mcp_client::ServerDescriptor;

// ─── Tool Kind ──────────────────────────────────────────────────────────────

/// How a local tool is executed. Fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// Script run by the Node.js interpreter.
    Node,
    /// Script run by the Python interpreter.
    Python,
    /// Container image run through the Docker CLI.
    Docker,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Python => "python",
            Self::Docker => "docker",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "node" | "nodejs" | "javascript" | "js" => Ok(Self::Node),
            "python" | "python3" | "py" => Ok(Self::Python),
            "docker" | "container" => Ok(Self::Docker),
            other => Err(ProxyError::InvalidSpec {
                reason: format!("unrecognized tool kind '{other}'"),
            }),
        }
    }
}

// ─── Origin ─────────────────────────────────────────────────────────────────

/// Where a tool comes from. Serialized as `local` or `remote:<server-id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ToolOrigin {
    Local,
    Remote { server: String },
}

impl ToolOrigin {
    pub fn remote(server: &str) -> Self {
        Self::Remote {
            server: server.to_string(),
        }
    }
}

impl fmt::Display for ToolOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote { server } => write!(f, "remote:{server}"),
        }
    }
}

impl From<ToolOrigin> for String {
    fn from(origin: ToolOrigin) -> Self {
        origin.to_string()
    }
}

impl TryFrom<String> for ToolOrigin {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "local" {
            return Ok(Self::Local);
        }
        match value.strip_prefix("remote:") {
            Some(server) if !server.is_empty() => Ok(Self::remote(server)),
            _ => Err(format!("invalid tool origin '{value}'")),
        }
    }
}

// ─── Input Schema ───────────────────────────────────────────────────────────

/// A tool's declared input shape. Only `required` is enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type", default = "default_schema_type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

fn default_schema_type() -> String {
    "object".into()
}

impl Default for InputSchema {
    fn default() -> Self {
        Self {
            schema_type: default_schema_type(),
            properties: serde_json::Map::new(),
            required: Vec::new(),
        }
    }
}

impl InputSchema {
    /// Read a schema published by a downstream server, ignoring parts that
    /// do not fit the `{type, properties, required}` shape.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let mut schema = Self::default();
        if let Some(t) = value.get("type").and_then(|v| v.as_str()) {
            schema.schema_type = t.to_string();
        }
        if let Some(props) = value.get("properties").and_then(|v| v.as_object()) {
            schema.properties = props.clone();
        }
        if let Some(required) = value.get("required").and_then(|v| v.as_array()) {
            schema.required = required
                .iter()
                .filter_map(|r| r.as_str().map(String::from))
                .collect();
        }
        schema
    }

    /// Required fields absent from `params`. A non-object `params` is
    /// treated as empty.
    pub fn missing_required(&self, params: &serde_json::Value) -> Vec<String> {
        let object = params.as_object();
        self.required
            .iter()
            .filter(|field| !object.is_some_and(|o| o.contains_key(field.as_str())))
            .cloned()
            .collect()
    }
}

// ─── Tool ───────────────────────────────────────────────────────────────────

/// A registered or discovered unit of invocable capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// UUIDv4 for local tools, `<server>:<name>` for discovered ones.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Execution strategy. `None` for discovered tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ToolKind>,
    /// Script path or image reference; server-side tool name when remote.
    pub entry_point: String,
    /// Opaque credentials handed to the tool process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    pub enabled: bool,
    pub origin: ToolOrigin,
    #[serde(default)]
    pub input_schema: InputSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub registered_at: DateTime<Utc>,
}

impl Tool {
    pub fn is_local(&self) -> bool {
        self.origin == ToolOrigin::Local
    }

    /// Owning server for discovered tools.
    pub fn server_id(&self) -> Option<&str> {
        match &self.origin {
            ToolOrigin::Local => None,
            ToolOrigin::Remote { server } => Some(server),
        }
    }
}

/// Id of a tool discovered on `server`.
pub fn remote_tool_id(server: &str, tool_name: &str) -> String {
    format!("{server}:{tool_name}")
}

// ─── Servers ────────────────────────────────────────────────────────────────

/// A downstream MCP server and its last known catalog.
#[derive(Debug, Clone)]
pub struct Server {
    pub id: String,
    pub descriptor: ServerDescriptor,
    pub last_discovered: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub tools: Vec<Tool>,
}

impl Server {
    pub fn new(id: &str, descriptor: ServerDescriptor) -> Self {
        Self {
            id: id.to_string(),
            descriptor,
            last_discovered: None,
            last_error: None,
            tools: Vec::new(),
        }
    }

    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            id: self.id.clone(),
            transport: self.descriptor.transport_name().to_string(),
            descriptor: self.descriptor.clone(),
            last_discovered: self.last_discovered,
            last_error: self.last_error.clone(),
            tool_count: self.tools.len(),
        }
    }
}

/// Serializable view of a [`Server`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSummary {
    pub id: String,
    pub transport: String,
    pub descriptor: ServerDescriptor,
    pub last_discovered: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub tool_count: usize,
}

// ─── Requests ───────────────────────────────────────────────────────────────

/// Input to tool registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterToolRequest {
    pub kind: String,
    pub entry_point: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub authentication: Option<serde_json::Value>,
    #[serde(default)]
    pub input_schema: Option<InputSchema>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

// ─── Execution ──────────────────────────────────────────────────────────────

/// Where an execution request is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "route", rename_all = "lowercase")]
pub enum Route {
    Adapter { kind: ToolKind },
    Proxied { server: String },
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Adapter { kind } => write!(f, "adapter({kind})"),
            Self::Proxied { server } => write!(f, "proxied({server})"),
        }
    }
}

/// Per-call execution record. Logged once and dropped.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub tool_id: String,
    pub route: Route,
    pub error: Option<ErrorKind>,
    pub elapsed_ms: u64,
}

impl ExecutionRecord {
    pub fn log(&self) {
        match self.error {
            None => tracing::info!(
                tool_id = %self.tool_id,
                route = %self.route,
                elapsed_ms = self.elapsed_ms,
                "tool executed"
            ),
            Some(kind) => tracing::warn!(
                tool_id = %self.tool_id,
                route = %self.route,
                elapsed_ms = self.elapsed_ms,
                error_kind = ?kind,
                "tool execution failed"
            ),
        }
    }
}

// ─── Aggregate View ─────────────────────────────────────────────────────────

/// Client configuration generated from enabled tools and live servers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DerivedConfig {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: BTreeMap<String, ServerDescriptor>,
}

/// A consistent point-in-time read of all proxy state.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSnapshot {
    pub servers: Vec<ServerSummary>,
    pub tools: Vec<Tool>,
    pub derived_config: DerivedConfig,
}

// ─── Tests ──────────────────────────────────────────────────────────────────
