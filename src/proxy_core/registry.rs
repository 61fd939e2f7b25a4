//! Tool registry: registration and lifecycle of locally installed tools.
//!
//! Every mutation is written to the store first and applied in memory only
//! after the write succeeds, both under the state write lock. A failed write
//! leaves the registry untouched.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::aggregator::Aggregator;
use super::errors::ProxyError;
use super::types::{RegisterToolRequest, Tool, ToolKind, ToolOrigin};

/// Registry of local tools, backed by the shared [`Aggregator`].
#[derive(Clone)]
pub struct ToolRegistry {
    agg: Arc<Aggregator>,
}

impl ToolRegistry {
    pub fn new(agg: Arc<Aggregator>) -> Self {
        Self { agg }
    }

    /// Register a local tool and return its id.
    ///
    /// The tool is persisted before the id is returned, so any later call
    /// observes it.
    pub async fn register(&self, req: RegisterToolRequest) -> Result<String, ProxyError> {
        let kind: ToolKind = req.kind.parse()?;
        let entry_point = req.entry_point.trim().to_string();
        if entry_point.is_empty() {
            return Err(ProxyError::InvalidSpec {
                reason: "entry_point must not be empty".into(),
            });
        }
        if req.timeout_ms == Some(0) {
            return Err(ProxyError::InvalidSpec {
                reason: "timeout_ms must be greater than zero".into(),
            });
        }

        let name = req
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| default_tool_name(kind, &entry_point));

        let tool = Tool {
            id: Uuid::new_v4().to_string(),
            name,
            description: req.description,
            kind: Some(kind),
            entry_point,
            authentication: req.authentication,
            env: req.env,
            enabled: true,
            origin: ToolOrigin::Local,
            input_schema: req.input_schema.unwrap_or_default(),
            timeout_ms: req.timeout_ms,
            registered_at: Utc::now(),
        };

        let mut state = self.agg.write().await;
        self.agg.with_store(|store| store.insert_tool(&tool))?;
        tracing::info!(tool_id = %tool.id, name = %tool.name, kind = %kind, "tool registered");
        let id = tool.id.clone();
        state.tools.insert(id.clone(), tool);
        Ok(id)
    }

    /// Enable or disable a tool, local or discovered.
    ///
    /// A discovered tool's flag is kept in memory and reapplied on every
    /// rediscovery of its server.
    pub async fn set_enabled(&self, tool_id: &str, enabled: bool) -> Result<(), ProxyError> {
        let mut state = self.agg.write().await;

        if state.tools.contains_key(tool_id) {
            self.agg
                .with_store(|store| store.set_tool_enabled(tool_id, enabled))?;
            if let Some(tool) = state.tools.get_mut(tool_id) {
                tool.enabled = enabled;
            }
            tracing::info!(tool_id, enabled, "tool status updated");
            return Ok(());
        }

        let server_id = state
            .find_tool(tool_id)
            .and_then(|t| t.server_id())
            .map(String::from)
            .ok_or_else(|| ProxyError::tool_not_found(tool_id))?;

        if enabled {
            state.disabled_remote.remove(tool_id);
        } else {
            state.disabled_remote.insert(tool_id.to_string());
        }
        if let Some(server) = state.servers.get_mut(&server_id) {
            for tool in server.tools.iter_mut().filter(|t| t.id == tool_id) {
                tool.enabled = enabled;
            }
        }
        tracing::info!(tool_id, server = %server_id, enabled, "discovered tool status updated");
        Ok(())
    }

    /// Remove a local tool. In-flight executions keep running.
    pub async fn uninstall(&self, tool_id: &str) -> Result<(), ProxyError> {
        let mut state = self.agg.write().await;
        if !state.tools.contains_key(tool_id) {
            return Err(ProxyError::tool_not_found(tool_id));
        }
        self.agg.with_store(|store| store.delete_tool(tool_id))?;
        state.tools.remove(tool_id);
        tracing::info!(tool_id, "tool uninstalled");
        Ok(())
    }

    /// All local tools.
    pub async fn list(&self) -> Vec<Tool> {
        self.agg.read().await.local_tools()
    }

    /// Look up any tool, local or discovered.
    pub async fn get(&self, tool_id: &str) -> Option<Tool> {
        self.agg.read().await.find_tool(tool_id).cloned()
    }

    /// Merge environment variables into a local tool's configuration.
    ///
    /// An empty value removes the variable.
    pub async fn update_config(
        &self,
        tool_id: &str,
        env: BTreeMap<String, String>,
    ) -> Result<Tool, ProxyError> {
        let mut state = self.agg.write().await;
        let current = state
            .tools
            .get(tool_id)
            .ok_or_else(|| ProxyError::tool_not_found(tool_id))?;

        let mut merged = current.env.clone();
        for (key, value) in env {
            if key.trim().is_empty() {
                return Err(ProxyError::InvalidSpec {
                    reason: "environment variable names must not be empty".into(),
                });
            }
            if value.is_empty() {
                merged.remove(&key);
            } else {
                merged.insert(key, value);
            }
        }

        self.agg
            .with_store(|store| store.update_tool_env(tool_id, &merged))?;
        let tool = state
            .tools
            .get_mut(tool_id)
            .ok_or_else(|| ProxyError::tool_not_found(tool_id))?;
        tool.env = merged;
        tracing::info!(tool_id, vars = tool.env.len(), "tool config updated");
        Ok(tool.clone())
    }

    /// Replace the in-memory registry with what the store holds.
    pub async fn load_persisted(&self) -> Result<usize, ProxyError> {
        let mut state = self.agg.write().await;
        let tools = self.agg.with_store(|store| store.load_tools())?;
        state.tools = tools.into_iter().map(|t| (t.id.clone(), t)).collect();
        tracing::info!(count = state.tools.len(), "persisted tools loaded");
        Ok(state.tools.len())
    }

    /// Wipe all persisted and in-memory state, servers included.
    pub async fn clear(&self) -> Result<(), ProxyError> {
        let mut state = self.agg.write().await;
        self.agg.with_store(|store| store.clear())?;
        state.tools.clear();
        state.servers.clear();
        state.disabled_remote.clear();
        tracing::warn!("registry database cleared");
        Ok(())
    }
}

/// Name used when registration omits one: the entry point's file stem,
/// without an image tag or digest for containers.
fn default_tool_name(kind: ToolKind, entry_point: &str) -> String {
    let stem = Path::new(entry_point)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(entry_point);
    let stem = match kind {
        ToolKind::Docker => entry_point
            .rsplit('/')
            .next()
            .and_then(|last| last.split(['@', ':']).next())
            .unwrap_or(stem),
        ToolKind::Node | ToolKind::Python => stem,
    };
    if stem.is_empty() {
        entry_point.to_string()
    } else {
        stem.to_string()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
