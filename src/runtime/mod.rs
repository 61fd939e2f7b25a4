//! Runtime adapters: one execution strategy per tool kind.
//!
//! Submodules:
//! - `script`: `<interpreter> <entry_point>` for Node.js and Python tools
//! - `container`: ephemeral `docker run` per call for image tools
//! - `process`: the shared stdin/stdout contract and scoped process guard

pub mod container;
pub mod process;
pub mod script;

use std::collections::BTreeMap;
use std::time::Duration;

pub use container::ContainerAdapter;
pub use process::PreparedCommand;
pub use script::ScriptAdapter;

use crate::config::RuntimeConfig;
use crate::proxy_core::errors::ProxyError;
use crate::proxy_core::types::{Tool, ToolKind};

/// Env var carrying a tool's authentication payload as JSON.
pub const AUTH_ENV_VAR: &str = "TOOLPROXY_AUTH";

/// Env var carrying the invoked tool's id.
pub const TOOL_ID_ENV_VAR: &str = "TOOLPROXY_TOOL_ID";

/// Execution strategy for a local tool.
#[derive(Debug, Clone)]
pub enum RuntimeAdapter {
    Script(ScriptAdapter),
    Container(ContainerAdapter),
}

impl RuntimeAdapter {
    /// The adapter for `kind`, using the configured interpreters.
    pub fn for_kind(kind: ToolKind, runtimes: &RuntimeConfig) -> Self {
        match kind {
            ToolKind::Node => Self::Script(ScriptAdapter::new(&runtimes.node)),
            ToolKind::Python => Self::Script(ScriptAdapter::new(&runtimes.python)),
            ToolKind::Docker => Self::Container(ContainerAdapter::new(&runtimes.docker)),
        }
    }

    /// Interpreter or container engine behind this adapter.
    pub fn backend(&self) -> &str {
        match self {
            Self::Script(script) => script.interpreter(),
            Self::Container(container) => container.engine(),
        }
    }

    /// Resolve the command line for one invocation.
    pub fn prepare(&self, tool: &Tool) -> Result<PreparedCommand, ProxyError> {
        match self {
            Self::Script(script) => script.prepare(tool),
            Self::Container(container) => Ok(container.prepare(tool)),
        }
    }

    /// Run `tool` with `params`, bounded by `timeout`.
    pub async fn invoke(
        &self,
        tool: &Tool,
        params: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ProxyError> {
        let command = self.prepare(tool)?;
        process::run(&tool.id, command, params, timeout).await
    }
}

/// Environment for a tool process: its configured variables plus the
/// tool id and, when present, the authentication payload.
pub(crate) fn tool_env(tool: &Tool) -> BTreeMap<String, String> {
    let mut env = tool.env.clone();
    env.insert(TOOL_ID_ENV_VAR.to_string(), tool.id.clone());
    if let Some(auth) = &tool.authentication {
        env.insert(AUTH_ENV_VAR.to_string(), auth.to_string());
    }
    env
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy_core::errors::ErrorKind;
    use crate::proxy_core::types::{InputSchema, ToolOrigin};

    fn tool(kind: ToolKind, entry: &str) -> Tool {
        Tool {
            id: "t1".into(),
            name: "t".into(),
            description: String::new(),
            kind: Some(kind),
            entry_point: entry.into(),
            authentication: Some(serde_json::json!({"token": "abc"})),
            env: BTreeMap::new(),
            enabled: true,
            origin: ToolOrigin::Local,
            input_schema: InputSchema::default(),
            timeout_ms: None,
            registered_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_for_kind_selects_backend() {
        let runtimes = RuntimeConfig {
            node: "/usr/bin/node".into(),
            python: "/usr/bin/python3".into(),
            docker: "/usr/bin/docker".into(),
        };
        assert_eq!(RuntimeAdapter::for_kind(ToolKind::Node, &runtimes).backend(), "/usr/bin/node");
        assert_eq!(
            RuntimeAdapter::for_kind(ToolKind::Python, &runtimes).backend(),
            "/usr/bin/python3"
        );
        assert!(matches!(
            RuntimeAdapter::for_kind(ToolKind::Docker, &runtimes),
            RuntimeAdapter::Container(_)
        ));
    }

    #[test]
    fn test_tool_env_carries_auth() {
        let env = tool_env(&tool(ToolKind::Node, "a.js"));
        assert_eq!(env[AUTH_ENV_VAR], r#"{"token":"abc"}"#);
        assert_eq!(env[TOOL_ID_ENV_VAR], "t1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_adapter_reads_auth() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("auth.sh");
        std::fs::write(&script, "cat > /dev/null; printf '{\"result\": %s}' \"$TOOLPROXY_AUTH\"\n")
            .unwrap();

        let runtimes = RuntimeConfig {
            node: "sh".into(),
            ..RuntimeConfig::default()
        };
        let adapter = RuntimeAdapter::for_kind(ToolKind::Node, &runtimes);
        let out = adapter
            .invoke(
                &tool(ToolKind::Node, &script.display().to_string()),
                &serde_json::json!({}),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(out["token"], "abc");
    }

    #[tokio::test]
    async fn test_missing_docker_cli_is_backend_unavailable() {
        let runtimes = RuntimeConfig {
            docker: "/nonexistent/docker".into(),
            ..RuntimeConfig::default()
        };
        let adapter = RuntimeAdapter::for_kind(ToolKind::Docker, &runtimes);
        let err = adapter
            .invoke(
                &tool(ToolKind::Docker, "alpine:3"),
                &serde_json::json!({}),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    }
}
