//! Tool operations: registration, lifecycle and execution.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::{CommandResult, ToolProxy};
use crate::proxy_core::{RegisterToolRequest, Tool};

/// Params naming a single tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRef {
    pub tool_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteToolRequest {
    pub tool_id: String,
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateToolStatusRequest {
    pub tool_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateToolConfigRequest {
    pub tool_id: String,
    pub env: BTreeMap<String, String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ToolProxy {
    /// Register a local tool and return its id.
    pub async fn register_tool(&self, req: RegisterToolRequest) -> CommandResult<String> {
        Ok(self.registry.register(req).await?)
    }

    /// Local tools only.
    pub async fn list_tools(&self) -> Vec<Tool> {
        self.registry.list().await
    }

    /// Look up one tool, local or discovered.
    pub async fn get_tool(&self, tool_id: &str) -> Option<Tool> {
        self.registry.get(tool_id).await
    }

    /// Execute a local tool.
    pub async fn execute_tool(&self, req: ExecuteToolRequest) -> CommandResult<serde_json::Value> {
        Ok(self.dispatcher.execute(&req.tool_id, req.parameters).await?)
    }

    /// Execute any tool; discovered tools are forwarded to their server and
    /// the server's result is returned as-is.
    pub async fn execute_proxy_tool(
        &self,
        req: ExecuteToolRequest,
    ) -> CommandResult<serde_json::Value> {
        Ok(self
            .dispatcher
            .execute_proxy(&req.tool_id, req.parameters)
            .await?)
    }

    /// Resolve a client-facing reference (id or unique name) to a tool id.
    pub async fn resolve_tool(&self, reference: &str) -> CommandResult<String> {
        Ok(self.dispatcher.resolve_reference(reference).await?)
    }

    pub async fn update_tool_status(&self, req: UpdateToolStatusRequest) -> CommandResult<()> {
        Ok(self.registry.set_enabled(&req.tool_id, req.enabled).await?)
    }

    pub async fn uninstall_tool(&self, req: ToolRef) -> CommandResult<()> {
        Ok(self.registry.uninstall(&req.tool_id).await?)
    }

    /// Merge environment variables into a local tool's configuration.
    pub async fn update_tool_config(&self, req: UpdateToolConfigRequest) -> CommandResult<Tool> {
        Ok(self.registry.update_config(&req.tool_id, req.env).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::in_memory_proxy;
    use super::*;
    use crate::proxy_core::ErrorKind;

    #[test]
    fn test_execute_request_defaults_parameters() {
        let req: ExecuteToolRequest =
            serde_json::from_value(serde_json::json!({"tool_id": "t1"})).unwrap();
        assert_eq!(req.parameters, serde_json::json!({}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_lifecycle_through_commands() {
        let proxy = in_memory_proxy();
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("env.sh");
        std::fs::write(&script, "cat > /dev/null; printf '{\"greeting\": \"%s\"}' \"$GREETING\"\n")
            .unwrap();

        let id = proxy
            .register_tool(RegisterToolRequest {
                kind: "python".into(),
                entry_point: script.display().to_string(),
                env: BTreeMap::from([("GREETING".to_string(), "hi".to_string())]),
                ..Default::default()
            })
            .await
            .unwrap();

        let run = || ExecuteToolRequest {
            tool_id: id.clone(),
            parameters: serde_json::json!({}),
        };
        assert_eq!(proxy.execute_tool(run()).await.unwrap()["greeting"], "hi");

        let updated = proxy
            .update_tool_config(UpdateToolConfigRequest {
                tool_id: id.clone(),
                env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            })
            .await
            .unwrap();
        assert_eq!(updated.env["GREETING"], "hello");
        assert_eq!(proxy.execute_tool(run()).await.unwrap()["greeting"], "hello");

        proxy
            .update_tool_status(UpdateToolStatusRequest {
                tool_id: id.clone(),
                enabled: false,
            })
            .await
            .unwrap();
        assert_eq!(
            proxy.execute_tool(run()).await.unwrap_err().kind,
            ErrorKind::Disabled
        );

        proxy.uninstall_tool(ToolRef { tool_id: id.clone() }).await.unwrap();
        assert_eq!(
            proxy.execute_tool(run()).await.unwrap_err().kind,
            ErrorKind::NotFound
        );
        assert_eq!(
            proxy
                .uninstall_tool(ToolRef { tool_id: id })
                .await
                .unwrap_err()
                .kind,
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_register_rejects_unknown_kind() {
        let proxy = in_memory_proxy();
        let err = proxy
            .register_tool(RegisterToolRequest {
                kind: "ruby".into(),
                entry_point: "x.rb".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidSpec);
        assert!(proxy.list_tools().await.is_empty());
    }
}
