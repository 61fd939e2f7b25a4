//! Containerized tools, run through the Docker CLI.
//!
//! One ephemeral container per call: `docker run --rm -i --name <unique>`.
//! The unique name lets teardown force-remove a container whose CLI client
//! was killed before Docker could clean it up.

use std::process::Stdio;

use tokio::process::Command;
use uuid::Uuid;

use super::process::PreparedCommand;
use super::tool_env;
use crate::proxy_core::types::Tool;

/// Prefix for container names created by the proxy.
pub const CONTAINER_PREFIX: &str = "toolproxy-";

/// Builds `docker run` invocations for container tools.
#[derive(Debug, Clone)]
pub struct ContainerAdapter {
    docker: String,
}

impl ContainerAdapter {
    pub fn new(docker: &str) -> Self {
        Self {
            docker: docker.to_string(),
        }
    }

    /// The Docker CLI this adapter runs.
    pub fn engine(&self) -> &str {
        &self.docker
    }

    /// Command line for one invocation of `tool`'s image.
    ///
    /// Environment values are handed to the CLI process and forwarded by
    /// name (`-e KEY`), so they never appear in the argument list.
    pub fn prepare(&self, tool: &Tool) -> PreparedCommand {
        let name = format!("{CONTAINER_PREFIX}{}", Uuid::new_v4());
        let env = tool_env(tool);

        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            name.clone(),
        ];
        for key in env.keys() {
            args.push("-e".to_string());
            args.push(key.clone());
        }
        args.push(tool.entry_point.clone());

        PreparedCommand {
            program: self.docker.clone(),
            args,
            env,
            container: Some(name),
        }
    }
}

/// Force-remove a container and wait for the CLI to finish.
pub async fn remove_container(docker: &str, name: &str) {
    let status = Command::new(docker)
        .args(["rm", "-f", name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(s) if s.success() => tracing::debug!(container = name, "container removed"),
        Ok(s) => tracing::debug!(container = name, code = s.code(), "container already gone"),
        Err(e) => tracing::warn!(container = name, error = %e, "failed to remove container"),
    }
}

/// Force-remove a container from a synchronous context (a `Drop`).
///
/// Runs on the current Tokio runtime when there is one; otherwise the CLI
/// is started and left to finish on its own.
pub fn remove_container_detached(docker: String, name: String) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                remove_container(&docker, &name).await;
            });
        }
        Err(_) => {
            let spawned = std::process::Command::new(&docker)
                .args(["rm", "-f", &name])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
            if let Err(e) = spawned {
                tracing::warn!(container = %name, error = %e, "failed to remove container");
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy_core::types::{InputSchema, ToolKind, ToolOrigin};
    use std::collections::BTreeMap;

    fn image_tool(auth: Option<serde_json::Value>) -> Tool {
        Tool {
            id: "c1".into(),
            name: "pdf".into(),
            description: String::new(),
            kind: Some(ToolKind::Docker),
            entry_point: "ghcr.io/acme/pdf:1".into(),
            authentication: auth,
            env: BTreeMap::from([("LANG".to_string(), "C".to_string())]),
            enabled: true,
            origin: ToolOrigin::Local,
            input_schema: InputSchema::default(),
            timeout_ms: None,
            registered_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_prepare_builds_run_command() {
        let adapter = ContainerAdapter::new("docker");
        let cmd = adapter.prepare(&image_tool(Some(serde_json::json!({"key": "k"}))));

        assert_eq!(cmd.program, "docker");
        assert_eq!(cmd.args[..4], ["run", "--rm", "-i", "--name"]);
        let name = cmd.container.clone().unwrap();
        assert!(name.starts_with(CONTAINER_PREFIX));
        assert_eq!(cmd.args[4], name);
        assert_eq!(cmd.args.last().map(String::as_str), Some("ghcr.io/acme/pdf:1"));

        // Values travel in the environment, only names on the command line.
        assert!(cmd.args.contains(&"LANG".to_string()));
        assert!(cmd.args.contains(&"TOOLPROXY_AUTH".to_string()));
        assert!(!cmd.args.iter().any(|a| a.contains("\"key\"")));
        assert_eq!(cmd.env["TOOLPROXY_AUTH"], r#"{"key":"k"}"#);
    }

    #[test]
    fn test_container_names_are_unique() {
        let adapter = ContainerAdapter::new("docker");
        let tool = image_tool(None);
        assert_ne!(adapter.prepare(&tool).container, adapter.prepare(&tool).container);
    }

    #[tokio::test]
    async fn test_remove_with_missing_cli_does_not_panic() {
        remove_container("/nonexistent/docker", "toolproxy-test").await;
        remove_container_detached("/nonexistent/docker".into(), "toolproxy-test".into());
    }
}
