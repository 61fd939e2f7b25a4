//! Script tools run under an interpreter (Node.js, Python).

use std::path::Path;

use super::process::PreparedCommand;
use super::tool_env;
use crate::proxy_core::errors::ProxyError;
use crate::proxy_core::types::Tool;

/// Builds `<interpreter> <entry_point>` invocations.
#[derive(Debug, Clone)]
pub struct ScriptAdapter {
    interpreter: String,
}

impl ScriptAdapter {
    pub fn new(interpreter: &str) -> Self {
        Self {
            interpreter: interpreter.to_string(),
        }
    }

    /// The interpreter this adapter runs.
    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    /// Command line for one invocation of `tool`'s script.
    pub fn prepare(&self, tool: &Tool) -> Result<PreparedCommand, ProxyError> {
        if !Path::new(&tool.entry_point).is_file() {
            return Err(ProxyError::RuntimeFailure {
                tool_id: tool.id.clone(),
                reason: format!("entry point '{}' is not a file", tool.entry_point),
            });
        }
        Ok(PreparedCommand {
            program: self.interpreter.clone(),
            args: vec![tool.entry_point.clone()],
            env: tool_env(tool),
            container: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy_core::errors::ErrorKind;
    use crate::proxy_core::types::{InputSchema, ToolKind, ToolOrigin};
    use std::collections::BTreeMap;

    fn script_tool(entry: &str) -> Tool {
        Tool {
            id: "s1".into(),
            name: "script".into(),
            description: String::new(),
            kind: Some(ToolKind::Python),
            entry_point: entry.into(),
            authentication: None,
            env: BTreeMap::new(),
            enabled: true,
            origin: ToolOrigin::Local,
            input_schema: InputSchema::default(),
            timeout_ms: None,
            registered_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_prepare_uses_interpreter_and_entry_point() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let entry = file.path().display().to_string();
        let cmd = ScriptAdapter::new("python3")
            .prepare(&script_tool(&entry))
            .unwrap();
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args, vec![entry]);
        assert!(cmd.container.is_none());
        assert!(!cmd.env.contains_key("TOOLPROXY_AUTH"));
    }

    #[test]
    fn test_missing_entry_point() {
        let err = ScriptAdapter::new("node")
            .prepare(&script_tool("/nonexistent/tool.js"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
    }
}
