//! Canonical proxy state and atomic multi-part reads.
//!
//! Local tools, discovered catalogs and the remote-disable set live behind a
//! single `RwLock`. Anything a front end needs to see together (servers,
//! tools, derived config) is computed from one read guard, so a concurrent
//! writer can never tear the view. Lock order is state, then store; no
//! guard is ever held across process or network I/O.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::database::RegistryStore;
use super::errors::ProxyError;
use super::types::{AggregateSnapshot, DerivedConfig, Server, ServerSummary, Tool, ToolKind};
use crate::config::RuntimeConfig;
use crate::mcp_client::{ServerConfig, ServerDescriptor};

// ─── State ──────────────────────────────────────────────────────────────────

/// Everything the proxy knows, guarded as one unit.
#[derive(Debug, Default)]
pub struct ProxyState {
    /// Locally registered tools by id.
    pub tools: HashMap<String, Tool>,
    /// Downstream servers by id, each with its cached catalog.
    pub servers: HashMap<String, Server>,
    /// Discovered tool ids the user disabled. Survives rediscovery.
    pub disabled_remote: HashSet<String>,
}

impl ProxyState {
    /// Look up a tool by id across local and discovered tools.
    pub fn find_tool(&self, tool_id: &str) -> Option<&Tool> {
        if let Some(tool) = self.tools.get(tool_id) {
            return Some(tool);
        }
        let (server, _) = tool_id.split_once(':')?;
        self.servers
            .get(server)?
            .tools
            .iter()
            .find(|t| t.id == tool_id)
    }

    /// Local tools sorted by registration time.
    pub fn local_tools(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self.tools.values().cloned().collect();
        tools.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        tools
    }

    /// Local tools followed by every server's cached catalog.
    pub fn all_tools(&self) -> Vec<Tool> {
        let mut tools = self.local_tools();
        let mut server_ids: Vec<&String> = self.servers.keys().collect();
        server_ids.sort();
        for id in server_ids {
            if let Some(server) = self.servers.get(id) {
                tools.extend(server.tools.iter().cloned());
            }
        }
        tools
    }

    /// Server summaries sorted by id.
    pub fn server_summaries(&self) -> Vec<ServerSummary> {
        let mut servers: Vec<ServerSummary> =
            self.servers.values().map(Server::summary).collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    /// Client configuration for every enabled local tool and every server
    /// exposing at least one enabled tool.
    pub fn derive_config(&self, runtimes: &RuntimeConfig) -> DerivedConfig {
        let mut mcp_servers: BTreeMap<String, ServerDescriptor> = BTreeMap::new();

        let mut server_ids: Vec<&String> = self.servers.keys().collect();
        server_ids.sort();
        for id in server_ids {
            let Some(server) = self.servers.get(id) else {
                continue;
            };
            if server.tools.iter().any(|t| t.enabled) {
                mcp_servers.insert(server.id.clone(), server.descriptor.clone());
            }
        }

        for tool in self.local_tools().into_iter().filter(|t| t.enabled) {
            let Some(kind) = tool.kind else { continue };
            let mut key = tool.name.clone();
            if mcp_servers.contains_key(&key) {
                key = format!("{}-{}", tool.name, short_id(&tool.id));
            }
            mcp_servers.insert(key, local_invocation(&tool, kind, runtimes));
        }

        DerivedConfig { mcp_servers }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// How a client would launch a local tool directly.
fn local_invocation(tool: &Tool, kind: ToolKind, runtimes: &RuntimeConfig) -> ServerDescriptor {
    let (command, args) = match kind {
        ToolKind::Node => (runtimes.node.clone(), vec![tool.entry_point.clone()]),
        ToolKind::Python => (runtimes.python.clone(), vec![tool.entry_point.clone()]),
        ToolKind::Docker => {
            let mut args = vec!["run".to_string(), "--rm".to_string(), "-i".to_string()];
            for key in tool.env.keys() {
                args.push("-e".to_string());
                args.push(key.clone());
            }
            args.push(tool.entry_point.clone());
            (runtimes.docker.clone(), args)
        }
    };
    ServerDescriptor::Stdio(ServerConfig {
        command,
        args,
        env: tool.env.clone(),
        cwd: None,
    })
}

// ─── Aggregator ─────────────────────────────────────────────────────────────

/// Owner of the proxy state and its durable store.
pub struct Aggregator {
    state: RwLock<ProxyState>,
    store: Mutex<RegistryStore>,
    runtimes: RuntimeConfig,
}

impl Aggregator {
    pub fn new(store: RegistryStore, runtimes: RuntimeConfig) -> Self {
        Self {
            state: RwLock::new(ProxyState::default()),
            store: Mutex::new(store),
            runtimes,
        }
    }

    pub fn runtimes(&self) -> &RuntimeConfig {
        &self.runtimes
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, ProxyState> {
        self.state.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, ProxyState> {
        self.state.write().await
    }

    /// Run a synchronous store operation.
    pub(crate) fn with_store<T>(
        &self,
        op: impl FnOnce(&RegistryStore) -> Result<T, ProxyError>,
    ) -> Result<T, ProxyError> {
        let store = self.store.lock().map_err(|_| ProxyError::Storage {
            reason: "registry store lock poisoned".into(),
        })?;
        op(&store)
    }

    /// Servers, tools and derived config from one read critical section.
    pub async fn snapshot(&self) -> AggregateSnapshot {
        let state = self.state.read().await;
        AggregateSnapshot {
            servers: state.server_summaries(),
            tools: state.all_tools(),
            derived_config: state.derive_config(&self.runtimes),
        }
    }

    /// Freshly derived client configuration.
    pub async fn derived_config(&self) -> DerivedConfig {
        self.state.read().await.derive_config(&self.runtimes)
    }

    /// Local tools plus every cached catalog.
    pub async fn list_all(&self) -> Vec<Tool> {
        self.state.read().await.all_tools()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::HttpServerConfig;
    use crate::proxy_core::types::{remote_tool_id, InputSchema, ToolOrigin};
    use chrono::Utc;

    fn local(id: &str, name: &str, kind: ToolKind) -> Tool {
        Tool {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            kind: Some(kind),
            entry_point: format!("/tools/{name}"),
            authentication: None,
            env: BTreeMap::new(),
            enabled: true,
            origin: ToolOrigin::Local,
            input_schema: InputSchema::default(),
            timeout_ms: None,
            registered_at: Utc::now(),
        }
    }

    fn remote(server: &str, name: &str) -> Tool {
        Tool {
            id: remote_tool_id(server, name),
            name: name.into(),
            description: String::new(),
            kind: None,
            entry_point: name.into(),
            authentication: None,
            env: BTreeMap::new(),
            enabled: true,
            origin: ToolOrigin::remote(server),
            input_schema: InputSchema::default(),
            timeout_ms: None,
            registered_at: Utc::now(),
        }
    }

    fn http_server(id: &str, tools: Vec<Tool>) -> Server {
        let mut server = Server::new(
            id,
            ServerDescriptor::Http(HttpServerConfig {
                url: format!("http://localhost/{id}"),
                headers: BTreeMap::new(),
            }),
        );
        server.tools = tools;
        server
    }

    #[test]
    fn test_find_tool_local_and_remote() {
        let mut state = ProxyState::default();
        state
            .tools
            .insert("abc".into(), local("abc", "echo", ToolKind::Node));
        state
            .servers
            .insert("web".into(), http_server("web", vec![remote("web", "fetch")]));

        assert!(state.find_tool("abc").is_some());
        assert!(state.find_tool("web:fetch").is_some());
        assert!(state.find_tool("web:missing").is_none());
        assert!(state.find_tool("other:fetch").is_none());
    }

    #[test]
    fn test_derived_config_lists_enabled_only() {
        let runtimes = RuntimeConfig::default();
        let mut state = ProxyState::default();
        state
            .tools
            .insert("a1".into(), local("a1", "echo", ToolKind::Python));
        let mut off = local("b2", "off", ToolKind::Node);
        off.enabled = false;
        state.tools.insert("b2".into(), off);

        let mut disabled_remote = remote("dead", "x");
        disabled_remote.enabled = false;
        state
            .servers
            .insert("dead".into(), http_server("dead", vec![disabled_remote]));
        state
            .servers
            .insert("web".into(), http_server("web", vec![remote("web", "fetch")]));

        let config = state.derive_config(&runtimes);
        let keys: Vec<&str> = config.mcp_servers.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["echo", "web"]);

        match &config.mcp_servers["echo"] {
            ServerDescriptor::Stdio(c) => {
                assert_eq!(c.command, runtimes.python);
                assert_eq!(c.args, vec!["/tools/echo".to_string()]);
            }
            other => panic!("expected stdio, got {other:?}"),
        }
    }

    #[test]
    fn test_derived_config_disambiguates_names() {
        let runtimes = RuntimeConfig::default();
        let mut state = ProxyState::default();
        state
            .servers
            .insert("echo".into(), http_server("echo", vec![remote("echo", "x")]));
        state.tools.insert(
            "12345678-aaaa".into(),
            local("12345678-aaaa", "echo", ToolKind::Docker),
        );

        let config = state.derive_config(&runtimes);
        assert!(config.mcp_servers.contains_key("echo"));
        match &config.mcp_servers["echo-12345678"] {
            ServerDescriptor::Stdio(c) => {
                assert_eq!(c.args[..3], ["run", "--rm", "-i"]);
                assert_eq!(c.args.last().map(String::as_str), Some("/tools/echo"));
            }
            other => panic!("expected stdio, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_snapshot_is_consistent() {
        let agg = Aggregator::new(
            RegistryStore::open(":memory:").unwrap(),
            RuntimeConfig::default(),
        );
        {
            let mut state = agg.write().await;
            state
                .tools
                .insert("a1".into(), local("a1", "echo", ToolKind::Node));
            state
                .servers
                .insert("web".into(), http_server("web", vec![remote("web", "fetch")]));
        }
        let snap = agg.snapshot().await;
        assert_eq!(snap.tools.len(), 2);
        assert_eq!(snap.servers.len(), 1);
        assert_eq!(snap.servers[0].tool_count, 1);
        assert_eq!(snap.derived_config.mcp_servers.len(), 2);
        assert_eq!(agg.list_all().await.len(), 2);
    }
}
