//! Discovery engine: downstream server management and catalog caching.
//!
//! `discover` talks to the server with no state lock held, then swaps the
//! server's catalog in one write. Discoveries of the same server are
//! serialized by a per-server async mutex; different servers proceed in
//! parallel. A failed discovery records the error and keeps the previous
//! catalog.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;

use super::aggregator::Aggregator;
use super::errors::ProxyError;
use super::types::{remote_tool_id, InputSchema, Server, ServerSummary, Tool, ToolOrigin};
use crate::mcp_client::client::{extract_tool_entries, parse_tool_entry};
use crate::mcp_client::{McpClient, ServerDescriptor};

/// Outcome of one server's discovery inside [`DiscoveryEngine::discover_all`].
pub type DiscoveryOutcome = (String, Result<usize, ProxyError>);

/// Queries downstream servers and caches their catalogs.
pub struct DiscoveryEngine {
    agg: Arc<Aggregator>,
    client: Arc<McpClient>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    timeout: Duration,
}

impl DiscoveryEngine {
    pub fn new(agg: Arc<Aggregator>, client: Arc<McpClient>, timeout_ms: u64) -> Self {
        Self {
            agg,
            client,
            locks: Mutex::new(HashMap::new()),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    // ─── Servers ────────────────────────────────────────────────────────

    /// Add or update a downstream server.
    ///
    /// Changing an existing server's descriptor drops its connection; the
    /// cached catalog stays until the next discovery.
    pub async fn register_server(
        &self,
        server_id: &str,
        descriptor: ServerDescriptor,
    ) -> Result<ServerSummary, ProxyError> {
        validate_server(server_id, &descriptor)?;

        let (summary, changed) = {
            let mut state = self.agg.write().await;
            self.agg
                .with_store(|store| store.upsert_server(server_id, &descriptor))?;
            let server = state
                .servers
                .entry(server_id.to_string())
                .or_insert_with(|| Server::new(server_id, descriptor.clone()));
            let changed = server.descriptor != descriptor;
            server.descriptor = descriptor;
            (server.summary(), changed)
        };

        if changed {
            self.client.disconnect(server_id).await;
        }
        tracing::info!(server = server_id, transport = %summary.transport, "server registered");
        Ok(summary)
    }

    /// Remove a server together with its cached catalog.
    ///
    /// Waits for an in-flight discovery of the same server. The per-server
    /// lock outlives the server so a re-registered id keeps serializing
    /// against that discovery.
    pub async fn remove_server(&self, server_id: &str) -> Result<(), ProxyError> {
        let lock = self.server_lock(server_id).await;
        let _serial = lock.lock().await;
        {
            let mut state = self.agg.write().await;
            if !state.servers.contains_key(server_id) {
                return Err(ProxyError::server_not_found(server_id));
            }
            self.agg
                .with_store(|store| store.delete_server(server_id))?;
            state.servers.remove(server_id);
            let prefix = format!("{server_id}:");
            state.disabled_remote.retain(|id| !id.starts_with(&prefix));
        }
        self.client.disconnect(server_id).await;
        tracing::info!(server = server_id, "server removed");
        Ok(())
    }

    /// All known servers.
    pub async fn list_servers(&self) -> Vec<ServerSummary> {
        self.agg.read().await.server_summaries()
    }

    /// Add persisted servers that are not already known.
    pub async fn load_persisted(&self) -> Result<usize, ProxyError> {
        let mut state = self.agg.write().await;
        let stored = self.agg.with_store(|store| store.load_servers())?;
        let mut added = 0;
        for (id, descriptor) in stored {
            if !state.servers.contains_key(&id) {
                state.servers.insert(id.clone(), Server::new(&id, descriptor));
                added += 1;
            }
        }
        tracing::info!(count = added, "persisted servers loaded");
        Ok(added)
    }

    // ─── Discovery ──────────────────────────────────────────────────────

    async fn server_lock(&self, server_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(server_id.to_string()).or_default())
    }

    /// Fetch a server's catalog and replace the cached one.
    pub async fn discover(&self, server_id: &str) -> Result<Vec<Tool>, ProxyError> {
        let lock = self.server_lock(server_id).await;
        let _serial = lock.lock().await;
        let start = Instant::now();

        let descriptor = self
            .agg
            .read()
            .await
            .servers
            .get(server_id)
            .map(|s| s.descriptor.clone())
            .ok_or_else(|| ProxyError::server_not_found(server_id))?;

        let fetched = self
            .client
            .list_tools(server_id, &descriptor, self.timeout)
            .await
            .map_err(|e| ProxyError::from_mcp(server_id, e));

        let entries = match fetched {
            Ok(entries) => entries,
            Err(err) => {
                if let Some(server) = self.agg.write().await.servers.get_mut(server_id) {
                    server.last_error = Some(err.to_string());
                }
                tracing::warn!(server = server_id, error = %err, "discovery failed; keeping cached catalog");
                return Err(err);
            }
        };

        let mut state = self.agg.write().await;
        let tools = build_catalog(server_id, entries, &state.disabled_remote);
        let server = state
            .servers
            .get_mut(server_id)
            .ok_or_else(|| ProxyError::server_not_found(server_id))?;
        server.tools = tools.clone();
        server.last_discovered = Some(Utc::now());
        server.last_error = None;

        tracing::info!(
            server = server_id,
            tools = tools.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "discovery complete"
        );
        Ok(tools)
    }

    /// Drop the server's connection, then discover it again on a fresh one.
    pub async fn restart_server(&self, server_id: &str) -> Result<Vec<Tool>, ProxyError> {
        if !self.agg.read().await.servers.contains_key(server_id) {
            return Err(ProxyError::server_not_found(server_id));
        }
        tracing::info!(server = server_id, "restarting server connection");
        self.client.disconnect(server_id).await;
        self.discover(server_id).await
    }

    /// Discover every known server concurrently. Failures are logged and
    /// reported per server.
    pub async fn discover_all(&self) -> Vec<DiscoveryOutcome> {
        let mut ids: Vec<String> = self.agg.read().await.servers.keys().cloned().collect();
        ids.sort();

        let runs = ids.into_iter().map(|id| async move {
            let result = self.discover(&id).await.map(|tools| tools.len());
            (id, result)
        });
        futures::future::join_all(runs).await
    }

    /// Local tools plus every cached catalog.
    pub async fn list_all(&self) -> Vec<Tool> {
        self.agg.list_all().await
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn validate_server(server_id: &str, descriptor: &ServerDescriptor) -> Result<(), ProxyError> {
    if server_id.trim().is_empty() || server_id.contains(':') {
        return Err(ProxyError::InvalidSpec {
            reason: format!("server id '{server_id}' must be non-empty and must not contain ':'"),
        });
    }
    match descriptor {
        ServerDescriptor::Stdio(config) if config.command.trim().is_empty() => {
            Err(ProxyError::InvalidSpec {
                reason: "server command must not be empty".into(),
            })
        }
        ServerDescriptor::Http(config)
            if !(config.url.starts_with("http://") || config.url.starts_with("https://")) =>
        {
            Err(ProxyError::InvalidSpec {
                reason: format!("server url '{}' must be http(s)", config.url),
            })
        }
        _ => Ok(()),
    }
}

/// Turn raw catalog entries into tools, skipping malformed entries and
/// duplicate names.
fn build_catalog(
    server_id: &str,
    entries: Vec<serde_json::Value>,
    disabled: &HashSet<String>,
) -> Vec<Tool> {
    let now = Utc::now();
    let mut seen = HashSet::new();
    let mut tools = Vec::with_capacity(entries.len());

    for (index, entry) in entries.into_iter().enumerate() {
        let def = match parse_tool_entry(entry) {
            Ok(def) => def,
            Err(reason) => {
                tracing::warn!(server = server_id, index, %reason, "skipping catalog entry");
                continue;
            }
        };
        if !seen.insert(def.name.clone()) {
            tracing::warn!(server = server_id, tool = %def.name, "skipping duplicate tool name");
            continue;
        }

        let id = remote_tool_id(server_id, &def.name);
        tools.push(Tool {
            enabled: !disabled.contains(&id),
            id,
            description: def.description.unwrap_or_default(),
            kind: None,
            entry_point: def.name.clone(),
            authentication: None,
            env: Default::default(),
            origin: ToolOrigin::remote(server_id),
            input_schema: def
                .input_schema
                .as_ref()
                .map(InputSchema::from_value)
                .unwrap_or_default(),
            timeout_ms: None,
            registered_at: now,
            name: def.name,
        });
    }
    tools
}

/// Parse a bare `tools/list` result into tools, for callers holding a raw
/// payload rather than a live connection.
pub fn catalog_from_result(
    server_id: &str,
    result: serde_json::Value,
) -> Result<Vec<Tool>, ProxyError> {
    let entries = extract_tool_entries(server_id, result)
        .map_err(|e| ProxyError::from_mcp(server_id, e))?;
    Ok(build_catalog(server_id, entries, &HashSet::new()))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::mcp_client::lifecycle::tests::sh_server_config;
    use crate::mcp_client::HttpServerConfig;
    use crate::proxy_core::database::RegistryStore;
    use crate::proxy_core::errors::ErrorKind;
    use crate::proxy_core::registry::ToolRegistry;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine() -> (DiscoveryEngine, Arc<Aggregator>) {
        let agg = Arc::new(Aggregator::new(
            RegistryStore::open(":memory:").unwrap(),
            RuntimeConfig::default(),
        ));
        let client = Arc::new(McpClient::new(5_000));
        (DiscoveryEngine::new(Arc::clone(&agg), client, 5_000), agg)
    }

    fn http(url: String) -> ServerDescriptor {
        ServerDescriptor::Http(HttpServerConfig {
            url,
            headers: BTreeMap::new(),
        })
    }

    async fn mount_catalog(server: &MockServer, tools: serde_json::Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"method": "initialize"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 1,
                "result": {"protocolVersion": "2024-11-05", "capabilities": {}}
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(
                serde_json::json!({"method": "notifications/initialized"}),
            ))
            .respond_with(ResponseTemplate::new(202))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 2, "result": {"tools": tools}
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn test_build_catalog_skips_bad_entries() {
        let entries = vec![
            serde_json::json!({"name": "read", "inputSchema": {"type": "object", "required": ["path"]}}),
            serde_json::json!({"description": "no name"}),
            serde_json::json!({"name": "read"}),
            serde_json::json!("garbage"),
            serde_json::json!({"name": "write"}),
        ];
        let disabled = HashSet::from(["fs:write".to_string()]);
        let tools = build_catalog("fs", entries, &disabled);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].id, "fs:read");
        assert_eq!(tools[0].input_schema.required, vec!["path".to_string()]);
        assert_eq!(tools[0].origin, ToolOrigin::remote("fs"));
        assert!(tools[0].enabled);
        assert!(!tools[1].enabled);
    }

    #[test]
    fn test_catalog_from_result_rejects_bad_payload() {
        let err = catalog_from_result("fs", serde_json::json!(42)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerProtocolError);
    }

    #[tokio::test]
    async fn test_register_server_validation() {
        let (engine, _) = engine();
        let err = engine
            .register_server("a:b", http("http://localhost/x".into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSpec);
        let err = engine
            .register_server("web", http("ftp://localhost/x".into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSpec);
        assert!(engine.list_servers().await.is_empty());
    }

    #[tokio::test]
    async fn test_discover_unknown_server() {
        let (engine, _) = engine();
        let err = engine.discover("ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_discover_http_server() {
        let mock = MockServer::start().await;
        mount_catalog(
            &mock,
            serde_json::json!([{"name": "fetch", "description": "Fetch a URL"}, {"bad": true}]),
        )
        .await;

        let (engine, _) = engine();
        engine.register_server("web", http(mock.uri())).await.unwrap();
        let tools = engine.discover("web").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].id, "web:fetch");

        let all = engine.list_all().await;
        assert_eq!(all.len(), 1);
        let servers = engine.list_servers().await;
        assert_eq!(servers[0].tool_count, 1);
        assert!(servers[0].last_discovered.is_some());
    }

    #[tokio::test]
    async fn test_failed_discovery_keeps_cached_catalog() {
        let mock = MockServer::start().await;
        mount_catalog(&mock, serde_json::json!([{"name": "fetch"}])).await;

        let (engine, _) = engine();
        engine.register_server("web", http(mock.uri())).await.unwrap();
        engine.discover("web").await.unwrap();
        let before = engine.list_all().await;

        // Server goes away.
        drop(mock);

        let err = engine.discover("web").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerUnreachable);
        assert_eq!(engine.list_all().await, before);
        assert!(engine.list_servers().await[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_malformed_catalog_is_protocol_error() {
        let mock = MockServer::start().await;
        mount_catalog(&mock, serde_json::json!("not a list")).await;

        let (engine, _) = engine();
        engine.register_server("web", http(mock.uri())).await.unwrap();
        let err = engine.discover("web").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerProtocolError);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_discover_stdio_server_and_disable_survives() {
        let (engine, agg) = engine();
        engine
            .register_server("fx", ServerDescriptor::Stdio(sh_server_config()))
            .await
            .unwrap();

        let tools = engine.discover("fx").await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "ping"]);

        let registry = ToolRegistry::new(Arc::clone(&agg));
        registry.set_enabled("fx:ping", false).await.unwrap();
        let again = engine.discover("fx").await.unwrap();
        let ping = again.iter().find(|t| t.id == "fx:ping").unwrap();
        assert!(!ping.enabled);

        engine.remove_server("fx").await.unwrap();
        assert!(engine.list_all().await.is_empty());
        assert!(agg.read().await.disabled_remote.is_empty());
    }

    #[tokio::test]
    async fn test_discover_all_reports_each_server() {
        let mock = MockServer::start().await;
        mount_catalog(&mock, serde_json::json!([{"name": "a"}, {"name": "b"}])).await;

        let (engine, _) = engine();
        engine.register_server("good", http(mock.uri())).await.unwrap();
        engine
            .register_server("bad", http("http://127.0.0.1:9/mcp".into()))
            .await
            .unwrap();

        let outcomes = engine.discover_all().await;
        assert_eq!(outcomes.len(), 2);
        let good = outcomes.iter().find(|(id, _)| id == "good").unwrap();
        assert_eq!(*good.1.as_ref().unwrap(), 2);
        let bad = outcomes.iter().find(|(id, _)| id == "bad").unwrap();
        assert_eq!(bad.1.as_ref().unwrap_err().kind(), ErrorKind::ServerUnreachable);
    }

    #[tokio::test]
    async fn test_servers_persist() {
        let (engine, agg) = engine();
        engine
            .register_server("web", http("http://localhost:1/mcp".into()))
            .await
            .unwrap();
        agg.write().await.servers.clear();
        assert_eq!(engine.load_persisted().await.unwrap(), 1);
        assert_eq!(engine.load_persisted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_server_waits_for_discovery_lock() {
        let (engine, _) = engine();
        let engine = Arc::new(engine);
        engine
            .register_server("web", http("http://127.0.0.1:9/mcp".into()))
            .await
            .unwrap();

        let lock = engine.server_lock("web").await;
        let held = lock.lock().await;
        let removal = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.remove_server("web").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!removal.is_finished());
        drop(held);
        removal.await.unwrap().unwrap();

        // Re-registering reuses the same lock.
        engine
            .register_server("web", http("http://127.0.0.1:9/mcp".into()))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&lock, &engine.server_lock("web").await));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_server_reconnects() {
        let agg = Arc::new(Aggregator::new(
            RegistryStore::open(":memory:").unwrap(),
            RuntimeConfig::default(),
        ));
        let client = Arc::new(McpClient::new(5_000));
        let engine = DiscoveryEngine::new(agg, Arc::clone(&client), 5_000);
        let descriptor = ServerDescriptor::Stdio(sh_server_config());
        engine.register_server("fx", descriptor.clone()).await.unwrap();
        engine.discover("fx").await.unwrap();
        let before = client.connect("fx", &descriptor).await.unwrap();

        let tools = engine.restart_server("fx").await.unwrap();
        assert_eq!(tools.len(), 2);
        let after = client.connect("fx", &descriptor).await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));

        assert_eq!(
            engine.restart_server("nope").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        client.shutdown_all().await;
    }
}
