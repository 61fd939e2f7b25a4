//! Operations exposed to clients of the proxy.
//!
//! [`ToolProxy`] is the single handle the transport layer holds. Every
//! operation returns [`CommandResult`], so failures cross the boundary as a
//! `{kind, message}` pair and never as a panic.

pub mod servers;
pub mod state;
pub mod tools;

use std::sync::Arc;

use serde::Serialize;

use crate::config::ProxyConfig;
use crate::mcp_client::McpClient;
use crate::proxy_core::{
    Aggregator, DiscoveryEngine, Dispatcher, ErrorKind, ProxyError, RegistryStore, ToolRegistry,
};

pub use servers::{RegisterServerRequest, ServerRef};
pub use tools::{ExecuteToolRequest, ToolRef, UpdateToolConfigRequest, UpdateToolStatusRequest};

/// Error returned across the request boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<ProxyError> for CommandError {
    fn from(e: ProxyError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CommandError {}

pub type CommandResult<T> = Result<T, CommandError>;

/// The running proxy: registry, discovery and dispatch over shared state.
pub struct ToolProxy {
    agg: Arc<Aggregator>,
    client: Arc<McpClient>,
    registry: ToolRegistry,
    discovery: DiscoveryEngine,
    dispatcher: Dispatcher,
}

impl ToolProxy {
    /// Assemble a proxy over an opened store. Nothing is loaded or
    /// discovered; see [`ToolProxy::from_config`] for full startup.
    pub fn new(store: RegistryStore, config: &ProxyConfig) -> Self {
        let agg = Arc::new(Aggregator::new(store, config.runtimes.clone()));
        let client = Arc::new(McpClient::new(config.init_timeout_ms));
        Self {
            registry: ToolRegistry::new(Arc::clone(&agg)),
            discovery: DiscoveryEngine::new(
                Arc::clone(&agg),
                Arc::clone(&client),
                config.discovery_timeout_ms,
            ),
            dispatcher: Dispatcher::new(
                Arc::clone(&agg),
                Arc::clone(&client),
                config.default_timeout_ms,
            ),
            agg,
            client,
        }
    }

    /// Open the registry database, restore persisted tools and servers,
    /// register the configured servers and, when enabled, discover them all.
    ///
    /// Discovery failures are logged and do not fail startup.
    pub async fn from_config(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let db_path = config.resolved_database_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProxyError::Storage {
                reason: format!("cannot create {}: {e}", parent.display()),
            })?;
        }
        let store = RegistryStore::open(&db_path.to_string_lossy())?;
        let proxy = Self::new(store, config);

        let tools = proxy.registry.load_persisted().await?;
        let servers = proxy.discovery.load_persisted().await?;
        for (id, descriptor) in &config.servers {
            proxy.discovery.register_server(id, descriptor.clone()).await?;
        }
        tracing::info!(
            tools,
            servers,
            configured = config.servers.len(),
            db = %db_path.display(),
            "registry restored"
        );

        if config.discover_on_startup {
            proxy.discover_everything().await;
        }
        Ok(proxy)
    }

    /// Discover every known server concurrently, logging each outcome.
    pub async fn discover_everything(&self) -> usize {
        let outcomes = self.discovery.discover_all().await;
        let mut discovered = 0;
        for (server, outcome) in outcomes {
            match outcome {
                Ok(count) => {
                    discovered += count;
                    tracing::info!(server = %server, tools = count, "startup discovery succeeded");
                }
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "startup discovery failed");
                }
            }
        }
        discovered
    }

    /// Terminate every downstream server connection.
    pub async fn shutdown(&self) {
        self.client.shutdown_all().await;
        tracing::info!("proxy shut down");
    }
}
