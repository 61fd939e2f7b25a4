//! Downstream server operations: registration and discovery.

use serde::Deserialize;

use super::{CommandResult, ToolProxy};
use crate::mcp_client::ServerDescriptor;
use crate::proxy_core::{ServerSummary, Tool};

/// Params naming a single server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerRef {
    pub server_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterServerRequest {
    pub server_id: String,
    pub descriptor: ServerDescriptor,
}

impl ToolProxy {
    /// Add or replace a downstream server. Discovery is a separate call.
    pub async fn register_server(&self, req: RegisterServerRequest) -> CommandResult<ServerSummary> {
        Ok(self
            .discovery
            .register_server(&req.server_id, req.descriptor)
            .await?)
    }

    pub async fn remove_server(&self, req: ServerRef) -> CommandResult<()> {
        Ok(self.discovery.remove_server(&req.server_id).await?)
    }

    pub async fn list_servers(&self) -> Vec<ServerSummary> {
        self.discovery.list_servers().await
    }

    /// Refresh one server's catalog and return it.
    pub async fn discover_tools(&self, req: ServerRef) -> CommandResult<Vec<Tool>> {
        Ok(self.discovery.discover(&req.server_id).await?)
    }

    /// Reconnect to a server and refresh its catalog.
    pub async fn restart_server(&self, req: ServerRef) -> CommandResult<Vec<Tool>> {
        Ok(self.discovery.restart_server(&req.server_id).await?)
    }

    /// Local tools plus every cached server catalog.
    pub async fn list_all_server_tools(&self) -> Vec<Tool> {
        self.discovery.list_all().await
    }
}
