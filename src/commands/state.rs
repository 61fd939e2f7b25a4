//! Aggregate views and whole-registry maintenance.

use super::{CommandResult, ToolProxy};
use crate::proxy_core::{AggregateSnapshot, DerivedConfig};

impl ToolProxy {
    /// Client configuration for the enabled tools, regenerated from current
    /// state on every call.
    pub async fn get_derived_config(&self) -> DerivedConfig {
        self.agg.derived_config().await
    }

    /// Servers, tools and derived configuration from a single read.
    pub async fn get_all_state(&self) -> AggregateSnapshot {
        self.agg.snapshot().await
    }

    /// Whether the registry database holds any tool or server.
    pub async fn check_database_exists(&self) -> CommandResult<bool> {
        Ok(self.agg.with_store(|store| store.has_data())?)
    }

    /// Drop every tool and server, persisted and in memory, and close all
    /// downstream connections.
    pub async fn clear_database(&self) -> CommandResult<()> {
        self.registry.clear().await?;
        self.client.shutdown_all().await;
        Ok(())
    }
}
