//! Proxy core: the tool registry, discovery, execution routing and the
//! shared state they all operate on.
//!
//! - `aggregator`: single owner of proxy state and consistent snapshots
//! - `registry`: local tool registration and lifecycle
//! - `discovery`: downstream server catalogs
//! - `dispatcher`: routes executions to a runtime adapter or a server
//! - `database`: SQLite persistence for tools and servers

pub mod aggregator;
pub mod database;
pub mod discovery;
pub mod dispatcher;
pub mod errors;
pub mod registry;
pub mod types;

pub use aggregator::Aggregator;
pub use database::RegistryStore;
pub use discovery::DiscoveryEngine;
pub use dispatcher::Dispatcher;
pub use errors::{ErrorKind, ProxyError};
pub use registry::ToolRegistry;
pub use types::{
    AggregateSnapshot, DerivedConfig, InputSchema, RegisterToolRequest, Server, ServerSummary,
    Tool, ToolKind, ToolOrigin,
};
