//! MCP Client: supervised connections to the specialized tool servers.
//!
//! This module handles:
//! - JSON-RPC 2.0 over three transports (child-process stdio, HTTP, WebSocket)
//! - Per-server lifecycle: discovery with bounded retries, degrade, restart
//! - The capability directory mapping tools to the servers that serve them
//! - Tool call routing and argument pre-checks
//!
//! The pipeline reaches servers only through [`ServerRegistry::call_tool`].

pub mod directory;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use directory::{CapabilityDirectory, Route};
pub use errors::{DiscoveryError, McpError, TransportError};
pub use lifecycle::{DiscoveryPolicy, HandleSnapshot, ServerHandle, ServerStatus};
pub use registry::ServerRegistry;
pub use transport::{Connector, DefaultConnector, Transport};
pub use types::{ServerConfig, ServerDescriptor, ToolDescriptor, ToolTarget, TransportKind};
