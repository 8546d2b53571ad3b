//! The seam between the pipeline and the servers it calls.

use async_trait::async_trait;
use serde_json::Value;

use crate::mcp_client::{McpError, ServerRegistry, ToolTarget};

/// Routes one tool call. Implemented by [`ServerRegistry`]; tests script it.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, target: &ToolTarget, arguments: Value) -> Result<Value, McpError>;
}

#[async_trait]
impl ToolInvoker for ServerRegistry {
    async fn invoke(&self, target: &ToolTarget, arguments: Value) -> Result<Value, McpError> {
        self.call_tool(target, arguments).await
    }
}
