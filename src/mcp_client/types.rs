//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, server configuration and descriptors, and
//! tool descriptors produced by discovery.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::McpError;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// Any inbound JSON-RPC message.
///
/// Responses carry an `id` and no `method`; server-initiated requests and
/// notifications carry a `method` and are ignored by this client.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The id this message answers, if it is a response at all.
    pub fn response_id(&self) -> Option<u64> {
        match self.method {
            Some(_) => None,
            None => self.id,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// A tool ran but reported failure (`isError: true`).
    pub const TOOL_ERROR: i64 = -32000;
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// A tool advertised by a server during discovery.
///
/// Read-only once discovery completes; rediscovery produces new descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
    /// Owning server. Filled in by discovery, not sent by the server.
    #[serde(default)]
    pub server: String,
}

impl ToolDescriptor {
    /// Names of top-level fields the input schema marks as required.
    pub fn required_fields(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| arr.iter().filter_map(|f| f.as_str()).collect())
            .unwrap_or_default()
    }
}

/// `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolListResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Wire transport used to reach a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Line-delimited JSON over a child process's stdin/stdout.
    #[default]
    Stdio,
    /// One HTTP POST per request.
    Http,
    /// Persistent WebSocket, one JSON message per text frame.
    #[serde(alias = "ws")]
    Websocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Http => write!(f, "http"),
            TransportKind::Websocket => write!(f, "websocket"),
        }
    }
}

/// One entry of the `servers` map in the orchestrator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub transport: TransportKind,
    /// Executable to launch (stdio).
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment / initialization variables for the launched process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the launched process.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Network address (http / websocket).
    #[serde(default)]
    pub url: Option<String>,
    /// Per-call timeout; falls back to the orchestrator default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// How a server is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    Command {
        program: String,
        args: Vec<String>,
        cwd: Option<String>,
    },
    Address {
        url: String,
    },
}

/// Immutable description of one configured server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescriptor {
    pub name: String,
    pub launch: Launch,
    pub env: HashMap<String, String>,
    pub transport: TransportKind,
    pub timeout: Duration,
}

impl ServerDescriptor {
    /// Build a descriptor from its configuration entry.
    ///
    /// Stdio servers need a `command`; network servers need a `url` whose
    /// scheme matches the transport.
    pub fn from_config(
        name: &str,
        config: &ServerConfig,
        default_timeout: Duration,
    ) -> Result<Self, McpError> {
        let launch = match config.transport {
            TransportKind::Stdio => {
                let program = config
                    .command
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| McpError::ConfigError {
                        reason: format!("server '{name}': stdio transport requires 'command'"),
                    })?;
                Launch::Command {
                    program: program.to_string(),
                    args: config.args.clone(),
                    cwd: config.cwd.clone(),
                }
            }
            kind @ (TransportKind::Http | TransportKind::Websocket) => {
                let url = config.url.as_deref().ok_or_else(|| McpError::ConfigError {
                    reason: format!("server '{name}': {kind} transport requires 'url'"),
                })?;
                let schemes: &[&str] = match kind {
                    TransportKind::Http => &["http://", "https://"],
                    _ => &["ws://", "wss://"],
                };
                if !schemes.iter().any(|s| url.starts_with(s)) {
                    return Err(McpError::ConfigError {
                        reason: format!(
                            "server '{name}': url '{url}' does not match {kind} transport"
                        ),
                    });
                }
                Launch::Address {
                    url: url.to_string(),
                }
            }
        };

        let timeout = config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);

        Ok(Self {
            name: name.to_string(),
            launch,
            env: config.env.clone(),
            transport: config.transport,
            timeout,
        })
    }

    /// A stdio descriptor, mostly useful for tests and programmatic setup.
    pub fn stdio(name: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            launch: Launch::Command {
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                cwd: None,
            },
            env: HashMap::new(),
            transport: TransportKind::Stdio,
            timeout: Duration::from_secs(30),
        }
    }
}

// ─── Routing ─────────────────────────────────────────────────────────────────

/// A tool name, optionally pinned to one server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolTarget {
    #[serde(default)]
    pub server: Option<String>,
    pub tool: String,
}

impl ToolTarget {
    pub fn new(tool: &str) -> Self {
        Self {
            server: None,
            tool: tool.to_string(),
        }
    }

    pub fn on(server: &str, tool: &str) -> Self {
        Self {
            server: Some(server.to_string()),
            tool: tool.to_string(),
        }
    }
}

impl fmt::Display for ToolTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.server {
            Some(server) => write!(f, "{server}.{}", self.tool),
            None => write!(f, "{}", self.tool),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
