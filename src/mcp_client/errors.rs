//! MCP Client error types.
//!
//! Three layers, from the wire up:
//! - [`TransportError`]: a single remote call failed on the wire
//! - [`DiscoveryError`]: a server never became `Ready`
//! - [`McpError`]: what a routed tool call reports to its caller

use thiserror::Error;

/// Failure of one request on one connection.
///
/// The same four kinds are reported by every transport, so callers never
/// need to know whether a server is reached over a pipe, HTTP or a socket.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The connection closed, the process exited, or it never came up.
    #[error("connection to '{server}' lost: {reason}")]
    ConnectionLost { server: String, reason: String },

    /// No response arrived within the call's timeout.
    #[error("'{method}' on '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The peer answered with something that is not a valid envelope.
    #[error("protocol violation from '{server}': {reason}")]
    ProtocolViolation { server: String, reason: String },

    /// The peer answered with a JSON-RPC error object.
    #[error("remote error [{code}]: {message}")]
    RemoteError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },
}

/// A server could not complete its discovery handshake.
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    /// Every handshake attempt failed.
    #[error("discovery for '{server}' failed after {attempts} attempts: {last_error}")]
    Exhausted {
        server: String,
        attempts: u32,
        last_error: String,
    },

    /// A single restart attempt (from `ensure_ready`) failed.
    #[error("restart of '{server}' failed: {reason}")]
    StartFailed { server: String, reason: String },
}

/// Errors surfaced by routed tool calls and registry operations.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// The call reached a server but failed on the wire.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The target server is `Failed` or `Degraded` and could not be restarted.
    #[error("server '{name}' unavailable: {reason}")]
    ServerUnavailable { name: String, reason: String },

    /// No server with this name is configured.
    #[error("unknown server: '{name}'")]
    UnknownServer { name: String },

    /// No ready server advertises the tool.
    #[error("tool not found: '{name}'")]
    ToolNotFound { name: String },

    /// Several ready servers advertise the tool and no server was named.
    #[error("tool '{name}' is ambiguous (offered by: {})", servers.join(", "))]
    AmbiguousTool { name: String, servers: Vec<String> },

    /// Arguments are missing fields the tool's input schema requires.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// A server descriptor could not be built from configuration.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// The tool answered, but not in a shape the caller understands.
    #[error("unusable output from '{tool}': {reason}")]
    InvalidOutput { tool: String, reason: String },
}

impl McpError {
    /// Transport faults are the only errors a caller may retry.
    ///
    /// Routing and availability errors cannot change by calling again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, McpError::Transport(_))
    }

    /// Whether the call failed because no single server could be chosen.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            McpError::ToolNotFound { .. }
                | McpError::AmbiguousTool { .. }
                | McpError::UnknownServer { .. }
                | McpError::InvalidArguments { .. }
        )
    }

    /// Whether the connection dropped underneath the call.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            McpError::Transport(TransportError::ConnectionLost { .. })
        )
    }
}

impl From<DiscoveryError> for McpError {
    fn from(e: DiscoveryError) -> Self {
        let name = match &e {
            DiscoveryError::Exhausted { server, .. } => server.clone(),
            DiscoveryError::StartFailed { server, .. } => server.clone(),
        };
        McpError::ServerUnavailable {
            name,
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_are_retryable() {
        let timeout = McpError::from(TransportError::Timeout {
            server: "llm".into(),
            method: "tools/call".into(),
            timeout_ms: 100,
        });
        assert!(timeout.is_retryable());
        assert!(!timeout.is_routing());

        let missing = McpError::ToolNotFound {
            name: "Generate_SQL".into(),
        };
        assert!(!missing.is_retryable());
        assert!(missing.is_routing());

        let unavailable = McpError::ServerUnavailable {
            name: "llm".into(),
            reason: "failed".into(),
        };
        assert!(!unavailable.is_retryable());
        assert!(!unavailable.is_routing());

        let unusable = McpError::InvalidOutput {
            tool: "Comprehensive_Validation".into(),
            reason: "no 'valid' flag".into(),
        };
        assert!(!unusable.is_retryable());
        assert!(!unusable.is_routing());
    }

    #[test]
    fn test_discovery_error_surfaces_as_server_unavailable() {
        let err = McpError::from(DiscoveryError::Exhausted {
            server: "validation".into(),
            attempts: 4,
            last_error: "refused".into(),
        });
        match err {
            McpError::ServerUnavailable { name, reason } => {
                assert_eq!(name, "validation");
                assert!(reason.contains("4 attempts"));
            }
            other => panic!("expected ServerUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn test_ambiguous_tool_lists_servers() {
        let err = McpError::AmbiguousTool {
            name: "Validate".into(),
            servers: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            err.to_string(),
            "tool 'Validate' is ambiguous (offered by: a, b)"
        );
    }
}
