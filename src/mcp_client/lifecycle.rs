//! Per-server lifecycle.
//!
//! A [`ServerHandle`] owns one server's connection, its discovered tools and
//! its status. Status moves through
//!
//! ```text
//! Starting ──► Ready ──► Degraded ──► Starting ...
//!    │                                  │
//!    └────────────► Failed ◄────────────┘
//! ```
//!
//! `Ready` always means a live connection and a non-empty tool inventory.
//! Every status change bumps the handle's status feed, a `watch` counter
//! that the registry compares against before serving its directory.
//! Starts, restarts and stops hold the handle's transition lock, so two
//! callers never race to replace the same connection. Marking a handle
//! degraded is a compare-and-set on the connection generation: a failure
//! observed on an old connection can never tear down its replacement.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::sleep;

use super::errors::{DiscoveryError, McpError, TransportError};
use super::transport::{unwrap_tool_output, Connector, Transport};
use super::types::{InitializeResult, ServerDescriptor, ToolDescriptor, ToolListResult, TransportKind};

// ─── Constants ───────────────────────────────────────────────────────────────

/// MCP protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Upper bound on the liveness probe sent to a suspect connection.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Status ──────────────────────────────────────────────────────────────────

/// Where a server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// A handshake is in progress.
    Starting,
    /// Connected, with a non-empty tool inventory.
    Ready,
    /// The connection dropped; the next `ensure_ready` restarts it.
    Degraded,
    /// Discovery gave up.
    Failed,
    /// Shut down on request.
    Stopped,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Starting => "starting",
            ServerStatus::Ready => "ready",
            ServerStatus::Degraded => "degraded",
            ServerStatus::Failed => "failed",
            ServerStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Discovery tunables shared by every handle in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryPolicy {
    /// Bound on one connect-plus-handshake attempt.
    pub discovery_timeout: Duration,
    /// Pause before each retry.
    pub retry_interval: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(2),
            max_retries: 3,
        }
    }
}

/// Point-in-time view of a handle, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct HandleSnapshot {
    pub name: String,
    pub transport: TransportKind,
    pub status: ServerStatus,
    pub tools: Vec<String>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// ─── ServerHandle ────────────────────────────────────────────────────────────

struct HandleState {
    status: ServerStatus,
    connection: Option<Arc<dyn Transport>>,
    /// Last discovered inventory. Kept after the handle leaves `Ready` so
    /// the registry knows which server to restart for a tool.
    tools: Arc<Vec<ToolDescriptor>>,
    retry_count: u32,
    /// Bumped every time the handle becomes `Ready` on a new connection.
    generation: u64,
    last_error: Option<String>,
}

/// Supervised connection to one configured server.
pub struct ServerHandle {
    descriptor: ServerDescriptor,
    state: RwLock<HandleState>,
    transitions: Mutex<()>,
    /// Set after a call timed out; the next call probes the connection first.
    suspect: AtomicBool,
    status_feed: Arc<watch::Sender<u64>>,
}

impl ServerHandle {
    pub fn new(descriptor: ServerDescriptor) -> Self {
        let (feed, _) = watch::channel(0);
        Self::with_status_feed(descriptor, Arc::new(feed))
    }

    /// A handle that reports its status changes on a shared feed.
    pub fn with_status_feed(
        descriptor: ServerDescriptor,
        status_feed: Arc<watch::Sender<u64>>,
    ) -> Self {
        Self {
            descriptor,
            state: RwLock::new(HandleState {
                status: ServerStatus::Starting,
                connection: None,
                tools: Arc::new(Vec::new()),
                retry_count: 0,
                generation: 0,
                last_error: None,
            }),
            transitions: Mutex::new(()),
            suspect: AtomicBool::new(false),
            status_feed,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub async fn status(&self) -> ServerStatus {
        self.state.read().await.status
    }

    /// Tool inventory, present only while the handle is `Ready`.
    pub async fn ready_tools(&self) -> Option<Arc<Vec<ToolDescriptor>>> {
        let state = self.state.read().await;
        (state.status == ServerStatus::Ready).then(|| Arc::clone(&state.tools))
    }

    /// Whether a restart could bring `tool` back: the last inventory lists
    /// it, or the server never completed discovery.
    pub async fn may_serve(&self, tool: &str) -> bool {
        let state = self.state.read().await;
        match state.status {
            ServerStatus::Failed | ServerStatus::Degraded => {
                state.tools.is_empty() || state.tools.iter().any(|t| t.name == tool)
            }
            _ => false,
        }
    }

    pub fn is_suspect(&self) -> bool {
        self.suspect.load(Ordering::Acquire)
    }

    pub async fn snapshot(&self) -> HandleSnapshot {
        let state = self.state.read().await;
        HandleSnapshot {
            name: self.descriptor.name.clone(),
            transport: self.descriptor.transport,
            status: state.status,
            tools: state.tools.iter().map(|t| t.name.clone()).collect(),
            retry_count: state.retry_count,
            last_error: state.last_error.clone(),
        }
    }

    // ─── Transitions ─────────────────────────────────────────────────────

    /// Connect and run discovery, retrying up to `policy.max_retries` times.
    ///
    /// Every attempt is a fresh connect plus handshake bounded by
    /// `policy.discovery_timeout`, preceded (after the first) by
    /// `policy.retry_interval`.
    pub async fn start(
        &self,
        connector: &dyn Connector,
        policy: &DiscoveryPolicy,
    ) -> Result<(), DiscoveryError> {
        let _guard = self.transitions.lock().await;
        self.begin_start().await;

        let attempts = policy.max_retries.saturating_add(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if attempt > 1 {
                sleep(policy.retry_interval).await;
            }
            match self.attempt(connector, policy).await {
                Ok((connection, tools)) => {
                    self.become_ready(connection, tools, attempt - 1).await;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        server = %self.descriptor.name,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "discovery attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        self.become_failed(last_error.clone(), policy.max_retries)
            .await;
        Err(DiscoveryError::Exhausted {
            server: self.descriptor.name.clone(),
            attempts,
            last_error,
        })
    }

    /// One bounded restart attempt, for a handle that left `Ready`.
    ///
    /// Returns immediately if another caller already restarted it.
    pub async fn restart(
        &self,
        connector: &dyn Connector,
        policy: &DiscoveryPolicy,
    ) -> Result<(), DiscoveryError> {
        let _guard = self.transitions.lock().await;
        if self.status().await == ServerStatus::Ready {
            return Ok(());
        }
        tracing::info!(server = %self.descriptor.name, "restarting server");
        self.begin_start().await;

        match self.attempt(connector, policy).await {
            Ok((connection, tools)) => {
                self.become_ready(connection, tools, 0).await;
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.become_failed(reason.clone(), 0).await;
                Err(DiscoveryError::StartFailed {
                    server: self.descriptor.name.clone(),
                    reason,
                })
            }
        }
    }

    /// Drop the connection of generation `generation` and mark the handle
    /// `Degraded`. No-op if the handle has moved on to another connection.
    pub async fn mark_degraded(&self, generation: u64, reason: &str) -> bool {
        let old = {
            let mut state = self.state.write().await;
            if state.generation != generation || state.status != ServerStatus::Ready {
                return false;
            }
            self.set_status(&mut state, ServerStatus::Degraded);
            state.last_error = Some(reason.to_string());
            state.connection.take()
        };
        tracing::warn!(server = %self.descriptor.name, reason, "server degraded");
        if let Some(connection) = old {
            connection.close().await;
        }
        true
    }

    /// Shut the connection down. The handle stays `Stopped` until restarted.
    pub async fn stop(&self) {
        let _guard = self.transitions.lock().await;
        let old = {
            let mut state = self.state.write().await;
            self.set_status(&mut state, ServerStatus::Stopped);
            state.connection.take()
        };
        if let Some(connection) = old {
            connection.close().await;
            tracing::info!(server = %self.descriptor.name, "server stopped");
        }
    }

    /// Called with the state lock held, so the feed never runs ahead of
    /// the status it announces.
    fn set_status(&self, state: &mut HandleState, status: ServerStatus) {
        if state.status != status {
            state.status = status;
            self.status_feed.send_modify(|epoch| *epoch += 1);
        }
    }

    async fn begin_start(&self) {
        self.suspect.store(false, Ordering::Release);
        let old = {
            let mut state = self.state.write().await;
            self.set_status(&mut state, ServerStatus::Starting);
            state.connection.take()
        };
        if let Some(connection) = old {
            connection.close().await;
        }
    }

    async fn become_ready(
        &self,
        connection: Arc<dyn Transport>,
        tools: Vec<ToolDescriptor>,
        retry_count: u32,
    ) {
        let mut state = self.state.write().await;
        state.connection = Some(connection);
        state.tools = Arc::new(tools);
        state.retry_count = retry_count;
        state.generation += 1;
        state.last_error = None;
        self.set_status(&mut state, ServerStatus::Ready);
        tracing::info!(
            server = %self.descriptor.name,
            transport = %self.descriptor.transport,
            tools = state.tools.len(),
            retries = retry_count,
            "server ready"
        );
    }

    async fn become_failed(&self, reason: String, retry_count: u32) {
        let mut state = self.state.write().await;
        self.set_status(&mut state, ServerStatus::Failed);
        state.connection = None;
        state.retry_count = retry_count;
        state.last_error = Some(reason);
        tracing::error!(
            server = %self.descriptor.name,
            error = state.last_error.as_deref().unwrap_or_default(),
            "server failed"
        );
    }

    /// One connect plus handshake, bounded by the discovery timeout.
    async fn attempt(
        &self,
        connector: &dyn Connector,
        policy: &DiscoveryPolicy,
    ) -> Result<(Arc<dyn Transport>, Vec<ToolDescriptor>), TransportError> {
        let limit = policy.discovery_timeout;
        let attempt = async {
            let connection = connector.connect(&self.descriptor).await?;
            match discover(connection.as_ref(), &self.descriptor.name, limit).await {
                Ok(tools) => Ok((connection, tools)),
                Err(e) => {
                    connection.close().await;
                    Err(e)
                }
            }
        };
        match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                server: self.descriptor.name.clone(),
                method: "discovery".into(),
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Invoke `tools/call` on this server and return the tool's output.
    ///
    /// A timeout marks the connection suspect; the next call pings it
    /// first. A lost connection marks the handle `Degraded`.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let timeout = self.descriptor.timeout;
        let (connection, generation) = self.connection().await?;

        if self.is_suspect() {
            self.health_check(connection.as_ref(), generation, timeout)
                .await?;
        }

        let params = json!({ "name": tool, "arguments": arguments });
        tracing::debug!(server = %self.descriptor.name, tool, "calling tool");
        match connection.request("tools/call", Some(params), timeout).await {
            Ok(result) => Ok(unwrap_tool_output(result)?),
            Err(e @ TransportError::Timeout { .. }) => {
                self.suspect.store(true, Ordering::Release);
                tracing::warn!(server = %self.descriptor.name, tool, error = %e, "tool call timed out");
                Err(e.into())
            }
            Err(e @ TransportError::ConnectionLost { .. }) => {
                self.mark_degraded(generation, &e.to_string()).await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn connection(&self) -> Result<(Arc<dyn Transport>, u64), McpError> {
        let state = self.state.read().await;
        match (&state.status, &state.connection) {
            (ServerStatus::Ready, Some(connection)) => {
                Ok((Arc::clone(connection), state.generation))
            }
            (status, _) => Err(McpError::ServerUnavailable {
                name: self.descriptor.name.clone(),
                reason: match &state.last_error {
                    Some(e) => format!("server is {status}: {e}"),
                    None => format!("server is {status}"),
                },
            }),
        }
    }

    /// Probe a suspect connection with `ping`.
    ///
    /// Any reply counts as alive, including a JSON-RPC error from a server
    /// that does not implement `ping`.
    async fn health_check(
        &self,
        connection: &dyn Transport,
        generation: u64,
        timeout: Duration,
    ) -> Result<(), McpError> {
        let probe = timeout.min(HEALTH_CHECK_TIMEOUT);
        match connection.request("ping", None, probe).await {
            Ok(_) | Err(TransportError::RemoteError { .. }) => {
                self.suspect.store(false, Ordering::Release);
                tracing::debug!(server = %self.descriptor.name, "suspect connection answered ping");
                Ok(())
            }
            Err(e) => {
                let reason = format!("health check failed: {e}");
                self.mark_degraded(generation, &reason).await;
                Err(TransportError::ConnectionLost {
                    server: self.descriptor.name.clone(),
                    reason,
                }
                .into())
            }
        }
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Run `initialize`, acknowledge it, and collect the tool inventory.
///
/// Tools come from the initialize result when present, otherwise from
/// `tools/list`. A server that advertises nothing fails discovery.
async fn discover(
    connection: &dyn Transport,
    server: &str,
    timeout: Duration,
) -> Result<Vec<ToolDescriptor>, TransportError> {
    let violation = |reason: String| TransportError::ProtocolViolation {
        server: server.to_string(),
        reason,
    };

    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let init = connection.request("initialize", Some(params), timeout).await?;
    let init: InitializeResult = serde_json::from_value(init)
        .map_err(|e| violation(format!("malformed initialize result: {e}")))?;
    connection.notify("notifications/initialized", None).await?;

    let mut tools = if init.tools.is_empty() {
        let listed = connection.request("tools/list", None, timeout).await?;
        serde_json::from_value::<ToolListResult>(listed)
            .map_err(|e| violation(format!("malformed tools/list result: {e}")))?
            .tools
    } else {
        init.tools
    };

    if tools.is_empty() {
        return Err(violation("server advertised no tools".into()));
    }
    for tool in &mut tools {
        tool.server = server.to_string();
    }
    Ok(tools)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
