//! Server registry: owns every configured server and routes tool calls.
//!
//! Provides:
//! - Concurrent discovery across servers at startup
//! - `ensure_ready`: one bounded restart for a server that left `Ready`
//! - The current [`CapabilityDirectory`], rebuilt and swapped whenever a
//!   handle's status has changed since it was last built
//! - Tool call routing with argument pre-checks
//!
//! Each server's lifecycle is serialized inside its own [`ServerHandle`];
//! the registry never holds a lock across handles.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{watch, Mutex, RwLock};

use super::directory::{CapabilityDirectory, Route};
use super::errors::{DiscoveryError, McpError};
use super::lifecycle::{DiscoveryPolicy, HandleSnapshot, ServerHandle, ServerStatus};
use super::transport::{Connector, DefaultConnector};
use super::types::{ServerDescriptor, ToolTarget};

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// A directory together with the status epoch it was built from.
struct Published {
    epoch: u64,
    directory: Arc<CapabilityDirectory>,
}

pub struct ServerRegistry {
    handles: BTreeMap<String, Arc<ServerHandle>>,
    directory: RwLock<Published>,
    /// Bumped by every handle on every status change.
    status_feed: Arc<watch::Sender<u64>>,
    /// Serializes rebuilds so a slow rebuild never overwrites a newer one.
    rebuild_lock: Mutex<()>,
    connector: Arc<dyn Connector>,
    policy: DiscoveryPolicy,
}

impl ServerRegistry {
    /// A registry that reaches servers over their configured transports.
    pub fn new(descriptors: Vec<ServerDescriptor>, policy: DiscoveryPolicy) -> Self {
        Self::with_connector(descriptors, policy, Arc::new(DefaultConnector))
    }

    pub fn with_connector(
        descriptors: Vec<ServerDescriptor>,
        policy: DiscoveryPolicy,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (feed, _) = watch::channel(0);
        let status_feed = Arc::new(feed);
        let handles = descriptors
            .into_iter()
            .map(|d| {
                let handle = ServerHandle::with_status_feed(d, Arc::clone(&status_feed));
                (handle.name().to_string(), Arc::new(handle))
            })
            .collect();
        Self {
            handles,
            directory: RwLock::new(Published {
                epoch: 0,
                directory: Arc::new(CapabilityDirectory::empty()),
            }),
            status_feed,
            rebuild_lock: Mutex::new(()),
            connector,
            policy,
        }
    }

    pub fn handle(&self, name: &str) -> Result<&Arc<ServerHandle>, McpError> {
        self.handles.get(name).ok_or_else(|| McpError::UnknownServer {
            name: name.to_string(),
        })
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start every server concurrently and publish the resulting directory.
    ///
    /// Returns the servers that failed discovery (partial startup is fine:
    /// failed servers are just absent from the directory).
    pub async fn start_all(&self) -> Vec<(String, DiscoveryError)> {
        let starts = self.handles.iter().map(|(name, handle)| async move {
            let result = handle.start(self.connector.as_ref(), &self.policy).await;
            (name.clone(), result)
        });
        let failures: Vec<_> = join_all(starts)
            .await
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect();

        let directory = self.directory().await;
        tracing::info!(
            servers = self.handles.len(),
            failed = failures.len(),
            tools = directory.len(),
            "server discovery complete"
        );
        failures
    }

    /// Start (or fully re-discover) one server, with retries.
    pub async fn start(&self, name: &str) -> Result<(), McpError> {
        let handle = self.handle(name)?;
        handle
            .start(self.connector.as_ref(), &self.policy)
            .await
            .map_err(McpError::from)
    }

    /// Return the handle if `Ready`; otherwise make one fresh start attempt.
    pub async fn ensure_ready(&self, name: &str) -> Result<Arc<ServerHandle>, McpError> {
        let handle = Arc::clone(self.handle(name)?);
        if handle.status().await == ServerStatus::Ready {
            return Ok(handle);
        }
        handle
            .restart(self.connector.as_ref(), &self.policy)
            .await
            .map(|()| handle)
            .map_err(McpError::from)
    }

    /// Stop every server and publish an empty directory.
    pub async fn shutdown_all(&self) {
        join_all(self.handles.values().map(|h| h.stop())).await;
        tracing::info!(servers = self.handles.len(), "all servers stopped");
    }

    pub async fn statuses(&self) -> Vec<HandleSnapshot> {
        join_all(self.handles.values().map(|h| h.snapshot())).await
    }

    // ─── Directory ───────────────────────────────────────────────────────

    /// The current directory snapshot, rebuilt first if any handle changed
    /// status since the last build.
    pub async fn directory(&self) -> Arc<CapabilityDirectory> {
        {
            let published = self.directory.read().await;
            if published.epoch == self.status_epoch() {
                return Arc::clone(&published.directory);
            }
        }
        self.rebuild_directory().await
    }

    fn status_epoch(&self) -> u64 {
        *self.status_feed.borrow()
    }

    /// Merge the inventories of all `Ready` handles and swap the result in.
    async fn rebuild_directory(&self) -> Arc<CapabilityDirectory> {
        let _guard = self.rebuild_lock.lock().await;

        // Read the epoch before the statuses: a change that lands mid-build
        // leaves this build stale and the next read rebuilds again.
        let epoch = self.status_epoch();
        {
            let published = self.directory.read().await;
            if published.epoch == epoch {
                return Arc::clone(&published.directory);
            }
        }

        let inventories = join_all(self.handles.values().map(|handle| async move {
            handle
                .ready_tools()
                .await
                .map(|tools| (Arc::clone(handle), tools))
        }))
        .await;
        let directory = Arc::new(CapabilityDirectory::from_inventories(
            inventories.into_iter().flatten(),
        ));

        *self.directory.write().await = Published {
            epoch,
            directory: Arc::clone(&directory),
        };
        tracing::debug!(
            tools = directory.len(),
            servers = ?directory.server_names(),
            "capability directory rebuilt"
        );
        directory
    }

    // ─── Tool Calls ──────────────────────────────────────────────────────

    /// Route and execute one tool call.
    ///
    /// Steps:
    /// 1. Resolve the target (restarting a named or likely server if needed)
    /// 2. Check required arguments
    /// 3. Call the tool on the owning server
    ///
    /// Failures are not retried here.
    pub async fn call_tool(
        &self,
        target: &ToolTarget,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let route = self.route(target).await?;
        route.check_arguments(&arguments)?;
        route.handle.call_tool(&route.tool.name, arguments).await
    }

    /// Resolve a target to a route on a `Ready` server.
    pub async fn route(&self, target: &ToolTarget) -> Result<Route, McpError> {
        if let Some(server) = &target.server {
            self.ensure_ready(server).await?;
            return self.directory().await.resolve_on(server, &target.tool);
        }

        match self.directory().await.resolve(&target.tool) {
            Err(McpError::ToolNotFound { .. }) => self.recover(&target.tool).await,
            resolved => resolved,
        }
    }

    /// A tool is missing from the directory: give each server that may
    /// serve it one restart attempt, then resolve again.
    async fn recover(&self, tool: &str) -> Result<Route, McpError> {
        let mut candidates = Vec::new();
        for (name, handle) in &self.handles {
            if handle.may_serve(tool).await {
                candidates.push(name.as_str());
            }
        }
        if candidates.is_empty() {
            return Err(McpError::ToolNotFound {
                name: tool.to_string(),
            });
        }

        tracing::info!(tool, servers = ?candidates, "tool missing, restarting candidate servers");
        let outcomes: HashMap<&str, Result<_, McpError>> = candidates
            .iter()
            .copied()
            .zip(join_all(candidates.iter().map(|name| self.ensure_ready(name))).await)
            .collect();

        match self.directory().await.resolve(tool) {
            Err(McpError::ToolNotFound { .. }) => {
                // Report why the first candidate is still down, if it is.
                let unavailable = candidates
                    .iter()
                    .find_map(|name| outcomes.get(name).and_then(|r| r.as_ref().err()));
                Err(unavailable.cloned().unwrap_or(McpError::ToolNotFound {
                    name: tool.to_string(),
                }))
            }
            resolved => resolved,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
