//! Capability directory: which ready server serves which tool.
//!
//! A directory is an immutable snapshot. The registry builds a new one from
//! the inventories of its `Ready` handles and swaps it in whole, so readers
//! see either the previous merge or the next one, never a mix.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::errors::McpError;
use super::lifecycle::ServerHandle;
use super::types::{ToolDescriptor, ToolTarget};

/// A tool resolved to the handle that serves it.
#[derive(Clone)]
pub struct Route {
    pub handle: Arc<ServerHandle>,
    pub tool: ToolDescriptor,
}

impl Route {
    pub fn server(&self) -> &str {
        self.handle.name()
    }

    /// Check that `arguments` carries every field the tool's schema requires.
    ///
    /// Structural only; full schema validation is left to the server.
    pub fn check_arguments(&self, arguments: &serde_json::Value) -> Result<(), McpError> {
        let missing: Vec<&str> = self
            .tool
            .required_fields()
            .into_iter()
            .filter(|field| arguments.get(*field).is_none())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(McpError::InvalidArguments {
            tool: self.tool.name.clone(),
            reason: format!("missing required field(s): {}", missing.join(", ")),
        })
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("server", &self.server())
            .field("tool", &self.tool.name)
            .finish()
    }
}

/// Merged tool inventory of every ready server.
#[derive(Default)]
pub struct CapabilityDirectory {
    /// `tool name → routes`, one route per server advertising it.
    tools: BTreeMap<String, Vec<Route>>,
}

impl CapabilityDirectory {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Merge inventories. Callers pass only handles that are `Ready`.
    pub fn from_inventories(
        inventories: impl IntoIterator<Item = (Arc<ServerHandle>, Arc<Vec<ToolDescriptor>>)>,
    ) -> Self {
        let mut tools: BTreeMap<String, Vec<Route>> = BTreeMap::new();
        for (handle, inventory) in inventories {
            for tool in inventory.iter() {
                tools.entry(tool.name.clone()).or_default().push(Route {
                    handle: Arc::clone(&handle),
                    tool: tool.clone(),
                });
            }
        }
        for routes in tools.values_mut() {
            routes.sort_by(|a, b| a.server().cmp(b.server()));
        }
        Self { tools }
    }

    /// Resolve a tool by name.
    ///
    /// `name` may be qualified as `server.tool` to pick one of several
    /// servers offering the same tool. An exact tool-name match wins over a
    /// qualified reading, so tools whose own names contain a dot still work.
    pub fn resolve(&self, name: &str) -> Result<Route, McpError> {
        match self.tools.get(name).map(Vec::as_slice) {
            Some([route]) => Ok(route.clone()),
            Some(routes) if routes.len() > 1 => Err(McpError::AmbiguousTool {
                name: name.to_string(),
                servers: routes.iter().map(|r| r.server().to_string()).collect(),
            }),
            _ => match name.split_once('.') {
                Some((server, tool)) => self.resolve_on(server, tool),
                None => Err(McpError::ToolNotFound {
                    name: name.to_string(),
                }),
            },
        }
    }

    /// Resolve a tool on one named server.
    pub fn resolve_on(&self, server: &str, tool: &str) -> Result<Route, McpError> {
        self.tools
            .get(tool)
            .and_then(|routes| routes.iter().find(|r| r.server() == server))
            .cloned()
            .ok_or_else(|| McpError::ToolNotFound {
                name: format!("{server}.{tool}"),
            })
    }

    pub fn resolve_target(&self, target: &ToolTarget) -> Result<Route, McpError> {
        match &target.server {
            Some(server) => self.resolve_on(server, &target.tool),
            None => self.resolve(&target.tool),
        }
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.tools.contains_key(tool)
    }

    /// Distinct tool names, sorted.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Servers contributing at least one tool, sorted.
    pub fn server_names(&self) -> Vec<String> {
        self.tools
            .values()
            .flatten()
            .map(|r| r.server().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Number of `(server, tool)` pairs.
    pub fn len(&self) -> usize {
        self.tools.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for CapabilityDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.tools
                    .iter()
                    .map(|(name, routes)| (name, routes.iter().map(Route::server).collect::<Vec<_>>())),
            )
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
