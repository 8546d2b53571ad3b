//! Orchestrator configuration loading and validation.
//!
//! Reads `orchestrator.yaml` and resolves environment variables. The file
//! names every specialized server, the tools the pipeline uses, and the
//! discovery and refinement tunables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::mcp_client::{DiscoveryPolicy, ServerConfig, ServerDescriptor, ToolTarget};
use crate::pipeline::prompt::DEFAULT_REFINEMENT_TEMPLATE;
use crate::pipeline::PipelineSettings;

/// File searched for when no path is given.
pub const CONFIG_FILE_NAME: &str = "orchestrator.yaml";

/// Environment variable holding an explicit config path.
pub const CONFIG_PATH_ENV: &str = "OMCP_CONFIG";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find orchestrator.yaml (set OMCP_CONFIG or pass --config)")]
    NotFound,

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config field '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Refinement loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RefinementConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Refinements after the first candidate.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Must contain `{sql_query}` and `{issues}`.
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            prompt_template: default_prompt_template(),
        }
    }
}

/// Which tool plays each collaborator role.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_generation_tool")]
    pub generation: ToolTarget,
    #[serde(default = "default_validation_tool")]
    pub validation: ToolTarget,
    #[serde(default = "default_execution_tool")]
    pub execution: ToolTarget,
    /// Fetched as generation context when a question arrives without one.
    /// `null` disables the fetch.
    #[serde(default = "default_schema_tool")]
    pub schema: Option<ToolTarget>,
    /// One-shot repair of caller-supplied SQL, used only when the directory
    /// offers it. `null` disables it.
    #[serde(default = "default_refine_tool")]
    pub refine: Option<ToolTarget>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            generation: default_generation_tool(),
            validation: default_validation_tool(),
            execution: default_execution_tool(),
            schema: default_schema_tool(),
            refine: default_refine_tool(),
        }
    }
}

/// Top-level configuration (mirrors `orchestrator.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Bound on one discovery attempt, in seconds.
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,
    /// Pause between discovery attempts, in seconds.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    /// Discovery retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-call timeout for servers without their own `timeout_secs`.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default)]
    pub refinement: RefinementConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

fn default_true() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    2
}
fn default_prompt_template() -> String {
    DEFAULT_REFINEMENT_TEMPLATE.to_string()
}
fn default_generation_tool() -> ToolTarget {
    ToolTarget::on("ollama", "Generate_SQL")
}
fn default_validation_tool() -> ToolTarget {
    ToolTarget::on("validation", "Comprehensive_Validation")
}
fn default_execution_tool() -> ToolTarget {
    ToolTarget::on("sql", "Execute_SQL_Query")
}
fn default_schema_tool() -> Option<ToolTarget> {
    Some(ToolTarget::on("sql", "Get_OMOP_Schema"))
}
fn default_refine_tool() -> Option<ToolTarget> {
    Some(ToolTarget::new("Refine_SQL"))
}
fn default_discovery_timeout_secs() -> u64 {
    30
}
fn default_retry_interval_secs() -> u64 {
    2
}
fn default_max_retries() -> u32 {
    3
}
fn default_call_timeout_secs() -> u64 {
    60
}

impl OrchestratorConfig {
    pub fn discovery_policy(&self) -> DiscoveryPolicy {
        DiscoveryPolicy {
            discovery_timeout: Duration::from_secs(self.discovery_timeout_secs),
            retry_interval: Duration::from_secs(self.retry_interval_secs),
            max_retries: self.max_retries,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            refinement_enabled: self.refinement.enabled,
            max_attempts: self.refinement.max_attempts,
            prompt_template: self.refinement.prompt_template.clone(),
            generation: self.tools.generation.clone(),
            validation: self.tools.validation.clone(),
            schema: self.tools.schema.clone(),
        }
    }

    /// Immutable descriptors for every configured server.
    pub fn server_descriptors(&self) -> Result<Vec<ServerDescriptor>, ConfigError> {
        self.servers
            .iter()
            .map(|(name, server)| {
                ServerDescriptor::from_config(name, server, self.call_timeout()).map_err(|e| {
                    ConfigError::Invalid {
                        field: format!("servers.{name}"),
                        reason: e.to_string(),
                    }
                })
            })
            .collect()
    }

    /// Check the fields serde cannot: timeouts, template placeholders,
    /// server launch details, and tool targets naming known servers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.discovery_timeout_secs == 0 {
            return Err(invalid("discovery_timeout_secs", "must be greater than 0"));
        }
        if self.call_timeout_secs == 0 {
            return Err(invalid("call_timeout_secs", "must be greater than 0"));
        }
        for placeholder in ["{sql_query}", "{issues}"] {
            if !self.refinement.prompt_template.contains(placeholder) {
                return Err(invalid(
                    "refinement.prompt_template",
                    &format!("missing {placeholder} placeholder"),
                ));
            }
        }

        self.server_descriptors()?;

        let mut targets = vec![
            ("tools.generation", &self.tools.generation),
            ("tools.validation", &self.tools.validation),
            ("tools.execution", &self.tools.execution),
        ];
        if let Some(schema) = &self.tools.schema {
            targets.push(("tools.schema", schema));
        }
        if let Some(refine) = &self.tools.refine {
            targets.push(("tools.refine", refine));
        }
        for (field, target) in targets {
            if target.tool.trim().is_empty() {
                return Err(invalid(field, "tool name is empty"));
            }
            if let Some(server) = &target.server {
                if !self.servers.contains_key(server) {
                    return Err(invalid(field, &format!("unknown server '{server}'")));
                }
            }
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `OMCP_CONFIG` first, then searches upward from `start` for
/// `orchestrator.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
        let candidate = PathBuf::from(with_home_dir(&explicit));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "OMCP_CONFIG points to a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(ConfigError::NotFound)
}

/// Load, interpolate, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let config = parse_config(&raw)?;
    tracing::info!(
        path = %path.display(),
        servers = config.servers.len(),
        "loaded orchestrator config"
    );
    Ok(config)
}

/// Parse and validate config text.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn parse_config(raw: &str) -> Result<OrchestratorConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    let config: OrchestratorConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Substitute `${VAR}` and `${VAR:-default}` from the environment.
///
/// Unset variables without a default become empty, and a default may start
/// with `~`. An unterminated `${` is copied through untouched.
fn interpolate_env_vars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let body = &rest[open + 2..];
        let Some(close) = body.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };

        let (name, fallback) = match body[..close].split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (&body[..close], None),
        };
        let value = std::env::var(name)
            .ok()
            .or_else(|| fallback.map(with_home_dir))
            .unwrap_or_default();
        out.push_str(&value);
        rest = &body[close + 1..];
    }

    out.push_str(rest);
    out
}

/// `~/x` becomes `$HOME/x`; anything else is returned unchanged.
fn with_home_dir(path: &str) -> String {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
        _ => path.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
