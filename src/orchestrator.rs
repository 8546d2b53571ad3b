//! The surface offered to API and CLI layers.
//!
//! [`Orchestrator`] ties the server registry to a pipeline built from
//! configuration:
//! 1. `start` discovers every configured server concurrently
//! 2. `run_pipeline` turns a question into validated SQL
//! 3. `handle_agent_message` does the same for A2A messages
//! 4. `validate_sql` checks caller-supplied SQL, with one repair attempt
//! 5. `execute_sql` runs an accepted query (never called by the pipeline)

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::a2a::{
    bridge::missing_question_message, first_user_message, message_to_invocation,
    result_to_message, AgentMessage, AgentRequest, AgentResponse,
};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::mcp_client::{DiscoveryError, HandleSnapshot, McpError, ServerRegistry, ToolTarget};
use crate::pipeline::{Pipeline, PipelineResult, ToolInvoker, ValidationIssue, ValidationResult};

/// Verdict on caller-supplied SQL, plus the outcome of the repair attempt
/// when the SQL was rejected.
#[derive(Debug, Clone, Serialize)]
pub struct SqlReview {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
    pub refinement_attempted: bool,
    pub refinement_successful: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refined_sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refined_issues: Option<Vec<ValidationIssue>>,
}

pub struct Orchestrator {
    registry: Arc<ServerRegistry>,
    pipeline: Pipeline,
    validation: ToolTarget,
    refine: Option<ToolTarget>,
    execution: ToolTarget,
}

impl Orchestrator {
    /// Validate `config` and build an orchestrator whose servers are not yet
    /// started.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = ServerRegistry::new(config.server_descriptors()?, config.discovery_policy());
        Ok(Self::with_registry(Arc::new(registry), config))
    }

    pub fn with_registry(registry: Arc<ServerRegistry>, config: &OrchestratorConfig) -> Self {
        let invoker: Arc<dyn ToolInvoker> = Arc::clone(&registry) as Arc<dyn ToolInvoker>;
        Self {
            pipeline: Pipeline::new(invoker, config.pipeline_settings()),
            validation: config.tools.validation.clone(),
            refine: config.tools.refine.clone(),
            execution: config.tools.execution.clone(),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Discover every server. Servers that fail are logged and left out of
    /// the directory; the orchestrator keeps running without them.
    pub async fn start(&self) -> Vec<(String, DiscoveryError)> {
        let failures = self.registry.start_all().await;
        for (server, error) in &failures {
            tracing::warn!(server = %server, error = %error, "server unavailable after discovery");
        }
        failures
    }

    pub async fn run_pipeline(&self, question: &str, context: Option<Value>) -> PipelineResult {
        self.pipeline.run(question, context).await
    }

    pub async fn run_pipeline_with_cancel(
        &self,
        question: &str,
        context: Option<Value>,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        self.pipeline.run_with_cancel(question, context, cancel).await
    }

    /// Answer one agent message with one assistant message.
    pub async fn handle_agent_message(&self, message: &AgentMessage) -> AgentMessage {
        let invocation = message_to_invocation(message);
        let result = self
            .pipeline
            .run(&invocation.question, invocation.context)
            .await;
        result_to_message(&result)
    }

    /// Answer an A2A request from its first user message.
    pub async fn handle_agent_request(&self, request: &AgentRequest) -> AgentResponse {
        let reply = match first_user_message(request) {
            Some(message) => {
                tracing::info!(
                    messages = request.messages.len(),
                    "A2A request received"
                );
                self.handle_agent_message(message).await
            }
            None => {
                tracing::warn!("A2A request without a user message");
                missing_question_message()
            }
        };
        AgentResponse::single(reply)
    }

    /// Validate `sql` as given. When it is rejected and the directory offers
    /// the refine tool, ask for one repaired query.
    ///
    /// A failing refine call is logged and reported as an unsuccessful
    /// attempt; only the validation call itself can fail this operation.
    pub async fn validate_sql(&self, sql: &str) -> Result<SqlReview, McpError> {
        let output = self
            .registry
            .call_tool(&self.validation, json!({ "sql": sql }))
            .await?;
        let verdict = ValidationResult::from_output(&output).map_err(|reason| {
            McpError::InvalidOutput {
                tool: self.validation.to_string(),
                reason,
            }
        })?;

        let mut review = SqlReview {
            is_valid: verdict.valid,
            issues: verdict.issues,
            refinement_attempted: false,
            refinement_successful: false,
            refined_sql: None,
            refined_issues: None,
        };
        if review.is_valid {
            return Ok(review);
        }

        let Some(refine) = &self.refine else {
            return Ok(review);
        };
        if self.registry.directory().await.resolve_target(refine).is_err() {
            tracing::debug!(tool = %refine, "refine tool not offered, returning verdict only");
            return Ok(review);
        }

        review.refinement_attempted = true;
        let arguments = json!({ "sql": sql, "issues": review.issues });
        let output = match self.registry.call_tool(refine, arguments).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(tool = %refine, error = %e, "refine call failed");
                return Ok(review);
            }
        };

        let refined_sql = ["refined_sql", "sql"]
            .iter()
            .find_map(|key| output.get(*key).and_then(Value::as_str));
        match (ValidationResult::from_output(&output), refined_sql) {
            (Ok(refined), Some(refined_sql)) if refined.valid => {
                review.refinement_successful = true;
                review.refined_sql = Some(refined_sql.to_string());
                review.refined_issues = Some(refined.issues);
            }
            _ => tracing::info!(tool = %refine, "refinement did not produce a valid query"),
        }
        Ok(review)
    }

    /// Run `sql` through the configured execution tool.
    pub async fn execute_sql(
        &self,
        sql: &str,
        connection_name: Option<&str>,
    ) -> Result<Value, McpError> {
        let mut arguments = json!({ "sql": sql });
        if let Some(name) = connection_name {
            arguments["connectionName"] = json!(name);
        }
        self.registry.call_tool(&self.execution, arguments).await
    }

    /// Status, tool count, retries and last error for every server.
    pub async fn health(&self) -> Vec<HandleSnapshot> {
        self.registry.statuses().await
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
