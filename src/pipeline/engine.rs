//! The generate → validate → refine state machine.
//!
//! ```text
//! Generating ──► Validating ──► Succeeded
//!     ▲              │
//!     │              ▼
//!     └──────── Refining ──► Failed
//! ```
//!
//! One run per question. States of a run execute strictly in sequence;
//! separate runs share nothing but the invoker. The loop is bounded by the
//! refinement budget alone: `attempts <= max_attempts + 1`.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::invoker::ToolInvoker;
use super::prompt::{accumulate_issues, render_refinement_prompt, DEFAULT_REFINEMENT_TEMPLATE};
use super::types::{
    FailureReason, PipelineResult, PipelineState, Session, SqlCandidate, ValidationIssue,
    ValidationResult,
};
use crate::mcp_client::{McpError, ToolTarget};

/// Tools and refinement budget for a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub refinement_enabled: bool,
    /// Refinements allowed after the first candidate.
    pub max_attempts: u32,
    pub prompt_template: String,
    pub generation: ToolTarget,
    pub validation: ToolTarget,
    /// Called for context when a question arrives without any.
    pub schema: Option<ToolTarget>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            refinement_enabled: true,
            max_attempts: 2,
            prompt_template: DEFAULT_REFINEMENT_TEMPLATE.to_string(),
            generation: ToolTarget::new("Generate_SQL"),
            validation: ToolTarget::new("Comprehensive_Validation"),
            schema: None,
        }
    }
}

/// A terminal failure raised inside a state.
struct Halt {
    reason: FailureReason,
    detail: String,
}

impl Halt {
    fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    /// Classify a tool error: routing problems are their own reason,
    /// everything else means the collaborator is unavailable.
    fn from_call(err: McpError, unavailable: FailureReason) -> Self {
        let reason = if err.is_routing() {
            FailureReason::RoutingFailed
        } else {
            unavailable
        };
        Self::new(reason, err.to_string())
    }
}

pub struct Pipeline {
    invoker: Arc<dyn ToolInvoker>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(invoker: Arc<dyn ToolInvoker>, settings: PipelineSettings) -> Self {
        Self { invoker, settings }
    }

    /// Turn a question into validated SQL.
    pub async fn run(&self, question: &str, context: Option<Value>) -> PipelineResult {
        self.run_with_cancel(question, context, &CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), checking `cancel` at every state transition.
    ///
    /// A call already in flight is allowed to finish (or time out) and its
    /// result is discarded.
    pub async fn run_with_cancel(
        &self,
        question: &str,
        context: Option<Value>,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        let session = Session::new(question, context);
        let span = tracing::info_span!("pipeline", session_id = %session.id);
        self.drive(session, cancel).instrument(span).await
    }

    async fn drive(&self, mut session: Session, cancel: &CancellationToken) -> PipelineResult {
        tracing::info!(question = %session.question, "pipeline started");

        if session.context.is_none() && !cancel.is_cancelled() {
            session.context = self.fetch_schema().await;
        }

        let mut seen_issues: Vec<ValidationIssue> = Vec::new();
        let mut last_issues: Vec<ValidationIssue> = Vec::new();
        let mut previous: Option<SqlCandidate> = None;
        let mut original_sql: Option<String> = None;
        let mut refinements: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return self.cancelled(&session, last_issues, previous);
            }
            session.attempts += 1;
            enter(PipelineState::Generating, session.attempts);

            let candidate = match self.generate(&session, previous.as_ref(), &seen_issues).await {
                Ok(candidate) => candidate,
                Err(halt) => {
                    return self.failed(&session, halt, last_issues, previous.map(|c| c.sql))
                }
            };
            tracing::debug!(attempt = session.attempts, sql = %candidate.sql, "candidate generated");
            let original = original_sql.get_or_insert_with(|| candidate.sql.clone()).clone();

            if cancel.is_cancelled() {
                return self.cancelled(&session, last_issues, Some(candidate));
            }
            enter(PipelineState::Validating, session.attempts);

            let verdict = match self.validate(&candidate).await {
                Ok(verdict) => verdict,
                Err(halt) => {
                    return self.failed(&session, halt, last_issues, Some(candidate.sql))
                }
            };

            if cancel.is_cancelled() {
                return self.cancelled(&session, verdict.issues, Some(candidate));
            }

            if verdict.valid {
                enter(PipelineState::Succeeded, session.attempts);
                tracing::info!(attempts = session.attempts, "pipeline succeeded");
                return PipelineResult::Success {
                    session_id: session.id,
                    sql: candidate.sql,
                    attempts: session.attempts,
                    original_sql: original,
                    confidence: candidate.confidence,
                };
            }

            tracing::info!(
                attempt = session.attempts,
                issues = verdict.issues.len(),
                "candidate rejected by validation"
            );
            accumulate_issues(&mut seen_issues, &verdict.issues);
            last_issues = verdict.issues;

            if !self.settings.refinement_enabled {
                let halt = Halt::new(
                    FailureReason::ValidationRejected,
                    "validation failed and refinement is disabled",
                );
                return self.failed(&session, halt, last_issues, Some(candidate.sql));
            }
            if refinements >= self.settings.max_attempts {
                let halt = Halt::new(
                    FailureReason::AttemptsExhausted,
                    format!("validation still failing after {refinements} refinement(s)"),
                );
                return self.failed(&session, halt, last_issues, Some(candidate.sql));
            }

            refinements += 1;
            enter(PipelineState::Refining, session.attempts);
            previous = Some(candidate);
        }
    }

    // ─── States ──────────────────────────────────────────────────────────

    /// Generating: one call, retried once on a transport fault.
    async fn generate(
        &self,
        session: &Session,
        previous: Option<&SqlCandidate>,
        issues: &[ValidationIssue],
    ) -> Result<SqlCandidate, Halt> {
        let mut arguments = json!({
            "question": session.question,
            "context": session.context.clone().unwrap_or(Value::Null),
        });
        let prompt = previous.map(|prior| {
            render_refinement_prompt(&self.settings.prompt_template, &prior.sql, issues)
        });
        if let (Some(prior), Some(prompt)) = (previous, &prompt) {
            arguments["priorSql"] = json!(prior.sql);
            arguments["issues"] = json!(issues);
            arguments["prompt"] = json!(prompt);
        }

        let output = self
            .call_retrying_once(&self.settings.generation, arguments)
            .await
            .map_err(|e| Halt::from_call(e, FailureReason::GenerationUnavailable))?;

        SqlCandidate::from_output(&output, session.attempts, prompt)
            .map_err(|reason| Halt::new(FailureReason::GenerationUnavailable, reason))
    }

    /// Validating: one call, never retried.
    async fn validate(&self, candidate: &SqlCandidate) -> Result<ValidationResult, Halt> {
        let output = self
            .invoker
            .invoke(&self.settings.validation, json!({ "sql": candidate.sql }))
            .await
            .map_err(|e| Halt::from_call(e, FailureReason::ValidationUnavailable))?;

        ValidationResult::from_output(&output)
            .map_err(|reason| Halt::new(FailureReason::ValidationUnavailable, reason))
    }

    /// Fetch schema context. Failure leaves the context empty.
    async fn fetch_schema(&self) -> Option<Value> {
        let target = self.settings.schema.as_ref()?;
        match self.call_retrying_once(target, json!({})).await {
            Ok(schema) => {
                tracing::debug!(tool = %target, "schema context fetched");
                Some(schema)
            }
            Err(e) => {
                tracing::warn!(tool = %target, error = %e, "schema fetch failed, continuing without context");
                None
            }
        }
    }

    async fn call_retrying_once(
        &self,
        target: &ToolTarget,
        arguments: Value,
    ) -> Result<Value, McpError> {
        match self.invoker.invoke(target, arguments.clone()).await {
            Err(e) if e.is_retryable() => {
                tracing::warn!(tool = %target, error = %e, "transient tool failure, retrying once");
                self.invoker.invoke(target, arguments).await
            }
            result => result,
        }
    }

    // ─── Outcomes ────────────────────────────────────────────────────────

    fn failed(
        &self,
        session: &Session,
        halt: Halt,
        last_issues: Vec<ValidationIssue>,
        last_sql: Option<String>,
    ) -> PipelineResult {
        enter(PipelineState::Failed, session.attempts);
        tracing::warn!(
            attempts = session.attempts,
            reason = %halt.reason,
            detail = %halt.detail,
            "pipeline failed"
        );
        PipelineResult::Failed {
            session_id: session.id,
            reason: halt.reason,
            detail: halt.detail,
            attempts: session.attempts,
            last_issues,
            last_sql,
        }
    }

    fn cancelled(
        &self,
        session: &Session,
        last_issues: Vec<ValidationIssue>,
        last: Option<SqlCandidate>,
    ) -> PipelineResult {
        let halt = Halt::new(FailureReason::Cancelled, "session cancelled");
        self.failed(session, halt, last_issues, last.map(|c| c.sql))
    }
}

fn enter(state: PipelineState, attempt: u32) {
    tracing::debug!(state = %state, attempt, "pipeline state");
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::TransportError;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    type Reply = Result<Value, McpError>;

    /// Replies to each tool from a queue; records every call.
    #[derive(Default)]
    struct ScriptedInvoker {
        replies: Mutex<HashMap<String, VecDeque<Reply>>>,
        calls: Mutex<Vec<(String, Value)>>,
        cancel_on: Mutex<Option<(String, CancellationToken)>>,
    }

    impl ScriptedInvoker {
        fn new() -> Self {
            Self::default()
        }

        fn on(self, tool: &str, replies: Vec<Reply>) -> Self {
            self.replies
                .lock()
                .unwrap()
                .entry(tool.to_string())
                .or_default()
                .extend(replies);
            self
        }

        /// Cancel `token` while a call to `tool` is in flight.
        fn cancelling(self, tool: &str, token: &CancellationToken) -> Self {
            *self.cancel_on.lock().unwrap() = Some((tool.to_string(), token.clone()));
            self
        }

        fn calls_to(&self, tool: &str) -> Vec<Value> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == tool)
                .map(|(_, args)| args.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ToolInvoker for ScriptedInvoker {
        async fn invoke(&self, target: &ToolTarget, arguments: Value) -> Result<Value, McpError> {
            self.calls
                .lock()
                .unwrap()
                .push((target.tool.clone(), arguments));
            if let Some((tool, token)) = &*self.cancel_on.lock().unwrap() {
                if *tool == target.tool {
                    token.cancel();
                }
            }
            self.replies
                .lock()
                .unwrap()
                .get_mut(&target.tool)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| {
                    Err(McpError::ToolNotFound {
                        name: target.tool.clone(),
                    })
                })
        }
    }

    const GENERATE: &str = "Generate_SQL";
    const VALIDATE: &str = "Comprehensive_Validation";

    fn sql(s: &str) -> Reply {
        Ok(json!({ "sql": s }))
    }

    fn valid() -> Reply {
        Ok(json!({ "valid": true, "issues": [] }))
    }

    fn invalid(issues: &[&str]) -> Reply {
        Ok(json!({ "valid": false, "issues": issues }))
    }

    fn timeout() -> Reply {
        Err(McpError::Transport(TransportError::Timeout {
            server: "ollama".into(),
            method: "tools/call".into(),
            timeout_ms: 60_000,
        }))
    }

    fn pipeline(invoker: &Arc<ScriptedInvoker>, settings: PipelineSettings) -> Pipeline {
        Pipeline::new(Arc::clone(invoker) as Arc<dyn ToolInvoker>, settings)
    }

    fn settings(max_attempts: u32) -> PipelineSettings {
        PipelineSettings {
            max_attempts,
            ..PipelineSettings::default()
        }
    }

    #[tokio::test]
    async fn test_valid_first_candidate_needs_one_call_each() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .on(GENERATE, vec![Ok(json!({"sql": "SELECT 1", "confidence": 0.8}))])
                .on(VALIDATE, vec![valid()]),
        );

        let result = pipeline(&invoker, settings(2)).run("how many people?", None).await;

        match result {
            PipelineResult::Success { sql, attempts, original_sql, confidence, .. } => {
                assert_eq!(sql, "SELECT 1");
                assert_eq!(attempts, 1);
                assert_eq!(original_sql, "SELECT 1");
                assert_eq!(confidence, Some(0.8));
            }
            other => panic!("expected Success, got {other:?}"),
        }
        assert_eq!(invoker.calls_to(GENERATE).len(), 1);
        assert_eq!(invoker.calls_to(VALIDATE), vec![json!({"sql": "SELECT 1"})]);
    }

    #[tokio::test]
    async fn test_refinement_feeds_issues_and_prior_sql_back() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .on(GENERATE, vec![sql("SELECT A"), sql("SELECT B")])
                .on(VALIDATE, vec![invalid(&["missing concept mapping"]), valid()]),
        );

        let result = pipeline(&invoker, settings(2))
            .run("count patients with diabetes", Some(json!("omop schema")))
            .await;

        match &result {
            PipelineResult::Success { sql, attempts, original_sql, .. } => {
                assert_eq!(sql, "SELECT B");
                assert_eq!(*attempts, 2);
                assert_eq!(original_sql, "SELECT A");
            }
            other => panic!("expected Success, got {other:?}"),
        }

        let generations = invoker.calls_to(GENERATE);
        assert_eq!(generations[0]["question"], "count patients with diabetes");
        assert_eq!(generations[0]["context"], "omop schema");
        assert!(generations[0].get("priorSql").is_none());

        let refine = &generations[1];
        assert_eq!(refine["priorSql"], "SELECT A");
        assert_eq!(refine["issues"][0]["message"], "missing concept mapping");
        let prompt = refine["prompt"].as_str().unwrap();
        assert!(prompt.contains("SELECT A"));
        assert!(prompt.contains("- missing concept mapping"));
    }

    #[tokio::test]
    async fn test_budget_exhausted_after_max_refinements() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .on(GENERATE, vec![sql("S1"), sql("S2"), sql("S3")])
                .on(
                    VALIDATE,
                    vec![invalid(&["i1"]), invalid(&["i2"]), invalid(&["i3"])],
                ),
        );

        let result = pipeline(&invoker, settings(2)).run("q", Some(json!({}))).await;

        match result {
            PipelineResult::Failed { reason, attempts, last_issues, last_sql, .. } => {
                assert_eq!(reason, FailureReason::AttemptsExhausted);
                assert_eq!(attempts, 3);
                assert_eq!(last_issues, vec![ValidationIssue::new(None, "i3")]);
                assert_eq!(last_sql.as_deref(), Some("S3"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(invoker.calls_to(GENERATE).len(), 3);
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_budget_plus_one() {
        for max_attempts in 0..4u32 {
            let n = max_attempts as usize + 2;
            let invoker = Arc::new(
                ScriptedInvoker::new()
                    .on(GENERATE, (0..n).map(|i| sql(&format!("S{i}"))).collect())
                    .on(VALIDATE, (0..n).map(|_| invalid(&["nope"])).collect()),
            );

            let result = pipeline(&invoker, settings(max_attempts))
                .run("q", Some(json!({})))
                .await;

            assert_eq!(result.attempts(), max_attempts + 1);
            assert_eq!(result.failure_reason(), Some(FailureReason::AttemptsExhausted));
            assert_eq!(invoker.calls_to(GENERATE).len(), max_attempts as usize + 1);
        }
    }

    #[tokio::test]
    async fn test_refinement_disabled_fails_after_first_candidate() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .on(GENERATE, vec![sql("S1")])
                .on(VALIDATE, vec![invalid(&["bad join"])]),
        );
        let settings = PipelineSettings {
            refinement_enabled: false,
            ..settings(2)
        };

        let result = pipeline(&invoker, settings).run("q", Some(json!({}))).await;

        match result {
            PipelineResult::Failed { reason, attempts, last_issues, .. } => {
                assert_eq!(reason, FailureReason::ValidationRejected);
                assert_eq!(attempts, 1);
                assert_eq!(last_issues, vec![ValidationIssue::new(None, "bad join")]);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generation_timing_out_twice_is_unavailable() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .on(GENERATE, vec![timeout(), timeout()])
                .on(VALIDATE, vec![valid()]),
        );

        let result = pipeline(&invoker, settings(2)).run("q", Some(json!({}))).await;

        assert_eq!(
            result.failure_reason(),
            Some(FailureReason::GenerationUnavailable)
        );
        assert_eq!(result.attempts(), 1);
        assert_eq!(invoker.calls_to(GENERATE).len(), 2);
        assert!(invoker.calls_to(VALIDATE).is_empty());
    }

    #[tokio::test]
    async fn test_single_generation_timeout_is_retried_with_same_inputs() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .on(GENERATE, vec![timeout(), sql("SELECT 1")])
                .on(VALIDATE, vec![valid()]),
        );

        let result = pipeline(&invoker, settings(2)).run("q", Some(json!({}))).await;

        assert!(result.is_success());
        assert_eq!(result.attempts(), 1);
        let calls = invoker.calls_to(GENERATE);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
    }

    #[tokio::test]
    async fn test_validation_transport_failure_is_not_retried() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .on(GENERATE, vec![sql("SELECT 1")])
                .on(VALIDATE, vec![timeout(), valid()]),
        );

        let result = pipeline(&invoker, settings(2)).run("q", Some(json!({}))).await;

        match result {
            PipelineResult::Failed { reason, last_sql, .. } => {
                assert_eq!(reason, FailureReason::ValidationUnavailable);
                assert_eq!(last_sql.as_deref(), Some("SELECT 1"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(invoker.calls_to(VALIDATE).len(), 1);
    }

    #[tokio::test]
    async fn test_routing_error_is_terminal_and_not_retried() {
        let invoker = Arc::new(ScriptedInvoker::new().on(
            GENERATE,
            vec![Err(McpError::AmbiguousTool {
                name: GENERATE.into(),
                servers: vec!["a".into(), "b".into()],
            })],
        ));

        let result = pipeline(&invoker, settings(2)).run("q", Some(json!({}))).await;

        assert_eq!(result.failure_reason(), Some(FailureReason::RoutingFailed));
        assert_eq!(invoker.calls_to(GENERATE).len(), 1);
    }

    #[tokio::test]
    async fn test_unusable_validation_output_is_unavailable() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .on(GENERATE, vec![sql("SELECT 1")])
                .on(VALIDATE, vec![Ok(json!("looks fine to me"))]),
        );

        let result = pipeline(&invoker, settings(2)).run("q", Some(json!({}))).await;

        assert_eq!(
            result.failure_reason(),
            Some(FailureReason::ValidationUnavailable)
        );
    }

    #[tokio::test]
    async fn test_refinement_prompt_accumulates_issues() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .on(GENERATE, vec![sql("S1"), sql("S2"), sql("S3")])
                .on(
                    VALIDATE,
                    vec![invalid(&["first"]), invalid(&["first", "second"]), valid()],
                ),
        );

        let result = pipeline(&invoker, settings(3)).run("q", Some(json!({}))).await;
        assert!(result.is_success());

        let third = &invoker.calls_to(GENERATE)[2];
        assert_eq!(third["priorSql"], "S2");
        let prompt = third["prompt"].as_str().unwrap();
        assert_eq!(prompt.matches("- first").count(), 1);
        assert!(prompt.contains("- second"));
    }

    #[tokio::test]
    async fn test_schema_is_fetched_when_context_missing() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .on("Get_OMOP_Schema", vec![Ok(json!({"tables": ["person"]}))])
                .on(GENERATE, vec![sql("SELECT 1")])
                .on(VALIDATE, vec![valid()]),
        );
        let settings = PipelineSettings {
            schema: Some(ToolTarget::on("sql", "Get_OMOP_Schema")),
            ..settings(2)
        };

        let result = pipeline(&invoker, settings).run("q", None).await;

        assert!(result.is_success());
        assert_eq!(
            invoker.calls_to(GENERATE)[0]["context"],
            json!({"tables": ["person"]})
        );
    }

    #[tokio::test]
    async fn test_schema_failure_does_not_stop_pipeline() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .on(GENERATE, vec![sql("SELECT 1")])
                .on(VALIDATE, vec![valid()]),
        );
        let settings = PipelineSettings {
            schema: Some(ToolTarget::on("sql", "Get_OMOP_Schema")),
            ..settings(2)
        };

        let result = pipeline(&invoker, settings).run("q", None).await;

        assert!(result.is_success());
        assert_eq!(invoker.calls_to("Get_OMOP_Schema").len(), 1);
        assert_eq!(invoker.calls_to(GENERATE)[0]["context"], Value::Null);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_makes_no_calls() {
        let invoker = Arc::new(ScriptedInvoker::new());
        let token = CancellationToken::new();
        token.cancel();

        let result = pipeline(&invoker, settings(2))
            .run_with_cancel("q", None, &token)
            .await;

        assert_eq!(result.failure_reason(), Some(FailureReason::Cancelled));
        assert_eq!(result.attempts(), 0);
        assert!(invoker.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_generation_discards_candidate() {
        let token = CancellationToken::new();
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .on(GENERATE, vec![sql("SELECT 1")])
                .on(VALIDATE, vec![valid()])
                .cancelling(GENERATE, &token),
        );

        let result = pipeline(&invoker, settings(2))
            .run_with_cancel("q", Some(json!({})), &token)
            .await;

        match result {
            PipelineResult::Failed { reason, attempts, last_sql, .. } => {
                assert_eq!(reason, FailureReason::Cancelled);
                assert_eq!(attempts, 1);
                assert_eq!(last_sql.as_deref(), Some("SELECT 1"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(invoker.calls_to(VALIDATE).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_independent() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .on(GENERATE, vec![sql("SELECT 1"), sql("SELECT 1")])
                .on(VALIDATE, vec![valid(), valid()]),
        );
        let pipeline = pipeline(&invoker, settings(2));

        let (a, b) = tokio::join!(
            pipeline.run("first", Some(json!({}))),
            pipeline.run("second", Some(json!({})))
        );

        assert!(a.is_success() && b.is_success());
        assert_ne!(a.session_id(), b.session_id());
    }
}
