//! Pipeline data types.
//!
//! Collaborator outputs are parsed leniently: generation servers reply with
//! `{sql, confidence?}`, a bare string, or a `[sql, confidence]` pair, and
//! validation servers use either `valid` or `is_valid` and report issues as
//! objects or plain strings.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Session ─────────────────────────────────────────────────────────────────

/// One question moving through the pipeline. Owned by a single run and
/// dropped when it terminates.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub question: String,
    pub context: Option<Value>,
    /// Candidates generated so far.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(question: &str, context: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: question.to_string(),
            context,
            attempts: 0,
            created_at: Utc::now(),
        }
    }
}

// ─── Candidates ──────────────────────────────────────────────────────────────

/// One generated query. Refinement supersedes a candidate with a new one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlCandidate {
    pub sql: String,
    pub attempt: u32,
    /// Refinement prompt that produced this candidate; `None` for the first.
    pub prompt: Option<String>,
    pub confidence: Option<f64>,
}

impl SqlCandidate {
    /// Read a candidate from a generation tool's output.
    pub fn from_output(output: &Value, attempt: u32, prompt: Option<String>) -> Result<Self, String> {
        let (sql, confidence) = match output {
            Value::String(sql) => (Some(sql.as_str()), None),
            Value::Array(items) => (
                items.first().and_then(Value::as_str),
                items.get(1).and_then(Value::as_f64),
            ),
            Value::Object(fields) => (
                ["sql", "sql_query", "query"]
                    .iter()
                    .find_map(|key| fields.get(*key).and_then(Value::as_str)),
                fields.get("confidence").and_then(Value::as_f64),
            ),
            _ => (None, None),
        };

        let sql = sql.map(str::trim).filter(|s| !s.is_empty()).ok_or_else(|| {
            format!("no SQL in generation output: {}", truncate(&output.to_string(), 200))
        })?;

        Ok(Self {
            sql: sql.to_string(),
            attempt,
            prompt,
            confidence,
        })
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// One problem the validator found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(rule: Option<&str>, message: &str) -> Self {
        Self {
            rule: rule.map(str::to_string),
            message: message.to_string(),
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(message) => Some(Self::new(None, message)),
            Value::Object(fields) => {
                let pick = |keys: &[&str]| {
                    keys.iter()
                        .find_map(|key| fields.get(*key).and_then(Value::as_str))
                };
                let message = pick(&["message", "description", "issue"])
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                Some(Self {
                    rule: pick(&["rule", "id", "code"]).map(str::to_string),
                    message,
                })
            }
            Value::Null => None,
            other => Some(Self::new(None, &other.to_string())),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.rule {
            Some(rule) => write!(f, "[{rule}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Verdict on one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Read a verdict from a validation tool's output.
    pub fn from_output(output: &Value) -> Result<Self, String> {
        let valid = ["valid", "is_valid"]
            .iter()
            .find_map(|key| output.get(*key).and_then(Value::as_bool))
            .ok_or_else(|| {
                format!(
                    "validation output has no 'valid' flag: {}",
                    truncate(&output.to_string(), 200)
                )
            })?;

        let mut issues: Vec<ValidationIssue> = output
            .get("issues")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(ValidationIssue::from_value).collect())
            .unwrap_or_default();

        if !valid && issues.is_empty() {
            issues.push(ValidationIssue::new(
                None,
                "validator rejected the query without details",
            ));
        }
        Ok(Self { valid, issues })
    }
}

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// Why a run ended without an accepted query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The generation tool kept failing on the wire.
    GenerationUnavailable,
    /// The validation tool failed; candidates are never passed unvalidated.
    ValidationUnavailable,
    /// A tool could not be routed to exactly one server.
    RoutingFailed,
    /// Validation still failed after the last permitted refinement.
    AttemptsExhausted,
    /// Validation failed and refinement is disabled.
    ValidationRejected,
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::GenerationUnavailable => "generation unavailable",
            FailureReason::ValidationUnavailable => "validation unavailable",
            FailureReason::RoutingFailed => "routing failed",
            FailureReason::AttemptsExhausted => "refinement attempts exhausted",
            FailureReason::ValidationRejected => "validation rejected",
            FailureReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineResult {
    Success {
        session_id: Uuid,
        sql: String,
        attempts: u32,
        /// First candidate, before any refinement.
        original_sql: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
    },
    Failed {
        session_id: Uuid,
        reason: FailureReason,
        detail: String,
        attempts: u32,
        last_issues: Vec<ValidationIssue>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_sql: Option<String>,
    },
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineResult::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PipelineResult::Success { attempts, .. } | PipelineResult::Failed { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            PipelineResult::Success { session_id, .. }
            | PipelineResult::Failed { session_id, .. } => *session_id,
        }
    }

    /// The accepted query, if any.
    pub fn sql(&self) -> Option<&str> {
        match self {
            PipelineResult::Success { sql, .. } => Some(sql),
            PipelineResult::Failed { .. } => None,
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            PipelineResult::Success { .. } => None,
            PipelineResult::Failed { reason, .. } => Some(*reason),
        }
    }
}

/// Pipeline states, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Generating,
    Validating,
    Refining,
    Succeeded,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Generating => "generating",
            PipelineState::Validating => "validating",
            PipelineState::Refining => "refining",
            PipelineState::Succeeded => "succeeded",
            PipelineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candidate_from_object_string_and_pair() {
        let c = SqlCandidate::from_output(&json!({"sql": " SELECT 1 ", "confidence": 0.9}), 1, None)
            .unwrap();
        assert_eq!(c.sql, "SELECT 1");
        assert_eq!(c.confidence, Some(0.9));

        let c = SqlCandidate::from_output(&json!("SELECT 2"), 2, Some("fix it".into())).unwrap();
        assert_eq!(c.sql, "SELECT 2");
        assert_eq!(c.attempt, 2);
        assert_eq!(c.prompt.as_deref(), Some("fix it"));

        let c = SqlCandidate::from_output(&json!(["SELECT 3", 0.75]), 1, None).unwrap();
        assert_eq!(c.sql, "SELECT 3");
        assert_eq!(c.confidence, Some(0.75));
    }

    #[test]
    fn test_candidate_without_sql_is_rejected() {
        assert!(SqlCandidate::from_output(&json!({"text": "hello"}), 1, None).is_err());
        assert!(SqlCandidate::from_output(&json!("   "), 1, None).is_err());
        assert!(SqlCandidate::from_output(&json!(42), 1, None).is_err());
    }

    #[test]
    fn test_validation_accepts_both_flag_names() {
        let v = ValidationResult::from_output(&json!({"valid": true})).unwrap();
        assert!(v.valid);
        assert!(v.issues.is_empty());

        let v = ValidationResult::from_output(&json!({
            "is_valid": false,
            "issues": ["missing concept mapping", {"rule": "OMOP-7", "message": "use concept_ancestor"}]
        }))
        .unwrap();
        assert!(!v.valid);
        assert_eq!(
            v.issues,
            vec![
                ValidationIssue::new(None, "missing concept mapping"),
                ValidationIssue::new(Some("OMOP-7"), "use concept_ancestor"),
            ]
        );
    }

    #[test]
    fn test_invalid_without_issues_gets_placeholder_issue() {
        let v = ValidationResult::from_output(&json!({"valid": false})).unwrap();
        assert_eq!(v.issues.len(), 1);
    }

    #[test]
    fn test_validation_without_flag_is_rejected() {
        let err = ValidationResult::from_output(&json!({"issues": []})).unwrap_err();
        assert!(err.contains("no 'valid' flag"));
    }

    #[test]
    fn test_issue_display() {
        assert_eq!(
            ValidationIssue::new(Some("R1"), "bad join").to_string(),
            "[R1] bad join"
        );
        assert_eq!(ValidationIssue::new(None, "bad join").to_string(), "bad join");
    }

    #[test]
    fn test_result_serializes_with_status_tag() {
        let id = Uuid::new_v4();
        let success = PipelineResult::Success {
            session_id: id,
            sql: "SELECT 1".into(),
            attempts: 1,
            original_sql: "SELECT 1".into(),
            confidence: None,
        };
        let json = serde_json::to_value(&success).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["attempts"], 1);
        assert!(json.get("confidence").is_none());

        let failed = PipelineResult::Failed {
            session_id: id,
            reason: FailureReason::AttemptsExhausted,
            detail: "still invalid".into(),
            attempts: 3,
            last_issues: vec![ValidationIssue::new(None, "x")],
            last_sql: Some("SELECT 2".into()),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["reason"], "attempts_exhausted");
        assert_eq!(json["last_issues"][0]["message"], "x");
        assert!(json["last_issues"][0].get("rule").is_none());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("abc", 5), "abc");
    }
}
