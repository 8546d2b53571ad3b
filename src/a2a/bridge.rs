//! Structural translation between agent messages and pipeline runs.
//!
//! No validation or retries happen here: a message becomes a question plus
//! context, and a [`PipelineResult`] becomes one assistant message.

use serde_json::{json, Map, Value};

use super::types::{AgentMessage, AgentRequest, AgentRole};
use crate::pipeline::PipelineResult;

/// What the pipeline needs from an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub question: String,
    pub context: Option<Value>,
}

/// `content` is the question. Context is `metadata.context` when present,
/// otherwise the whole metadata object when it is not empty.
pub fn message_to_invocation(message: &AgentMessage) -> Invocation {
    let context = match message.metadata.get("context") {
        Some(Value::Null) => None,
        Some(context) => Some(context.clone()),
        None if message.metadata.is_empty() => None,
        None => Some(Value::Object(message.metadata.clone())),
    };
    Invocation {
        question: message.content.clone(),
        context,
    }
}

/// The SQL on success, `Error: <reason>: <detail>` on failure.
pub fn result_to_message(result: &PipelineResult) -> AgentMessage {
    let mut metadata = Map::new();
    metadata.insert("session_id".into(), json!(result.session_id()));
    metadata.insert("attempts".into(), json!(result.attempts()));

    match result {
        PipelineResult::Success {
            sql,
            original_sql,
            confidence,
            ..
        } => {
            metadata.insert("status".into(), json!("success"));
            metadata.insert("sql".into(), json!(sql));
            metadata.insert("original_sql".into(), json!(original_sql));
            if let Some(confidence) = confidence {
                metadata.insert("confidence".into(), json!(confidence));
            }
            AgentMessage::assistant(sql.clone()).with_metadata(metadata)
        }
        PipelineResult::Failed {
            reason,
            detail,
            last_issues,
            last_sql,
            ..
        } => {
            metadata.insert("status".into(), json!("failed"));
            metadata.insert("reason".into(), json!(reason));
            metadata.insert("issues".into(), json!(last_issues));
            if let Some(sql) = last_sql {
                metadata.insert("last_sql".into(), json!(sql));
            }
            let mut content = format!("Error: {reason}: {detail}");
            if !last_issues.is_empty() {
                content.push_str("\nRemaining issues:");
                for issue in last_issues {
                    content.push_str(&format!("\n- {issue}"));
                }
            }
            AgentMessage::assistant(content).with_metadata(metadata)
        }
    }
}

/// The first message authored by a user, if any.
pub fn first_user_message(request: &AgentRequest) -> Option<&AgentMessage> {
    request
        .messages
        .iter()
        .find(|message| message.role == AgentRole::User)
}

/// Reply for a request that carries no user message.
pub fn missing_question_message() -> AgentMessage {
    let mut metadata = Map::new();
    metadata.insert("status".into(), json!("failed"));
    AgentMessage::assistant("Error: no user message found").with_metadata(metadata)
}
