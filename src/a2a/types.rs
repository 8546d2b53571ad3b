//! A2A wire types.
//!
//! Agents exchange `{messages: [...]}` envelopes; each message carries a
//! role, free-text content and an open metadata object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: AgentRole,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentMessage {
    pub fn new(role: AgentRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: Map::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(AgentRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(AgentRole::Assistant, content)
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Inbound or outbound A2A request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    #[serde(default)]
    pub messages: Vec<AgentMessage>,
    /// Tool definitions offered to the receiving agent. Passed through as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
}

impl AgentRequest {
    pub fn new(messages: Vec<AgentMessage>) -> Self {
        Self {
            messages,
            tools: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        if !tools.is_empty() {
            self.tools = Some(tools);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(default)]
    pub messages: Vec<AgentMessage>,
}

impl AgentResponse {
    pub fn single(message: AgentMessage) -> Self {
        Self {
            messages: vec![message],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_without_metadata_deserializes() {
        let msg: AgentMessage =
            serde_json::from_value(json!({"role": "user", "content": "hi"})).unwrap();
        assert_eq!(msg, AgentMessage::user("hi"));
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let result: Result<AgentMessage, _> =
            serde_json::from_value(json!({"role": "robot", "content": "hi"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_request_omits_empty_tools() {
        let request = AgentRequest::new(vec![AgentMessage::user("q")]).with_tools(vec![]);
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("tools").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["metadata"], json!({}));
    }
}
