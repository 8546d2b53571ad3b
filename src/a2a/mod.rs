//! Agent Bridge: agent-to-agent (A2A) messages in and out of the pipeline.

pub mod bridge;
pub mod client;
pub mod types;

pub use bridge::{first_user_message, message_to_invocation, result_to_message, Invocation};
pub use client::{A2aClient, A2aError, DEFAULT_AGENT_TIMEOUT};
pub use types::{AgentMessage, AgentRequest, AgentResponse, AgentRole};
