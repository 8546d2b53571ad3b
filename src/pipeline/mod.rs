//! Pipeline: turns a question into validated SQL.
//!
//! Each run generates a candidate, validates it, and regenerates with the
//! validator's feedback until the query passes or the refinement budget is
//! spent. Tool calls go through [`ToolInvoker`], which the server registry
//! implements.

pub mod engine;
pub mod invoker;
pub mod prompt;
pub mod types;

pub use engine::{Pipeline, PipelineSettings};
pub use invoker::ToolInvoker;
pub use types::{
    FailureReason, PipelineResult, PipelineState, Session, SqlCandidate, ValidationIssue,
    ValidationResult,
};
