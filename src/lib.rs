//! OMCP orchestration engine.
//!
//! Supervises the specialized MCP servers (SQL, LLM generation, validation,
//! agents) and drives the generate → validate → refine pipeline that turns a
//! natural-language question into validated SQL.

pub mod a2a;
pub mod config;
pub mod mcp_client;
pub mod orchestrator;
pub mod pipeline;

pub use config::{load_config, OrchestratorConfig};
pub use orchestrator::{Orchestrator, SqlReview};
pub use pipeline::PipelineResult;

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "omcp_orchestrator=info,warn";

/// Install the global tracing subscriber.
///
/// Logs go to stderr; stdout carries command output. `json` switches to
/// one JSON object per line. Calling this twice is a no-op.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if installed.is_ok() {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            pid = std::process::id(),
            "omcp orchestrator starting"
        );
    }
}
