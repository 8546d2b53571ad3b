//! `omcp`: command-line front-end for the orchestration engine.

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use omcp_orchestrator::a2a::{A2aClient, AgentRequest, DEFAULT_AGENT_TIMEOUT};
use omcp_orchestrator::config::{find_config_path, load_config};
use omcp_orchestrator::{init_tracing, Orchestrator};

/// Turn natural-language questions into validated OMOP SQL.
#[derive(Parser, Debug)]
#[command(name = "omcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to orchestrator.yaml (default: $OMCP_CONFIG, then search upward).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output logs as JSON.
    #[arg(long, global = true, default_value = "false")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline for one question and print the result as JSON.
    Ask {
        question: String,

        /// Context passed to generation instead of the fetched schema.
        #[arg(long)]
        context: Option<String>,

        /// Execute the accepted query.
        #[arg(long)]
        execute: bool,

        /// Connection used with --execute.
        #[arg(long, requires = "execute")]
        connection: Option<String>,
    },

    /// Validate a query as given, with one repair attempt if it is rejected.
    Validate { sql: String },

    /// Read an A2A request from stdin and print the reply.
    A2a {
        /// Send the request to the agent at this URL instead of answering it.
        #[arg(long)]
        forward: Option<String>,

        /// Timeout in seconds for --forward.
        #[arg(long, requires = "forward")]
        timeout_secs: Option<u64>,
    },

    /// Start every server and print the health report.
    Servers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let a2a_request = match &args.command {
        Command::A2a { .. } => Some(read_agent_request()?),
        _ => None,
    };

    if let (Command::A2a { forward: Some(url), timeout_secs }, Some(request)) =
        (&args.command, &a2a_request)
    {
        let timeout = (*timeout_secs).map_or(DEFAULT_AGENT_TIMEOUT, Duration::from_secs);
        let response = A2aClient::new()?.send_request(url, request, timeout).await?;
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    let config_path = match args.config {
        Some(path) => path,
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            find_config_path(&cwd)?
        }
    };
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let orchestrator = Orchestrator::from_config(&config)?;

    orchestrator.start().await;

    let outcome = run(&orchestrator, args.command, a2a_request).await;
    orchestrator.shutdown().await;
    let output = outcome?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn read_agent_request() -> anyhow::Result<AgentRequest> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("failed to read A2A request from stdin")?;
    serde_json::from_str(&raw).context("invalid A2A request")
}

async fn run(
    orchestrator: &Orchestrator,
    command: Command,
    a2a_request: Option<AgentRequest>,
) -> anyhow::Result<Value> {
    match command {
        Command::Ask {
            question,
            context,
            execute,
            connection,
        } => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling pipeline");
                    on_interrupt.cancel();
                }
            });

            let result = orchestrator
                .run_pipeline_with_cancel(&question, context.map(Value::String), &cancel)
                .await;

            let mut output = json!({ "result": &result });
            if execute {
                if let Some(sql) = result.sql() {
                    let rows = orchestrator
                        .execute_sql(sql, connection.as_deref())
                        .await
                        .context("query execution failed")?;
                    output["execution"] = rows;
                }
            }
            Ok(output)
        }
        Command::Validate { sql } => {
            let review = orchestrator
                .validate_sql(&sql)
                .await
                .context("validation failed")?;
            Ok(serde_json::to_value(review)?)
        }
        Command::A2a { .. } => {
            let request = a2a_request.context("missing A2A request")?;
            let response = orchestrator.handle_agent_request(&request).await;
            Ok(serde_json::to_value(response)?)
        }
        Command::Servers => Ok(json!({ "servers": orchestrator.health().await })),
    }
}
