use super::{load_config, FINISHED_KIND};
use crate::exit_codes;
use clap::Args;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tandem_core::{
    ExecutionEngineInfo, ExecutionEngineOptions, QuitReason, RunnerCommand, TcpExecutionEngine,
    TracingDiagnosticSink,
};
use tokio_stream::StreamExt;

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Runner port (printed by `tandem runner`)
    #[arg(long)]
    pub port: u16,

    /// Engine config (YAML). Defaults plus TANDEM_* variables when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Identity used in diagnostics
    #[arg(long, default_value = "1e")]
    pub id: String,

    /// Reported to the runner during negotiation
    #[arg(long, default_value = "tandem-worker")]
    pub assembly_id: String,

    #[arg(long, default_value = concat!("tandem ", env!("CARGO_PKG_VERSION")))]
    pub framework_name: String,
}

pub async fn run(args: WorkerArgs) -> anyhow::Result<i32> {
    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(code) => return Ok(code),
    };

    let engine = TcpExecutionEngine::with_options(
        args.id.clone(),
        args.port,
        Arc::new(TracingDiagnosticSink),
        ExecutionEngineOptions {
            info: ExecutionEngineInfo {
                test_assembly_unique_id: args.assembly_id.clone(),
                test_framework_display_name: args.framework_name.clone(),
            },
            config,
        },
    );
    if let Err(e) = engine.start().await {
        tracing::error!(error = %e, "failed to reach runner");
        engine.dispose().await;
        return Ok(exit_codes::FAILURE);
    }

    let mut commands = engine
        .take_commands()
        .ok_or_else(|| anyhow::anyhow!("command stream already taken"))?;

    let reason = loop {
        tokio::select! {
            biased;
            next = commands.next() => {
                match next {
                    Some(command) => handle(&engine, command)?,
                    None => break QuitReason::ConnectionClosed,
                }
            }
            reason = engine.wait_for_quit() => break reason,
        }
    };

    engine.dispose().await;
    tracing::info!(?reason, "worker finished");

    Ok(match reason {
        QuitReason::Requested => exit_codes::SUCCESS,
        QuitReason::ConnectionClosed => exit_codes::FAILURE,
    })
}

/// Answers every request with an immediate synthetic completion.
fn handle(engine: &TcpExecutionEngine, command: RunnerCommand) -> anyhow::Result<()> {
    match command {
        RunnerCommand::Find { operation_id } => {
            engine.send_json(&operation_id, &json!({ "kind": "discovery", "test_cases": [] }))?;
            engine.send_json(&operation_id, &json!({ "kind": FINISHED_KIND }))?;
            engine.finish_operation(&operation_id);
        }
        RunnerCommand::Run { operation_id } => {
            if engine.send_json(&operation_id, &json!({ "kind": "run-started" }))? {
                engine.send_json(&operation_id, &json!({ "kind": FINISHED_KIND, "passed": 0, "failed": 0 }))?;
            }
            engine.finish_operation(&operation_id);
        }
        RunnerCommand::Cancel { operation_id } => {
            tracing::info!(%operation_id, "cancel requested");
        }
    }
    Ok(())
}
