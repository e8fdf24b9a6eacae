use super::{load_config, FINISHED_KIND};
use crate::exit_codes;
use clap::Args;
use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{EngineState, TcpRunnerEngine, TracingDiagnosticSink};
use tokio_stream::StreamExt;

#[derive(Args, Debug)]
pub struct RunnerArgs {
    /// Engine config (YAML). Defaults plus TANDEM_* variables when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Identity used in diagnostics
    #[arg(long, default_value = "1r")]
    pub id: String,

    /// Accept workers from non-loopback addresses
    #[arg(long)]
    pub allow_remote: bool,

    /// Operation IDs to RUN once the worker is connected (repeatable)
    #[arg(long = "run", value_name = "OP")]
    pub run: Vec<String>,

    /// Seconds to wait for a worker to connect
    #[arg(long, default_value_t = 30)]
    pub connect_timeout: u64,

    /// Send QUIT after this many seconds even if operations are still running
    #[arg(long)]
    pub quit_after: Option<u64>,
}

pub async fn run(args: RunnerArgs) -> anyhow::Result<i32> {
    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(code) => return Ok(code),
    };

    let allow_remote = args.allow_remote;
    let runner = TcpRunnerEngine::with_config(
        args.id.clone(),
        move |addr, _port| allow_remote || addr.is_loopback(),
        Arc::new(TracingDiagnosticSink),
        config,
    );
    let port = runner.start()?;
    println!("{}", json!({ "event": "listening", "port": port }));

    let connected = tokio::time::timeout(
        Duration::from_secs(args.connect_timeout),
        runner.wait_for_state(EngineState::Connected),
    )
    .await;
    if !matches!(connected, Ok(EngineState::Connected)) {
        tracing::warn!(port, "no worker connected");
        runner.dispose().await;
        return Ok(exit_codes::FAILURE);
    }

    let info = runner.execution_engine_info()?;
    println!(
        "{}",
        json!({
            "event": "connected",
            "test_assembly_unique_id": info.test_assembly_unique_id,
            "test_framework_display_name": info.test_framework_display_name,
        })
    );

    let mut pending: HashSet<String> = args.run.iter().cloned().collect();
    for op in &args.run {
        runner.send_run(op);
    }

    let mut messages = runner
        .take_messages()
        .ok_or_else(|| anyhow::anyhow!("message stream already taken"))?;
    let quit_after = args.quit_after.map(Duration::from_secs);
    let deadline = async move {
        match quit_after {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    while !pending.is_empty() {
        tokio::select! {
            biased;
            next = messages.next() => {
                let Some(message) = next else { break };
                let body: serde_json::Value = message
                    .json()
                    .unwrap_or_else(|_| json!(String::from_utf8_lossy(&message.payload)));
                if body["kind"] == FINISHED_KIND {
                    pending.remove(&message.operation_id);
                }
                println!(
                    "{}",
                    json!({ "event": "message", "operation_id": message.operation_id, "message": body })
                );
            }
            () = &mut deadline => {
                tracing::warn!(unfinished = pending.len(), "quit deadline reached");
                break;
            }
            () = runner.wait_for_peer_closed() => {
                tracing::warn!(unfinished = pending.len(), "worker went away");
                break;
            }
        }
    }

    runner.send_quit();
    runner.dispose().await;
    println!("{}", json!({ "event": "disconnected", "unfinished": pending.len() }));

    Ok(if pending.is_empty() {
        exit_codes::SUCCESS
    } else {
        exit_codes::FAILURE
    })
}
