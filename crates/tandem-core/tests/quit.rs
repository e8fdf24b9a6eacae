use std::sync::Arc;
use std::time::Duration;
use tandem_core::{
    CollectingDiagnosticSink, DiagnosticSink, EngineState, NullDiagnosticSink, QuitReason,
    TcpExecutionEngine, TcpRunnerEngine,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn null_sink() -> Arc<dyn DiagnosticSink> {
    Arc::new(NullDiagnosticSink)
}

async fn connected_pair(
    execution_sink: Arc<dyn DiagnosticSink>,
) -> (TcpRunnerEngine, TcpExecutionEngine) {
    let runner = TcpRunnerEngine::new("1r", |_, _| true, null_sink());
    let port = runner.start().unwrap();
    let execution = TcpExecutionEngine::new("1e", port, execution_sink);
    execution.start().await.unwrap();
    let state = timeout(WAIT, runner.wait_for_state(EngineState::Connected))
        .await
        .unwrap();
    assert_eq!(state, EngineState::Connected);
    (runner, execution)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_when_runner_sends_quit_execution_engine_stops() {
    let (runner, execution) = connected_pair(null_sink()).await;

    runner.send_quit();
    let reason = timeout(WAIT, execution.wait_for_quit())
        .await
        .expect("timed out waiting for the QUIT signal to arrive");

    assert_eq!(reason, QuitReason::Requested);
    // Still connected: quit does not change state by itself
    assert_eq!(runner.state(), EngineState::Connected);

    execution.dispose().await;
    runner.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disposing_runner_before_sending_quit_sends_quit() {
    let (runner, execution) = connected_pair(null_sink()).await;

    runner.dispose().await;
    let reason = timeout(WAIT, execution.wait_for_quit())
        .await
        .expect("timed out waiting for the QUIT signal to arrive");

    assert_eq!(reason, QuitReason::Requested);
    execution.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_explicit_quit_then_dispose_is_clean() {
    let sink = CollectingDiagnosticSink::new();
    let runner = TcpRunnerEngine::new("1r", |_, _| true, Arc::new(sink.clone()));
    let port = runner.start().unwrap();
    let execution = TcpExecutionEngine::new("1e", port, null_sink());
    execution.start().await.unwrap();
    timeout(WAIT, runner.wait_for_state(EngineState::Connected))
        .await
        .unwrap();

    runner.send_quit();
    timeout(WAIT, execution.wait_for_quit()).await.unwrap();
    runner.dispose().await;
    execution.dispose().await;

    let messages = sink.messages();
    assert!(!messages.iter().any(|m| m.contains("abnormal termination")));
    assert!(!messages.iter().any(|m| m.contains("send_quit")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_runner_vanishing_closes_execution_engine() {
    let sink = CollectingDiagnosticSink::new();
    let (runner, execution) = connected_pair(Arc::new(sink.clone())).await;

    // Dropping without dispose aborts the runner's tasks and its socket.
    drop(runner);
    let reason = timeout(WAIT, execution.wait_for_quit()).await.unwrap();
    assert_eq!(reason, QuitReason::ConnectionClosed);

    execution.dispose().await;
    assert!(sink
        .messages()
        .contains(&"BufferTcpClient(execution::1e): abnormal termination of pipe".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_quit_without_connection() {
    let sink = CollectingDiagnosticSink::new();
    let runner = TcpRunnerEngine::new("1r", |_, _| true, Arc::new(sink.clone()));
    runner.start().unwrap();

    runner.send_quit();
    runner.dispose().await;

    assert!(sink.messages().contains(
        &"TcpRunnerEngine(1r): send_quit called when there is no connected execution engine"
            .to_string()
    ));
}
