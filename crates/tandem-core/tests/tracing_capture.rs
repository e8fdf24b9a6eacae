//! Structured log capture: diagnostics bridged into `tracing`, and the
//! transport's abnormal-termination warning.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tandem_core::{EngineConfig, FrameTransport, TcpRunnerEngine, TracingDiagnosticSink};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::StreamExt;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct MockWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl std::io::Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for MockWriter {
    type Writer = MockWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn setup_capture() -> (MockWriter, tracing::subscriber::DefaultGuard) {
    let writer = MockWriter {
        buf: Arc::new(Mutex::new(Vec::new())),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_writer(writer.clone())
        .with_env_filter(EnvFilter::new("tandem=debug,tandem_core=debug"))
        .json()
        .finish();

    (writer, tracing::subscriber::set_default(subscriber))
}

fn json_lines(writer: &MockWriter) -> Vec<serde_json::Value> {
    let output = String::from_utf8(writer.buf.lock().unwrap().clone()).unwrap();
    output
        .lines()
        .filter_map(|line| serde_json::from_str(line.trim()).ok())
        .collect()
}

// Current-thread runtime: the capture guard is thread-local and spawned tasks
// must run on this thread to be observed.
#[tokio::test]
async fn test_diagnostics_bridge_into_tracing() {
    let (writer, _guard) = setup_capture();

    let runner = TcpRunnerEngine::new("9r", |_, _| true, Arc::new(TracingDiagnosticSink));
    let port = runner.start().unwrap();
    runner.dispose().await;

    let lines = json_lines(&writer);
    let diagnostics: Vec<&str> = lines
        .iter()
        .filter(|v| v["target"] == "tandem::diagnostic")
        .filter_map(|v| v["fields"]["message"].as_str())
        .collect();

    assert_eq!(diagnostics.len(), 5);
    assert_eq!(
        diagnostics[2],
        format!("TcpRunnerEngine(9r): Listening on tcp://localhost:{port}/")
    );
}

#[tokio::test]
async fn test_abnormal_termination_is_warned() {
    let (writer, _guard) = setup_capture();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let mut client = client.unwrap();

    let config = EngineConfig {
        max_frame_len: 4,
        ..EngineConfig::default()
    };
    let transport = FrameTransport::new("test::w", accepted.unwrap().0, &config).unwrap();
    let mut frames = transport.start().unwrap();

    client.write_all(b"much too long\n").await.unwrap();
    let end = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .unwrap();
    assert!(end.is_none());

    let lines = json_lines(&writer);
    let warning = lines
        .iter()
        .find(|v| v["fields"]["message"] == "abnormal termination of pipe")
        .expect("no abnormal termination warning");
    assert_eq!(warning["level"], "WARN");
    assert_eq!(warning["fields"]["transport"], "test::w");

    transport.close().await;
}
