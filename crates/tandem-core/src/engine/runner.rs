//! Server side: listens on an ephemeral loopback port and drives the worker.

use super::{EngineState, EngineStateMachine};
use crate::config::EngineConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::EngineError;
use crate::protocol::{
    self, execution, runner, split_on_separator, ExecutionEngineInfo, RemoteMessage,
    RunnerEngineInfo,
};
use crate::transport::{FrameStream, FrameTransport, Termination};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

const ENGINE_TYPE: &str = "TcpRunnerEngine";
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Decides whether an inbound connection from `(address, port)` is allowed.
pub type AcceptFilter = Arc<dyn Fn(IpAddr, u16) -> bool + Send + Sync>;

/// `MSG` frames from the execution engine.
pub type MessageStream = UnboundedReceiverStream<RemoteMessage>;

/// Called for each inbound `MSG` before it is forwarded. Returning `false`
/// cancels that message's operation.
pub type MessageGate = Arc<dyn Fn(&RemoteMessage) -> bool + Send + Sync>;

pub struct TcpRunnerEngine {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    machine: EngineStateMachine,
    config: EngineConfig,
    filter: AcceptFilter,
    // Only mutated while holding the state lock.
    connection: Mutex<Option<Arc<Connection>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    quit_sent: AtomicBool,
    peer_disconnected: AtomicBool,
    peer_closed: watch::Sender<bool>,
    execution_info: Mutex<Option<ExecutionEngineInfo>>,
    message_gate: Mutex<Option<MessageGate>>,
    messages_tx: mpsc::UnboundedSender<RemoteMessage>,
    messages_rx: Mutex<Option<mpsc::UnboundedReceiver<RemoteMessage>>>,
}

struct Connection {
    remote_port: u16,
    transport: FrameTransport,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl TcpRunnerEngine {
    pub fn new<F>(engine_id: impl Into<String>, filter: F, sink: Arc<dyn DiagnosticSink>) -> Self
    where
        F: Fn(IpAddr, u16) -> bool + Send + Sync + 'static,
    {
        Self::with_config(engine_id, filter, sink, EngineConfig::default())
    }

    pub fn with_config<F>(
        engine_id: impl Into<String>,
        filter: F,
        sink: Arc<dyn DiagnosticSink>,
        config: EngineConfig,
    ) -> Self
    where
        F: Fn(IpAddr, u16) -> bool + Send + Sync + 'static,
    {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (peer_closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(RunnerInner {
                machine: EngineStateMachine::new(ENGINE_TYPE, engine_id, sink),
                config,
                filter: Arc::new(filter),
                connection: Mutex::new(None),
                accept_task: Mutex::new(None),
                quit_sent: AtomicBool::new(false),
                peer_disconnected: AtomicBool::new(false),
                peer_closed,
                execution_info: Mutex::new(None),
                message_gate: Mutex::new(None),
                messages_tx,
                messages_rx: Mutex::new(Some(messages_rx)),
            }),
        }
    }

    pub fn engine_id(&self) -> &str {
        self.inner.machine.engine_id()
    }

    pub fn state(&self) -> EngineState {
        self.inner.machine.state()
    }

    /// Wait until the engine reaches `state` (or a later one).
    pub async fn wait_for_state(&self, state: EngineState) -> EngineState {
        self.inner.machine.wait_for(state).await
    }

    /// Bind `127.0.0.1:0` and start accepting. Returns the bound port before
    /// any connection arrives. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<u16, EngineError> {
        let machine = &self.inner.machine;
        let mut state = machine.lock();
        if *state != EngineState::Unknown {
            return Err(EngineError::InvalidState {
                engine: ENGINE_TYPE,
                operation: "start",
                state: *state,
                expected: EngineState::Unknown,
            });
        }
        machine.transition_locked(&mut state, EngineState::Initialized);

        let listener = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .map_err(EngineError::Bind)?;
        listener.set_nonblocking(true).map_err(EngineError::Bind)?;
        let port = listener.local_addr().map_err(EngineError::Bind)?.port();
        let listener = TcpListener::from_std(listener).map_err(EngineError::Bind)?;

        machine.transition_locked(&mut state, EngineState::Listening);
        machine.diagnostic(format_args!("Listening on tcp://localhost:{port}/"));

        let inner = Arc::clone(&self.inner);
        *lock(&self.inner.accept_task) = Some(tokio::spawn(inner.accept_loop(listener)));

        Ok(port)
    }

    /// Ask the execution engine to stop its run and disconnect.
    pub fn send_quit(&self) {
        if let Some(connection) = self.connection("send_quit") {
            self.inner.quit_sent.store(true, Ordering::Release);
            send_command(&connection, runner::QUIT, None);
        }
    }

    pub fn send_find(&self, operation_id: &str) {
        if let Some(connection) = self.connection("send_find") {
            send_command(&connection, runner::FIND, Some(operation_id.as_bytes()));
        }
    }

    pub fn send_run(&self, operation_id: &str) {
        if let Some(connection) = self.connection("send_run") {
            send_command(&connection, runner::RUN, Some(operation_id.as_bytes()));
        }
    }

    pub fn send_cancel(&self, operation_id: &str) {
        if let Some(connection) = self.connection("send_cancel") {
            send_command(&connection, runner::CANCEL, Some(operation_id.as_bytes()));
        }
    }

    /// Install a gate consulted for every inbound `MSG`. When it returns
    /// `false` the runner sends `CANCEL` for that operation itself; the
    /// message is still forwarded.
    pub fn set_message_gate<F>(&self, gate: F)
    where
        F: Fn(&RemoteMessage) -> bool + Send + Sync + 'static,
    {
        *lock(&self.inner.message_gate) = Some(Arc::new(gate));
    }

    /// Messages forwarded from the execution engine. Available once.
    pub fn take_messages(&self) -> Option<MessageStream> {
        lock(&self.inner.messages_rx)
            .take()
            .map(UnboundedReceiverStream::new)
    }

    /// What the execution engine reported during negotiation.
    pub fn execution_engine_info(&self) -> Result<ExecutionEngineInfo, EngineError> {
        lock(&self.inner.execution_info)
            .clone()
            .ok_or_else(|| EngineError::NotConnected {
                engine: ENGINE_TYPE,
                state: self.state(),
            })
    }

    /// Resolves once the execution engine's stream has ended, whether it
    /// acknowledged `QUIT` or simply went away.
    pub async fn wait_for_peer_closed(&self) {
        let mut rx = self.inner.peer_closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Tear down: quit the peer if still needed, close the connection, stop
    /// listening. Only the first caller does the work; others wait for it.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        let Ok(connection) = inner.begin_dispose() else {
            inner.machine.wait_for(EngineState::Disconnected).await;
            return;
        };

        let accept_task = lock(&inner.accept_task).take();
        if let Some(task) = accept_task {
            task.abort();
            let _ = task.await;
        }

        if let Some(connection) = connection {
            inner.shutdown_connection(&connection).await;
        }

        inner.machine.transition_to(EngineState::Disconnected);
    }

    fn connection(&self, method: &str) -> Option<Arc<Connection>> {
        let connection = lock(&self.inner.connection).clone();
        if connection.is_none() {
            self.inner.machine.diagnostic(format_args!(
                "{method} called when there is no connected execution engine"
            ));
        }
        connection
    }
}

impl Drop for TcpRunnerEngine {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.inner.accept_task).take() {
            task.abort();
        }
        if let Some(connection) = lock(&self.inner.connection).take() {
            if let Some(task) = lock(&connection.dispatch).take() {
                task.abort();
            }
        }
    }
}

impl RunnerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(engine = %self.machine.engine_id(), error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };

            let remote_port = remote.port();
            if !(self.filter)(remote.ip(), remote_port) {
                self.machine.diagnostic(format_args!(
                    "Connection rejected from tcp://localhost:{remote_port}/"
                ));
                continue;
            }

            self.on_connection(stream, remote_port);
        }
    }

    fn on_connection(self: &Arc<Self>, stream: TcpStream, remote_port: u16) {
        let label = format!("runner::{}", self.machine.engine_id());
        let transport = match FrameTransport::new(label, stream, &self.config) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(remote_port, error = %e, "dropping connection");
                return;
            }
        };

        let mut state = self.machine.lock();
        if *state != EngineState::Listening {
            let current = *state;
            drop(state);
            self.machine.diagnostic(format_args!(
                "Connection rejected from tcp://localhost:{remote_port}/ (engine is already {current})"
            ));
            return;
        }

        self.machine.diagnostic(format_args!(
            "Connection accepted from tcp://localhost:{remote_port}/"
        ));
        self.machine
            .transition_locked(&mut state, EngineState::Negotiating);

        let frames = match transport.start() {
            Ok(frames) => frames,
            Err(e) => {
                warn!(remote_port, error = %e, "failed to start transport");
                return;
            }
        };

        let connection = Arc::new(Connection {
            remote_port,
            transport,
            dispatch: Mutex::new(None),
        });
        *lock(&self.connection) = Some(Arc::clone(&connection));

        let dispatch = tokio::spawn(Arc::clone(self).dispatch(Arc::clone(&connection), frames));
        *lock(&connection.dispatch) = Some(dispatch);

        match serde_json::to_vec(&RunnerEngineInfo::default()) {
            Ok(info) => send_command(&connection, runner::INFO, Some(&info)),
            Err(e) => warn!(error = %e, "failed to encode runner info"),
        }
    }

    async fn dispatch(self: Arc<Self>, connection: Arc<Connection>, mut frames: FrameStream) {
        while let Some(frame) = frames.next().await {
            self.process_frame(&connection, &frame);
        }
        self.peer_closed.send_replace(true);
        connection.transport.finish_sending();
    }

    fn process_frame(&self, connection: &Connection, frame: &[u8]) {
        let (command, data) = split_on_separator(frame);
        match std::str::from_utf8(command) {
            Ok(execution::INFO) => self.on_info(data),
            Ok(execution::MSG) => self.on_message(connection, data),
            Ok(execution::DISCONNECT) => {
                debug!(engine = %self.machine.engine_id(), "execution engine acknowledged quit");
                self.peer_disconnected.store(true, Ordering::Release);
            }
            _ => self.machine.diagnostic(format_args!(
                "Received unknown command '{}'",
                String::from_utf8_lossy(command)
            )),
        }
    }

    fn on_info(&self, data: Option<&[u8]>) {
        let Some(json) = data.filter(|d| !d.is_empty()) else {
            self.machine.diagnostic("INFO data is missing the JSON");
            return;
        };
        let info: ExecutionEngineInfo = match serde_json::from_slice(json) {
            Ok(info) => info,
            Err(e) => {
                self.machine
                    .diagnostic(format_args!("INFO data could not be parsed: {e}"));
                return;
            }
        };

        let mut state = self.machine.lock();
        if *state != EngineState::Negotiating {
            let current = *state;
            drop(state);
            self.machine.diagnostic(format_args!(
                "INFO message received outside of Negotiating state (current state is {current})"
            ));
            return;
        }
        *lock(&self.execution_info) = Some(info);
        self.machine
            .transition_locked(&mut state, EngineState::Connected);
    }

    fn on_message(&self, connection: &Connection, data: Option<&[u8]>) {
        let Some(data) = data.filter(|d| !d.is_empty()) else {
            self.machine
                .diagnostic("MSG data is missing the operation ID and JSON");
            return;
        };
        let (operation_id, json) = split_on_separator(data);
        let Some(json) = json else {
            self.machine.diagnostic("MSG data is missing the JSON");
            return;
        };

        let state = self.machine.state();
        if state != EngineState::Connected {
            self.machine.diagnostic(format_args!(
                "MSG message received before we reached Connected state (current state is {state})"
            ));
        }

        let message = RemoteMessage {
            operation_id: String::from_utf8_lossy(operation_id).into_owned(),
            payload: json.to_vec(),
        };
        let gate = lock(&self.message_gate).clone();
        let proceed = match gate {
            Some(gate) => gate(&message),
            None => true,
        };
        let cancelled = (!proceed).then(|| message.operation_id.clone());

        if self.messages_tx.send(message).is_err() {
            debug!("message stream dropped");
        }
        if let Some(operation_id) = cancelled {
            debug!(%operation_id, "message gate cancelled operation");
            send_command(connection, runner::CANCEL, Some(operation_id.as_bytes()));
        }
    }

    /// Enter `Disconnecting` and detach the connection under the same lock
    /// the accept path uses. Fails if another caller got there first.
    fn begin_dispose(&self) -> Result<Option<Arc<Connection>>, EngineState> {
        let mut state = self.machine.lock();
        if state.is_shutting_down() {
            return Err(*state);
        }
        self.machine
            .transition_locked(&mut state, EngineState::Disconnecting);
        Ok(lock(&self.connection).take())
    }

    async fn shutdown_connection(&self, connection: &Connection) {
        let timeout = self.config.shutdown_timeout();

        if !self.quit_sent.swap(true, Ordering::AcqRel) {
            send_command(connection, runner::QUIT, None);
        }

        let termination = connection.transport.wait_for_peer(timeout).await;

        // Drain frames already read so a trailing DISCONNECT is seen.
        let dispatch = lock(&connection.dispatch).take();
        if let Some(mut dispatch) = dispatch {
            if tokio::time::timeout(timeout, &mut dispatch).await.is_err() {
                dispatch.abort();
            }
        }

        let acknowledged = self.peer_disconnected.load(Ordering::Acquire);
        let abnormal = match termination {
            Termination::EndOfStream | Termination::Failed(_) => !acknowledged,
            Termination::TimedOut => {
                warn!(engine = %self.machine.engine_id(), "execution engine did not disconnect in time");
                false
            }
            Termination::Closed => false,
        };
        if abnormal {
            self.machine
                .emit(connection.transport.abnormal_termination_message());
        }

        let port = connection.remote_port;
        self.machine
            .diagnostic(format_args!("Disconnecting from tcp://localhost:{port}/"));
        connection.transport.close().await;
        self.machine
            .diagnostic(format_args!("Disconnected from tcp://localhost:{port}/"));
    }
}

fn send_command(connection: &Connection, command: &str, data: Option<&[u8]>) {
    if let Err(e) = connection
        .transport
        .send(&protocol::command_frame(command, data))
    {
        debug!(command, error = %e, "send skipped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
