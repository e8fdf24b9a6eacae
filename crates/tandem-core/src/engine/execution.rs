//! Client side: connects to a runner and executes what it asks for.

use super::{EngineState, EngineStateMachine};
use crate::config::EngineConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::EngineError;
use crate::protocol::{
    self, execution, operation_id, runner, split_on_separator, ExecutionEngineInfo,
    RunnerCommand, RunnerEngineInfo, PROTOCOL_VERSION,
};
use crate::transport::{FrameStream, FrameTransport, Termination};
use serde::Serialize;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

const ENGINE_TYPE: &str = "TcpExecutionEngine";

/// Commands from the runner, for the worker's main loop.
pub type CommandStream = UnboundedReceiverStream<RunnerCommand>;

/// Why [`TcpExecutionEngine::wait_for_quit`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitReason {
    /// The runner sent `QUIT`.
    Requested,
    /// The connection ended some other way (runner gone, local dispose).
    ConnectionClosed,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionEngineOptions {
    pub info: ExecutionEngineInfo,
    pub config: EngineConfig,
}

#[derive(Default)]
struct Operations {
    executing: HashSet<String>,
    cancelled: HashSet<String>,
}

pub struct TcpExecutionEngine {
    inner: Arc<ExecutionInner>,
}

struct ExecutionInner {
    machine: EngineStateMachine,
    runner_port: u16,
    options: ExecutionEngineOptions,
    transport: Mutex<Option<Arc<FrameTransport>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    quit: watch::Sender<Option<QuitReason>>,
    operations: Mutex<Operations>,
    commands_tx: mpsc::UnboundedSender<RunnerCommand>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<RunnerCommand>>>,
}

impl TcpExecutionEngine {
    pub fn new(engine_id: impl Into<String>, runner_port: u16, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self::with_options(engine_id, runner_port, sink, ExecutionEngineOptions::default())
    }

    pub fn with_options(
        engine_id: impl Into<String>,
        runner_port: u16,
        sink: Arc<dyn DiagnosticSink>,
        options: ExecutionEngineOptions,
    ) -> Self {
        let (quit, _) = watch::channel(None);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ExecutionInner {
                machine: EngineStateMachine::new(ENGINE_TYPE, engine_id, sink),
                runner_port,
                options,
                transport: Mutex::new(None),
                dispatch: Mutex::new(None),
                quit,
                operations: Mutex::new(Operations::default()),
                commands_tx,
                commands_rx: Mutex::new(Some(commands_rx)),
            }),
        }
    }

    pub fn engine_id(&self) -> &str {
        self.inner.machine.engine_id()
    }

    pub fn runner_port(&self) -> u16 {
        self.inner.runner_port
    }

    pub fn state(&self) -> EngineState {
        self.inner.machine.state()
    }

    pub async fn wait_for_state(&self, state: EngineState) -> EngineState {
        self.inner.machine.wait_for(state).await
    }

    /// Connect to the runner. Returns the local port of the connection.
    pub async fn start(&self) -> Result<u16, EngineError> {
        let inner = &self.inner;
        let port = inner.runner_port;

        inner.begin_connect()?;
        inner
            .machine
            .diagnostic(format_args!("Connecting to tcp://localhost:{port}/"));

        let stream = tokio::select! {
            connected = TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port))) => {
                connected.map_err(|source| EngineError::Connect { port, source })?
            }
            state = inner.machine.wait_for(EngineState::Disconnecting) => {
                return Err(EngineError::InvalidState {
                    engine: ENGINE_TYPE,
                    operation: "start",
                    state,
                    expected: EngineState::Connecting,
                });
            }
        };

        let local_port = stream
            .local_addr()
            .map_err(crate::error::TransportError::from)?
            .port();
        let label = format!("execution::{}", inner.machine.engine_id());
        let transport = Arc::new(FrameTransport::new(label, stream, &inner.options.config)?);

        inner
            .machine
            .diagnostic(format_args!("Connected to tcp://localhost:{port}/"));
        inner.attach(transport)?;

        Ok(local_port)
    }

    /// Resolves when the runner sends `QUIT`, or when the connection ends
    /// for any other reason.
    pub async fn wait_for_quit(&self) -> QuitReason {
        let mut rx = self.inner.quit.subscribe();
        let reason = rx.wait_for(Option::is_some).await.map(|r| *r);
        match reason {
            Ok(Some(reason)) => reason,
            _ => QuitReason::ConnectionClosed,
        }
    }

    /// Commands from the runner. Available once.
    pub fn take_commands(&self) -> Option<CommandStream> {
        lock(&self.inner.commands_rx)
            .take()
            .map(UnboundedReceiverStream::new)
    }

    /// Send a `MSG` for `operation_id`. Returns `false` once the runner has
    /// cancelled that operation, so the caller can stop producing.
    pub fn send_message(&self, operation_id: &str, payload: &[u8]) -> bool {
        let transport = lock(&self.inner.transport).clone();
        match transport {
            Some(transport) => {
                if let Err(e) = transport.send(&protocol::message_frame(operation_id, payload)) {
                    debug!(operation_id, error = %e, "message not sent");
                }
            }
            None => self
                .inner
                .machine
                .diagnostic("send_message called when there is no connected runner engine"),
        }
        !self.is_cancelled(operation_id)
    }

    pub fn send_json<T: Serialize>(&self, operation_id: &str, message: &T) -> Result<bool, EngineError> {
        let payload = serde_json::to_vec(message)?;
        Ok(self.send_message(operation_id, &payload))
    }

    pub fn is_cancelled(&self, operation_id: &str) -> bool {
        lock(&self.inner.operations).cancelled.contains(operation_id)
    }

    /// Forget a finished operation so its ID may be reused.
    pub fn finish_operation(&self, operation_id: &str) {
        let mut ops = lock(&self.inner.operations);
        ops.executing.remove(operation_id);
        ops.cancelled.remove(operation_id);
    }

    /// Close the connection to the runner. Idempotent; concurrent callers
    /// wait for the first one to finish.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        let Ok((transport, dispatch)) = inner.begin_dispose() else {
            inner.machine.wait_for(EngineState::Disconnected).await;
            return;
        };

        let requested = *inner.quit.borrow() == Some(QuitReason::Requested);
        inner.signal_quit(QuitReason::ConnectionClosed);

        if let Some(transport) = transport {
            let runner_ended = matches!(
                transport.termination(),
                Some(Termination::EndOfStream | Termination::Failed(_))
            );
            if runner_ended && !requested {
                inner.machine.emit(transport.abnormal_termination_message());
            }

            let port = inner.runner_port;
            inner
                .machine
                .diagnostic(format_args!("Disconnecting from tcp://localhost:{port}/"));
            transport.close().await;
            if let Some(mut dispatch) = dispatch {
                let timeout = inner.options.config.shutdown_timeout();
                if tokio::time::timeout(timeout, &mut dispatch).await.is_err() {
                    dispatch.abort();
                }
            }
            inner
                .machine
                .diagnostic(format_args!("Disconnected from tcp://localhost:{port}/"));
        }

        inner.machine.transition_to(EngineState::Disconnected);
    }
}

impl Drop for TcpExecutionEngine {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.inner.dispatch).take() {
            task.abort();
        }
    }
}

impl ExecutionInner {
    fn begin_connect(&self) -> Result<(), EngineError> {
        let mut state = self.machine.lock();
        if *state != EngineState::Unknown {
            return Err(EngineError::InvalidState {
                engine: ENGINE_TYPE,
                operation: "start",
                state: *state,
                expected: EngineState::Unknown,
            });
        }
        self.machine
            .transition_locked(&mut state, EngineState::Initialized);
        self.machine
            .transition_locked(&mut state, EngineState::Connecting);
        Ok(())
    }

    /// Install the connected transport and start reading, unless dispose won
    /// the race.
    fn attach(self: &Arc<Self>, transport: Arc<FrameTransport>) -> Result<(), EngineError> {
        let mut state = self.machine.lock();
        if *state != EngineState::Connecting {
            return Err(EngineError::InvalidState {
                engine: ENGINE_TYPE,
                operation: "start",
                state: *state,
                expected: EngineState::Connecting,
            });
        }
        self.machine
            .transition_locked(&mut state, EngineState::Negotiating);

        let frames = transport.start()?;
        *lock(&self.transport) = Some(Arc::clone(&transport));
        let dispatch = tokio::spawn(Arc::clone(self).dispatch(transport, frames));
        *lock(&self.dispatch) = Some(dispatch);
        Ok(())
    }

    fn begin_dispose(
        &self,
    ) -> Result<(Option<Arc<FrameTransport>>, Option<JoinHandle<()>>), EngineState> {
        let mut state = self.machine.lock();
        if state.is_shutting_down() {
            return Err(*state);
        }
        self.machine
            .transition_locked(&mut state, EngineState::Disconnecting);
        Ok((lock(&self.transport).take(), lock(&self.dispatch).take()))
    }

    fn signal_quit(&self, reason: QuitReason) -> bool {
        self.quit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    async fn dispatch(self: Arc<Self>, transport: Arc<FrameTransport>, mut frames: FrameStream) {
        while let Some(frame) = frames.next().await {
            self.process_frame(&transport, &frame);
        }
        self.signal_quit(QuitReason::ConnectionClosed);
        transport.finish_sending();
    }

    fn process_frame(&self, transport: &FrameTransport, frame: &[u8]) {
        let (command, data) = split_on_separator(frame);
        match std::str::from_utf8(command) {
            Ok(runner::INFO) => self.on_info(transport, data),
            Ok(runner::QUIT) => self.on_quit(transport),
            Ok(cmd @ (runner::FIND | runner::RUN)) => self.on_operation(cmd, data),
            Ok(runner::CANCEL) => self.on_cancel(data),
            _ => self.machine.diagnostic(format_args!(
                "Received unknown command '{}'",
                String::from_utf8_lossy(command)
            )),
        }
    }

    fn on_info(&self, transport: &FrameTransport, data: Option<&[u8]>) {
        match data.map(|json| serde_json::from_slice::<RunnerEngineInfo>(json)) {
            Some(Ok(info)) if info.protocol_version != PROTOCOL_VERSION => {
                warn!(
                    theirs = info.protocol_version,
                    ours = PROTOCOL_VERSION,
                    "runner speaks a different protocol version"
                );
            }
            Some(Err(e)) => debug!(error = %e, "unparseable runner info"),
            _ => {}
        }

        if !self
            .machine
            .try_transition(EngineState::Negotiating, EngineState::Connected)
        {
            self.machine.diagnostic(format_args!(
                "INFO message received outside of Negotiating state (current state is {})",
                self.machine.state()
            ));
        }

        match serde_json::to_vec(&self.options.info) {
            Ok(json) => {
                if let Err(e) = transport.send(&protocol::command_frame(execution::INFO, Some(&json))) {
                    debug!(error = %e, "INFO reply not sent");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode execution engine info"),
        }
    }

    fn on_quit(&self, transport: &FrameTransport) {
        if self.signal_quit(QuitReason::Requested) {
            if let Err(e) = transport.send(execution::DISCONNECT.as_bytes()) {
                debug!(error = %e, "DISCONNECT not sent");
            }
        }
    }

    fn on_operation(&self, command: &str, data: Option<&[u8]>) {
        let state = self.machine.state();
        if state != EngineState::Connected {
            self.machine.diagnostic(format_args!(
                "Ignoring {command} message received outside of Connected state (current state is {state})"
            ));
            return;
        }
        let Some(operation_id) = operation_id(data) else {
            self.machine
                .diagnostic(format_args!("{command} data is missing the operation ID"));
            return;
        };

        if !lock(&self.operations).executing.insert(operation_id.clone()) {
            self.machine.diagnostic(format_args!(
                "{command} requested for duplicate operation ID '{operation_id}'"
            ));
            return;
        }

        let request = if command == runner::FIND {
            RunnerCommand::Find { operation_id }
        } else {
            RunnerCommand::Run { operation_id }
        };
        if self.commands_tx.send(request).is_err() {
            debug!("command stream dropped");
        }
    }

    fn on_cancel(&self, data: Option<&[u8]>) {
        let state = self.machine.state();
        if state != EngineState::Connected {
            self.machine.diagnostic(format_args!(
                "Ignoring CANCEL message received outside of Connected state (current state is {state})"
            ));
            return;
        }
        let Some(operation_id) = operation_id(data) else {
            self.machine
                .diagnostic("CANCEL data is missing the operation ID");
            return;
        };

        {
            let mut ops = lock(&self.operations);
            if !ops.executing.contains(&operation_id) {
                drop(ops);
                self.machine.diagnostic(format_args!(
                    "CANCEL requested for unknown operation ID '{operation_id}'"
                ));
                return;
            }
            ops.cancelled.insert(operation_id.clone());
        }
        self.machine.diagnostic(format_args!(
            "CANCEL request recorded for operation ID '{operation_id}'"
        ));

        if self
            .commands_tx
            .send(RunnerCommand::Cancel { operation_id })
            .is_err()
        {
            debug!("command stream dropped");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
