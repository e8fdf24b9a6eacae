//! Out-of-process test engine transport.
//!
//! A [`TcpRunnerEngine`] listens on a loopback port; a [`TcpExecutionEngine`]
//! in the worker process connects to it. Both sides negotiate with `INFO`,
//! exchange newline-delimited frames, and shut down cooperatively with
//! `QUIT`/`DISCONNECT` or detect that the peer vanished.

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod transport;

pub use config::EngineConfig;
pub use diagnostics::{
    CollectingDiagnosticSink, DiagnosticMessage, DiagnosticSink, NullDiagnosticSink,
    TracingDiagnosticSink,
};
pub use engine::{
    AcceptFilter, CommandStream, EngineState, EngineStateMachine, ExecutionEngineOptions,
    MessageGate, MessageStream, QuitReason, TcpExecutionEngine, TcpRunnerEngine,
};
pub use error::{ConfigError, EngineError, FrameError, TransportError};
pub use protocol::{ExecutionEngineInfo, RemoteMessage, RunnerCommand, RunnerEngineInfo};
pub use transport::{FrameStream, FrameTransport, Termination};
