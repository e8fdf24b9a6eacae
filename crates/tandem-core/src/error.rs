//! Error types for the engines and the frame transport.

use crate::engine::EngineState;
use thiserror::Error;

/// Errors raised while splitting an inbound byte stream into frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds maximum length (got={got}, max={max})")]
    TooLong { got: usize, max: usize },
}

/// Errors raised by a [`crate::transport::FrameTransport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport read loop already started")]
    AlreadyStarted,

    #[error("transport is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to callers of the runner and execution engines.
///
/// Protocol violations (illegal state transitions) are not represented here:
/// they indicate both peers disagree about sequencing and panic instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot call {operation} on {engine} in state {state} (expected {expected})")]
    InvalidState {
        engine: &'static str,
        operation: &'static str,
        state: EngineState,
        expected: EngineState,
    },

    #[error("failed to bind listening socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to connect to tcp://localhost:{port}/: {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("{engine} has no execution engine info before reaching Connected (currently {state})")]
    NotConnected {
        engine: &'static str,
        state: EngineState,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
}
