//! Command vocabulary carried inside frames.
//!
//! Every frame payload is `COMMAND` or `COMMAND SP data`. The runner speaks
//! first (`INFO`) once a connection is accepted; the execution engine answers
//! with its own `INFO`, which completes negotiation on both sides.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Separates a command from its data, and an operation ID from a `MSG` body.
pub const DATA_SEPARATOR: u8 = b' ';

pub mod runner {
    //! Commands sent by the runner engine.
    pub const INFO: &str = "INFO";
    pub const FIND: &str = "FIND";
    pub const RUN: &str = "RUN";
    pub const CANCEL: &str = "CANCEL";
    pub const QUIT: &str = "QUIT";
}

pub mod execution {
    //! Commands sent by the execution engine.
    pub const INFO: &str = "INFO";
    pub const MSG: &str = "MSG";
    pub const DISCONNECT: &str = "DISCONNECT";
}

/// Negotiation payload sent by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerEngineInfo {
    pub protocol_version: u32,
}

impl Default for RunnerEngineInfo {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Negotiation payload sent by the execution engine; describes the test
/// assembly it hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEngineInfo {
    pub test_assembly_unique_id: String,
    pub test_framework_display_name: String,
}

/// Work requested by the runner, surfaced to the worker's main loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerCommand {
    Find { operation_id: String },
    Run { operation_id: String },
    Cancel { operation_id: String },
}

impl RunnerCommand {
    pub fn operation_id(&self) -> &str {
        match self {
            Self::Find { operation_id }
            | Self::Run { operation_id }
            | Self::Cancel { operation_id } => operation_id,
        }
    }
}

/// A `MSG` frame received by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub operation_id: String,
    pub payload: Vec<u8>,
}

impl RemoteMessage {
    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Build a frame payload from a command and optional data.
pub fn command_frame(command: &str, data: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(command.len() + data.map_or(0, |d| d.len() + 1));
    out.extend_from_slice(command.as_bytes());
    if let Some(data) = data {
        out.push(DATA_SEPARATOR);
        out.extend_from_slice(data);
    }
    out
}

/// `MSG <operation_id> <payload>`
pub fn message_frame(operation_id: &str, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(operation_id.len() + 1 + payload.len());
    data.extend_from_slice(operation_id.as_bytes());
    data.push(DATA_SEPARATOR);
    data.extend_from_slice(payload);
    command_frame(execution::MSG, Some(&data))
}

/// Split at the first separator. The data half is `None` when there is no
/// separator at all.
pub fn split_on_separator(frame: &[u8]) -> (&[u8], Option<&[u8]>) {
    match frame.iter().position(|&b| b == DATA_SEPARATOR) {
        Some(pos) => (&frame[..pos], Some(&frame[pos + 1..])),
        None => (frame, None),
    }
}

/// Operation IDs travel as UTF-8; an empty ID counts as missing.
pub fn operation_id(data: Option<&[u8]>) -> Option<String> {
    data.filter(|d| !d.is_empty())
        .map(|d| String::from_utf8_lossy(d).into_owned())
}
