//! Diagnostic sinks.
//!
//! Engines and transports report lifecycle events as plain text messages.
//! The message text is part of the public contract (tests and tooling match
//! on it), so sinks receive the fully rendered string.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

/// A single diagnostic event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticMessage {
    pub message: String,
}

impl DiagnosticMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for DiagnosticMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Receiver of diagnostic events. Shared between engines; must tolerate
/// concurrent calls.
///
/// State transition messages are delivered while the engine holds its state
/// lock. An implementation must not call back into the emitting engine
/// (`state`, `dispose`, any `send_*`) from `on_diagnostic`: it will deadlock.
/// Hand the message to another task if it needs to react.
pub trait DiagnosticSink: Send + Sync {
    fn on_diagnostic(&self, message: &DiagnosticMessage);
}

/// Discards everything.
pub struct NullDiagnosticSink;

impl DiagnosticSink for NullDiagnosticSink {
    fn on_diagnostic(&self, _message: &DiagnosticMessage) {}
}

/// Forwards diagnostics to `tracing` at debug level.
pub struct TracingDiagnosticSink;

impl DiagnosticSink for TracingDiagnosticSink {
    fn on_diagnostic(&self, message: &DiagnosticMessage) {
        tracing::debug!(target: "tandem::diagnostic", "{}", message.message);
    }
}

/// Records every message in arrival order.
#[derive(Clone, Default)]
pub struct CollectingDiagnosticSink {
    messages: Arc<Mutex<Vec<String>>>,
}

impl CollectingDiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the messages received so far.
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl DiagnosticSink for CollectingDiagnosticSink {
    fn on_diagnostic(&self, message: &DiagnosticMessage) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_sink_is_shared_between_clones() {
        let sink = CollectingDiagnosticSink::new();
        let clone = sink.clone();

        clone.on_diagnostic(&DiagnosticMessage::new("first"));
        sink.on_diagnostic(&DiagnosticMessage::new("second"));

        assert_eq!(sink.messages(), vec!["first", "second"]);
    }

    #[test]
    fn test_null_sink_accepts_messages() {
        let sink: Arc<dyn DiagnosticSink> = Arc::new(NullDiagnosticSink);
        sink.on_diagnostic(&DiagnosticMessage::new("ignored"));
    }
}
