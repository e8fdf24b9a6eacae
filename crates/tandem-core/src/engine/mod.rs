//! Engine lifecycle shared by the runner and execution roles.

mod execution;
mod runner;

pub use execution::{CommandStream, ExecutionEngineOptions, QuitReason, TcpExecutionEngine};
pub use runner::{AcceptFilter, MessageGate, MessageStream, TcpRunnerEngine};

use crate::diagnostics::{DiagnosticMessage, DiagnosticSink};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineState {
    Unknown,
    Initialized,
    Listening,
    Connecting,
    Negotiating,
    Connected,
    Disconnecting,
    Disconnected,
}

impl EngineState {
    /// Legal forward moves. Any live state may be torn down.
    pub fn can_transition_to(self, next: EngineState) -> bool {
        use EngineState::*;
        match (self, next) {
            (Unknown, Initialized)
            | (Initialized, Listening)
            | (Initialized, Connecting)
            | (Listening, Negotiating)
            | (Connecting, Negotiating)
            | (Negotiating, Connected)
            | (Disconnecting, Disconnected) => true,
            (Disconnecting | Disconnected, Disconnecting) => false,
            (_, Disconnecting) => true,
            _ => false,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Initialized => 1,
            Self::Listening | Self::Connecting => 2,
            Self::Negotiating => 3,
            Self::Connected => 4,
            Self::Disconnecting => 5,
            Self::Disconnected => 6,
        }
    }

    /// True once this state is `target` or anything after it on the forward
    /// path. `Listening` and `Connecting` sit at the same step.
    pub fn has_reached(self, target: EngineState) -> bool {
        self.rank() >= target.rank()
    }

    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Disconnecting | Self::Disconnected)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Serialized state holder. Every transition is announced to the sink while
/// the lock is held, so announcements appear in transition order.
pub struct EngineStateMachine {
    engine_type: &'static str,
    engine_id: String,
    state: Mutex<EngineState>,
    changes: watch::Sender<EngineState>,
    sink: Arc<dyn DiagnosticSink>,
}

impl EngineStateMachine {
    pub fn new(
        engine_type: &'static str,
        engine_id: impl Into<String>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let (changes, _) = watch::channel(EngineState::Unknown);
        Self {
            engine_type,
            engine_id: engine_id.into(),
            state: Mutex::new(EngineState::Unknown),
            changes,
            sink,
        }
    }

    pub fn engine_type(&self) -> &'static str {
        self.engine_type
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    pub fn state(&self) -> EngineState {
        *self.lock()
    }

    /// Move to `next`, returning the previous state.
    ///
    /// # Panics
    ///
    /// If `next` is not a legal successor of the current state.
    pub fn transition_to(&self, next: EngineState) -> EngineState {
        let mut state = self.lock();
        self.transition_locked(&mut state, next)
    }

    /// Move to `next` only if the current state is `expected`.
    pub fn try_transition(&self, expected: EngineState, next: EngineState) -> bool {
        let mut state = self.lock();
        if *state != expected {
            return false;
        }
        self.transition_locked(&mut state, next);
        true
    }

    /// Exclusive access to the state. Callers that must keep other fields
    /// consistent with the state (e.g. a connection slot) hold this guard
    /// while touching them.
    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn transition_locked(
        &self,
        state: &mut MutexGuard<'_, EngineState>,
        next: EngineState,
    ) -> EngineState {
        let previous = **state;
        assert!(
            previous.can_transition_to(next),
            "{}({}): illegal engine state transition from {} to {}",
            self.engine_type,
            self.engine_id,
            previous,
            next
        );
        **state = next;
        // Still under the state lock here.
        self.diagnostic(format_args!(
            "Engine state transition from {previous} to {next}"
        ));
        self.changes.send_replace(next);
        previous
    }

    /// Emit `<Type>(<id>): <message>`.
    pub fn diagnostic(&self, message: impl fmt::Display) {
        self.emit(format!(
            "{}({}): {}",
            self.engine_type, self.engine_id, message
        ));
    }

    /// Emit a message verbatim, without the engine prefix.
    pub(crate) fn emit(&self, message: String) {
        self.sink.on_diagnostic(&DiagnosticMessage::new(message));
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.changes.subscribe()
    }

    /// Wait until the engine reaches `target` or a later state; returns the
    /// state observed.
    pub async fn wait_for(&self, target: EngineState) -> EngineState {
        let mut rx = self.changes.subscribe();
        let observed = rx.wait_for(|s| s.has_reached(target)).await.map(|s| *s);
        observed.unwrap_or_else(|_| self.state())
    }
}

impl fmt::Debug for EngineStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineStateMachine")
            .field("engine_type", &self.engine_type)
            .field("engine_id", &self.engine_id)
            .field("state", &self.state())
            .finish()
    }
}
