//! Output fan-out: sinks that consume the mixed bus.
//!
//! Three variants share one contract and state machine: local device
//! playback, the HTTP PCM/WAV stream server and Google Cast. A transient
//! failure in one output never touches the others or the mixer; each
//! output owns its tap on the fan-out and cleans it up on stop/dispose.

pub mod cast;
pub mod http_stream;
pub mod local;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};

/// Output lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum OutputState {
    #[default]
    Created,
    Initializing,
    Ready,
    /// Cast only: session being established
    Connecting,
    Streaming,
    Stopping,
    Stopped,
    Error,
    Disposed,
}

impl std::fmt::Display for OutputState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "Created",
            Self::Initializing => "Initializing",
            Self::Ready => "Ready",
            Self::Connecting => "Connecting",
            Self::Streaming => "Streaming",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
            Self::Disposed => "Disposed",
        };
        f.write_str(s)
    }
}

impl OutputState {
    pub fn allows(self, to: OutputState) -> bool {
        use OutputState::*;
        match (self, to) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (Error, Initializing) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Created, Initializing) => true,
            (Initializing, Ready) => true,
            (Ready, Streaming) | (Stopped, Streaming) => true,
            (Ready, Connecting) => true,
            (Connecting, Streaming) | (Connecting, Ready) => true,
            (Streaming, Stopping) => true,
            (Stopping, Stopped) | (Streaming, Stopped) => true,
            (Stopped, Ready) => true,
            _ => false,
        }
    }
}

/// Per-output state cell; publishes `OutputStateChanged` in order.
pub struct OutputStateCell {
    output_id: String,
    state: RwLock<OutputState>,
    bus: Arc<EventBus>,
}

impl OutputStateCell {
    pub fn new(output_id: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            output_id: output_id.into(),
            state: RwLock::new(OutputState::Created),
            bus,
        }
    }

    pub fn get(&self) -> OutputState {
        *self.state.read()
    }

    pub fn transition(&self, to: OutputState, operation: &str) -> Result<OutputState> {
        let mut guard = self.state.write();
        let previous = *guard;
        if previous == OutputState::Disposed {
            return Err(Error::AlreadyDisposed);
        }
        if !previous.allows(to) {
            return Err(Error::illegal_state(operation, previous));
        }
        *guard = to;
        drop(guard);

        tracing::debug!(
            target: "output::events",
            output = %self.output_id,
            "{previous} -> {to} ({operation})"
        );
        self.bus.publish(EngineEvent::OutputStateChanged {
            output_id: self.output_id.clone(),
            previous,
            new: to,
        });
        Ok(previous)
    }

    pub fn fail(&self, error: &Error) {
        let mut guard = self.state.write();
        let previous = *guard;
        if previous == OutputState::Disposed || previous == OutputState::Error {
            return;
        }
        *guard = OutputState::Error;
        drop(guard);

        tracing::warn!(output = %self.output_id, "output entered Error: {error}");
        self.bus.publish(EngineEvent::OutputStateChanged {
            output_id: self.output_id.clone(),
            previous,
            new: OutputState::Error,
        });
    }

    pub fn dispose(&self) -> bool {
        let mut guard = self.state.write();
        let previous = *guard;
        if previous == OutputState::Disposed {
            return false;
        }
        *guard = OutputState::Disposed;
        drop(guard);
        self.bus.publish(EngineEvent::OutputStateChanged {
            output_id: self.output_id.clone(),
            previous,
            new: OutputState::Disposed,
        });
        true
    }

    pub fn output_id(&self) -> &str {
        &self.output_id
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

/// The contract shared by all output variants.
pub trait Output: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn state(&self) -> OutputState;

    fn initialize(&self) -> Result<()>;
    /// Begin consuming the mixed stream (Ready/Stopped -> Streaming).
    fn start(&self) -> Result<()>;
    /// Stop consuming. Stopping an output that is not streaming logs a
    /// warning and succeeds.
    fn stop(&self) -> Result<()>;
    fn dispose(&self) -> Result<()>;

    fn volume(&self) -> f32;
    fn set_volume(&self, volume: f32) -> Result<()>;
    fn muted(&self) -> bool;
    fn set_muted(&self, muted: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OutputState; 9] = [
        OutputState::Created,
        OutputState::Initializing,
        OutputState::Ready,
        OutputState::Connecting,
        OutputState::Streaming,
        OutputState::Stopping,
        OutputState::Stopped,
        OutputState::Error,
        OutputState::Disposed,
    ];

    #[test]
    fn test_happy_path() {
        use OutputState::*;
        assert!(Created.allows(Initializing));
        assert!(Initializing.allows(Ready));
        assert!(Ready.allows(Streaming));
        assert!(Streaming.allows(Stopping));
        assert!(Stopping.allows(Stopped));
        assert!(Stopped.allows(Streaming));
        assert!(Stopped.allows(Ready));
    }

    #[test]
    fn test_connecting_bridges_ready_and_streaming() {
        use OutputState::*;
        assert!(Ready.allows(Connecting));
        assert!(Connecting.allows(Streaming));
        assert!(Connecting.allows(Ready));
        assert!(!Created.allows(Connecting));
    }

    #[test]
    fn test_disposed_terminal() {
        for to in ALL {
            assert!(!OutputState::Disposed.allows(to));
        }
    }

    #[test]
    fn test_cell_publishes() {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe();
        let cell = OutputStateCell::new("local", bus);
        cell.transition(OutputState::Initializing, "initialize").unwrap();
        cell.transition(OutputState::Ready, "initialize").unwrap();
        let count = rx.try_iter().count();
        assert_eq!(count, 2);
    }
}
