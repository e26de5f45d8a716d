//! # Connection State
//!
//! The single authoritative connection state of a session and the transitions
//! allowed between states. Every change is published on the event bus.
//!
//! ## State Lifecycle:
//! 1. **Idle**: nothing acquired, ready to connect
//! 2. **Connecting**: devices acquired, waiting for the remote stream to open
//! 3. **Connected**: stream open, microphone streaming
//! 4. **Error**: the transport failed; `reset()` returns to Idle
//!
//! Disconnecting moves any state back to Idle.

use crate::error::{AppResult, SessionError};
use crate::session::events::{EventBus, SessionEvent};

use serde::Serialize;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Current connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Error => "ERROR",
        }
    }

    /// Whether a session is acquired or being acquired in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Holds the state and enforces the allowed transitions.
pub struct ConnectionStateMachine {
    state: RwLock<ConnectionState>,
    bus: EventBus,
}

impl ConnectionStateMachine {
    pub fn new(bus: EventBus) -> Self {
        Self {
            state: RwLock::new(ConnectionState::Idle),
            bus,
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `next` if `allowed(current)`; publish when the state actually changes.
    fn transition(
        &self,
        next: ConnectionState,
        allowed: impl FnOnce(ConnectionState) -> bool,
    ) -> AppResult<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let current = *state;

        if !allowed(current) {
            return Err(SessionError::InvalidState(format!(
                "cannot move from {} to {}",
                current.as_str(),
                next.as_str()
            )));
        }

        if current != next {
            *state = next;
            debug!(from = current.as_str(), to = next.as_str(), "Connection state changed");
            self.bus.publish(SessionEvent::StateChanged(next));
        }
        Ok(())
    }

    /// Idle → Connecting.
    pub fn begin_connect(&self) -> AppResult<()> {
        self.transition(ConnectionState::Connecting, |s| s == ConnectionState::Idle)
    }

    /// Connecting → Connected.
    pub fn mark_connected(&self) -> AppResult<()> {
        self.transition(ConnectionState::Connected, |s| s == ConnectionState::Connecting)
    }

    /// Connecting/Connected → Error.
    pub fn fail(&self) -> AppResult<()> {
        self.transition(ConnectionState::Error, |s| s.is_active())
    }

    /// Error → Idle.
    pub fn reset(&self) -> AppResult<()> {
        self.transition(ConnectionState::Idle, |s| {
            matches!(s, ConnectionState::Error | ConnectionState::Idle)
        })
    }

    /// Any state → Idle.
    pub fn settle_idle(&self) {
        let _ = self.transition(ConnectionState::Idle, |_| true);
    }
}
