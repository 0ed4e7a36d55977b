//! Protocol engine state machine.
//!
//! ```text
//! Disconnected ──> Connecting ──> Handshaking ──> Streaming
//!                      │              │              │
//!                      └──────────────┴──> Faulted <─┘
//!                                            │
//!                      Connecting <── Reconnecting
//! ```
//!
//! Any state may move to the terminal `ShutDown`. Handshaking may also go back
//! to Connecting when a profile fallback reopens the link.

use crate::error::{AppResult, CaptureError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Disconnected,
    Connecting,
    Handshaking,
    Streaming,
    Faulted,
    Reconnecting,
    ShutDown,
}

impl EngineState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: EngineState) -> bool {
        use EngineState::*;
        match (self, next) {
            (ShutDown, _) => false,
            (_, ShutDown) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Handshaking) | (Connecting, Faulted) => true,
            (Handshaking, Streaming) | (Handshaking, Faulted) | (Handshaking, Connecting) => true,
            (Streaming, Faulted) | (Streaming, Connecting) => true,
            (Faulted, Reconnecting) | (Faulted, Disconnected) => true,
            (Reconnecting, Connecting) | (Reconnecting, Disconnected) => true,
            _ => false,
        }
    }

    /// Whether the link is up and frames are expected.
    #[must_use]
    pub fn is_streaming(self) -> bool {
        self == EngineState::Streaming
    }

    /// Short label for logs and audit entries.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            EngineState::Disconnected => "disconnected",
            EngineState::Connecting => "connecting",
            EngineState::Handshaking => "handshaking",
            EngineState::Streaming => "streaming",
            EngineState::Faulted => "faulted",
            EngineState::Reconnecting => "reconnecting",
            EngineState::ShutDown => "shut_down",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Current state plus transition bookkeeping.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: EngineState,
    transitions: u64,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: EngineState::Disconnected,
            transitions: 0,
        }
    }
}

impl StateMachine {
    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: EngineState) -> AppResult<EngineState> {
        if !self.state.can_transition_to(next) {
            return Err(CaptureError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let previous = self.state;
        self.state = next;
        self.transitions += 1;
        Ok(previous)
    }
}
