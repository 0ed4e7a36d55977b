//! Custom error types for the capture core.
//!
//! This module defines the primary error type, `CaptureError`, shared by every
//! subsystem. Using the `thiserror` crate, it provides a centralized and
//! consistent way to describe what went wrong, from a missing USB bridge to a
//! corrupt trailing record in a session buffer.
//!
//! ## Error Categories
//!
//! - **Link errors** (`TransportUnavailable`, `TransportBusy`, `TransportIo`,
//!   `NoHandshakeResponse`): propagate to the protocol engine's state machine and
//!   drive visible state transitions.
//! - **Decode errors** (`DecodeMalformed`, `DecodeIncomplete`): absorbed locally by
//!   the ingestion pipeline until the fallback threshold is reached.
//! - **Soft errors** (`BufferWriteFailed`, `BufferRecoveryPartial`, `WatchdogTimeout`):
//!   logged at warning severity; capture continues.
//! - **Command errors** (`CommandTimeout`, `CommandExhausted`): fatal for the
//!   command only, never for polling.
//! - **Configuration errors** (`Configuration`, `ProfileValidation`): raised at load
//!   time, before any connection attempt.
//!
//! By using `#[from]`, `CaptureError` can be created from underlying error types,
//! simplifying error handling with the `?` operator.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the capture error type.
pub type AppResult<T> = std::result::Result<T, CaptureError>;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Dotted path of the offending field, e.g. `profiles.ph.poll_interval_s`
    pub field: String,
    /// Human-readable reason
    pub message: String,
}

impl FieldError {
    pub(crate) fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Primary error type for the capture core.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Transport busy (held by another process): {0}")]
    TransportBusy(String),

    #[error("Transport I/O fault: {0}")]
    TransportIo(String),

    #[error("No handshake response within {timeout_ms} ms")]
    NoHandshakeResponse { timeout_ms: u64 },

    #[error("Malformed frame: {0}")]
    DecodeMalformed(String),

    #[error("Incomplete frame ({buffered} bytes buffered)")]
    DecodeIncomplete { buffered: usize },

    #[error("Session buffer write failed: {0}")]
    BufferWriteFailed(String),

    #[error("Session buffer recovery partial: {recovered} recovered, {lost} lost ({reason})")]
    BufferRecoveryPartial {
        recovered: usize,
        lost: usize,
        reason: String,
    },

    #[error("Command '{command}' timed out after {timeout_ms} ms")]
    CommandTimeout { command: String, timeout_ms: u64 },

    #[error("Command '{command}' exhausted after {attempts} failed attempts: {last_error}")]
    CommandExhausted {
        command: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Command '{command}' rejected: {reason}")]
    CommandRejected { command: String, reason: String },

    #[error("Watchdog timeout: no frame for {elapsed_ms} ms")]
    WatchdogTimeout { elapsed_ms: u64 },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("No fallback profile left after '{0}'")]
    FallbackExhausted(String),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Profile '{profile}' is invalid: {}", join_field_errors(.errors))]
    ProfileValidation {
        profile: String,
        errors: Vec<FieldError>,
    },

    #[error("Relational store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Capture core is shut down")]
    ShutDown,
}

impl CaptureError {
    /// Soft errors degrade a guarantee but never stop capture.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            CaptureError::BufferWriteFailed(_)
                | CaptureError::BufferRecoveryPartial { .. }
                | CaptureError::WatchdogTimeout { .. }
        )
    }

    /// Errors that should push the protocol engine into `Faulted`.
    pub fn is_link_fault(&self) -> bool {
        matches!(
            self,
            CaptureError::TransportUnavailable(_)
                | CaptureError::TransportBusy(_)
                | CaptureError::TransportIo(_)
                | CaptureError::NoHandshakeResponse { .. }
        )
    }

    /// Stable short label used in audit entries and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::TransportUnavailable(_) => "transport_unavailable",
            CaptureError::TransportBusy(_) => "transport_busy",
            CaptureError::TransportIo(_) => "transport_io",
            CaptureError::NoHandshakeResponse { .. } => "no_handshake_response",
            CaptureError::DecodeMalformed(_) => "decode_malformed",
            CaptureError::DecodeIncomplete { .. } => "decode_incomplete",
            CaptureError::BufferWriteFailed(_) => "buffer_write_failed",
            CaptureError::BufferRecoveryPartial { .. } => "buffer_recovery_partial",
            CaptureError::CommandTimeout { .. } => "command_timeout",
            CaptureError::CommandExhausted { .. } => "command_exhausted",
            CaptureError::CommandRejected { .. } => "command_rejected",
            CaptureError::WatchdogTimeout { .. } => "watchdog_timeout",
            CaptureError::InvalidTransition { .. } => "invalid_transition",
            CaptureError::ReconnectExhausted { .. } => "reconnect_exhausted",
            CaptureError::FallbackExhausted(_) => "fallback_exhausted",
            CaptureError::Configuration(_) => "configuration",
            CaptureError::ProfileValidation { .. } => "profile_validation",
            CaptureError::Store(_) => "store",
            CaptureError::Serialization(_) => "serialization",
            CaptureError::Io(_) => "io",
            CaptureError::ShutDown => "shut_down",
        }
    }
}

impl From<rusqlite::Error> for CaptureError {
    fn from(err: rusqlite::Error) -> Self {
        CaptureError::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_errors_are_classified() {
        assert!(CaptureError::BufferWriteFailed("disk full".into()).is_soft());
        assert!(CaptureError::WatchdogTimeout { elapsed_ms: 10 }.is_soft());
        assert!(!CaptureError::TransportBusy("/dev/ttyUSB0".into()).is_soft());
    }

    #[test]
    fn link_faults_are_classified() {
        assert!(CaptureError::NoHandshakeResponse { timeout_ms: 5 }.is_link_fault());
        assert!(CaptureError::TransportIo("eof".into()).is_link_fault());
        assert!(!CaptureError::DecodeMalformed("x".into()).is_link_fault());
    }

    #[test]
    fn profile_validation_lists_every_field() {
        let err = CaptureError::ProfileValidation {
            profile: "ph".into(),
            errors: vec![
                FieldError::new("profiles.ph.poll_interval_s", "must be > 0"),
                FieldError::new("profiles.ph.serial.baud_rate", "out of range"),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("poll_interval_s: must be > 0"));
        assert!(text.contains("baud_rate: out of range"));
        assert_eq!(err.kind(), "profile_validation");
    }
}
