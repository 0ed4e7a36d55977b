//! Structured lifecycle events.
//!
//! The core reports everything an operator or an external health surface may
//! care about as a [`CoreEvent`] passed synchronously to an [`EventSink`]. Events
//! that must survive the process (faults, command and reconnect exhaustion,
//! recovery summaries, fallbacks, watchdog timeouts) are also written to the store's
//! audit trail by [`EventPublisher`].

use crate::protocol::EngineState;
use crate::store::{AuditEntry, AuditSeverity, MeasurementStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Event emitted by the capture core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    StateChanged {
        from: EngineState,
        to: EngineState,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    SessionOpened {
        session_id: String,
        instrument: String,
        profile: String,
    },
    SessionClosed {
        session_id: String,
        reason: String,
        measurements: u64,
    },
    ProfileFallback {
        session_id: Option<String>,
        from: String,
        to: String,
        consecutive_failures: u32,
    },
    WatchdogTimeout {
        elapsed_ms: u64,
        at: DateTime<Utc>,
    },
    WatchdogRecovery {
        outage_ms: u64,
        at: DateTime<Utc>,
    },
    CommandSucceeded {
        command: String,
        attempt: u32,
        response: String,
    },
    CommandFailed {
        command: String,
        attempt: u32,
        error: String,
        retry_in_ms: u64,
    },
    CommandExhausted {
        command: String,
        attempts: u32,
        last_error: String,
    },
    RecoverySummary {
        session_id: String,
        file: String,
        replayed: u64,
        duplicates: u64,
        lost: u64,
    },
    BufferDegraded {
        session_id: String,
        error: String,
    },
    ReconnectExhausted {
        profile: String,
        attempts: u32,
        last_error: Option<String>,
    },
}

impl CoreEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::StateChanged { .. } => "state_changed",
            CoreEvent::SessionOpened { .. } => "session_opened",
            CoreEvent::SessionClosed { .. } => "session_closed",
            CoreEvent::ProfileFallback { .. } => "profile_fallback",
            CoreEvent::WatchdogTimeout { .. } => "watchdog_timeout",
            CoreEvent::WatchdogRecovery { .. } => "watchdog_recovery",
            CoreEvent::CommandSucceeded { .. } => "command_succeeded",
            CoreEvent::CommandFailed { .. } => "command_failed",
            CoreEvent::CommandExhausted { .. } => "command_exhausted",
            CoreEvent::RecoverySummary { .. } => "recovery_summary",
            CoreEvent::BufferDegraded { .. } => "buffer_degraded",
            CoreEvent::ReconnectExhausted { .. } => "reconnect_exhausted",
        }
    }

    /// Durable audit entry for events operators must see after the fact.
    pub fn audit_entry(&self) -> Option<AuditEntry> {
        match self {
            CoreEvent::StateChanged {
                from,
                to: EngineState::Faulted,
                reason,
                ..
            } => Some(
                AuditEntry::new(
                    AuditSeverity::Warning,
                    "engine_faulted",
                    format!(
                        "engine faulted from {from}: {}",
                        reason.as_deref().unwrap_or("unknown")
                    ),
                )
                .with_details(json!({ "from": from, "reason": reason })),
            ),
            CoreEvent::CommandExhausted {
                command,
                attempts,
                last_error,
            } => Some(
                AuditEntry::new(
                    AuditSeverity::Fatal,
                    "command_exhausted",
                    format!("command '{command}' deactivated after {attempts} failed attempts"),
                )
                .with_details(json!({
                    "command": command,
                    "attempts": attempts,
                    "last_error": last_error,
                })),
            ),
            CoreEvent::RecoverySummary {
                session_id,
                file,
                replayed,
                duplicates,
                lost,
            } => {
                let severity = if *lost > 0 {
                    AuditSeverity::Warning
                } else {
                    AuditSeverity::Info
                };
                Some(
                    AuditEntry::new(
                        severity,
                        "recovery_summary",
                        format!(
                            "recovered session {session_id}: {replayed} replayed, {duplicates} already stored, {lost} lost"
                        ),
                    )
                    .with_session(session_id.clone())
                    .with_details(json!({
                        "file": file,
                        "replayed": replayed,
                        "duplicates": duplicates,
                        "lost": lost,
                    })),
                )
            }
            CoreEvent::ProfileFallback {
                session_id,
                from,
                to,
                consecutive_failures,
            } => {
                let entry = AuditEntry::new(
                    AuditSeverity::Warning,
                    "profile_fallback",
                    format!(
                        "switched profile {from} -> {to} after {consecutive_failures} malformed frames"
                    ),
                )
                .with_details(json!({ "from": from, "to": to }));
                Some(match session_id {
                    Some(id) => entry.with_session(id.clone()),
                    None => entry,
                })
            }
            CoreEvent::ReconnectExhausted {
                profile,
                attempts,
                last_error,
            } => Some(
                AuditEntry::new(
                    AuditSeverity::Fatal,
                    "reconnect_exhausted",
                    format!("gave up on the instrument link after {attempts} reconnect attempts"),
                )
                .with_details(json!({
                    "profile": profile,
                    "attempts": attempts,
                    "last_error": last_error,
                })),
            ),
            CoreEvent::WatchdogTimeout { elapsed_ms, .. } => Some(
                AuditEntry::new(
                    AuditSeverity::Warning,
                    "watchdog_timeout",
                    format!("no frame for {elapsed_ms} ms"),
                )
                .with_details(json!({ "elapsed_ms": elapsed_ms })),
            ),
            _ => None,
        }
    }
}

/// Receiver of core events. Called synchronously; must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &CoreEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &CoreEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        match event {
            CoreEvent::StateChanged {
                to: EngineState::Faulted,
                ..
            }
            | CoreEvent::CommandExhausted { .. }
            | CoreEvent::ReconnectExhausted { .. } => {
                error!(event = event.name(), %payload, "capture event")
            }
            CoreEvent::ProfileFallback { .. }
            | CoreEvent::WatchdogTimeout { .. }
            | CoreEvent::BufferDegraded { .. }
            | CoreEvent::CommandFailed { .. } => {
                warn!(event = event.name(), %payload, "capture event")
            }
            _ => info!(event = event.name(), %payload, "capture event"),
        }
    }
}

/// Re-publishes events on a tokio broadcast channel for an external
/// reporting layer.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<CoreEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: &CoreEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event.clone());
    }
}

/// Keeps every event in memory. Used by tests.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<CoreEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().clone()
    }

    /// Number of events with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &CoreEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Forwards to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &CoreEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Emits events and writes the auditable ones to the store.
#[derive(Clone)]
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
    store: Arc<dyn MeasurementStore>,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>, store: Arc<dyn MeasurementStore>) -> Self {
        Self { sink, store }
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Emit `event`; audit failures are logged, never returned.
    pub async fn publish(&self, event: CoreEvent) {
        self.sink.emit(&event);
        if let Some(entry) = event.audit_entry() {
            if let Err(e) = self.store.append_audit(&entry).await {
                warn!(event = event.name(), error = %e, "Failed to write audit entry");
            }
        }
    }
}
