//! Watchdog and scheduled commands running on the supervisor task.

mod common;

use common::{eventually, registry};
use chrono::{Duration as ChronoDuration, Utc};
use daq_capture::events::{EventPublisher, MemoryEventSink};
use daq_capture::protocol::{CommandChannel, CommandEnvelope, EngineState, EngineStatus};
use daq_capture::store::{AuditSeverity, MeasurementStore, MemoryStore};
use daq_capture::watchdog::{LinkHealth, Supervisor, SupervisorSettings, WatchdogEventKind};
use daq_capture::{AppResult, CaptureError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing_test::traced_test;

struct Harness {
    status: watch::Sender<EngineStatus>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<daq_capture::watchdog::SupervisorReport>,
    health: LinkHealth,
    sink: Arc<MemoryEventSink>,
    store: Arc<MemoryStore>,
}

fn status(state: EngineState, profile: &str) -> EngineStatus {
    EngineStatus {
        state,
        profile: profile.to_string(),
        session_id: None,
        device: None,
    }
}

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        tick: Duration::from_millis(20),
        watchdog_timeout: Duration::from_millis(150),
        ring_capacity: 16,
        command_timeout: Duration::from_millis(100),
    }
}

fn start(profile: &str, commands: CommandChannel) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemoryEventSink::new());
    let publisher = EventPublisher::new(sink.clone(), store.clone());
    let health = LinkHealth::new();
    let (status_tx, status_rx) = watch::channel(status(EngineState::Streaming, profile));
    let supervisor = Supervisor::new(
        settings(),
        registry(),
        status_rx,
        commands,
        publisher,
        health.clone(),
    )
    .unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(supervisor.run(shutdown_rx));
    Harness {
        status: status_tx,
        shutdown: shutdown_tx,
        task,
        health,
        sink,
        store,
    }
}

/// Stand-in engine answering every command with `reply`.
fn fake_engine<F>(mut rx: mpsc::Receiver<CommandEnvelope>, reply: F) -> Arc<AtomicUsize>
where
    F: Fn(usize) -> AppResult<String> + Send + 'static,
{
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = envelope.reply.send(reply(n));
        }
    });
    seen
}

fn timeout_error() -> CaptureError {
    CaptureError::CommandTimeout {
        command: "ping".into(),
        timeout_ms: 100,
    }
}

#[tokio::test]
async fn test_watchdog_fires_once_per_outage_and_recovers() {
    let (commands, _rx) = CommandChannel::new(4);
    let h = start("alternate", commands);
    h.health.mark_streaming(Utc::now());
    h.health.record_decoded(Utc::now());

    // Silence for well over two timeouts.
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(h.sink.count("watchdog_timeout"), 1);
    assert!(h.health.is_degraded());

    h.health.record_decoded(Utc::now());
    eventually(|| h.sink.count("watchdog_recovery") == 1, "watchdog recovery").await;
    assert!(!h.health.is_degraded());

    h.shutdown.send_replace(true);
    let report = h.task.await.unwrap();
    let kinds: Vec<_> = report.watchdog_events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, [WatchdogEventKind::Timeout, WatchdogEventKind::Recovery]);

    let audit = h.store.audit_entries().await.unwrap();
    assert_eq!(audit.iter().filter(|e| e.kind == "watchdog_timeout").count(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_stale_link_is_logged_as_soft_error() {
    let store = Arc::new(MemoryStore::new());
    let publisher = EventPublisher::new(Arc::new(MemoryEventSink::new()), store.clone());
    let health = LinkHealth::new();
    let (_status, status_rx) = watch::channel(status(EngineState::Streaming, "alternate"));
    let (commands, _rx) = CommandChannel::new(4);
    let mut supervisor = Supervisor::new(
        settings(),
        registry(),
        status_rx,
        commands,
        publisher,
        health.clone(),
    )
    .unwrap();
    health.mark_streaming(Utc::now() - ChronoDuration::seconds(1));

    let event = supervisor.check_watchdog().await.unwrap();

    assert_eq!(event.kind, WatchdogEventKind::Timeout);
    assert!(health.is_degraded());
    assert!(logs_contain("Watchdog timeout: no frame for"));
}

#[tokio::test]
async fn test_failing_command_backs_off_then_deactivates() {
    let (commands, rx) = CommandChannel::new(4);
    let attempts = fake_engine(rx, |_| Err(timeout_error()));
    let h = start("primary", commands);

    eventually(|| h.sink.count("command_exhausted") == 1, "exhaustion").await;
    // Deactivated: no further attempts however long we wait.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(h.sink.count("command_failed"), 1);

    h.shutdown.send_replace(true);
    let report = h.task.await.unwrap();
    let ping = report.schedules.iter().find(|s| s.name() == "ping").unwrap();
    assert!(!ping.active);
    assert_eq!(ping.attempts, 2);

    let audit = h.store.audit_entries().await.unwrap();
    let exhausted = audit.iter().find(|e| e.kind == "command_exhausted").unwrap();
    assert_eq!(exhausted.severity, AuditSeverity::Fatal);
}

#[tokio::test]
async fn test_transient_failure_recovers_and_keeps_period() {
    let (commands, rx) = CommandChannel::new(4);
    let attempts = fake_engine(rx, |n| {
        if n == 1 {
            Err(timeout_error())
        } else {
            Ok("PONG".to_string())
        }
    });
    let h = start("primary", commands);

    eventually(|| h.sink.count("command_succeeded") >= 2, "two successes").await;
    assert_eq!(h.sink.count("command_failed"), 1);
    assert_eq!(h.sink.count("command_exhausted"), 0);
    assert!(attempts.load(Ordering::SeqCst) >= 3);

    h.shutdown.send_replace(true);
    let report = h.task.await.unwrap();
    let ping = report.schedules.iter().find(|s| s.name() == "ping").unwrap();
    assert!(ping.active);
    assert_eq!(ping.attempts, 0);
    assert!(ping.successes >= 2);
}

#[tokio::test]
async fn test_no_commands_while_link_is_down() {
    let (commands, rx) = CommandChannel::new(4);
    let attempts = fake_engine(rx, |_| Ok("PONG".to_string()));
    let h = start("primary", commands);
    h.status
        .send_replace(status(EngineState::Reconnecting, "primary"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 0);

    h.status.send_replace(status(EngineState::Streaming, "primary"));
    eventually(|| attempts.load(Ordering::SeqCst) >= 1, "first command").await;
    h.shutdown.send_replace(true);
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_profile_switch_reloads_schedules() {
    let (commands, _rx) = CommandChannel::new(4);
    let h = start("primary", commands);
    h.status.send_replace(status(EngineState::Streaming, "alternate"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.shutdown.send_replace(true);
    let report = h.task.await.unwrap();
    assert!(report.schedules.is_empty());
}
