//! Protocol engine against the scripted mock link.

mod common;

use common::{rig, wait_for_state};
use daq_capture::protocol::{CommandChannel, CommandExecutor, CommandRequest, EngineState};
use daq_capture::store::{AuditSeverity, MeasurementStore};
use daq_capture::CaptureError;
use std::time::Duration;
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};
use tracing_test::traced_test;

const POLL: &[u8] = b"D?\r\n";
const FRAME: &[u8] = b"+1.250,24.8\r\n";

fn ping(timeout_ms: u64) -> CommandRequest {
    CommandRequest {
        name: "ping".into(),
        payload: b"PING\r\n".to_vec(),
        expect: "PONG".into(),
        timeout: Duration::from_millis(timeout_ms),
    }
}

#[tokio::test]
async fn test_handshake_opens_session_and_streams() {
    let mut rig = rig("primary");
    rig.harness.reply_to(POLL, FRAME);
    let (_tx, mut shutdown) = watch::channel(false);

    let session = assert_ok!(rig.engine.establish(&mut shutdown).await);

    assert_eq!(rig.engine.state(), EngineState::Streaming);
    assert_eq!(rig.engine.session_id(), Some(session.as_str()));
    rig.harness.expect_write(POLL).await;
    assert_eq!(rig.harness.settings_seen()[0].stop_bits, 1);

    let rows = rig.store.measurements(&session).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].sequence, 1);
    assert_eq!(rows[0].raw, FRAME);
    assert_eq!(rig.sink.count("session_opened"), 1);
    assert!(rig.health.snapshot().streaming_since.is_some());
}

#[tokio::test]
async fn test_silent_instrument_faults_and_is_audited() {
    let mut rig = rig("primary");
    rig.engine.connect().await.unwrap();

    let err = rig.engine.handshake().await.unwrap_err();

    assert!(matches!(err, CaptureError::NoHandshakeResponse { timeout_ms: 300 }));
    assert_eq!(rig.engine.state(), EngineState::Faulted);
    assert!(rig.engine.session_id().is_none());
    let audit = rig.store.audit_entries().await.unwrap();
    assert!(audit.iter().any(|e| e.kind == "engine_faulted"));
}

#[tokio::test]
async fn test_open_failure_is_retried_with_backoff() {
    let mut rig = rig("primary");
    rig.harness
        .fail_next_open(CaptureError::TransportUnavailable("no bridge".into()));
    rig.harness
        .fail_next_open(CaptureError::TransportBusy("held by another process".into()));
    rig.harness.reply_to(POLL, FRAME);
    let (_tx, mut shutdown) = watch::channel(false);

    assert_ok!(rig.engine.establish(&mut shutdown).await);

    assert_eq!(rig.harness.open_count(), 3);
    assert_eq!(rig.engine.state(), EngineState::Streaming);
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let mut rig = rig("primary");
    for _ in 0..4 {
        rig.harness
            .fail_next_open(CaptureError::TransportUnavailable("unplugged".into()));
    }
    let (_tx, mut shutdown) = watch::channel(false);

    let err = assert_err!(rig.engine.establish(&mut shutdown).await);

    assert!(matches!(err, CaptureError::ReconnectExhausted { attempts: 3 }));
    assert_eq!(rig.engine.state(), EngineState::Disconnected);
    assert_eq!(rig.harness.open_count(), 4);

    assert_eq!(rig.sink.count("reconnect_exhausted"), 1);
    let audit = rig.store.audit_entries().await.unwrap();
    let gave_up = audit
        .iter()
        .find(|e| e.kind == "reconnect_exhausted")
        .unwrap();
    assert_eq!(gave_up.severity, AuditSeverity::Fatal);
    assert_eq!(gave_up.details["attempts"], 3);
    assert!(gave_up.details["last_error"]
        .as_str()
        .unwrap()
        .contains("unplugged"));
}

#[tokio::test]
async fn test_link_loss_reconnects_into_same_session() {
    let mut rig = rig("primary");
    rig.harness.reply_to(POLL, FRAME);
    let (tx, mut shutdown) = watch::channel(false);
    let session = rig.engine.establish(&mut shutdown).await.unwrap();
    let mut status = rig.engine.subscribe();
    let (_commands, rx) = CommandChannel::new(4);
    let engine = tokio::spawn(rig.engine.run(rx, shutdown));

    rig.harness.disconnect();
    common::eventually(|| rig.harness.open_count() >= 2, "reopen").await;
    wait_for_state(&mut status, EngineState::Streaming).await;
    tokio::time::sleep(Duration::from_millis(450)).await;

    tx.send_replace(true);
    let report = engine.await.unwrap().unwrap();
    assert_eq!(report.closed_session.as_deref(), Some(session.as_str()));
    assert_eq!(rig.sink.count("session_opened"), 1);

    let sequences: Vec<u64> = rig
        .store
        .measurements(&session)
        .await
        .unwrap()
        .iter()
        .map(|m| m.sequence)
        .collect();
    assert!(sequences.len() >= 3, "got {sequences:?}");
    assert_eq!(sequences, (1..=sequences.len() as u64).collect::<Vec<_>>());

    let audit = rig.store.audit_entries().await.unwrap();
    assert!(audit.iter().any(|e| e.kind == "engine_faulted"));
}

#[tokio::test]
async fn test_shutdown_closes_session_and_transport() {
    let mut rig = rig("primary");
    rig.harness.reply_to(POLL, FRAME);
    let (tx, mut shutdown) = watch::channel(false);
    let session = rig.engine.establish(&mut shutdown).await.unwrap();
    let mut status = rig.engine.subscribe();
    let (_commands, rx) = CommandChannel::new(4);
    let engine = tokio::spawn(rig.engine.run(rx, shutdown));

    tokio::time::sleep(Duration::from_millis(250)).await;
    tx.send_replace(true);
    let report = engine.await.unwrap().unwrap();

    assert_eq!(report.closed_session.as_deref(), Some(session.as_str()));
    assert_eq!(status.borrow_and_update().state, EngineState::ShutDown);
    let row = rig.store.session(&session).await.unwrap().unwrap();
    assert!(!row.is_open());
    // Every store write succeeded, so the buffer has nothing left to recover.
    assert!(common::buffer_files(rig.dir.path()).is_empty());
    assert_eq!(rig.sink.count("session_closed"), 1);
}

#[tokio::test]
async fn test_buffer_keeps_session_end_when_store_fails() {
    let mut rig = rig("primary");
    rig.harness.reply_to(POLL, FRAME);
    let (tx, mut shutdown) = watch::channel(false);
    rig.engine.establish(&mut shutdown).await.unwrap();
    rig.store.set_fail_writes(true);
    let (_commands, rx) = CommandChannel::new(4);
    let engine = tokio::spawn(rig.engine.run(rx, shutdown));

    tokio::time::sleep(Duration::from_millis(450)).await;
    tx.send_replace(true);
    engine.await.unwrap().unwrap();

    let files = common::buffer_files(rig.dir.path());
    assert_eq!(files.len(), 1);
    let lines = common::buffer_lines(&files[0]);
    assert!(lines[0].contains(r#""type":"session_start""#));
    assert!(lines.len() >= 4, "got {} lines", lines.len());
    let last = lines.last().unwrap();
    assert!(last.contains(r#""type":"session_end""#));
    assert!(last.contains(r#""reason":"shutdown""#));
    assert!(rig.health.store_failures() > 0);
}

#[tokio::test]
async fn test_command_round_trip_while_streaming() {
    let mut rig = rig("primary");
    rig.harness.reply_to(POLL, FRAME);
    rig.harness.reply_to(b"PING\r\n", b"PONG 42\r\n");
    let (tx, mut shutdown) = watch::channel(false);
    let session = rig.engine.establish(&mut shutdown).await.unwrap();
    let (mut commands, rx) = CommandChannel::new(4);
    let engine = tokio::spawn(rig.engine.run(rx, shutdown));

    let response = commands.execute(&ping(500)).await.unwrap();
    assert_eq!(response, "PONG 42");

    rig.harness.clear_replies();
    rig.harness.reply_to(POLL, FRAME);
    let err = commands.execute(&ping(100)).await.unwrap_err();
    assert!(matches!(err, CaptureError::CommandTimeout { .. }));

    tx.send_replace(true);
    engine.await.unwrap().unwrap();

    // The response frame was claimed by the command, never stored as a measurement.
    let rows = rig.store.measurements(&session).await.unwrap();
    assert!(rows.iter().all(|m| m.raw == FRAME));
}

#[tokio::test]
async fn test_command_after_shutdown_is_rejected() {
    let mut rig = rig("primary");
    rig.harness.reply_to(POLL, FRAME);
    let (tx, mut shutdown) = watch::channel(false);
    rig.engine.establish(&mut shutdown).await.unwrap();
    let (mut commands, rx) = CommandChannel::new(4);
    let engine = tokio::spawn(rig.engine.run(rx, shutdown));

    tx.send_replace(true);
    engine.await.unwrap().unwrap();

    let err = commands.execute(&ping(100)).await.unwrap_err();
    assert!(matches!(err, CaptureError::ShutDown));
}

#[tokio::test]
#[traced_test]
async fn test_repeated_decode_failure_switches_to_fallback() {
    let mut rig = rig("primary");
    rig.harness.reply_to(POLL, b"T;7.50\r\nT;7.51\r\nT;7.52\r\n");
    rig.harness.reply_to(b"R\r\n", b"T;7.53\r\n");
    let (_tx, mut shutdown) = watch::channel(false);

    let session = rig.engine.establish(&mut shutdown).await.unwrap();

    assert_eq!(rig.engine.profile().name, "alternate");
    assert_eq!(rig.engine.state(), EngineState::Streaming);
    assert_eq!(rig.harness.settings_seen().last().unwrap().stop_bits, 2);
    assert_eq!(rig.sink.count("profile_fallback"), 1);

    let rows = rig.store.measurements(&session).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value.as_f64(), Some(7.53));

    let audit = rig.store.audit_entries().await.unwrap();
    assert!(audit.iter().any(|e| e.kind == "profile_fallback"));
    assert!(logs_contain("Switching to fallback profile"));
}
