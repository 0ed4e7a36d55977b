//! Crash recovery of session buffers into the relational store.

mod common;

use common::{buffer_files, buffer_lines, device, pipeline_settings, registry};
use daq_capture::buffer::{recover, RecoveryOutcome, SessionBuffer, BufferPolicy};
use daq_capture::events::{EventPublisher, MemoryEventSink};
use daq_capture::ingest::IngestionPipeline;
use daq_capture::store::{AuditSeverity, MeasurementStore, MemoryStore, SqliteStore};
use daq_capture::watchdog::LinkHealth;
use chrono::{Duration as ChronoDuration, Utc};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn frame(i: usize) -> Vec<u8> {
    format!("+{}.{:03},25.0\r\n", 1 + i / 10, i % 1000).into_bytes()
}

fn sqlite(dir: &Path, name: &str) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(dir.join(name)).unwrap())
}

fn publisher(store: Arc<dyn MeasurementStore>) -> (EventPublisher, Arc<MemoryEventSink>) {
    let sink = Arc::new(MemoryEventSink::new());
    (EventPublisher::new(sink.clone(), store), sink)
}

/// Feed `frames` through a live pipeline, then drop it without running any
/// destructor, the way a killed process leaves things.
async fn capture_then_crash(
    buffer_dir: &Path,
    store: Arc<dyn MeasurementStore>,
    flush_every: usize,
    frames: usize,
) -> String {
    let (publisher, _) = publisher(store.clone());
    let registry = registry();
    let mut pipeline = IngestionPipeline::new(
        registry.get("primary").unwrap(),
        pipeline_settings(buffer_dir, flush_every),
        store,
        publisher,
        LinkHealth::new(),
    );
    let session = pipeline.begin_session(&device()).await;
    for i in 0..frames {
        let batch = pipeline.ingest(&frame(i), Utc::now()).await;
        assert_eq!(batch.decoded(), 1);
    }
    std::mem::forget(pipeline);
    session
}

#[tokio::test]
async fn test_ten_frames_are_recovered_after_kill() {
    let tmp = TempDir::new().unwrap();
    let buffer_dir = tmp.path().join("buffer");
    let live = sqlite(tmp.path(), "live.sqlite");

    let session = capture_then_crash(&buffer_dir, live.clone(), 5, 10).await;

    assert_eq!(live.measurement_count(&session).await.unwrap(), 10);
    let files = buffer_files(&buffer_dir);
    assert_eq!(files.len(), 1);
    let lines = buffer_lines(&files[0]);
    assert_eq!(lines.len(), 11);
    assert!(lines[0].contains(r#""type":"session_start""#));
    assert!(lines.iter().all(|l| !l.contains("session_end")));

    // Restart against a database that never saw the relational writes.
    let fresh = sqlite(tmp.path(), "fresh.sqlite");
    let (publisher, sink) = publisher(fresh.clone());
    let report = recover(&buffer_dir, fresh.as_ref(), &publisher).await.unwrap();

    assert_eq!(report.replayed(), 10);
    assert_eq!(report.lost(), 0);
    assert_eq!(report.files[0].outcome, RecoveryOutcome::Replayed);
    assert!(!report.files[0].closed_cleanly);
    assert_eq!(fresh.measurement_count(&session).await.unwrap(), 10);
    assert!(buffer_files(&buffer_dir).is_empty());
    assert_eq!(sink.count("recovery_summary"), 1);

    let sequences: Vec<u64> = fresh
        .measurements(&session)
        .await
        .unwrap()
        .iter()
        .map(|m| m.sequence)
        .collect();
    assert_eq!(sequences, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_recovery_into_live_store_only_finds_duplicates() {
    let tmp = TempDir::new().unwrap();
    let buffer_dir = tmp.path().join("buffer");
    let store = sqlite(tmp.path(), "capture.sqlite");
    let session = capture_then_crash(&buffer_dir, store.clone(), 1, 6).await;

    let (publisher, _) = publisher(store.clone());
    let report = recover(&buffer_dir, store.as_ref(), &publisher).await.unwrap();

    assert_eq!(report.replayed(), 0);
    assert_eq!(report.duplicates(), 6);
    assert_eq!(store.measurement_count(&session).await.unwrap(), 6);

    let row = store.session(&session).await.unwrap().unwrap();
    assert!(!row.is_open(), "recovery must close the orphaned session");
    let instrument = store.upsert_instrument(&device()).await.unwrap();
    assert!(store.open_session_for(instrument).await.unwrap().is_none());
}

#[tokio::test]
async fn test_crash_loses_at_most_the_unflushed_window() {
    let tmp = TempDir::new().unwrap();
    let buffer_dir = tmp.path().join("buffer");
    let live = Arc::new(MemoryStore::new());
    let session = capture_then_crash(&buffer_dir, live, 10, 15).await;

    let store = Arc::new(MemoryStore::new());
    let (publisher, _) = publisher(store.clone());
    let report = recover(&buffer_dir, store.as_ref(), &publisher).await.unwrap();

    assert_eq!(report.replayed(), 10);
    assert_eq!(store.measurement_count(&session).await.unwrap(), 10);
}

#[tokio::test]
async fn test_replaying_twice_never_duplicates() {
    let tmp = TempDir::new().unwrap();
    let buffer_dir = tmp.path().join("buffer");
    let session = capture_then_crash(&buffer_dir, Arc::new(MemoryStore::new()), 1, 8).await;
    let file = buffer_files(&buffer_dir).remove(0);
    let copy = std::fs::read(&file).unwrap();

    let store = sqlite(tmp.path(), "capture.sqlite");
    let (publisher, _) = publisher(store.clone());
    let first = recover(&buffer_dir, store.as_ref(), &publisher).await.unwrap();

    // A crash between the replay and the delete leaves the file behind.
    std::fs::write(&file, &copy).unwrap();
    let second = recover(&buffer_dir, store.as_ref(), &publisher).await.unwrap();

    assert_eq!(first.replayed(), 8);
    assert_eq!(second.replayed(), 0);
    assert_eq!(second.duplicates(), 8);
    assert_eq!(store.measurement_count(&session).await.unwrap(), 8);
}

#[tokio::test]
async fn test_torn_tail_is_discarded_and_audited() {
    let tmp = TempDir::new().unwrap();
    let buffer_dir = tmp.path().join("buffer");
    let session = capture_then_crash(&buffer_dir, Arc::new(MemoryStore::new()), 1, 4).await;
    let file = buffer_files(&buffer_dir).remove(0);
    {
        let mut handle = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
        handle
            .write_all(br#"{"type":"measurement","session_id":"#)
            .unwrap();
    }

    let store = Arc::new(MemoryStore::new());
    let (publisher, _) = publisher(store.clone());
    let report = recover(&buffer_dir, store.as_ref(), &publisher).await.unwrap();

    assert_eq!(report.replayed(), 4);
    assert_eq!(report.lost(), 1);
    assert_eq!(store.measurement_count(&session).await.unwrap(), 4);
    assert!(buffer_files(&buffer_dir).is_empty());

    let audit = store.audit_entries().await.unwrap();
    let summary = audit.iter().find(|e| e.kind == "recovery_summary").unwrap();
    assert_eq!(summary.severity, AuditSeverity::Warning);
    assert_eq!(summary.session_id.as_deref(), Some(session.as_str()));
    assert_eq!(summary.details["lost"], 1);
}

#[tokio::test]
async fn test_cleanly_closed_buffer_uses_recorded_end_time() {
    let tmp = TempDir::new().unwrap();
    let started_at = Utc::now() - ChronoDuration::minutes(5);
    let mut buffer = SessionBuffer::open(
        tmp.path(),
        "s-closed",
        &device(),
        "primary",
        started_at,
        BufferPolicy::default(),
    )
    .unwrap();
    let ended_at = Utc::now();
    buffer.close(ended_at, "shutdown").unwrap();

    let store = Arc::new(MemoryStore::new());
    let (publisher, _) = publisher(store.clone());
    let report = recover(tmp.path(), store.as_ref(), &publisher).await.unwrap();

    assert!(report.files[0].closed_cleanly);
    let row = store.session("s-closed").await.unwrap().unwrap();
    assert_eq!(row.ended_at, Some(ended_at));
}

#[tokio::test]
async fn test_store_failure_keeps_file_for_next_start() {
    let tmp = TempDir::new().unwrap();
    let buffer_dir = tmp.path().join("buffer");
    capture_then_crash(&buffer_dir, Arc::new(MemoryStore::new()), 1, 3).await;

    let store = Arc::new(MemoryStore::new());
    store.set_fail_writes(true);
    let (publisher, _) = publisher(store.clone());
    let report = recover(&buffer_dir, store.as_ref(), &publisher).await.unwrap();

    assert_eq!(report.kept(), 1);
    assert_eq!(buffer_files(&buffer_dir).len(), 1);

    store.set_fail_writes(false);
    let report = recover(&buffer_dir, store.as_ref(), &publisher).await.unwrap();
    assert_eq!(report.replayed(), 3);
    assert!(buffer_files(&buffer_dir).is_empty());
}

#[tokio::test]
async fn test_torn_tail_loss_is_audited_after_a_failed_pass() {
    let tmp = TempDir::new().unwrap();
    let buffer_dir = tmp.path().join("buffer");
    let session = capture_then_crash(&buffer_dir, Arc::new(MemoryStore::new()), 1, 3).await;
    let file = buffer_files(&buffer_dir).remove(0);
    {
        let mut handle = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
        handle.write_all(br#"{"type":"measurement","seq"#).unwrap();
    }

    let store = Arc::new(MemoryStore::new());
    let (publisher, _) = publisher(store.clone());
    store.set_fail_writes(true);
    let first = recover(&buffer_dir, store.as_ref(), &publisher).await.unwrap();
    assert_eq!(first.kept(), 1);
    assert_eq!(first.lost(), 1);

    store.set_fail_writes(false);
    let second = recover(&buffer_dir, store.as_ref(), &publisher).await.unwrap();
    assert_eq!(second.replayed(), 3);
    assert_eq!(second.lost(), 1);
    assert!(buffer_files(&buffer_dir).is_empty());

    let audit = store.audit_entries().await.unwrap();
    let summary = audit.iter().find(|e| e.kind == "recovery_summary").unwrap();
    assert_eq!(summary.session_id.as_deref(), Some(session.as_str()));
    assert_eq!(summary.details["lost"], 1);
}

#[tokio::test]
async fn test_missing_buffer_dir_is_not_an_error() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let (publisher, _) = publisher(store.clone());

    let report = recover(&tmp.path().join("absent"), store.as_ref(), &publisher)
        .await
        .unwrap();

    assert!(report.is_empty());
}
