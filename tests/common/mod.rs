//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use daq_capture::buffer::BufferPolicy;
use daq_capture::events::{EventPublisher, MemoryEventSink};
use daq_capture::ingest::pipeline::PipelineSettings;
use daq_capture::ingest::IngestionPipeline;
use daq_capture::profile::{load_registry_from_str, ProfileRegistry};
use daq_capture::protocol::{EngineSettings, EngineState, EngineStatus, ProtocolEngine, ReconnectPolicy};
use daq_capture::store::MemoryStore;
use daq_capture::transport::mock::{self, MockDeviceHarness};
use daq_capture::transport::DeviceInfo;
use daq_capture::watchdog::LinkHealth;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

/// `primary` speaks comma-separated frames polled with `D?`; `alternate`
/// speaks `T;<value>` frames polled with `R` on 8N2.
pub const PROFILES: &str = r#"
    [profiles.primary]
    transport = "usb_serial"
    poll_payload = { literal = "D?\r\n" }
    poll_interval_s = 0.2
    fallback = "alternate"

    [profiles.primary.frame]
    kind = "delimited"
    value_field = 0
    temperature_field = 1

    [profiles.primary.measurement]
    unit = "mS/cm"

    [[profiles.primary.commands]]
    name = "ping"
    payload = { literal = "PING\r\n" }
    expect = "PONG"
    retries = 2
    backoff_s = 0.1
    trigger = "periodic"
    every_s = 0.3

    [[profiles.primary.commands]]
    name = "identify"
    payload = { literal = "*IDN?\r\n" }
    expect = "EC"
    retries = 2
    backoff_s = 0.05
    trigger = "startup"

    [profiles.alternate]
    transport = "usb_serial"
    poll_payload = { literal = "R\r\n" }
    poll_interval_s = 0.2

    [profiles.alternate.serial]
    stop_bits = 2

    [profiles.alternate.frame]
    kind = "delimited"
    separator = ";"
    value_field = 1

    [profiles.alternate.measurement]
    unit = "mS/cm"
"#;

pub fn registry() -> Arc<ProfileRegistry> {
    Arc::new(load_registry_from_str(PROFILES).unwrap())
}

pub fn device() -> DeviceInfo {
    DeviceInfo {
        port: "/dev/ttyUSB0".into(),
        serial_number: Some("FT-TEST-1".into()),
        model: Some("EC-215".into()),
        description: None,
    }
}

pub fn pipeline_settings(dir: &Path, flush_every: usize) -> PipelineSettings {
    PipelineSettings {
        failure_threshold: 3,
        max_frame_len: 128,
        buffer_dir: dir.to_path_buf(),
        buffer_policy: BufferPolicy {
            flush_every,
            flush_interval: Duration::from_secs(60),
        },
    }
}

pub fn engine_settings() -> EngineSettings {
    EngineSettings {
        handshake_timeout: Duration::from_millis(300),
        read_timeout: Duration::from_millis(20),
        shutdown_grace: Duration::from_millis(100),
        reconnect: ReconnectPolicy {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(40),
            max_attempts: 3,
        },
    }
}

/// An engine on a mock link with in-memory store and event capture.
pub struct Rig {
    pub engine: ProtocolEngine,
    pub harness: MockDeviceHarness,
    pub store: Arc<MemoryStore>,
    pub sink: Arc<MemoryEventSink>,
    pub health: LinkHealth,
    pub publisher: EventPublisher,
    pub dir: TempDir,
}

pub fn rig(profile: &str) -> Rig {
    let registry = registry();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemoryEventSink::new());
    let publisher = EventPublisher::new(sink.clone(), store.clone());
    let health = LinkHealth::new();
    let pipeline = IngestionPipeline::new(
        registry.get(profile).unwrap(),
        pipeline_settings(dir.path(), 1),
        store.clone(),
        publisher.clone(),
        health.clone(),
    );
    let (transport, harness) = mock::pair_with_info(device());
    let engine = ProtocolEngine::new(
        Box::new(transport),
        registry,
        pipeline,
        engine_settings(),
        publisher.clone(),
        health.clone(),
    );
    Rig {
        engine,
        harness,
        store,
        sink,
        health,
        publisher,
        dir,
    }
}

/// Wait until the status satisfies `pred`, failing after five seconds.
pub async fn wait_for_status<F>(status: &mut watch::Receiver<EngineStatus>, mut pred: F) -> EngineStatus
where
    F: FnMut(&EngineStatus) -> bool,
{
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let current = status.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            status.changed().await.unwrap();
        }
    })
    .await;
    result.unwrap_or_else(|_| panic!("status never matched, last: {:?}", status.borrow()))
}

pub async fn wait_for_state(status: &mut watch::Receiver<EngineStatus>, state: EngineState) -> EngineStatus {
    wait_for_status(status, |s| s.state == state).await
}

/// Poll `check` every 10 ms until it holds, failing after five seconds.
pub async fn eventually<F>(mut check: F, what: &str)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Every buffer log in `dir`.
pub fn buffer_files(dir: &Path) -> Vec<std::path::PathBuf> {
    daq_capture::buffer::recovery::pending_buffers(dir).unwrap()
}

/// Lines of a buffer file.
pub fn buffer_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}
