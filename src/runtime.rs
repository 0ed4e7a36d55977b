//! Capture runtime: startup recovery, engine task, supervisor task.
//!
//! Startup order:
//! 1. replay leftover session buffers into the store
//! 2. connect and handshake (with reconnect on link faults)
//! 3. run the active profile's startup commands
//! 4. spawn the engine loop and the watchdog/scheduler supervisor
//!
//! [`CaptureRuntime::shutdown`] returns only once the engine has written the
//! session end and closed the transport.

use crate::buffer::{recover, BufferPolicy, RecoveryReport};
use crate::config::CaptureConfig;
use crate::error::{AppResult, CaptureError};
use crate::events::{EventPublisher, EventSink};
use crate::ingest::pipeline::PipelineSettings;
use crate::ingest::IngestionPipeline;
use crate::profile::ProfileRegistry;
use crate::protocol::{
    CommandChannel, EngineReport, EngineSettings, EngineState, EngineStatus, ProtocolEngine,
};
use crate::store::MeasurementStore;
use crate::transport::DynTransport;
use crate::watchdog::{
    run_startup_commands, HealthSnapshot, LinkHealth, StartupOutcome, Supervisor, SupervisorReport,
    SupervisorSettings,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Depth of the engine's command queue.
const COMMAND_QUEUE: usize = 16;

/// What the runtime leaves behind after shutdown.
#[derive(Debug)]
pub struct ShutdownReport {
    pub engine: AppResult<EngineReport>,
    pub supervisor: Option<SupervisorReport>,
}

pub struct CaptureRuntime {
    shutdown_tx: watch::Sender<bool>,
    engine: JoinHandle<AppResult<EngineReport>>,
    supervisor: JoinHandle<SupervisorReport>,
    status: watch::Receiver<EngineStatus>,
    commands: CommandChannel,
    health: LinkHealth,
    recovery: RecoveryReport,
    startup: Vec<StartupOutcome>,
}

impl CaptureRuntime {
    /// Recover, connect, run startup commands, and spawn the capture tasks.
    pub async fn start(
        config: &CaptureConfig,
        registry: Arc<ProfileRegistry>,
        transport: DynTransport,
        store: Arc<dyn MeasurementStore>,
        sink: Arc<dyn EventSink>,
    ) -> AppResult<Self> {
        config.validate()?;
        let profile = registry.get(&config.station.profile)?.clone();
        let publisher = EventPublisher::new(sink, store.clone());
        let health = LinkHealth::new();

        let recovery = match recover(&config.buffer.dir, store.as_ref(), &publisher).await {
            Ok(report) => {
                if !report.is_empty() {
                    info!(
                        files = report.files.len(),
                        replayed = report.replayed(),
                        duplicates = report.duplicates(),
                        lost = report.lost(),
                        kept = report.kept(),
                        "Buffer recovery finished"
                    );
                }
                report
            }
            Err(e) => {
                error!(error = %e, dir = %config.buffer.dir.display(), "Buffer recovery failed");
                RecoveryReport::default()
            }
        };

        let pipeline = IngestionPipeline::new(
            &profile,
            PipelineSettings {
                failure_threshold: config.engine.decode_failure_threshold,
                max_frame_len: config.engine.max_frame_len,
                buffer_dir: config.buffer.dir.clone(),
                buffer_policy: BufferPolicy::from_config(&config.buffer),
            },
            store,
            publisher.clone(),
            health.clone(),
        );
        let mut engine = ProtocolEngine::new(
            transport,
            registry.clone(),
            pipeline,
            EngineSettings::from_config(&config.engine),
            publisher.clone(),
            health.clone(),
        );

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        if let Err(e) = engine.establish(&mut shutdown_rx).await {
            error!(error = %e, "Could not establish the instrument link");
            engine.close().await;
            return Err(e);
        }

        let startup_defs: Vec<_> = engine.profile().startup_commands().cloned().collect();
        let startup = run_startup_commands(
            &startup_defs,
            &mut engine,
            config.engine.command_timeout(),
            &publisher,
            &health,
        )
        .await;
        for outcome in startup.iter().filter(|o| o.result.is_err()) {
            warn!(command = %outcome.command, attempts = outcome.attempts, "Startup command gave up");
        }

        let status = engine.subscribe();
        let (commands, command_rx) = CommandChannel::new(COMMAND_QUEUE);
        let supervisor = match Supervisor::new(
            SupervisorSettings::from_config(config),
            registry,
            status.clone(),
            commands.clone(),
            publisher,
            health.clone(),
        ) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                engine.close().await;
                return Err(e);
            }
        };

        let engine = tokio::spawn(engine.run(command_rx, shutdown_rx.clone()));
        let supervisor = tokio::spawn(supervisor.run(shutdown_rx));
        info!(profile = %status.borrow().profile, "Capture running");

        Ok(Self {
            shutdown_tx,
            engine,
            supervisor,
            status,
            commands,
            health,
            recovery,
            startup,
        })
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.status.borrow().session_id.clone()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Handle for submitting ad-hoc commands to the engine.
    pub fn commands(&self) -> CommandChannel {
        self.commands.clone()
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn startup(&self) -> &[StartupOutcome] {
        &self.startup
    }

    /// Resolves when the engine reaches `ShutDown` on its own, e.g. after
    /// reconnect attempts run out.
    pub async fn stopped(&self) {
        let mut status = self.status.clone();
        loop {
            if status.borrow_and_update().state == EngineState::ShutDown {
                return;
            }
            if status.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop both tasks. The engine drains in-flight reads within its grace
    /// period, writes the session end, and closes the transport first.
    pub async fn shutdown(self) -> ShutdownReport {
        info!("Shutdown requested");
        self.shutdown_tx.send_replace(true);

        let engine = match self.engine.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Engine task failed");
                Err(CaptureError::ShutDown)
            }
        };
        let supervisor = match self.supervisor.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Supervisor task failed");
                None
            }
        };

        if let Ok(report) = &engine {
            info!(
                profile = %report.profile,
                session = report.closed_session.as_deref().unwrap_or("-"),
                fallbacks = report.fallbacks,
                "Capture stopped"
            );
        }
        ShutdownReport { engine, supervisor }
    }
}
