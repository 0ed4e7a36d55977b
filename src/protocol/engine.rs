//! Protocol engine.
//!
//! The engine is the only owner of the transport. It drives the link through
//! the [`EngineState`] machine:
//!
//! - `connect`: open the transport with the profile's serial settings
//! - `handshake`: send the poll payload once and wait for the first valid frame,
//!   which opens the session and moves the engine to `Streaming`
//! - `run`: poll on the profile interval, serve the command channel, feed every
//!   read into the ingestion pipeline, and flush the session buffer
//! - on any transport fault: `Faulted -> Reconnecting` with exponential backoff
//! - on repeated decode failure: switch to the fallback profile and re-handshake
//!
//! Every transition is published as a `StateChanged` event.

use super::backoff::ReconnectPolicy;
use super::commands::{response_text, CommandEnvelope, CommandExecutor, CommandRequest};
use super::state::{EngineState, StateMachine};
use crate::config::EngineConfig;
use crate::error::{AppResult, CaptureError};
use crate::events::{CoreEvent, EventPublisher};
use crate::ingest::{FallbackRequest, IngestBatch, IngestionPipeline};
use crate::profile::{Profile, ProfileRegistry};
use crate::transport::{DeviceInfo, DynTransport};
use crate::watchdog::LinkHealth;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 1024;
const FLUSH_TICK: Duration = Duration::from_millis(100);

/// Engine timing.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub shutdown_grace: Duration,
    pub reconnect: ReconnectPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            read_timeout: config.read_timeout(),
            shutdown_grace: config.shutdown_grace(),
            reconnect: ReconnectPolicy::from_config(config),
        }
    }
}

/// Externally visible engine status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub profile: String,
    pub session_id: Option<String>,
    pub device: Option<DeviceInfo>,
}

/// What a finished engine leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineReport {
    pub profile: String,
    pub closed_session: Option<String>,
    pub fallbacks: u32,
}

enum LoopEvent {
    Shutdown,
    Poll,
    Command(Option<CommandEnvelope>),
    CommandDeadline,
    Read(AppResult<usize>),
    Flush,
}

struct PendingCommand {
    envelope: CommandEnvelope,
    deadline: Instant,
}

/// Link state machine and owner of the transport.
pub struct ProtocolEngine {
    machine: StateMachine,
    transport: DynTransport,
    registry: Arc<ProfileRegistry>,
    profile: Profile,
    pipeline: IngestionPipeline,
    settings: EngineSettings,
    publisher: EventPublisher,
    health: LinkHealth,
    status_tx: watch::Sender<EngineStatus>,
    device: Option<DeviceInfo>,
    read_buf: Vec<u8>,
    pending: Option<PendingCommand>,
    fallbacks: u32,
}

impl ProtocolEngine {
    pub fn new(
        transport: DynTransport,
        registry: Arc<ProfileRegistry>,
        pipeline: IngestionPipeline,
        settings: EngineSettings,
        publisher: EventPublisher,
        health: LinkHealth,
    ) -> Self {
        let profile = pipeline.profile().clone();
        let (status_tx, _) = watch::channel(EngineStatus {
            state: EngineState::Disconnected,
            profile: profile.name.clone(),
            session_id: None,
            device: None,
        });
        Self {
            machine: StateMachine::default(),
            transport,
            registry,
            profile,
            pipeline,
            settings,
            publisher,
            health,
            status_tx,
            device: None,
            read_buf: vec![0; READ_CHUNK],
            pending: None,
            fallbacks: 0,
        }
    }

    pub fn state(&self) -> EngineState {
        self.machine.state()
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn session_id(&self) -> Option<&str> {
        self.pipeline.session_id()
    }

    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    /// Watch channel tracking state, profile, and session.
    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status_tx.subscribe()
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(EngineStatus {
            state: self.machine.state(),
            profile: self.profile.name.clone(),
            session_id: self.pipeline.session_id().map(str::to_string),
            device: self.device.clone(),
        });
    }

    async fn transition(&mut self, next: EngineState, reason: Option<String>) -> AppResult<()> {
        let from = self.machine.transition(next)?;
        match next {
            EngineState::Faulted => {
                error!(from = %from, to = %next, reason = reason.as_deref().unwrap_or("-"), "Engine state change")
            }
            _ => info!(from = %from, to = %next, profile = %self.profile.name, "Engine state change"),
        }
        self.publish_status();
        self.publisher
            .publish(CoreEvent::StateChanged {
                from,
                to: next,
                reason,
                at: Utc::now(),
            })
            .await;
        Ok(())
    }

    async fn fault(&mut self, err: &CaptureError) {
        if self.machine.state().can_transition_to(EngineState::Faulted) {
            // Legal by the check above.
            let _ = self.transition(EngineState::Faulted, Some(err.to_string())).await;
        }
    }

    /// Open the transport with the active profile's serial settings.
    pub async fn connect(&mut self) -> AppResult<DeviceInfo> {
        self.transition(EngineState::Connecting, None).await?;
        if self.transport.is_open() {
            let _ = self.transport.close().await;
        }
        match self.transport.open(&self.profile.serial).await {
            Ok(device) => {
                info!(
                    port = %device.port,
                    instrument = %device.instrument_key(),
                    baud = self.profile.serial.baud_rate,
                    "Transport open"
                );
                self.device = Some(device.clone());
                self.publish_status();
                Ok(device)
            }
            Err(e) => {
                self.fault(&e).await;
                Err(e)
            }
        }
    }

    /// Wait for the first valid frame and open the session.
    ///
    /// Switches to the fallback profile when the instrument answers with
    /// frames the active grammar cannot decode.
    pub async fn handshake(&mut self) -> AppResult<String> {
        loop {
            match self.handshake_once().await? {
                Some(session_id) => return Ok(session_id),
                None => continue,
            }
        }
    }

    /// `Ok(None)` means a fallback profile was applied and the link reopened.
    async fn handshake_once(&mut self) -> AppResult<Option<String>> {
        self.transition(EngineState::Handshaking, None).await?;
        let payload = self.profile.poll_payload.clone();
        if let Err(e) = self.transport.write_all(&payload).await {
            self.fault(&e).await;
            return Err(e);
        }

        let deadline = Instant::now() + self.settings.handshake_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let err = CaptureError::NoHandshakeResponse {
                    timeout_ms: self.settings.handshake_timeout.as_millis() as u64,
                };
                self.fault(&err).await;
                return Err(err);
            }
            let wait = remaining.min(self.settings.read_timeout);
            let n = match self.transport.read(&mut self.read_buf, wait).await {
                Ok(n) => n,
                Err(e) => {
                    self.fault(&e).await;
                    return Err(e);
                }
            };
            if n == 0 {
                continue;
            }
            let chunk = self.read_buf[..n].to_vec();
            let batch = self.pipeline.ingest(&chunk, Utc::now()).await;
            if batch.decoded() > 0 {
                let device = self.device.clone().unwrap_or_default();
                let session_id = self.pipeline.begin_session(&device).await;
                self.transition(EngineState::Streaming, None).await?;
                self.health.mark_streaming(Utc::now());
                return Ok(Some(session_id));
            }
            if let Some(request) = batch.fallback {
                if self.apply_fallback(request).await? {
                    return Ok(None);
                }
            }
        }
    }

    /// Switch to the next profile in the fallback chain and reopen the link.
    ///
    /// Returns `false` when the active profile has no fallback.
    async fn apply_fallback(&mut self, request: FallbackRequest) -> AppResult<bool> {
        let Some(next) = self.registry.fallback_for(&self.profile.name).cloned() else {
            let err = CaptureError::FallbackExhausted(self.profile.name.clone());
            warn!(error = %err, failures = request.consecutive_failures, "Decode failures persist");
            return Ok(false);
        };

        let closed = self.pipeline.end_session("profile_switch").await;
        warn!(from = %request.from, to = %next.name, failures = request.consecutive_failures, "Switching to fallback profile");
        self.publisher
            .publish(CoreEvent::ProfileFallback {
                session_id: closed,
                from: request.from.clone(),
                to: next.name.clone(),
                consecutive_failures: request.consecutive_failures,
            })
            .await;

        self.fallbacks += 1;
        self.pipeline.switch_profile(&next);
        self.profile = next;
        self.connect().await?;
        Ok(true)
    }

    /// Connect and handshake, retrying with backoff on link errors.
    pub async fn establish(&mut self, shutdown: &mut watch::Receiver<bool>) -> AppResult<String> {
        let first = match self.connect().await {
            Ok(_) => self.handshake().await,
            Err(e) => Err(e),
        };
        match first {
            Ok(session_id) => Ok(session_id),
            Err(e) if !e.is_link_fault() => Err(e),
            Err(e) => {
                warn!(error = %e, "Initial connection failed, entering reconnect");
                if self.reconnect(shutdown).await? {
                    self.session_id()
                        .map(str::to_string)
                        .ok_or(CaptureError::ShutDown)
                } else {
                    Err(CaptureError::ShutDown)
                }
            }
        }
    }

    /// Back off and reopen until the link streams again.
    ///
    /// Returns `Ok(false)` if shutdown was requested while waiting.
    async fn reconnect(&mut self, shutdown: &mut watch::Receiver<bool>) -> AppResult<bool> {
        if let Some(pending) = self.pending.take() {
            let _ = pending
                .envelope
                .reply
                .send(Err(CaptureError::TransportIo("link lost".to_string())));
        }
        if let Err(e) = self.pipeline.reset_framing() {
            debug!(error = %e, "Dropped partial frame from the lost link");
        }
        let _ = self.transport.close().await;
        let policy = self.settings.reconnect.clone();

        let mut attempt = 0u32;
        let mut last_error: Option<String> = None;
        loop {
            attempt += 1;
            if !policy.should_retry(attempt) {
                let err = CaptureError::ReconnectExhausted {
                    attempts: attempt - 1,
                };
                error!(error = %err, "Giving up on the instrument link");
                self.publisher
                    .publish(CoreEvent::ReconnectExhausted {
                        profile: self.profile.name.clone(),
                        attempts: attempt - 1,
                        last_error: last_error.take(),
                    })
                    .await;
                if self.state() == EngineState::Faulted {
                    self.transition(EngineState::Disconnected, Some(err.to_string()))
                        .await?;
                }
                return Err(err);
            }
            if self.state() == EngineState::Faulted {
                self.transition(EngineState::Reconnecting, None).await?;
            }

            let delay = policy.delay_for_attempt(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(shutdown) => return Ok(false),
            }

            let result = match self.connect().await {
                Ok(_) => self.handshake().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => {
                    info!(attempt, "Link re-established");
                    return Ok(true);
                }
                Err(e) if e.is_link_fault() => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    last_error = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-send the poll payload.
    pub async fn poll_tick(&mut self) -> AppResult<()> {
        let payload = self.profile.poll_payload.clone();
        self.transport.write_all(&payload).await
    }

    async fn handle_batch(&mut self, batch: IngestBatch) -> AppResult<()> {
        if let Some(frame) = batch.claimed.first() {
            if let Some(pending) = self.pending.take() {
                let response = response_text(frame);
                debug!(command = %pending.envelope.request.name, %response, "Command answered");
                let _ = pending.envelope.reply.send(Ok(response));
            }
        }
        if let Some(request) = batch.fallback {
            if self.apply_fallback(request).await? {
                self.handshake().await?;
            }
        }
        Ok(())
    }

    async fn read_once(&mut self, n: usize) -> AppResult<()> {
        let chunk = self.read_buf[..n].to_vec();
        let batch = match &self.pending {
            Some(pending) => {
                let request = pending.envelope.request.clone();
                self.pipeline
                    .ingest_claiming(&chunk, Utc::now(), move |frame| request.matches(frame))
                    .await
            }
            None => self.pipeline.ingest(&chunk, Utc::now()).await,
        };
        self.handle_batch(batch).await
    }

    async fn start_command(&mut self, envelope: CommandEnvelope) -> AppResult<()> {
        debug!(command = %envelope.request.name, "Sending command");
        if let Err(e) = self.transport.write_all(&envelope.request.payload).await {
            let _ = envelope
                .reply
                .send(Err(CaptureError::TransportIo(e.to_string())));
            return Err(e);
        }
        let deadline = Instant::now() + envelope.request.timeout;
        self.pending = Some(PendingCommand { envelope, deadline });
        Ok(())
    }

    fn expire_command(&mut self) {
        if let Some(pending) = self.pending.take() {
            let request = &pending.envelope.request;
            let _ = pending.envelope.reply.send(Err(CaptureError::CommandTimeout {
                command: request.name.clone(),
                timeout_ms: request.timeout.as_millis() as u64,
            }));
        }
    }

    /// Stream until shutdown. The engine must already be streaming (or
    /// faulted, in which case it reconnects first).
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<CommandEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) -> AppResult<EngineReport> {
        let outcome = self.stream(&mut commands, &mut shutdown).await;
        if let Err(e) = &outcome {
            error!(error = %e, "Engine stopped");
        }
        let closed_session = self.finish().await;
        outcome.map(|()| EngineReport {
            profile: self.profile.name.clone(),
            closed_session,
            fallbacks: self.fallbacks,
        })
    }

    async fn stream(
        &mut self,
        commands: &mut mpsc::Receiver<CommandEnvelope>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AppResult<()> {
        let mut flush = tokio::time::interval(FLUSH_TICK);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll_profile = String::new();
        let mut poll = tokio::time::interval(Duration::from_secs(3600));
        let mut commands_open = true;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            if self.state() != EngineState::Streaming {
                if !self.reconnect(shutdown).await? {
                    return Ok(());
                }
            }
            if poll_profile != self.profile.name {
                let period = self.profile.poll_interval().unwrap_or(Duration::from_secs(3600));
                poll = tokio::time::interval_at(Instant::now() + period, period);
                poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
                poll_profile = self.profile.name.clone();
            }
            let polling = self.profile.poll_interval().is_some();
            let deadline = self.pending.as_ref().map(|p| p.deadline);
            let idle = self.pending.is_none() && commands_open;

            let event = {
                let read_timeout = self.settings.read_timeout;
                tokio::select! {
                    biased;
                    _ = shutdown_requested(shutdown) => LoopEvent::Shutdown,
                    _ = sleep_until_opt(deadline), if deadline.is_some() => LoopEvent::CommandDeadline,
                    _ = poll.tick(), if polling => LoopEvent::Poll,
                    envelope = commands.recv(), if idle => LoopEvent::Command(envelope),
                    _ = flush.tick() => LoopEvent::Flush,
                    result = self.transport.read(&mut self.read_buf, read_timeout) => LoopEvent::Read(result),
                }
            };

            let step = match event {
                LoopEvent::Shutdown => return Ok(()),
                LoopEvent::Poll => self.poll_tick().await,
                LoopEvent::Command(Some(envelope)) => self.start_command(envelope).await,
                LoopEvent::Command(None) => {
                    commands_open = false;
                    Ok(())
                }
                LoopEvent::CommandDeadline => {
                    self.expire_command();
                    Ok(())
                }
                LoopEvent::Flush => {
                    self.pipeline.tick();
                    Ok(())
                }
                LoopEvent::Read(Ok(0)) => Ok(()),
                LoopEvent::Read(Ok(n)) => self.read_once(n).await,
                LoopEvent::Read(Err(e)) => Err(e),
            };

            if let Err(e) = step {
                if !e.is_link_fault() {
                    return Err(e);
                }
                warn!(error = %e, "Transport fault");
                self.fault(&e).await;
            }
        }
    }

    /// Drain in-flight reads, close the session, force-close the transport.
    async fn finish(&mut self) -> Option<String> {
        if let Some(pending) = self.pending.take() {
            let _ = pending.envelope.reply.send(Err(CaptureError::ShutDown));
        }

        if self.state() == EngineState::Streaming && self.transport.is_open() {
            let deadline = Instant::now() + self.settings.shutdown_grace;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let wait = remaining.min(self.settings.read_timeout);
                match self.transport.read(&mut self.read_buf, wait).await {
                    Ok(n) if n > 0 => {
                        let chunk = self.read_buf[..n].to_vec();
                        self.pipeline.ingest(&chunk, Utc::now()).await;
                    }
                    _ => break,
                }
            }
        }

        let closed = self.pipeline.end_session("shutdown").await;
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Transport close failed");
        }
        self.device = None;
        if self.state() != EngineState::ShutDown {
            let _ = self.transition(EngineState::ShutDown, None).await;
        }
        closed
    }

    /// Shut down an engine that never reached `run`.
    pub async fn close(mut self) -> Option<String> {
        self.finish().await
    }
}

/// Direct command execution, used for startup commands before the loop runs.
#[async_trait]
impl CommandExecutor for ProtocolEngine {
    async fn execute(&mut self, request: &CommandRequest) -> AppResult<String> {
        if self.state() != EngineState::Streaming {
            return Err(CaptureError::CommandRejected {
                command: request.name.clone(),
                reason: format!("engine is {}", self.state()),
            });
        }
        if let Err(e) = self.transport.write_all(&request.payload).await {
            self.fault(&e).await;
            return Err(e);
        }
        let deadline = Instant::now() + request.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CaptureError::CommandTimeout {
                    command: request.name.clone(),
                    timeout_ms: request.timeout.as_millis() as u64,
                });
            }
            let wait = remaining.min(self.settings.read_timeout);
            let n = match self.transport.read(&mut self.read_buf, wait).await {
                Ok(n) => n,
                Err(e) => {
                    self.fault(&e).await;
                    return Err(e);
                }
            };
            if n == 0 {
                continue;
            }
            let chunk = self.read_buf[..n].to_vec();
            let expected = request.clone();
            let batch = self
                .pipeline
                .ingest_claiming(&chunk, Utc::now(), move |frame| expected.matches(frame))
                .await;
            if let Some(frame) = batch.claimed.first() {
                return Ok(response_text(frame));
            }
        }
    }
}

pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
