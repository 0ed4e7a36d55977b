//! The watchdog/scheduler task.
//!
//! Runs on its own timer, independent of the data path. Each tick it checks
//! link staleness and, while the engine streams, submits due commands through
//! the engine's command channel. Command futures run concurrently with the
//! tick so a slow command never delays the watchdog.

use super::monitor::{LinkHealth, Watchdog, WatchdogEvent, WatchdogEventKind};
use super::scheduler::{CommandSchedule, CommandScheduler};
use crate::config::CaptureConfig;
use crate::error::{AppResult, CaptureError};
use crate::events::{CoreEvent, EventPublisher};
use crate::profile::ProfileRegistry;
use crate::protocol::commands::{CommandChannel, CommandExecutor};
use crate::protocol::engine::{shutdown_requested, EngineStatus};
use crate::protocol::EngineState;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Supervisor timing.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub tick: Duration,
    pub watchdog_timeout: Duration,
    pub ring_capacity: usize,
    pub command_timeout: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            tick: Duration::from_millis(config.watchdog.tick_ms),
            watchdog_timeout: Duration::from_millis(config.watchdog.timeout_ms),
            ring_capacity: config.watchdog.event_ring_capacity,
            command_timeout: config.engine.command_timeout(),
        }
    }
}

/// State left when the supervisor stops.
#[derive(Debug, Clone)]
pub struct SupervisorReport {
    pub watchdog_events: Vec<WatchdogEvent>,
    pub schedules: Vec<CommandSchedule>,
}

enum Tick {
    Shutdown,
    Timer,
    Completed(String, AppResult<String>),
    Status(bool),
}

type InFlight = FuturesUnordered<BoxFuture<'static, (String, AppResult<String>)>>;

pub struct Supervisor {
    settings: SupervisorSettings,
    watchdog: Watchdog,
    scheduler: CommandScheduler,
    health: LinkHealth,
    publisher: EventPublisher,
    registry: Arc<ProfileRegistry>,
    status: watch::Receiver<EngineStatus>,
    commands: CommandChannel,
    profile: String,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        registry: Arc<ProfileRegistry>,
        status: watch::Receiver<EngineStatus>,
        commands: CommandChannel,
        publisher: EventPublisher,
        health: LinkHealth,
    ) -> AppResult<Self> {
        let profile = status.borrow().profile.clone();
        let scheduler = CommandScheduler::new(
            registry.get(&profile)?.scheduled_commands(),
            settings.command_timeout,
            publisher.clone(),
            health.clone(),
            Instant::now(),
        );
        Ok(Self {
            settings,
            watchdog: Watchdog::new(settings.watchdog_timeout, settings.ring_capacity),
            scheduler,
            health,
            publisher,
            registry,
            status,
            commands,
            profile,
        })
    }

    /// Run the watchdog check once.
    pub async fn check_watchdog(&mut self) -> Option<WatchdogEvent> {
        let event = self
            .watchdog
            .check(Utc::now(), &self.health.snapshot())?;
        match event.kind {
            WatchdogEventKind::Timeout => {
                let err = CaptureError::WatchdogTimeout {
                    elapsed_ms: event.elapsed_ms,
                };
                warn!(error = %err, "Link health degraded");
                self.health.set_degraded(true);
                self.publisher
                    .publish(CoreEvent::WatchdogTimeout {
                        elapsed_ms: event.elapsed_ms,
                        at: event.at,
                    })
                    .await;
            }
            WatchdogEventKind::Recovery => {
                self.health.set_degraded(false);
                self.publisher
                    .publish(CoreEvent::WatchdogRecovery {
                        outage_ms: event.elapsed_ms,
                        at: event.at,
                    })
                    .await;
            }
        }
        Some(event)
    }

    fn dispatch_due(&mut self, in_flight: &mut InFlight) {
        if self.status.borrow().state != EngineState::Streaming {
            return;
        }
        for request in self.scheduler.take_due(Instant::now()) {
            debug!(command = %request.name, "Command due");
            let mut channel = self.commands.clone();
            in_flight.push(
                async move {
                    let result = channel.execute(&request).await;
                    (request.name, result)
                }
                .boxed(),
            );
        }
    }

    fn follow_profile(&mut self) {
        let profile = self.status.borrow().profile.clone();
        if profile == self.profile {
            return;
        }
        match self.registry.get(&profile) {
            Ok(next) => {
                info!(from = %self.profile, to = %profile, "Reloading scheduled commands");
                self.scheduler
                    .reload(next.scheduled_commands(), Instant::now());
                self.profile = profile;
            }
            Err(e) => warn!(error = %e, "Active profile missing from registry"),
        }
    }

    /// Tick until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SupervisorReport {
        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: InFlight = FuturesUnordered::new();
        let mut status_open = true;

        loop {
            let event = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => Tick::Shutdown,
                _ = ticker.tick() => Tick::Timer,
                Some((name, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    Tick::Completed(name, result)
                }
                changed = self.status.changed(), if status_open => Tick::Status(changed.is_ok()),
            };

            match event {
                Tick::Shutdown => break,
                Tick::Timer => {
                    self.check_watchdog().await;
                    self.dispatch_due(&mut in_flight);
                }
                Tick::Completed(name, result) => {
                    self.scheduler
                        .complete(&name, result, Instant::now())
                        .await;
                }
                Tick::Status(true) => self.follow_profile(),
                Tick::Status(false) => status_open = false,
            }
        }

        SupervisorReport {
            watchdog_events: self.watchdog.events().cloned().collect(),
            schedules: self.scheduler.schedules().to_vec(),
        }
    }
}
