//! Scheduled protocol commands with retry and backoff.
//!
//! Each [`CommandSchedule`] tracks one named command. A failure schedules a
//! retry `attempt * backoff_base` later (capped at `backoff_cap`); after
//! `max_retries` consecutive failures the command is deactivated, a
//! `CommandExhausted` event is published and a fatal audit entry is written.
//! Schedules are never removed, only deactivated.

use crate::error::{AppResult, CaptureError};
use crate::events::{CoreEvent, EventPublisher};
use crate::profile::{CommandDef, CommandTrigger};
use crate::protocol::commands::{CommandExecutor, CommandRequest};
use crate::watchdog::monitor::LinkHealth;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What an attempt led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Succeeded { response: String },
    /// Failed; retried after `delay`
    Retry { attempt: u32, delay: Duration },
    /// Failed for the last allowed time; deactivated
    Exhausted { attempts: u32, last_error: String },
}

/// Runtime state of one named command.
#[derive(Debug, Clone)]
pub struct CommandSchedule {
    pub def: CommandDef,
    pub next_due: Instant,
    /// Consecutive failed attempts
    pub attempts: u32,
    pub last_error: Option<String>,
    pub active: bool,
    pub in_flight: bool,
    pub successes: u64,
}

impl CommandSchedule {
    pub fn new(def: CommandDef, now: Instant) -> Self {
        let next_due = match def.trigger {
            CommandTrigger::Startup => now,
            CommandTrigger::Periodic { every } => now + every,
            CommandTrigger::Once { delay } => now + delay,
        };
        Self {
            def,
            next_due,
            attempts: 0,
            last_error: None,
            active: true,
            in_flight: false,
            successes: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Delay before retrying after failed attempt `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.def
            .backoff_base
            .saturating_mul(attempt.max(1))
            .min(self.def.backoff_cap)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.active && !self.in_flight && now >= self.next_due
    }

    pub fn record_success(&mut self, now: Instant, response: String) -> CommandOutcome {
        self.in_flight = false;
        self.attempts = 0;
        self.last_error = None;
        self.successes += 1;
        match self.def.trigger {
            CommandTrigger::Periodic { every } => self.next_due = now + every,
            CommandTrigger::Startup | CommandTrigger::Once { .. } => self.active = false,
        }
        CommandOutcome::Succeeded { response }
    }

    pub fn record_failure(&mut self, now: Instant, error: String) -> CommandOutcome {
        self.in_flight = false;
        self.attempts += 1;
        self.last_error = Some(error.clone());
        if self.attempts >= self.def.max_retries {
            self.active = false;
            return CommandOutcome::Exhausted {
                attempts: self.attempts,
                last_error: error,
            };
        }
        let delay = self.retry_delay(self.attempts);
        self.next_due = now + delay;
        CommandOutcome::Retry {
            attempt: self.attempts,
            delay,
        }
    }
}

/// All scheduled commands of the active profile.
pub struct CommandScheduler {
    schedules: Vec<CommandSchedule>,
    timeout: Duration,
    publisher: EventPublisher,
    health: LinkHealth,
}

impl CommandScheduler {
    pub fn new<'a>(
        commands: impl IntoIterator<Item = &'a CommandDef>,
        timeout: Duration,
        publisher: EventPublisher,
        health: LinkHealth,
        now: Instant,
    ) -> Self {
        Self {
            schedules: commands
                .into_iter()
                .map(|def| CommandSchedule::new(def.clone(), now))
                .collect(),
            timeout,
            publisher,
            health,
        }
    }

    pub fn schedules(&self) -> &[CommandSchedule] {
        &self.schedules
    }

    pub fn schedule(&self, name: &str) -> Option<&CommandSchedule> {
        self.schedules.iter().find(|s| s.name() == name)
    }

    /// Swap in another profile's commands after a fallback.
    pub fn reload<'a>(&mut self, commands: impl IntoIterator<Item = &'a CommandDef>, now: Instant) {
        self.schedules = commands
            .into_iter()
            .map(|def| CommandSchedule::new(def.clone(), now))
            .collect();
    }

    /// Requests for every due command, marked in flight.
    pub fn take_due(&mut self, now: Instant) -> Vec<CommandRequest> {
        let timeout = self.timeout;
        self.schedules
            .iter_mut()
            .filter(|s| s.is_due(now))
            .map(|s| {
                s.in_flight = true;
                CommandRequest::from_def(&s.def, timeout)
            })
            .collect()
    }

    /// Record the result of an in-flight command.
    pub async fn complete(
        &mut self,
        name: &str,
        result: AppResult<String>,
        now: Instant,
    ) -> Option<CommandOutcome> {
        let schedule = self
            .schedules
            .iter_mut()
            .find(|s| s.name() == name && s.in_flight)?;
        let attempt = schedule.attempts + 1;
        let outcome = match result {
            Ok(response) => schedule.record_success(now, response),
            Err(e) => schedule.record_failure(now, e.to_string()),
        };
        let error = schedule.last_error.clone();
        report(
            &self.publisher,
            &self.health,
            name,
            attempt,
            &outcome,
            error.as_deref(),
        )
        .await;
        Some(outcome)
    }
}

async fn report(
    publisher: &EventPublisher,
    health: &LinkHealth,
    name: &str,
    attempt: u32,
    outcome: &CommandOutcome,
    error: Option<&str>,
) {
    health.record_command(matches!(outcome, CommandOutcome::Succeeded { .. }));
    let event = match outcome {
        CommandOutcome::Succeeded { response } => {
            debug!(command = name, response, "Command succeeded");
            CoreEvent::CommandSucceeded {
                command: name.to_string(),
                attempt,
                response: response.clone(),
            }
        }
        CommandOutcome::Retry { attempt, delay } => CoreEvent::CommandFailed {
            command: name.to_string(),
            attempt: *attempt,
            error: error.unwrap_or_default().to_string(),
            retry_in_ms: delay.as_millis() as u64,
        },
        CommandOutcome::Exhausted {
            attempts,
            last_error,
        } => CoreEvent::CommandExhausted {
            command: name.to_string(),
            attempts: *attempts,
            last_error: last_error.clone(),
        },
    };
    publisher.publish(event).await;
}

/// Per-command result of the startup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupOutcome {
    pub command: String,
    pub attempts: u32,
    pub result: Result<String, String>,
}

/// Run startup commands in order, each to success or exhaustion.
///
/// Exhaustion is fatal for that command only; the remaining commands still run.
pub async fn run_startup_commands<'a>(
    commands: impl IntoIterator<Item = &'a CommandDef>,
    executor: &mut dyn CommandExecutor,
    timeout: Duration,
    publisher: &EventPublisher,
    health: &LinkHealth,
) -> Vec<StartupOutcome> {
    let mut outcomes = Vec::new();
    for def in commands {
        let mut schedule = CommandSchedule::new(def.clone(), Instant::now());
        let request = CommandRequest::from_def(def, timeout);
        info!(command = %def.name, "Running startup command");
        let mut attempt = 0;
        let result = loop {
            schedule.in_flight = true;
            attempt += 1;
            let outcome = match executor.execute(&request).await {
                Ok(response) => schedule.record_success(Instant::now(), response),
                Err(CaptureError::ShutDown) => {
                    break Err(CaptureError::ShutDown.to_string());
                }
                Err(e) => {
                    warn!(command = %def.name, attempt, error = %e, "Startup command failed");
                    schedule.record_failure(Instant::now(), e.to_string())
                }
            };
            report(
                publisher,
                health,
                &def.name,
                attempt,
                &outcome,
                schedule.last_error.as_deref(),
            )
            .await;
            match outcome {
                CommandOutcome::Succeeded { response } => break Ok(response),
                CommandOutcome::Retry { delay, .. } => tokio::time::sleep(delay).await,
                CommandOutcome::Exhausted {
                    attempts,
                    last_error,
                } => {
                    let err = CaptureError::CommandExhausted {
                        command: def.name.clone(),
                        attempts,
                        last_error,
                    };
                    error!(error = %err, "Startup command deactivated");
                    break Err(err.to_string());
                }
            }
        };
        outcomes.push(StartupOutcome {
            command: def.name.clone(),
            attempts: attempt,
            result,
        });
    }
    outcomes
}
