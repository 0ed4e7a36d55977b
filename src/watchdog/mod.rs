//! Watchdog and command scheduler.
//!
//! - [`monitor`]: shared link health counters and the single-fire staleness check
//! - [`scheduler`]: named commands with retry/backoff and deactivation
//! - [`supervisor`]: the timer task tying both to the engine's command channel

pub mod monitor;
pub mod scheduler;
pub mod supervisor;

pub use monitor::{HealthSnapshot, LinkHealth, Watchdog, WatchdogEvent, WatchdogEventKind};
pub use scheduler::{
    run_startup_commands, CommandOutcome, CommandSchedule, CommandScheduler, StartupOutcome,
};
pub use supervisor::{Supervisor, SupervisorReport, SupervisorSettings};
