//! Configuration System using Figment
//!
//! Station configuration is loaded from:
//! 1. a TOML file (base configuration, `config/capture.toml` by default)
//! 2. Environment variables (prefixed with `DAQ_CAPTURE_`, nested keys split on `__`)
//!
//! # Example
//! ```no_run
//! use daq_capture::config::CaptureConfig;
//!
//! let config = CaptureConfig::load()?;
//! config.validate()?;
//! println!("Profile: {}", config.station.profile);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::{AppResult, CaptureError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Which instrument, port and profile this station drives
    pub station: StationConfig,
    /// Protocol engine timing
    #[serde(default)]
    pub engine: EngineConfig,
    /// Session buffer settings
    #[serde(default)]
    pub buffer: BufferConfig,
    /// Watchdog settings
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// Relational store settings
    #[serde(default)]
    pub store: StoreConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Station wiring: profile registry location and the device to open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Path to the protocol profile registry (TOML)
    #[serde(default = "default_profiles_path")]
    pub profiles_path: PathBuf,
    /// Name of the profile to start with
    pub profile: String,
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3")
    #[serde(default)]
    pub port: Option<String>,
    /// USB serial number of the bridge, used instead of `port` when set
    #[serde(default)]
    pub device_serial: Option<String>,
}

/// Protocol engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long to wait for the first valid frame after the handshake poll
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Upper bound on a single transport read
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// First reconnect delay (doubles per attempt)
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap
    #[serde(default = "default_reconnect_cap")]
    pub reconnect_cap_ms: u64,
    /// Reconnect attempts before the engine reports fatal
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_max_attempts: u32,
    /// Consecutive malformed frames before a profile fallback is requested
    #[serde(default = "default_decode_threshold")]
    pub decode_failure_threshold: u32,
    /// Grace period for in-flight reads on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    /// Response deadline for scheduled commands
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// Frames longer than this are discarded as malformed
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

/// Session buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Directory holding one append-only log per open session
    #[serde(default = "default_buffer_dir")]
    pub dir: PathBuf,
    /// Flush to stable storage every N records
    #[serde(default = "default_flush_every")]
    pub flush_every_records: usize,
    /// Flush at least this often while records are pending
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

/// Watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Supervisor tick period
    #[serde(default = "default_watchdog_tick")]
    pub tick_ms: u64,
    /// Frame staleness that raises a timeout
    #[serde(default = "default_watchdog_timeout")]
    pub timeout_ms: u64,
    /// Length of the in-memory event ring
    #[serde(default = "default_event_ring")]
    pub event_ring_capacity: usize,
}

/// Relational store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

// Default value functions
fn default_app_name() -> String {
    "daq-capture".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_profiles_path() -> PathBuf {
    PathBuf::from("config/profiles.toml")
}

fn default_handshake_timeout() -> u64 {
    3000
}

fn default_read_timeout() -> u64 {
    250
}

fn default_reconnect_base() -> u64 {
    500
}

fn default_reconnect_cap() -> u64 {
    30_000
}

fn default_reconnect_attempts() -> u32 {
    8
}

fn default_decode_threshold() -> u32 {
    5
}

fn default_shutdown_grace() -> u64 {
    2000
}

fn default_command_timeout() -> u64 {
    2000
}

fn default_max_frame_len() -> usize {
    512
}

fn default_buffer_dir() -> PathBuf {
    PathBuf::from("data/buffer")
}

fn default_flush_every() -> usize {
    100
}

fn default_flush_interval() -> u64 {
    1000
}

fn default_watchdog_tick() -> u64 {
    1000
}

fn default_watchdog_timeout() -> u64 {
    5000
}

fn default_event_ring() -> usize {
    256
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/capture.sqlite")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout(),
            read_timeout_ms: default_read_timeout(),
            reconnect_base_ms: default_reconnect_base(),
            reconnect_cap_ms: default_reconnect_cap(),
            reconnect_max_attempts: default_reconnect_attempts(),
            decode_failure_threshold: default_decode_threshold(),
            shutdown_grace_ms: default_shutdown_grace(),
            command_timeout_ms: default_command_timeout(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            dir: default_buffer_dir(),
            flush_every_records: default_flush_every(),
            flush_interval_ms: default_flush_interval(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_watchdog_tick(),
            timeout_ms: default_watchdog_timeout(),
            event_ring_capacity: default_event_ring(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

impl EngineConfig {
    /// Handshake deadline as a `Duration`
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Read deadline as a `Duration`
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Shutdown grace period as a `Duration`
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Command response deadline as a `Duration`
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl CaptureConfig {
    /// Build a config for `profile` with every other section defaulted.
    pub fn for_profile(profile: impl Into<String>) -> Self {
        Self {
            application: ApplicationConfig::default(),
            station: StationConfig {
                profiles_path: default_profiles_path(),
                profile: profile.into(),
                port: None,
                device_serial: None,
            },
            engine: EngineConfig::default(),
            buffer: BufferConfig::default(),
            watchdog: WatchdogConfig::default(),
            store: StoreConfig::default(),
        }
    }

    /// Load configuration from `config/capture.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `DAQ_CAPTURE_`.
    /// Example: `DAQ_CAPTURE_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/capture.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_CAPTURE_").split("__"))
            .extract()
    }

    /// Parse configuration from a TOML string (no environment overlay)
    pub fn from_toml_str(content: &str) -> Result<Self, figment::Error> {
        Figment::new().merge(Toml::string(content)).extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let mut problems = Vec::new();

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            problems.push(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            problems.push(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.station.profile.trim().is_empty() {
            problems.push("station.profile must not be empty".to_string());
        }

        let durations = [
            ("engine.handshake_timeout_ms", self.engine.handshake_timeout_ms),
            ("engine.read_timeout_ms", self.engine.read_timeout_ms),
            ("engine.reconnect_base_ms", self.engine.reconnect_base_ms),
            ("engine.reconnect_cap_ms", self.engine.reconnect_cap_ms),
            ("engine.shutdown_grace_ms", self.engine.shutdown_grace_ms),
            ("engine.command_timeout_ms", self.engine.command_timeout_ms),
            ("buffer.flush_interval_ms", self.buffer.flush_interval_ms),
            ("watchdog.tick_ms", self.watchdog.tick_ms),
            ("watchdog.timeout_ms", self.watchdog.timeout_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                problems.push(format!("{name} must be greater than 0"));
            }
        }

        if self.engine.reconnect_cap_ms < self.engine.reconnect_base_ms {
            problems.push(format!(
                "engine.reconnect_cap_ms ({}) must be >= reconnect_base_ms ({})",
                self.engine.reconnect_cap_ms, self.engine.reconnect_base_ms
            ));
        }
        if self.engine.decode_failure_threshold == 0 {
            problems.push("engine.decode_failure_threshold must be at least 1".to_string());
        }
        if self.engine.max_frame_len < 2 {
            problems.push("engine.max_frame_len must be at least 2".to_string());
        }
        if self.buffer.flush_every_records == 0 {
            problems.push("buffer.flush_every_records must be at least 1".to_string());
        }
        if self.watchdog.timeout_ms <= self.watchdog.tick_ms {
            problems.push(format!(
                "watchdog.timeout_ms ({}) must exceed watchdog.tick_ms ({})",
                self.watchdog.timeout_ms, self.watchdog.tick_ms
            ));
        }
        if self.watchdog.event_ring_capacity == 0 {
            problems.push("watchdog.event_ring_capacity must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CaptureError::Configuration(problems.join("; ")))
        }
    }
}
