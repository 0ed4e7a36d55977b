//! Schema definitions for declarative protocol profiles.
//!
//! Two layers live here:
//!
//! - `*Spec` types mirror the TOML registry one-to-one and are what serde sees.
//! - `Profile` / `CommandDef` are the validated forms the engine consumes: payloads
//!   are already bytes, intervals are already `Duration`s, and every invariant the
//!   loader checks (non-zero poll interval, known fallback, sane grammar) holds.
//!
//! # Schema Structure
//!
//! ```toml
//! [profiles.conductivity_8n1]
//! transport = "usb_serial"
//! poll_payload = { literal = "D?\r\n" }
//! poll_interval_s = 1.0
//! fallback = "conductivity_8n2"
//!
//! [profiles.conductivity_8n1.serial]
//! baud_rate = 9600
//! stop_bits = 1
//! latency_timer_ms = 2
//!
//! [profiles.conductivity_8n1.frame]
//! kind = "delimited"
//! terminator = "\r\n"
//! separator = ","
//! value_field = 0
//! temperature_field = 2
//!
//! [profiles.conductivity_8n1.measurement]
//! unit = "mS/cm"
//! compensation = { kind = "linear", coefficient_per_c = 0.0191, reference_c = 25.0 }
//!
//! [[profiles.conductivity_8n1.commands]]
//! name = "calibrate"
//! payload = { literal = "CAL\r\n" }
//! expect = "CAL"
//! retries = 3
//! backoff_s = 1.0
//! trigger = "startup"
//! ```

use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::collections::BTreeMap;
use std::time::Duration;

// =============================================================================
// Registry File
// =============================================================================

/// Top-level shape of a profile registry file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryFile {
    /// Profiles keyed by name
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileSpec>,
}

/// One profile exactly as written in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileSpec {
    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Link kind
    pub transport: TransportKind,

    /// Bytes sent on every poll
    pub poll_payload: PayloadSpec,

    /// Seconds between polls; must be > 0. Required for periodic polling.
    #[serde(default)]
    pub poll_interval_s: Option<f64>,

    /// Periodic polling, or one poll at handshake only
    #[serde(default)]
    pub poll_mode: PollModeSpec,

    /// Serial line settings
    #[serde(default)]
    pub serial: SerialSettings,

    /// Frame grammar
    pub frame: FrameGrammar,

    /// Value interpretation
    #[serde(default)]
    pub measurement: MeasurementSpec,

    /// Named protocol commands
    #[serde(default)]
    pub commands: Vec<CommandSpec>,

    /// Profile to switch to after repeated decode failure
    #[serde(default)]
    pub fallback: Option<String>,
}

// =============================================================================
// Transport & Serial Settings
// =============================================================================

/// Physical link kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Vendor USB-serial bridge
    UsbSerial,
    /// In-process synthetic instrument (dry runs)
    Simulated,
}

/// Parity bit setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial line parameters applied on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SerialSettings {
    /// Serial baud rate (300-921600)
    #[serde(default = "default_baud_rate")]
    #[validate(minimum = 300)]
    #[validate(maximum = 921600)]
    pub baud_rate: u32,

    /// Data bits (5, 6, 7, or 8)
    #[serde(default = "default_data_bits")]
    #[validate(minimum = 5)]
    #[validate(maximum = 8)]
    pub data_bits: u8,

    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    #[validate(minimum = 1)]
    #[validate(maximum = 2)]
    pub stop_bits: u8,

    /// Parity setting
    #[serde(default)]
    pub parity: Parity,

    /// FTDI latency timer in milliseconds (1-255); left untouched when absent
    #[serde(default)]
    pub latency_timer_ms: Option<u8>,
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            latency_timer_ms: None,
        }
    }
}

// =============================================================================
// Payloads & Polling
// =============================================================================

/// A byte payload written as hex or as a literal string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadSpec {
    /// Hex digits, whitespace allowed between bytes: `"02 52 03"`
    Hex(String),
    /// Literal text, TOML escapes already applied: `"D?\r\n"`
    Literal(String),
}

/// Poll cadence as written in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollModeSpec {
    /// Re-send the poll payload every `poll_interval_s`
    #[default]
    Periodic,
    /// Send the poll payload once during the handshake; the instrument streams
    Once,
}

/// Validated poll cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Poll on a fixed, non-zero interval
    Periodic {
        /// Time between polls
        interval: Duration,
    },
    /// Poll once at handshake
    Once,
}

// =============================================================================
// Frame Grammar
// =============================================================================

/// How bytes on the wire are split into frames and fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameGrammar {
    /// Tokenized ASCII: `"+1.234,mS/cm,24.8\r\n"`
    Delimited {
        /// Frame terminator
        #[serde(default = "default_terminator")]
        terminator: String,
        /// Field separator
        #[serde(default = "default_separator")]
        separator: String,
        /// Text stripped from the start of each frame when present
        #[serde(default)]
        prefix: Option<String>,
        /// Index of the value token
        #[serde(default)]
        value_field: usize,
        /// Index of the unit token, if the instrument sends one
        #[serde(default)]
        unit_field: Option<usize>,
        /// Index of the temperature token
        #[serde(default)]
        temperature_field: Option<usize>,
    },
    /// Fixed columns inside a terminated ASCII frame
    FixedWidth {
        /// Frame terminator
        #[serde(default = "default_terminator")]
        terminator: String,
        /// Value columns
        value: FieldSpan,
        /// Unit columns
        #[serde(default)]
        unit: Option<FieldSpan>,
        /// Temperature columns
        #[serde(default)]
        temperature: Option<FieldSpan>,
    },
    /// Fixed-length binary frame delimited by start (and optional end) byte
    Binary {
        /// Sync byte that opens every frame
        start_byte: u8,
        /// Optional closing byte
        #[serde(default)]
        end_byte: Option<u8>,
        /// Total frame length including start/end bytes
        length: usize,
        /// Raw value field
        value: BinaryField,
        /// Raw temperature field
        #[serde(default)]
        temperature: Option<BinaryField>,
        /// XOR of bytes `[1, n)` stored at `n`, the last byte before the end byte
        #[serde(default)]
        xor_checksum: bool,
    },
}

fn default_terminator() -> String {
    "\r\n".to_string()
}

fn default_separator() -> String {
    ",".to_string()
}

/// Column range inside a fixed-width frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSpan {
    /// Zero-based start column
    pub start: usize,
    /// Width in bytes
    pub width: usize,
}

/// Field inside a binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinaryField {
    /// Byte offset from frame start
    pub offset: usize,
    /// Integer encoding
    pub encoding: BinaryEncoding,
    /// Multiplier applied to the raw integer
    #[serde(default = "default_scale")]
    pub scale: f64,
}

/// Big-endian wire encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryEncoding {
    U8,
    I16Be,
    U16Be,
    I32Be,
    U32Be,
    F32Be,
}

impl BinaryEncoding {
    /// Encoded width in bytes
    pub fn width(self) -> usize {
        match self {
            BinaryEncoding::U8 => 1,
            BinaryEncoding::I16Be | BinaryEncoding::U16Be => 2,
            BinaryEncoding::I32Be | BinaryEncoding::U32Be | BinaryEncoding::F32Be => 4,
        }
    }
}

// =============================================================================
// Measurement Interpretation
// =============================================================================

/// Unit system and numeric corrections applied to decoded values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementSpec {
    /// Unit used when the frame carries none
    #[serde(default)]
    pub unit: String,
    /// `value = raw * scale + offset`
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// See `scale`
    #[serde(default)]
    pub offset: f64,
    /// Keep non-numeric value tokens as text instead of rejecting the frame
    #[serde(default)]
    pub allow_text: bool,
    /// Temperature compensation
    #[serde(default)]
    pub compensation: Compensation,
}

fn default_scale() -> f64 {
    1.0
}

impl Default for MeasurementSpec {
    fn default() -> Self {
        Self {
            unit: String::new(),
            scale: default_scale(),
            offset: 0.0,
            allow_text: false,
            compensation: Compensation::None,
        }
    }
}

/// Temperature compensation model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Compensation {
    /// Report the raw value
    #[default]
    None,
    /// `raw / (1 + coefficient_per_c * (t - reference_c))`
    Linear {
        /// Fractional change per degree Celsius
        coefficient_per_c: f64,
        /// Reference temperature in degrees Celsius
        reference_c: f64,
    },
}

// =============================================================================
// Commands
// =============================================================================

/// When a command runs, as written in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandTriggerSpec {
    /// Once, synchronously, before polling starts
    Startup,
    /// Repeatedly every `every_s`
    Periodic,
    /// Once, `delay_s` after streaming starts
    #[default]
    Once,
}

/// A named protocol command as written in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    /// Unique command name
    pub name: String,
    /// Bytes to send
    pub payload: PayloadSpec,
    /// Prefix a response must start with to count as success
    pub expect: String,
    /// Failed attempts allowed before the command is deactivated
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Retry backoff base in seconds
    #[serde(default = "default_backoff_s")]
    pub backoff_s: f64,
    /// Upper bound on a single retry delay
    #[serde(default)]
    pub backoff_cap_s: Option<f64>,
    /// Trigger
    #[serde(default)]
    pub trigger: CommandTriggerSpec,
    /// Period for `periodic` commands
    #[serde(default)]
    pub every_s: Option<f64>,
    /// Delay for `once` commands
    #[serde(default)]
    pub delay_s: Option<f64>,
}

fn default_retries() -> u32 {
    3
}

fn default_backoff_s() -> f64 {
    1.0
}

/// Validated trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTrigger {
    /// Before polling starts
    Startup,
    /// Every `every`
    Periodic {
        /// Period
        every: Duration,
    },
    /// Once, after `delay`
    Once {
        /// Delay after streaming starts
        delay: Duration,
    },
}

/// Validated command definition.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDef {
    /// Unique command name
    pub name: String,
    /// Bytes to send
    pub payload: Vec<u8>,
    /// Required response prefix
    pub expect: String,
    /// Failed attempts before deactivation
    pub max_retries: u32,
    /// Retry delay base
    pub backoff_base: Duration,
    /// Retry delay cap
    pub backoff_cap: Duration,
    /// Trigger
    pub trigger: CommandTrigger,
}

// =============================================================================
// Validated Profile
// =============================================================================

/// A validated, ready-to-use protocol profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    /// Registry key
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Link kind
    pub transport: TransportKind,
    /// Serial line settings
    pub serial: SerialSettings,
    /// Poll payload bytes
    pub poll_payload: Vec<u8>,
    /// Poll cadence
    pub poll: PollMode,
    /// Frame grammar
    pub frame: FrameGrammar,
    /// Value interpretation
    pub measurement: MeasurementSpec,
    /// Named commands
    pub commands: Vec<CommandDef>,
    /// Fallback profile name
    pub fallback: Option<String>,
}

impl Profile {
    /// Commands that must run before polling begins
    pub fn startup_commands(&self) -> impl Iterator<Item = &CommandDef> {
        self.commands
            .iter()
            .filter(|c| c.trigger == CommandTrigger::Startup)
    }

    /// Commands handed to the scheduler once streaming
    pub fn scheduled_commands(&self) -> impl Iterator<Item = &CommandDef> {
        self.commands
            .iter()
            .filter(|c| c.trigger != CommandTrigger::Startup)
    }

    /// Find a command by name
    pub fn command(&self, name: &str) -> Option<&CommandDef> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Poll interval if polling is periodic
    pub fn poll_interval(&self) -> Option<Duration> {
        match self.poll {
            PollMode::Periodic { interval } => Some(interval),
            PollMode::Once => None,
        }
    }
}
