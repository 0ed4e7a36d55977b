//! Frame ingestion: raw bytes in, persisted measurements out.
//!
//! - [`framing`] re-assembles frames from arbitrarily split reads
//! - [`decode`] applies the active profile's grammar to one frame
//! - [`compensation`] is the pure temperature correction
//! - [`pipeline`] ties them together and writes to the session buffer, then the store

pub mod compensation;
pub mod decode;
pub mod framing;
pub mod pipeline;

pub use decode::{FrameDecoder, MalformedReason};
pub use framing::FrameAssembler;
pub use pipeline::{FallbackRequest, IngestBatch, IngestionPipeline};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One frame exactly as it arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Frame bytes including delimiters
    pub bytes: Bytes,
    /// Receipt time of the read that completed the frame
    pub received_at: DateTime<Utc>,
}

impl RawFrame {
    pub fn new(bytes: impl Into<Bytes>, received_at: DateTime<Utc>) -> Self {
        Self {
            bytes: bytes.into(),
            received_at,
        }
    }

    /// Lower-case hex rendering used in buffer records and the store.
    pub fn hex(&self) -> String {
        to_hex(&self.bytes)
    }
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

pub(crate) fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| text.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

/// Decoded value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Numeric(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Numeric(v) => Some(*v),
            Value::Text(_) => None,
        }
    }
}

/// Outcome recorded with each measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeStatus {
    /// Numeric value decoded
    Ok,
    /// Non-numeric value kept as text
    Text,
}

impl DecodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DecodeStatus::Ok => "ok",
            DecodeStatus::Text => "text",
        }
    }
}

/// A decoded measurement, still tied to the frame it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Value after scale and offset
    pub value: Value,
    /// Unit from the frame, else from the profile
    pub unit: String,
    /// Temperature reported alongside the value
    pub temperature: Option<f64>,
    /// Temperature-compensated value
    pub compensated: Option<f64>,
    pub status: DecodeStatus,
    /// Source frame; every measurement has exactly one
    pub frame: RawFrame,
}

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeResult {
    Ok(Measurement),
    Malformed(MalformedReason),
    /// Bytes are buffered waiting for the rest of a frame
    Incomplete,
}
