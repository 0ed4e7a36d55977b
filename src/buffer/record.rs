//! Line format of the session buffer.
//!
//! Every record is one JSON object on one line, tagged by `type`:
//!
//! ```text
//! {"type":"session_start","session_id":"…","created_at":"…","started_at":"…","instrument":{…},"profile":"ph_8n1"}
//! {"type":"measurement","session_id":"…","created_at":"…","sequence":1,"received_at":"…","raw_hex":"2b372e30310d0a","value":7.01,"unit":"pH",…}
//! {"type":"session_end","session_id":"…","created_at":"…","ended_at":"…","reason":"shutdown"}
//! ```
//!
//! A line is only trusted when it parses and ends in `\n`, so a record torn by a
//! crash is detectable without touching the records before it.

use crate::error::{AppResult, CaptureError};
use crate::ingest::{from_hex, DecodeStatus, Measurement, Value};
use crate::store::StoredMeasurement;
use crate::transport::DeviceInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One buffer line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BufferRecord {
    SessionStart(SessionStartRecord),
    Measurement(MeasurementRecord),
    SessionEnd(SessionEndRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStartRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub instrument: DeviceInfo,
    pub profile: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
    pub raw_hex: String,
    pub value: Value,
    pub unit: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub compensated: Option<f64>,
    pub status: DecodeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEndRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub reason: String,
}

impl BufferRecord {
    pub fn session_id(&self) -> &str {
        match self {
            BufferRecord::SessionStart(r) => &r.session_id,
            BufferRecord::Measurement(r) => &r.session_id,
            BufferRecord::SessionEnd(r) => &r.session_id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            BufferRecord::SessionStart(r) => r.created_at,
            BufferRecord::Measurement(r) => r.created_at,
            BufferRecord::SessionEnd(r) => r.created_at,
        }
    }

    /// Serialize to a single newline-terminated line.
    pub fn to_line(&self) -> AppResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line, with or without its trailing newline.
    pub fn parse_line(line: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(line.trim_end_matches(['\n', '\r']))?)
    }
}

impl MeasurementRecord {
    pub fn from_measurement(
        session_id: &str,
        sequence: u64,
        measurement: &Measurement,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            created_at,
            sequence,
            received_at: measurement.frame.received_at,
            raw_hex: measurement.frame.hex(),
            value: measurement.value.clone(),
            unit: measurement.unit.clone(),
            temperature: measurement.temperature,
            compensated: measurement.compensated,
            status: measurement.status,
        }
    }

    /// Convert back into the store's row shape.
    pub fn to_stored(&self) -> AppResult<StoredMeasurement> {
        let raw = from_hex(&self.raw_hex).ok_or_else(|| {
            CaptureError::DecodeMalformed(format!(
                "buffer record {} carries invalid raw_hex",
                self.sequence
            ))
        })?;
        Ok(StoredMeasurement {
            session_id: self.session_id.clone(),
            sequence: self.sequence,
            received_at: self.received_at,
            raw,
            value: self.value.clone(),
            unit: self.unit.clone(),
            temperature: self.temperature,
            compensated: self.compensated,
            status: self.status,
        })
    }
}

/// Wall clock that never runs backwards within one buffer.
#[derive(Debug, Clone, Default)]
pub struct MonotonicClock {
    last: Option<DateTime<Utc>>,
}

impl MonotonicClock {
    pub fn now(&mut self) -> DateTime<Utc> {
        self.observe(Utc::now())
    }

    /// Clamp `at` so it is not earlier than anything handed out before.
    pub fn observe(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        let at = match self.last {
            Some(last) if last > at => last,
            _ => at,
        };
        self.last = Some(at);
        at
    }
}
