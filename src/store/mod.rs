//! Relational store boundary.
//!
//! Ingestion and recovery both write through [`MeasurementStore`]. The insert
//! contract is idempotent on `(session_id, sequence)` so replaying a buffer
//! twice never duplicates rows.
//!
//! Two implementations ship with the core:
//! - [`SqliteStore`]: rusqlite on a dedicated worker thread
//! - [`MemoryStore`]: in-process, with a switch to simulate write failures

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{orphaned_measurements, SqliteStore};

use crate::error::AppResult;
use crate::ingest::{DecodeStatus, Value};
use crate::transport::DeviceInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted instrument row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentRecord {
    pub id: i64,
    pub serial_number: String,
    pub model: Option<String>,
    pub description: Option<String>,
}

/// Fields needed to open a session row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub id: String,
    pub instrument_id: i64,
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub note: Option<String>,
    /// Device metadata snapshot at session start
    pub metadata: serde_json::Value,
}

/// A persisted session row.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub instrument_id: i64,
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub metadata: serde_json::Value,
}

impl SessionRecord {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// One measurement together with its raw frame.
///
/// The store writes the frame row and the measurement row together; a
/// measurement row always references exactly one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMeasurement {
    pub session_id: String,
    /// Per-session frame sequence, starting at 1
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
    pub raw: Vec<u8>,
    pub value: Value,
    pub unit: String,
    pub temperature: Option<f64>,
    pub compensated: Option<f64>,
    pub status: DecodeStatus,
}

/// Audit severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Fatal,
}

impl AuditSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Fatal => "fatal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(AuditSeverity::Info),
            "warning" => Some(AuditSeverity::Warning),
            "fatal" => Some(AuditSeverity::Fatal),
            _ => None,
        }
    }
}

/// A durable operator-facing audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub severity: AuditSeverity,
    /// Short machine-readable kind, e.g. `engine_faulted`
    pub kind: String,
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(severity: AuditSeverity, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            severity,
            kind: kind.into(),
            session_id: None,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Persistence interface consumed by ingestion, recovery, and the audit trail.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Insert the instrument if its serial is new; return its id either way.
    async fn upsert_instrument(&self, device: &DeviceInfo) -> AppResult<i64>;

    /// Create a session row. Creating an existing id is a no-op.
    async fn create_session(&self, session: &NewSession) -> AppResult<()>;

    /// Set the end timestamp of an open session. Closed sessions are left as is.
    async fn close_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> AppResult<()>;

    /// The open session for an instrument, if any.
    async fn open_session_for(&self, instrument_id: i64) -> AppResult<Option<SessionRecord>>;

    /// Look up a session by id.
    async fn session(&self, session_id: &str) -> AppResult<Option<SessionRecord>>;

    /// Insert frame and measurement. Returns `false` when `(session_id, sequence)`
    /// already exists.
    async fn insert_measurement(&self, measurement: &StoredMeasurement) -> AppResult<bool>;

    /// Number of measurements stored for a session.
    async fn measurement_count(&self, session_id: &str) -> AppResult<u64>;

    /// Measurements of a session in sequence order.
    async fn measurements(&self, session_id: &str) -> AppResult<Vec<StoredMeasurement>>;

    async fn append_audit(&self, entry: &AuditEntry) -> AppResult<()>;

    /// Every audit entry, oldest first.
    async fn audit_entries(&self) -> AppResult<Vec<AuditEntry>>;
}
