//! In-process store with the same contract as the SQLite store.

use super::{
    AuditEntry, InstrumentRecord, MeasurementStore, NewSession, SessionRecord, StoredMeasurement,
};
use crate::error::{AppResult, CaptureError};
use crate::transport::DeviceInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Tables {
    instruments: Vec<InstrumentRecord>,
    sessions: Vec<SessionRecord>,
    measurements: BTreeMap<(String, u64), StoredMeasurement>,
    audit: Vec<AuditEntry>,
}

/// Memory-backed [`MeasurementStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> AppResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CaptureError::Store("simulated write failure".to_string()));
        }
        Ok(())
    }

    /// Every session row.
    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.tables.lock().sessions.clone()
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn upsert_instrument(&self, device: &DeviceInfo) -> AppResult<i64> {
        self.check_writable()?;
        let key = device.instrument_key();
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.instruments.iter().find(|i| i.serial_number == key) {
            return Ok(existing.id);
        }
        let id = tables.instruments.len() as i64 + 1;
        tables.instruments.push(InstrumentRecord {
            id,
            serial_number: key,
            model: device.model.clone(),
            description: device.description.clone(),
        });
        Ok(id)
    }

    async fn create_session(&self, session: &NewSession) -> AppResult<()> {
        self.check_writable()?;
        let mut tables = self.tables.lock();
        if !tables.instruments.iter().any(|i| i.id == session.instrument_id) {
            return Err(CaptureError::Store(format!(
                "unknown instrument {}",
                session.instrument_id
            )));
        }
        if tables.sessions.iter().any(|s| s.id == session.id) {
            return Ok(());
        }
        tables.sessions.push(SessionRecord {
            id: session.id.clone(),
            instrument_id: session.instrument_id,
            profile: session.profile.clone(),
            started_at: session.started_at,
            ended_at: None,
            note: session.note.clone(),
            metadata: session.metadata.clone(),
        });
        Ok(())
    }

    async fn close_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> AppResult<()> {
        self.check_writable()?;
        let mut tables = self.tables.lock();
        if let Some(session) = tables
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.ended_at.is_none())
        {
            session.ended_at = Some(ended_at);
        }
        Ok(())
    }

    async fn open_session_for(&self, instrument_id: i64) -> AppResult<Option<SessionRecord>> {
        Ok(self
            .tables
            .lock()
            .sessions
            .iter()
            .rev()
            .find(|s| s.instrument_id == instrument_id && s.is_open())
            .cloned())
    }

    async fn session(&self, session_id: &str) -> AppResult<Option<SessionRecord>> {
        Ok(self
            .tables
            .lock()
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned())
    }

    async fn insert_measurement(&self, measurement: &StoredMeasurement) -> AppResult<bool> {
        self.check_writable()?;
        let mut tables = self.tables.lock();
        if !tables.sessions.iter().any(|s| s.id == measurement.session_id) {
            return Err(CaptureError::Store(format!(
                "unknown session {}",
                measurement.session_id
            )));
        }
        let key = (measurement.session_id.clone(), measurement.sequence);
        if tables.measurements.contains_key(&key) {
            return Ok(false);
        }
        tables.measurements.insert(key, measurement.clone());
        Ok(true)
    }

    async fn measurement_count(&self, session_id: &str) -> AppResult<u64> {
        Ok(self
            .tables
            .lock()
            .measurements
            .keys()
            .filter(|(s, _)| s == session_id)
            .count() as u64)
    }

    async fn measurements(&self, session_id: &str) -> AppResult<Vec<StoredMeasurement>> {
        Ok(self
            .tables
            .lock()
            .measurements
            .iter()
            .filter(|((s, _), _)| s == session_id)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> AppResult<()> {
        self.check_writable()?;
        self.tables.lock().audit.push(entry.clone());
        Ok(())
    }

    async fn audit_entries(&self) -> AppResult<Vec<AuditEntry>> {
        Ok(self.tables.lock().audit.clone())
    }
}
