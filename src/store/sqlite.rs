//! SQLite-backed store.
//!
//! rusqlite connections are blocking, so a single worker thread owns the
//! connection and callers send it closures over a channel, awaiting the answer
//! on a oneshot. WAL journaling, foreign keys on, schema versioned through
//! `PRAGMA user_version`.

use super::{
    AuditEntry, AuditSeverity, MeasurementStore, NewSession, SessionRecord, StoredMeasurement,
};
use crate::error::{AppResult, CaptureError};
use crate::ingest::{DecodeStatus, Value};
use crate::transport::DeviceInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{error, info};

const CURRENT_SCHEMA_VERSION: i32 = 1;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct WorkerInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to store thread: {err}");
            }
            if let Err(err) = handle.join() {
                error!("Failed to join store thread: {err:?}");
            }
        }
    }
}

/// [`MeasurementStore`] on a SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<WorkerInner>,
    path: Arc<PathBuf>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

impl SqliteStore {
    /// Open (or create) the database and run migrations.
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<AppResult<()>>();
        let path_for_thread = path.clone();

        let worker = thread::Builder::new()
            .name("capture-store".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.into()));
                        return;
                    }
                };
                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }
                if ready_tx.send(run_migrations(&mut conn)).is_err() {
                    return;
                }
                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => task(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }
                info!("Store thread shutting down");
            })?;

        ready_rx
            .recv()
            .map_err(|_| CaptureError::Store("store thread exited before ready".to_string()))??;

        info!(path = %path.display(), "Relational store opened");
        Ok(Self {
            inner: Arc::new(WorkerInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> AppResult<T>
    where
        F: FnOnce(&mut Connection) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = DbCommand::Execute(Box::new(move |conn| {
            let _ = reply_tx.send(task(conn));
        }));
        self.inner
            .sender
            .send(command)
            .map_err(|_| CaptureError::Store("store thread is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| CaptureError::Store("store thread terminated unexpectedly".to_string()))?
    }
}

fn run_migrations(conn: &mut Connection) -> AppResult<()> {
    let mut version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version > CURRENT_SCHEMA_VERSION {
        return Err(CaptureError::Store(format!(
            "database schema {version} is newer than supported {CURRENT_SCHEMA_VERSION}"
        )));
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }
    let tx = conn.transaction()?;
    while version < CURRENT_SCHEMA_VERSION {
        version += 1;
        apply_migration(&tx, version)?;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> AppResult<()> {
    match version {
        1 => Ok(tx.execute_batch(include_str!("schemas/schema_v1.sql"))?),
        _ => Err(CaptureError::Store(format!(
            "unknown migration target version {version}"
        ))),
    }
}

fn to_i64(value: u64) -> AppResult<i64> {
    i64::try_from(value)
        .map_err(|_| CaptureError::Store(format!("{value} exceeds SQLite INTEGER range")))
}

fn parse_datetime(value: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| CaptureError::Store(format!("invalid datetime '{value}': {err}")))
}

fn parse_json(value: &str) -> serde_json::Value {
    serde_json::from_str(value).unwrap_or(serde_json::Value::Null)
}

fn row_to_session(row: &Row<'_>) -> AppResult<SessionRecord> {
    let started_at: String = row.get("started_at")?;
    let ended_at: Option<String> = row.get("ended_at")?;
    let metadata: String = row.get("metadata")?;
    Ok(SessionRecord {
        id: row.get("id")?,
        instrument_id: row.get("instrument_id")?,
        profile: row.get("profile")?,
        started_at: parse_datetime(&started_at)?,
        ended_at: ended_at.as_deref().map(parse_datetime).transpose()?,
        note: row.get("note")?,
        metadata: parse_json(&metadata),
    })
}

const SESSION_COLUMNS: &str =
    "id, instrument_id, profile, started_at, ended_at, note, metadata";

#[async_trait]
impl MeasurementStore for SqliteStore {
    async fn upsert_instrument(&self, device: &DeviceInfo) -> AppResult<i64> {
        let key = device.instrument_key();
        let model = device.model.clone();
        let description = device.description.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO instruments (serial_number, model, description, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, model, description, Utc::now().to_rfc3339()],
            )?;
            let id = conn.query_row(
                "SELECT id FROM instruments WHERE serial_number = ?1",
                params![key],
                |row| row.get(0),
            )?;
            Ok(id)
        })
        .await
    }

    async fn create_session(&self, session: &NewSession) -> AppResult<()> {
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO sessions (id, instrument_id, profile, started_at, ended_at, note, metadata)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6)",
                params![
                    record.id,
                    record.instrument_id,
                    record.profile,
                    record.started_at.to_rfc3339(),
                    record.note,
                    record.metadata.to_string(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn close_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> AppResult<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
                params![ended_at.to_rfc3339(), session_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn open_session_for(&self, instrument_id: i64) -> AppResult<Option<SessionRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE instrument_id = ?1 AND ended_at IS NULL
                 ORDER BY started_at DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query(params![instrument_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn session(&self, session_id: &str) -> AppResult<Option<SessionRecord>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query(params![session_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn insert_measurement(&self, measurement: &StoredMeasurement) -> AppResult<bool> {
        let m = measurement.clone();
        self.execute(move |conn| {
            let sequence = to_i64(m.sequence)?;
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO raw_frames (session_id, sequence, received_at, payload)
                 VALUES (?1, ?2, ?3, ?4)",
                params![m.session_id, sequence, m.received_at.to_rfc3339(), m.raw],
            )?;
            if inserted == 0 {
                return Ok(false);
            }
            let frame_id = tx.last_insert_rowid();
            let (value_num, value_text) = match &m.value {
                Value::Numeric(v) => (Some(*v), None),
                Value::Text(t) => (None, Some(t.clone())),
            };
            tx.execute(
                "INSERT INTO measurements
                 (session_id, frame_id, value_num, value_text, unit, temperature, compensated, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    m.session_id,
                    frame_id,
                    value_num,
                    value_text,
                    m.unit,
                    m.temperature,
                    m.compensated,
                    m.status.as_str(),
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn measurement_count(&self, session_id: &str) -> AppResult<u64> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM measurements WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn measurements(&self, session_id: &str) -> AppResult<Vec<StoredMeasurement>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT f.sequence, f.received_at, f.payload, m.value_num, m.value_text,
                        m.unit, m.temperature, m.compensated, m.status
                 FROM measurements m JOIN raw_frames f ON f.id = m.frame_id
                 WHERE m.session_id = ?1
                 ORDER BY f.sequence",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let sequence: i64 = row.get(0)?;
                let received_at: String = row.get(1)?;
                let value_num: Option<f64> = row.get(3)?;
                let value_text: Option<String> = row.get(4)?;
                let status: String = row.get(8)?;
                out.push(StoredMeasurement {
                    session_id: session_id.clone(),
                    sequence: sequence.max(0) as u64,
                    received_at: parse_datetime(&received_at)?,
                    raw: row.get(2)?,
                    value: match (value_num, value_text) {
                        (Some(v), _) => Value::Numeric(v),
                        (None, Some(t)) => Value::Text(t),
                        (None, None) => {
                            return Err(CaptureError::Store(format!(
                                "measurement {sequence} has no value"
                            )))
                        }
                    },
                    unit: row.get(5)?,
                    temperature: row.get(6)?,
                    compensated: row.get(7)?,
                    status: if status == "text" {
                        DecodeStatus::Text
                    } else {
                        DecodeStatus::Ok
                    },
                });
            }
            Ok(out)
        })
        .await
    }

    async fn append_audit(&self, entry: &AuditEntry) -> AppResult<()> {
        let entry = entry.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO audit_events (at, severity, kind, session_id, message, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.at.to_rfc3339(),
                    entry.severity.as_str(),
                    entry.kind,
                    entry.session_id,
                    entry.message,
                    entry.details.to_string(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn audit_entries(&self) -> AppResult<Vec<AuditEntry>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT at, severity, kind, session_id, message, details
                 FROM audit_events ORDER BY id",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let at: String = row.get(0)?;
                let severity: String = row.get(1)?;
                let details: String = row.get(5)?;
                out.push(AuditEntry {
                    at: parse_datetime(&at)?,
                    severity: AuditSeverity::parse(&severity).ok_or_else(|| {
                        CaptureError::Store(format!("unknown audit severity '{severity}'"))
                    })?,
                    kind: row.get(2)?,
                    session_id: row.get(3)?,
                    message: row.get(4)?,
                    details: parse_json(&details),
                });
            }
            Ok(out)
        })
        .await
    }
}

/// Count rows that would violate the one-frame-per-measurement rule.
///
/// Used by the `recover` command as a post-replay integrity check.
pub async fn orphaned_measurements(store: &SqliteStore) -> AppResult<u64> {
    store
        .execute(|conn| {
            let count: Option<i64> = conn
                .query_row(
                    "SELECT COUNT(*) FROM measurements m
                     LEFT JOIN raw_frames f ON f.id = m.frame_id
                     WHERE f.id IS NULL",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0).max(0) as u64)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn device() -> DeviceInfo {
        DeviceInfo {
            port: "/dev/ttyUSB0".into(),
            serial_number: Some("FT1234".into()),
            model: Some("EC-215".into()),
            description: None,
        }
    }

    fn measurement(session: &str, sequence: u64) -> StoredMeasurement {
        StoredMeasurement {
            session_id: session.into(),
            sequence,
            received_at: Utc::now(),
            raw: b"+1.0\r\n".to_vec(),
            value: Value::Numeric(1.0),
            unit: "mS/cm".into(),
            temperature: Some(24.5),
            compensated: None,
            status: DecodeStatus::Ok,
        }
    }

    async fn store_with_session(dir: &TempDir) -> (SqliteStore, String) {
        let store = SqliteStore::open(dir.path().join("capture.db")).unwrap();
        let instrument_id = store.upsert_instrument(&device()).await.unwrap();
        let session = NewSession {
            id: "s-1".into(),
            instrument_id,
            profile: "ec".into(),
            started_at: Utc::now(),
            note: None,
            metadata: serde_json::json!({ "port": "/dev/ttyUSB0" }),
        };
        store.create_session(&session).await.unwrap();
        (store, session.id)
    }

    #[tokio::test]
    async fn test_instrument_upsert_is_stable() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("capture.db")).unwrap();
        let a = store.upsert_instrument(&device()).await.unwrap();
        let b = store.upsert_instrument(&device()).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (store, session) = store_with_session(&dir).await;
        assert!(store.insert_measurement(&measurement(&session, 1)).await.unwrap());
        assert!(!store.insert_measurement(&measurement(&session, 1)).await.unwrap());
        assert!(store.insert_measurement(&measurement(&session, 2)).await.unwrap());
        assert_eq!(store.measurement_count(&session).await.unwrap(), 2);
        assert_eq!(orphaned_measurements(&store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_session_lifecycle() {
        let dir = TempDir::new().unwrap();
        let (store, session) = store_with_session(&dir).await;
        let instrument_id = store.upsert_instrument(&device()).await.unwrap();
        let open = store.open_session_for(instrument_id).await.unwrap().unwrap();
        assert_eq!(open.id, session);
        assert_eq!(open.metadata["port"], "/dev/ttyUSB0");

        store.close_session(&session, Utc::now()).await.unwrap();
        assert!(store.open_session_for(instrument_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_measurement_without_session_rejected() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("capture.db")).unwrap();
        assert!(store.insert_measurement(&measurement("nope", 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_audit_round_trip_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("capture.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .append_audit(
                    &AuditEntry::new(AuditSeverity::Fatal, "command_exhausted", "calibrate gave up")
                        .with_details(serde_json::json!({ "attempts": 3 })),
                )
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let entries = store.audit_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, AuditSeverity::Fatal);
        assert_eq!(entries[0].details["attempts"], 3);
    }
}
