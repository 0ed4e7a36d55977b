//! Startup replay of session buffers left behind by an earlier run.
//!
//! Runs once, to completion, before any new session opens. For each `*.log`
//! file in the buffer directory:
//!
//! 1. Read well-formed lines up to the first torn or corrupt one and count
//!    what follows as lost. The file itself is left untouched.
//! 2. Recreate the instrument and session rows (no-ops if they exist).
//! 3. Insert every measurement in file order. Inserts are idempotent on
//!    `(session_id, sequence)`, so a recovery interrupted half way is simply
//!    run again.
//! 4. Close the session, publish a recovery summary (audited), delete the file.
//!
//! A file whose replay hits a store error is kept for the next start; the
//! remaining files are still processed.

use super::record::{BufferRecord, SessionStartRecord};
use super::writer::BUFFER_EXTENSION;
use crate::error::{AppResult, CaptureError};
use crate::events::{CoreEvent, EventPublisher};
use crate::store::{MeasurementStore, NewSession};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What happened to one buffer file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Replayed and deleted
    Replayed,
    /// Held no usable record; deleted
    Empty,
    /// Left in place for the next start
    Kept { reason: String },
}

/// Per-file recovery result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredFile {
    pub path: PathBuf,
    pub session_id: Option<String>,
    /// Measurements inserted by this pass
    pub replayed: u64,
    /// Measurements that were already in the store
    pub duplicates: u64,
    /// Lines discarded as torn or corrupt
    pub lost: u64,
    /// Whether the file ended with `session_end`
    pub closed_cleanly: bool,
    pub outcome: RecoveryOutcome,
}

/// Summary of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub files: Vec<RecoveredFile>,
}

impl RecoveryReport {
    pub fn replayed(&self) -> u64 {
        self.files.iter().map(|f| f.replayed).sum()
    }

    pub fn duplicates(&self) -> u64 {
        self.files.iter().map(|f| f.duplicates).sum()
    }

    pub fn lost(&self) -> u64 {
        self.files.iter().map(|f| f.lost).sum()
    }

    /// Files left in place for the next start.
    pub fn kept(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, RecoveryOutcome::Kept { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Well-formed prefix of a buffer file.
#[derive(Debug)]
struct ScannedFile {
    records: Vec<BufferRecord>,
    /// Byte length of the well-formed prefix
    good_len: u64,
    /// Non-blank lines after the well-formed prefix
    lost: u64,
}

fn scan(bytes: &[u8]) -> ScannedFile {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let rest = &bytes[offset..];
        let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
            break;
        };
        let line = &rest[..newline];
        let parsed = std::str::from_utf8(line)
            .ok()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(BufferRecord::parse_line);
        match parsed {
            // Blank line
            None if line.iter().all(u8::is_ascii_whitespace) => {}
            Some(Ok(record)) => records.push(record),
            _ => break,
        }
        offset += newline + 1;
    }

    let lost = bytes[offset..]
        .split(|b| *b == b'\n')
        .filter(|l| !l.iter().all(u8::is_ascii_whitespace))
        .count() as u64;

    ScannedFile {
        records,
        good_len: offset as u64,
        lost,
    }
}

/// Buffer files in `dir`, oldest name first.
pub fn pending_buffers(dir: &Path) -> AppResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == BUFFER_EXTENSION))
        .collect();
    files.sort();
    Ok(files)
}

/// Replay every buffer file in `dir` into `store`.
pub async fn recover(
    dir: &Path,
    store: &dyn MeasurementStore,
    publisher: &EventPublisher,
) -> AppResult<RecoveryReport> {
    let mut report = RecoveryReport::default();
    for path in pending_buffers(dir)? {
        let file = recover_file(&path, store, publisher).await;
        match &file.outcome {
            RecoveryOutcome::Kept { reason } => {
                warn!(path = %path.display(), reason, "Buffer file kept for next recovery")
            }
            _ => info!(
                path = %path.display(),
                session_id = file.session_id.as_deref().unwrap_or("-"),
                replayed = file.replayed,
                duplicates = file.duplicates,
                lost = file.lost,
                "Buffer file recovered"
            ),
        }
        report.files.push(file);
    }
    if !report.is_empty() {
        info!(
            files = report.files.len(),
            replayed = report.replayed(),
            lost = report.lost(),
            kept = report.kept(),
            "Recovery pass complete"
        );
    }
    Ok(report)
}

async fn recover_file(
    path: &Path,
    store: &dyn MeasurementStore,
    publisher: &EventPublisher,
) -> RecoveredFile {
    let mut file = RecoveredFile {
        path: path.to_path_buf(),
        session_id: None,
        replayed: 0,
        duplicates: 0,
        lost: 0,
        closed_cleanly: false,
        outcome: RecoveryOutcome::Replayed,
    };

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            file.outcome = RecoveryOutcome::Kept {
                reason: format!("unreadable: {e}"),
            };
            return file;
        }
    };

    // The torn tail stays on disk until the file is deleted, so a kept file
    // reports the same loss again on the next pass.
    let scanned = scan(&bytes);
    file.lost = scanned.lost;

    let start = match scanned.records.first() {
        Some(BufferRecord::SessionStart(start)) => start.clone(),
        None => {
            file.outcome = match fs::remove_file(path) {
                Ok(()) => RecoveryOutcome::Empty,
                Err(e) => RecoveryOutcome::Kept {
                    reason: format!("empty but not removable: {e}"),
                },
            };
            return file;
        }
        Some(_) => {
            file.outcome = RecoveryOutcome::Kept {
                reason: "first record is not session_start".to_string(),
            };
            return file;
        }
    };
    file.session_id = Some(start.session_id.clone());

    if let Err(e) = replay(&start, &scanned.records, store, &mut file).await {
        file.outcome = RecoveryOutcome::Kept {
            reason: e.to_string(),
        };
        return file;
    }

    if file.lost > 0 {
        let partial = CaptureError::BufferRecoveryPartial {
            recovered: (file.replayed + file.duplicates) as usize,
            lost: file.lost as usize,
            reason: "torn or corrupt trailing record".to_string(),
        };
        warn!(session_id = %start.session_id, error = %partial, "Buffer recovered partially");
    }

    publisher
        .publish(CoreEvent::RecoverySummary {
            session_id: start.session_id.clone(),
            file: path.display().to_string(),
            replayed: file.replayed,
            duplicates: file.duplicates,
            lost: file.lost,
        })
        .await;

    if let Err(e) = fs::remove_file(path) {
        file.outcome = RecoveryOutcome::Kept {
            reason: format!("replayed but not removable: {e}"),
        };
    }
    file
}

async fn replay(
    start: &SessionStartRecord,
    records: &[BufferRecord],
    store: &dyn MeasurementStore,
    file: &mut RecoveredFile,
) -> AppResult<()> {
    let instrument_id = store.upsert_instrument(&start.instrument).await?;
    store
        .create_session(&NewSession {
            id: start.session_id.clone(),
            instrument_id,
            profile: start.profile.clone(),
            started_at: start.started_at,
            note: start.note.clone(),
            metadata: serde_json::to_value(&start.instrument)?,
        })
        .await?;

    let mut last_seen: DateTime<Utc> = start.created_at;
    let mut ended_at = None;
    for record in &records[1..] {
        last_seen = last_seen.max(record.created_at());
        if record.session_id() != start.session_id {
            file.lost += 1;
            continue;
        }
        match record {
            BufferRecord::Measurement(m) => match m.to_stored() {
                Ok(stored) => {
                    if store.insert_measurement(&stored).await? {
                        file.replayed += 1;
                    } else {
                        file.duplicates += 1;
                    }
                }
                Err(e) => {
                    warn!(sequence = m.sequence, error = %e, "Skipping undecodable buffer record");
                    file.lost += 1;
                }
            },
            BufferRecord::SessionEnd(end) => {
                file.closed_cleanly = true;
                ended_at = Some(end.ended_at);
            }
            BufferRecord::SessionStart(_) => file.lost += 1,
        }
    }

    store
        .close_session(&start.session_id, ended_at.unwrap_or(last_seen))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(json: &str) -> String {
        format!("{json}\n")
    }

    const START: &str = r#"{"type":"session_start","session_id":"s1","created_at":"2025-01-01T00:00:00Z","started_at":"2025-01-01T00:00:00Z","instrument":{"port":"/dev/ttyUSB0","serial_number":"FT1","model":null,"description":null},"profile":"ph"}"#;
    const MEAS: &str = r#"{"type":"measurement","session_id":"s1","created_at":"2025-01-01T00:00:01Z","sequence":1,"received_at":"2025-01-01T00:00:01Z","raw_hex":"0a","value":1.0,"unit":"pH","status":"ok"}"#;

    #[test]
    fn test_scan_accepts_well_formed_file() {
        let content = line(START) + &line(MEAS);
        let scanned = scan(content.as_bytes());
        assert_eq!(scanned.records.len(), 2);
        assert_eq!(scanned.good_len, content.len() as u64);
        assert_eq!(scanned.lost, 0);
    }

    #[test]
    fn test_scan_discards_torn_last_line() {
        let good = line(START) + &line(MEAS);
        let content = good.clone() + &MEAS[..40];
        let scanned = scan(content.as_bytes());
        assert_eq!(scanned.records.len(), 2);
        assert_eq!(scanned.good_len, good.len() as u64);
        assert_eq!(scanned.lost, 1);
    }

    #[test]
    fn test_scan_stops_at_corrupt_line() {
        let good = line(START);
        let content = good.clone() + "{not json}\n" + &line(MEAS);
        let scanned = scan(content.as_bytes());
        assert_eq!(scanned.records.len(), 1);
        assert_eq!(scanned.good_len, good.len() as u64);
        assert_eq!(scanned.lost, 2);
    }

    #[test]
    fn test_scan_complete_line_without_newline_is_torn() {
        let content = line(START) + MEAS;
        let scanned = scan(content.as_bytes());
        assert_eq!(scanned.records.len(), 1);
        assert_eq!(scanned.lost, 1);
    }
}
