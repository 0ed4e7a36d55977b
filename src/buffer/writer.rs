//! Append-only session log.
//!
//! One file per session, `<dir>/<session_id>.log`. Records go into an in-memory
//! write buffer and reach stable storage (`write` + `fdatasync`) every
//! `flush_every` measurements or after `flush_interval`, whichever comes first.
//! A crash therefore loses at most the records since the last completed flush.

use super::record::{
    BufferRecord, MeasurementRecord, MonotonicClock, SessionEndRecord, SessionStartRecord,
};
use crate::config::BufferConfig;
use crate::error::{AppResult, CaptureError};
use crate::ingest::Measurement;
use crate::transport::DeviceInfo;
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Extension of session buffer files.
pub const BUFFER_EXTENSION: &str = "log";

// Large enough that the write buffer never spills between two flush points.
const WRITE_BUFFER_CAPACITY: usize = 1 << 20;

/// Path of the buffer file for `session_id`.
pub fn buffer_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{session_id}.{BUFFER_EXTENSION}"))
}

/// When buffered records are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    /// Flush after this many measurement records
    pub flush_every: usize,
    /// Flush at least this often while records are pending
    pub flush_interval: Duration,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            flush_every: 100,
            flush_interval: Duration::from_secs(1),
        }
    }
}

impl BufferPolicy {
    pub fn from_config(config: &BufferConfig) -> Self {
        Self {
            flush_every: config.flush_every_records.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms),
        }
    }
}

fn write_failed(path: &Path, err: impl std::fmt::Display) -> CaptureError {
    CaptureError::BufferWriteFailed(format!("{}: {err}", path.display()))
}

/// Open session log owned by the ingestion write path.
#[derive(Debug)]
pub struct SessionBuffer {
    session_id: String,
    path: PathBuf,
    writer: BufWriter<File>,
    policy: BufferPolicy,
    clock: MonotonicClock,
    unflushed: usize,
    last_flush: Instant,
    flush_pending: bool,
    appended: u64,
}

impl SessionBuffer {
    /// Create the log and durably write its `session_start` record.
    pub fn open(
        dir: &Path,
        session_id: &str,
        instrument: &DeviceInfo,
        profile: &str,
        started_at: DateTime<Utc>,
        policy: BufferPolicy,
    ) -> AppResult<Self> {
        fs::create_dir_all(dir).map_err(|e| write_failed(dir, e))?;
        let path = buffer_path(dir, session_id);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| write_failed(&path, e))?;

        let mut buffer = Self {
            session_id: session_id.to_string(),
            path,
            writer: BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, file),
            policy,
            clock: MonotonicClock::default(),
            unflushed: 0,
            last_flush: Instant::now(),
            flush_pending: false,
            appended: 0,
        };

        let created_at = buffer.clock.now();
        buffer.write_record(&BufferRecord::SessionStart(SessionStartRecord {
            session_id: session_id.to_string(),
            created_at,
            started_at,
            instrument: instrument.clone(),
            profile: profile.to_string(),
            note: None,
        }))?;
        buffer.flush()?;
        debug!(session_id, path = %buffer.path.display(), "Session buffer opened");
        Ok(buffer)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Measurement records appended so far.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Records written since the last completed flush.
    pub fn unflushed(&self) -> usize {
        self.unflushed
    }

    /// Append one measurement, flushing when the record threshold is reached.
    ///
    /// A failed flush keeps the record in memory and marks the flush as pending
    /// for the next [`tick`](Self::tick); the error is still returned so the
    /// caller can report degraded durability.
    pub fn append(&mut self, sequence: u64, measurement: &Measurement) -> AppResult<()> {
        let created_at = self.clock.now();
        let record = BufferRecord::Measurement(MeasurementRecord::from_measurement(
            &self.session_id,
            sequence,
            measurement,
            created_at,
        ));
        self.write_record(&record)?;
        self.appended += 1;
        self.unflushed += 1;
        if self.unflushed >= self.policy.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush if the interval elapsed or a previous flush failed.
    ///
    /// Returns whether a flush ran.
    pub fn tick(&mut self) -> AppResult<bool> {
        let interval_due =
            self.unflushed > 0 && self.last_flush.elapsed() >= self.policy.flush_interval;
        if interval_due || self.flush_pending {
            self.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Push everything written so far to stable storage.
    pub fn flush(&mut self) -> AppResult<()> {
        let result = self
            .writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_data());
        match result {
            Ok(()) => {
                self.unflushed = 0;
                self.flush_pending = false;
                self.last_flush = Instant::now();
                Ok(())
            }
            Err(e) => {
                self.flush_pending = true;
                warn!(session_id = %self.session_id, error = %e, "Session buffer flush failed, retrying next tick");
                Err(write_failed(&self.path, e))
            }
        }
    }

    /// Write `session_end`, flush, and close the file.
    pub fn close(mut self, ended_at: DateTime<Utc>, reason: &str) -> AppResult<PathBuf> {
        let created_at = self.clock.now();
        let ended_at = ended_at.max(created_at);
        self.write_record(&BufferRecord::SessionEnd(SessionEndRecord {
            session_id: self.session_id.clone(),
            created_at,
            ended_at,
            reason: reason.to_string(),
        }))?;
        self.flush()?;
        debug!(session_id = %self.session_id, reason, records = self.appended, "Session buffer closed");
        Ok(self.path)
    }

    fn write_record(&mut self, record: &BufferRecord) -> AppResult<()> {
        let line = record.to_line()?;
        self.writer
            .write_all(line.as_bytes())
            .map_err(|e| write_failed(&self.path, e))
    }
}
