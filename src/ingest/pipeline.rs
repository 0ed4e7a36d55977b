//! Ingestion pipeline: bytes in, ordered and persisted measurements out.
//!
//! For every complete frame the pipeline decodes with the active profile and,
//! on success, writes the measurement to the session buffer first and the
//! relational store second. A store failure is logged and counted; the buffer
//! stays on disk so the next start replays it. A buffer failure degrades
//! durability but never stops capture.
//!
//! Consecutive `Malformed` results are counted; reaching the threshold yields a
//! [`FallbackRequest`] for the engine and resets the counter.

use super::decode::{FrameDecoder, MalformedReason};
use super::framing::{Assembled, FrameAssembler};
use super::{DecodeResult, Measurement, RawFrame};
use crate::buffer::{BufferPolicy, SessionBuffer};
use crate::error::{AppResult, CaptureError};
use crate::events::{CoreEvent, EventPublisher};
use crate::profile::Profile;
use crate::store::{MeasurementStore, NewSession, StoredMeasurement};
use crate::transport::DeviceInfo;
use crate::watchdog::LinkHealth;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on measurements held while no session is open.
const MAX_HELD: usize = 1024;

/// Ingestion tuning taken from the engine and buffer config.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Consecutive malformed frames that trigger a fallback request
    pub failure_threshold: u32,
    pub max_frame_len: usize,
    pub buffer_dir: PathBuf,
    pub buffer_policy: BufferPolicy,
}

/// Signal to the engine that the active profile does not fit the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRequest {
    pub from: String,
    pub consecutive_failures: u32,
}

/// Everything one `ingest` call produced.
#[derive(Debug, Default)]
pub struct IngestBatch {
    pub results: Vec<DecodeResult>,
    /// Frames taken by the claim callback instead of being decoded
    pub claimed: Vec<Bytes>,
    pub fallback: Option<FallbackRequest>,
}

impl IngestBatch {
    pub fn decoded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, DecodeResult::Ok(_)))
            .count()
    }
}

#[derive(Debug)]
struct ActiveSession {
    id: String,
    next_sequence: u64,
    /// Every store write for this session succeeded
    store_ok: bool,
}

/// Decode, order, and persist frames for the active profile.
pub struct IngestionPipeline {
    profile: Profile,
    assembler: FrameAssembler,
    decoder: FrameDecoder,
    settings: PipelineSettings,
    consecutive_malformed: u32,
    session: Option<ActiveSession>,
    buffer: Option<SessionBuffer>,
    held: Vec<Measurement>,
    store: Arc<dyn MeasurementStore>,
    publisher: EventPublisher,
    health: LinkHealth,
}

impl IngestionPipeline {
    pub fn new(
        profile: &Profile,
        settings: PipelineSettings,
        store: Arc<dyn MeasurementStore>,
        publisher: EventPublisher,
        health: LinkHealth,
    ) -> Self {
        Self {
            profile: profile.clone(),
            assembler: FrameAssembler::for_grammar(&profile.frame, settings.max_frame_len),
            decoder: FrameDecoder::for_profile(profile),
            settings,
            consecutive_malformed: 0,
            session: None,
            buffer: None,
            held: Vec::new(),
            store,
            publisher,
            health,
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    /// Measurements persisted in the open session.
    pub fn session_measurements(&self) -> u64 {
        self.session
            .as_ref()
            .map_or(0, |s| s.next_sequence.saturating_sub(1))
    }

    pub fn consecutive_malformed(&self) -> u32 {
        self.consecutive_malformed
    }

    /// Path of the open buffer file, if buffering is healthy.
    pub fn buffer_path(&self) -> Option<PathBuf> {
        self.buffer.as_ref().map(|b| b.path().to_path_buf())
    }

    /// Feed raw bytes; decode and persist every complete frame.
    pub async fn ingest(&mut self, data: &[u8], received_at: DateTime<Utc>) -> IngestBatch {
        self.ingest_claiming(data, received_at, |_| false).await
    }

    /// Like [`ingest`](Self::ingest), but frames for which `claim` returns true
    /// are handed back undecoded (command responses).
    pub async fn ingest_claiming<F>(
        &mut self,
        data: &[u8],
        received_at: DateTime<Utc>,
        mut claim: F,
    ) -> IngestBatch
    where
        F: FnMut(&[u8]) -> bool + Send,
    {
        let mut batch = IngestBatch::default();
        for assembled in self.assembler.push(data) {
            match assembled {
                Assembled::Frame(bytes) => {
                    self.health.record_frame();
                    if claim(&bytes) {
                        batch.claimed.push(bytes);
                        continue;
                    }
                    match self.decoder.decode(RawFrame::new(bytes, received_at)) {
                        DecodeResult::Ok(measurement) => {
                            self.consecutive_malformed = 0;
                            self.health.record_decoded(received_at);
                            self.accept(&measurement).await;
                            batch.results.push(DecodeResult::Ok(measurement));
                        }
                        DecodeResult::Malformed(reason) => self.reject(reason, &mut batch),
                        DecodeResult::Incomplete => batch.results.push(DecodeResult::Incomplete),
                    }
                }
                Assembled::Rejected(reason) => self.reject(reason, &mut batch),
            }
        }
        if batch.results.is_empty() && batch.claimed.is_empty() && self.assembler.buffered() > 0 {
            batch.results.push(DecodeResult::Incomplete);
        }
        batch
    }

    fn reject(&mut self, reason: MalformedReason, batch: &mut IngestBatch) {
        self.health.record_malformed();
        self.consecutive_malformed += 1;
        debug!(
            profile = %self.profile.name,
            consecutive = self.consecutive_malformed,
            %reason,
            "Malformed frame"
        );
        if self.consecutive_malformed >= self.settings.failure_threshold {
            batch.fallback = Some(FallbackRequest {
                from: self.profile.name.clone(),
                consecutive_failures: self.consecutive_malformed,
            });
            self.consecutive_malformed = 0;
        }
        batch.results.push(DecodeResult::Malformed(reason));
    }

    async fn accept(&mut self, measurement: &Measurement) {
        if self.session.is_some() {
            self.persist(measurement).await;
        } else if self.held.len() < MAX_HELD {
            self.held.push(measurement.clone());
        } else {
            warn!("No open session, dropping measurement");
        }
    }

    async fn persist(&mut self, measurement: &Measurement) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let sequence = session.next_sequence;
        session.next_sequence += 1;
        let session_id = session.id.clone();

        if let Some(buffer) = self.buffer.as_mut() {
            if let Err(e) = buffer.append(sequence, measurement) {
                warn!(session_id = %session_id, sequence, error = %e, "Buffer append degraded");
                self.health.record_buffer_failure();
            }
        }

        let row = StoredMeasurement {
            session_id: session_id.clone(),
            sequence,
            received_at: measurement.frame.received_at,
            raw: measurement.frame.bytes.to_vec(),
            value: measurement.value.clone(),
            unit: measurement.unit.clone(),
            temperature: measurement.temperature,
            compensated: measurement.compensated,
            status: measurement.status,
        };
        if let Err(e) = self.store.insert_measurement(&row).await {
            warn!(session_id = %session_id, sequence, error = %e, "Store insert failed, buffer keeps the record");
            self.health.record_store_failure();
            if let Some(session) = self.session.as_mut() {
                session.store_ok = false;
            }
        }
    }

    /// Open a session for `device`, or return the one already open.
    ///
    /// Measurements decoded before the session existed are persisted first.
    pub async fn begin_session(&mut self, device: &DeviceInfo) -> String {
        if let Some(session) = &self.session {
            return session.id.clone();
        }
        let id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let store_ok = match self.register_session(&id, device, started_at).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Could not register session in store");
                self.health.record_store_failure();
                false
            }
        };

        self.buffer = match SessionBuffer::open(
            &self.settings.buffer_dir,
            &id,
            device,
            &self.profile.name,
            started_at,
            self.settings.buffer_policy,
        ) {
            Ok(buffer) => Some(buffer),
            Err(e) => {
                warn!(session_id = %id, error = %e, "Session buffer unavailable, capturing without durability");
                self.health.record_buffer_failure();
                self.publisher
                    .publish(CoreEvent::BufferDegraded {
                        session_id: id.clone(),
                        error: e.to_string(),
                    })
                    .await;
                None
            }
        };

        self.session = Some(ActiveSession {
            id: id.clone(),
            next_sequence: 1,
            store_ok,
        });
        info!(session_id = %id, profile = %self.profile.name, instrument = %device.instrument_key(), "Session opened");
        self.publisher
            .publish(CoreEvent::SessionOpened {
                session_id: id.clone(),
                instrument: device.instrument_key(),
                profile: self.profile.name.clone(),
            })
            .await;

        for measurement in std::mem::take(&mut self.held) {
            self.persist(&measurement).await;
        }
        id
    }

    async fn register_session(
        &self,
        id: &str,
        device: &DeviceInfo,
        started_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let instrument_id = self.store.upsert_instrument(device).await?;
        if let Some(stale) = self.store.open_session_for(instrument_id).await? {
            warn!(session_id = %stale.id, "Closing session left open by an earlier run");
            self.store.close_session(&stale.id, started_at).await?;
        }
        self.store
            .create_session(&NewSession {
                id: id.to_string(),
                instrument_id,
                profile: self.profile.name.clone(),
                started_at,
                note: None,
                metadata: serde_json::to_value(device)?,
            })
            .await
    }

    /// Close the open session: `session_end` to the buffer, end time to the store.
    ///
    /// The buffer file is removed only if every store write of the session
    /// succeeded; otherwise it stays for recovery.
    pub async fn end_session(&mut self, reason: &str) -> Option<String> {
        let session = self.session.take()?;
        self.held.clear();
        let ended_at = Utc::now();
        let measurements = session.next_sequence.saturating_sub(1);

        let buffer_file = match self.buffer.take().map(|b| b.close(ended_at, reason)) {
            Some(Ok(path)) => Some(path),
            Some(Err(e)) => {
                warn!(session_id = %session.id, error = %e, "Failed to close session buffer");
                self.health.record_buffer_failure();
                None
            }
            None => None,
        };

        let mut store_ok = session.store_ok;
        if let Err(e) = self.store.close_session(&session.id, ended_at).await {
            warn!(session_id = %session.id, error = %e, "Failed to close session in store");
            self.health.record_store_failure();
            store_ok = false;
        }

        if let Some(path) = buffer_file {
            if store_ok {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove replayed buffer");
                }
            } else {
                info!(path = %path.display(), "Keeping session buffer for recovery");
            }
        }

        info!(session_id = %session.id, reason, measurements, "Session closed");
        self.publisher
            .publish(CoreEvent::SessionClosed {
                session_id: session.id.clone(),
                reason: reason.to_string(),
                measurements,
            })
            .await;
        Some(session.id)
    }

    /// Use another profile's grammar from now on. Any open session must be
    /// ended first.
    pub fn switch_profile(&mut self, profile: &Profile) {
        self.assembler = FrameAssembler::for_grammar(&profile.frame, self.settings.max_frame_len);
        self.decoder = FrameDecoder::for_profile(profile);
        self.profile = profile.clone();
        self.consecutive_malformed = 0;
        self.held.clear();
    }

    /// Drop partial frame bytes after the link was lost.
    ///
    /// Returns `DecodeIncomplete` when a partial frame was discarded.
    pub fn reset_framing(&mut self) -> AppResult<()> {
        let buffered = self.assembler.buffered();
        self.assembler.reset();
        if buffered > 0 {
            return Err(CaptureError::DecodeIncomplete { buffered });
        }
        Ok(())
    }

    /// Periodic flush of the session buffer.
    pub fn tick(&mut self) {
        if let Some(buffer) = self.buffer.as_mut() {
            if buffer.tick().is_err() {
                self.health.record_buffer_failure();
            }
        }
    }
}
