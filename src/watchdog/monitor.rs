//! Link health counters and the single-fire watchdog.
//!
//! [`LinkHealth`] is written by the ingestion path (one atomic store per frame)
//! and read by the supervisor; neither side ever touches the other's state.
//! [`Watchdog`] turns the timestamp of the last decoded frame into at most one
//! `Timeout` per outage and one `Recovery` when measurements resume. Garbage
//! and command replies keep the byte counters moving but not the watchdog.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const UNSET: i64 = i64::MIN;

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == UNSET {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

#[derive(Debug)]
struct Counters {
    last_frame_ms: AtomicI64,
    streaming_since_ms: AtomicI64,
    frames: AtomicU64,
    decoded: AtomicU64,
    malformed: AtomicU64,
    store_failures: AtomicU64,
    buffer_failures: AtomicU64,
    commands_ok: AtomicU64,
    commands_failed: AtomicU64,
    degraded: AtomicBool,
}

/// Shared, lock-free link health counters.
#[derive(Debug, Clone)]
pub struct LinkHealth {
    inner: Arc<Counters>,
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self {
            inner: Arc::new(Counters {
                last_frame_ms: AtomicI64::new(UNSET),
                streaming_since_ms: AtomicI64::new(UNSET),
                frames: AtomicU64::new(0),
                decoded: AtomicU64::new(0),
                malformed: AtomicU64::new(0),
                store_failures: AtomicU64::new(0),
                buffer_failures: AtomicU64::new(0),
                commands_ok: AtomicU64::new(0),
                commands_failed: AtomicU64::new(0),
                degraded: AtomicBool::new(false),
            }),
        }
    }
}

/// Point-in-time copy of [`LinkHealth`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub last_frame_at: Option<DateTime<Utc>>,
    pub streaming_since: Option<DateTime<Utc>>,
    pub frames: u64,
    pub decoded: u64,
    pub malformed: u64,
    pub store_failures: u64,
    pub buffer_failures: u64,
    pub commands_ok: u64,
    pub commands_failed: u64,
    pub degraded: bool,
}

impl LinkHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// A complete frame arrived, decodable or not.
    pub fn record_frame(&self) {
        self.inner.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// A frame decoded into a measurement. Only these count as a live link.
    pub fn record_decoded(&self, at: DateTime<Utc>) {
        self.inner.decoded.fetch_add(1, Ordering::Relaxed);
        self.inner
            .last_frame_ms
            .fetch_max(to_millis(at), Ordering::Release);
    }

    pub fn record_malformed(&self) {
        self.inner.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.inner.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffer_failure(&self) {
        self.inner.buffer_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command(&self, ok: bool) {
        let counter = if ok {
            &self.inner.commands_ok
        } else {
            &self.inner.commands_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// The engine reached `Streaming`; the watchdog measures from here until
    /// the first frame.
    pub fn mark_streaming(&self, at: DateTime<Utc>) {
        let _ = self.inner.streaming_since_ms.compare_exchange(
            UNSET,
            to_millis(at),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.inner.degraded.store(degraded, Ordering::Release);
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire)
    }

    pub fn last_frame_at(&self) -> Option<DateTime<Utc>> {
        from_millis(self.inner.last_frame_ms.load(Ordering::Acquire))
    }

    pub fn store_failures(&self) -> u64 {
        self.inner.store_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let c = &self.inner;
        HealthSnapshot {
            last_frame_at: self.last_frame_at(),
            streaming_since: from_millis(c.streaming_since_ms.load(Ordering::Acquire)),
            frames: c.frames.load(Ordering::Relaxed),
            decoded: c.decoded.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            store_failures: c.store_failures.load(Ordering::Relaxed),
            buffer_failures: c.buffer_failures.load(Ordering::Relaxed),
            commands_ok: c.commands_ok.load(Ordering::Relaxed),
            commands_failed: c.commands_failed.load(Ordering::Relaxed),
            degraded: self.is_degraded(),
        }
    }
}

/// Kind of watchdog transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogEventKind {
    Timeout,
    Recovery,
}

/// Timestamped watchdog transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchdogEvent {
    pub kind: WatchdogEventKind,
    pub at: DateTime<Utc>,
    /// Time since the last frame (timeout) or length of the outage (recovery)
    pub elapsed_ms: u64,
}

/// Staleness detector. Raises `Timeout` once per outage.
#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    /// Last frame seen when the current timeout was raised
    outage_from: Option<DateTime<Utc>>,
    timed_out: bool,
    ring: VecDeque<WatchdogEvent>,
    capacity: usize,
}

impl Watchdog {
    pub fn new(timeout: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            timeout,
            outage_from: None,
            timed_out: false,
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Recent transitions, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &WatchdogEvent> {
        self.ring.iter()
    }

    /// Evaluate staleness at `now`.
    pub fn check(&mut self, now: DateTime<Utc>, health: &HealthSnapshot) -> Option<WatchdogEvent> {
        if self.timed_out {
            let resumed = match (health.last_frame_at, self.outage_from) {
                (Some(last), Some(from)) => last > from,
                (Some(_), None) => true,
                _ => false,
            };
            if !resumed {
                return None;
            }
            let last = health.last_frame_at.unwrap_or(now);
            let outage = self
                .outage_from
                .or(health.streaming_since)
                .map(|from| (last - from).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            self.timed_out = false;
            self.outage_from = None;
            return Some(self.push(WatchdogEventKind::Recovery, now, outage));
        }

        let reference = health.last_frame_at.or(health.streaming_since)?;
        let elapsed = (now - reference).to_std().unwrap_or(Duration::ZERO);
        if elapsed <= self.timeout {
            return None;
        }
        self.timed_out = true;
        self.outage_from = health.last_frame_at;
        Some(self.push(
            WatchdogEventKind::Timeout,
            now,
            elapsed.as_millis() as u64,
        ))
    }

    fn push(&mut self, kind: WatchdogEventKind, at: DateTime<Utc>, elapsed_ms: u64) -> WatchdogEvent {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        let event = WatchdogEvent {
            kind,
            at,
            elapsed_ms,
        };
        self.ring.push_back(event.clone());
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_no_reference_no_event() {
        let mut watchdog = Watchdog::new(Duration::from_secs(5), 8);
        let health = LinkHealth::new();
        assert!(watchdog.check(Utc::now(), &health.snapshot()).is_none());
    }

    #[test]
    fn test_timeout_fires_once_then_recovers() {
        let health = LinkHealth::new();
        let t0 = Utc::now();
        health.mark_streaming(t0);
        health.record_decoded(t0);

        let mut watchdog = Watchdog::new(Duration::from_secs(5), 8);
        let mut timeouts = 0;
        for second in 1..=20 {
            let now = t0 + ChronoDuration::seconds(second);
            if let Some(event) = watchdog.check(now, &health.snapshot()) {
                assert_eq!(event.kind, WatchdogEventKind::Timeout);
                timeouts += 1;
            }
        }
        assert_eq!(timeouts, 1);

        let resumed = t0 + ChronoDuration::seconds(21);
        health.record_decoded(resumed);
        let event = watchdog.check(resumed, &health.snapshot()).unwrap();
        assert_eq!(event.kind, WatchdogEventKind::Recovery);
        assert_eq!(event.elapsed_ms, 21_000);
        assert!(watchdog.check(resumed, &health.snapshot()).is_none());
        assert_eq!(watchdog.events().count(), 2);
    }

    #[test]
    fn test_measures_from_streaming_start_before_first_frame() {
        let health = LinkHealth::new();
        let t0 = Utc::now();
        health.mark_streaming(t0);
        let mut watchdog = Watchdog::new(Duration::from_secs(2), 8);
        assert!(watchdog
            .check(t0 + ChronoDuration::seconds(1), &health.snapshot())
            .is_none());
        let event = watchdog
            .check(t0 + ChronoDuration::seconds(3), &health.snapshot())
            .unwrap();
        assert_eq!(event.kind, WatchdogEventKind::Timeout);
    }

    #[test]
    fn test_ring_is_bounded() {
        let health = LinkHealth::new();
        let t0 = Utc::now();
        health.record_decoded(t0);
        let mut watchdog = Watchdog::new(Duration::from_millis(10), 3);
        for i in 1..=10 {
            let at = t0 + ChronoDuration::seconds(i);
            watchdog.check(at, &health.snapshot());
            health.record_decoded(at);
        }
        assert_eq!(watchdog.events().count(), 3);
    }

    #[test]
    fn test_counters() {
        let health = LinkHealth::new();
        let at = Utc::now();
        health.record_frame();
        health.record_frame();
        health.record_decoded(at);
        health.record_malformed();
        health.record_store_failure();
        health.record_command(true);
        health.record_command(false);
        health.set_degraded(true);
        let snap = health.snapshot();
        assert_eq!(
            (snap.decoded, snap.malformed, snap.store_failures),
            (1, 1, 1)
        );
        assert_eq!((snap.commands_ok, snap.commands_failed), (1, 1));
        assert!(snap.degraded);
        assert_eq!(snap.frames, 2);
        assert_eq!(snap.last_frame_at.map(|t| t.timestamp_millis()), Some(at.timestamp_millis()));
    }

    #[test]
    fn test_undecoded_frames_do_not_reset_the_watchdog() {
        let health = LinkHealth::new();
        let t0 = Utc::now();
        health.mark_streaming(t0);
        let mut watchdog = Watchdog::new(Duration::from_secs(2), 8);
        for second in 1..=5 {
            health.record_frame();
            health.record_malformed();
            watchdog.check(t0 + ChronoDuration::seconds(second), &health.snapshot());
        }
        assert!(watchdog.is_timed_out());
        assert_eq!(health.last_frame_at(), None);
    }
}
