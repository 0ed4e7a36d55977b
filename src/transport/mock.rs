//! Scripted transport for tests.
//!
//! [`MockTransport`] is handed to the code under test; the paired
//! [`MockDeviceHarness`] stays in the test and plays the instrument:
//!
//! - `send()` pushes bytes the transport will read
//! - `expect_write()` / `next_write()` observe what the engine wrote
//! - `reply_to()` installs an automatic reply for a written payload
//! - `fail_next_open()` / `disconnect()` inject link faults
//!
//! ```rust,ignore
//! let (transport, mut harness) = mock::pair();
//! harness.reply_to(b"D?\r\n", b"+1.25,mS/cm\r\n");
//! harness.fail_next_open(CaptureError::TransportBusy("held".into()));
//! ```

use super::{not_open, DeviceInfo, Transport};
use crate::error::{AppResult, CaptureError};
use crate::profile::SerialSettings;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Default)]
struct Shared {
    open_failures: VecDeque<CaptureError>,
    replies: Vec<(Vec<u8>, Vec<u8>)>,
    faulted: bool,
    open_count: u32,
    settings_seen: Vec<SerialSettings>,
}

/// Transport side of the mock link.
#[derive(Debug)]
pub struct MockTransport {
    shared: Arc<Mutex<Shared>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    writes_tx: UnboundedSender<Vec<u8>>,
    pending: VecDeque<u8>,
    info: DeviceInfo,
    open: bool,
}

/// Test side of the mock link.
#[derive(Debug)]
pub struct MockDeviceHarness {
    shared: Arc<Mutex<Shared>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    writes_rx: UnboundedReceiver<Vec<u8>>,
    write_buffer: Vec<u8>,
}

/// Create a connected transport/harness pair.
pub fn pair() -> (MockTransport, MockDeviceHarness) {
    pair_with_info(DeviceInfo {
        port: "mock0".to_string(),
        serial_number: Some("MOCK-0001".to_string()),
        model: Some("Mock Instrument".to_string()),
        description: Some("scripted test link".to_string()),
    })
}

/// Create a pair reporting a specific device identity.
pub fn pair_with_info(info: DeviceInfo) -> (MockTransport, MockDeviceHarness) {
    let shared = Arc::new(Mutex::new(Shared::default()));
    let (reads_tx, reads_rx) = mpsc::unbounded_channel();
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    (
        MockTransport {
            shared: Arc::clone(&shared),
            reads_rx,
            writes_tx,
            pending: VecDeque::new(),
            info,
            open: false,
        },
        MockDeviceHarness {
            shared,
            reads_tx,
            writes_rx,
            write_buffer: Vec::new(),
        },
    )
}

impl MockTransport {
    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn check_fault(&mut self) -> AppResult<()> {
        if self.shared.lock().faulted {
            self.open = false;
            self.pending.clear();
            return Err(CaptureError::TransportIo("mock device unplugged".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self, settings: &SerialSettings) -> AppResult<DeviceInfo> {
        self.open = false;
        let mut shared = self.shared.lock();
        shared.open_count += 1;
        shared.settings_seen.push(settings.clone());
        if let Some(err) = shared.open_failures.pop_front() {
            return Err(err);
        }
        shared.faulted = false;
        drop(shared);
        // Bytes sent while the link was down are lost, like on real hardware.
        self.pending.clear();
        while self.reads_rx.try_recv().is_ok() {}
        self.open = true;
        Ok(self.info.clone())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.open = false;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> AppResult<usize> {
        if !self.open {
            return Err(not_open());
        }
        self.check_fault()?;
        if !self.pending.is_empty() {
            return Ok(self.take_pending(buf));
        }
        match tokio::time::timeout(timeout, self.reads_rx.recv()).await {
            Ok(Some(chunk)) => {
                self.check_fault()?;
                self.pending.extend(chunk);
                Ok(self.take_pending(buf))
            }
            Ok(None) => {
                self.open = false;
                Err(CaptureError::TransportIo("mock harness dropped".to_string()))
            }
            Err(_) => Ok(0),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        if !self.open {
            return Err(not_open());
        }
        self.check_fault()?;
        let reply = self
            .shared
            .lock()
            .replies
            .iter()
            .find(|(trigger, _)| trigger.as_slice() == data)
            .map(|(_, reply)| reply.clone());
        if let Some(reply) = reply {
            self.pending.extend(reply);
        }
        self.writes_tx
            .send(data.to_vec())
            .map_err(|_| CaptureError::TransportIo("mock harness dropped".to_string()))
    }

    fn device_info(&self) -> Option<&DeviceInfo> {
        self.open.then_some(&self.info)
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl MockDeviceHarness {
    /// Bytes the transport will return from its next reads.
    pub fn send(&self, data: &[u8]) {
        // The transport may already be gone at the end of a test.
        let _ = self.reads_tx.send(data.to_vec());
    }

    /// Automatically answer every write equal to `trigger` with `reply`.
    pub fn reply_to(&self, trigger: &[u8], reply: &[u8]) {
        self.shared
            .lock()
            .replies
            .push((trigger.to_vec(), reply.to_vec()));
    }

    /// Remove all automatic replies.
    pub fn clear_replies(&self) {
        self.shared.lock().replies.clear();
    }

    /// Make the next `open()` fail with `err`.
    pub fn fail_next_open(&self, err: CaptureError) {
        self.shared.lock().open_failures.push_back(err);
    }

    /// Simulate pulling the cable: the next read or write fails.
    pub fn disconnect(&self) {
        self.shared.lock().faulted = true;
        // Wake a reader parked on the channel.
        let _ = self.reads_tx.send(Vec::new());
    }

    /// Number of `open()` calls so far.
    pub fn open_count(&self) -> u32 {
        self.shared.lock().open_count
    }

    /// Serial settings passed to each `open()` call.
    pub fn settings_seen(&self) -> Vec<SerialSettings> {
        self.shared.lock().settings_seen.clone()
    }

    /// Next chunk written by the transport, waiting up to `timeout`.
    pub async fn next_write(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        if !self.write_buffer.is_empty() {
            return Some(std::mem::take(&mut self.write_buffer));
        }
        tokio::time::timeout(timeout, self.writes_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the transport to write exactly `expected` next.
    ///
    /// # Panics
    /// Panics when the bytes differ or nothing arrives within two seconds.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        let deadline = Duration::from_secs(2);
        while self.write_buffer.len() < expected.len() {
            match tokio::time::timeout(deadline, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("transport dropped while expecting a write"),
                Err(_) => panic!(
                    "timed out waiting for {:?}, got {:?}",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.write_buffer)
                ),
            }
        }
        let actual: Vec<u8> = self.write_buffer.drain(..expected.len()).collect();
        assert_eq!(
            actual,
            expected,
            "expected write {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&actual)
        );
    }

    /// Count writes equal to `payload` received so far, without blocking.
    pub fn drain_count(&mut self, payload: &[u8]) -> usize {
        let mut count = 0;
        while let Ok(chunk) = self.writes_rx.try_recv() {
            if chunk == payload {
                count += 1;
            }
        }
        count
    }
}
