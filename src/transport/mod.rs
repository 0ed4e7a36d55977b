//! Byte-level link to the instrument.
//!
//! The protocol engine only ever talks to a [`Transport`]: open with serial line
//! settings, read with a timeout, write, close. Three implementations exist:
//!
//! - [`serial::SerialTransport`]: vendor USB-serial bridge (feature `serial`)
//! - [`simulated::SimulatedTransport`]: in-process synthetic instrument for dry runs
//! - [`mock::MockTransport`]: scripted link driven by a [`mock::MockDeviceHarness`] in tests
//!
//! Opening must tell "no device attached" (`TransportUnavailable`) apart from
//! "device attached but held by another process" (`TransportBusy`).

pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;
pub mod simulated;

use crate::config::StationConfig;
use crate::error::{AppResult, CaptureError};
use crate::profile::{Profile, SerialSettings, TransportKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identity of the device behind an open link.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// OS port name, e.g. `/dev/ttyUSB0`
    pub port: String,
    /// USB serial number, when the bridge reports one
    pub serial_number: Option<String>,
    /// Product / model string
    pub model: Option<String>,
    /// Manufacturer or free-form description
    pub description: Option<String>,
}

impl DeviceInfo {
    /// Stable key identifying the physical instrument.
    ///
    /// The USB serial number survives re-enumeration; the port name is the
    /// fallback when the bridge does not report one.
    pub fn instrument_key(&self) -> String {
        match &self.serial_number {
            Some(serial) if !serial.is_empty() => serial.clone(),
            _ => self.port.clone(),
        }
    }
}

/// Async byte link to one instrument.
#[async_trait]
pub trait Transport: Send {
    /// Open the link with the given line settings.
    ///
    /// Opening an already open transport closes it first.
    async fn open(&mut self, settings: &SerialSettings) -> AppResult<DeviceInfo>;

    /// Close the link. Closing a closed transport is a no-op.
    async fn close(&mut self) -> AppResult<()>;

    /// Read available bytes into `buf`.
    ///
    /// Returns `Ok(0)` when nothing arrived within `timeout`. A closed or
    /// vanished device is an error, never a zero-length read.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> AppResult<usize>;

    /// Write the whole payload.
    async fn write_all(&mut self, data: &[u8]) -> AppResult<()>;

    /// Identity of the open device.
    fn device_info(&self) -> Option<&DeviceInfo>;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;
}

/// Boxed transport as owned by the protocol engine.
pub type DynTransport = Box<dyn Transport>;

/// Build the transport a profile asks for.
pub fn build_transport(profile: &Profile, station: &StationConfig) -> AppResult<DynTransport> {
    match profile.transport {
        TransportKind::Simulated => Ok(Box::new(simulated::SimulatedTransport::for_profile(
            profile,
        ))),
        #[cfg(feature = "serial")]
        TransportKind::UsbSerial => Ok(Box::new(serial::SerialTransport::new(
            serial::PortSelector::from_station(station),
        ))),
        #[cfg(not(feature = "serial"))]
        TransportKind::UsbSerial => {
            let _ = station;
            Err(CaptureError::Configuration(format!(
                "profile '{}' needs a USB-serial link but this build has no `serial` feature",
                profile.name
            )))
        }
    }
}

pub(crate) fn not_open() -> CaptureError {
    CaptureError::TransportIo("transport is not open".to_string())
}
