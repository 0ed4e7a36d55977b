//! USB-serial bridge transport.
//!
//! Enumerates ports before opening so that "nothing plugged in" and "plugged in
//! but another process holds it" surface as different errors. The FTDI latency
//! timer is set through sysfs on Linux; failure to set it is logged and ignored.

use super::{not_open, DeviceInfo, Transport};
use crate::config::StationConfig;
use crate::error::{AppResult, CaptureError};
use crate::profile::{Parity, SerialSettings};
use async_trait::async_trait;
use serialport::{available_ports, SerialPortInfo, SerialPortType};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::spawn_blocking;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// How to pick the device among enumerated ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSelector {
    /// Explicit OS path
    Path(String),
    /// USB serial number reported by the bridge
    SerialNumber(String),
    /// First USB serial port found
    FirstUsb,
}

impl PortSelector {
    /// Prefer an explicit port path, then a serial number, then the first USB port.
    pub fn from_station(station: &StationConfig) -> Self {
        if let Some(port) = &station.port {
            PortSelector::Path(port.clone())
        } else if let Some(serial) = &station.device_serial {
            PortSelector::SerialNumber(serial.clone())
        } else {
            PortSelector::FirstUsb
        }
    }

    fn select(&self, ports: &[SerialPortInfo]) -> Option<DeviceInfo> {
        ports
            .iter()
            .find(|port| match (self, &port.port_type) {
                (PortSelector::Path(path), _) => &port.port_name == path,
                (PortSelector::SerialNumber(wanted), SerialPortType::UsbPort(usb)) => {
                    usb.serial_number.as_deref() == Some(wanted.as_str())
                }
                (PortSelector::FirstUsb, SerialPortType::UsbPort(_)) => true,
                _ => false,
            })
            .map(device_info_from)
    }
}

fn device_info_from(port: &SerialPortInfo) -> DeviceInfo {
    match &port.port_type {
        SerialPortType::UsbPort(usb) => DeviceInfo {
            port: port.port_name.clone(),
            serial_number: usb.serial_number.clone(),
            model: usb.product.clone(),
            description: usb.manufacturer.clone(),
        },
        _ => DeviceInfo {
            port: port.port_name.clone(),
            ..DeviceInfo::default()
        },
    }
}

/// Transport over a tokio-serial stream.
pub struct SerialTransport {
    selector: PortSelector,
    stream: Option<SerialStream>,
    info: Option<DeviceInfo>,
}

impl SerialTransport {
    pub fn new(selector: PortSelector) -> Self {
        Self {
            selector,
            stream: None,
            info: None,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self, settings: &SerialSettings) -> AppResult<DeviceInfo> {
        self.close().await?;

        let ports = available_ports()
            .map_err(|e| CaptureError::TransportUnavailable(format!("enumeration failed: {e}")))?;
        if ports.is_empty() {
            return Err(CaptureError::TransportUnavailable(
                "no serial ports detected".to_string(),
            ));
        }
        let info = self.selector.select(&ports).ok_or_else(|| {
            let names: Vec<_> = ports.iter().map(|p| p.port_name.as_str()).collect();
            CaptureError::TransportUnavailable(format!(
                "no port matches {:?} (available: {})",
                self.selector,
                names.join(", ")
            ))
        })?;

        let path = info.port.clone();
        let settings_owned = settings.clone();
        let stream = spawn_blocking(move || open_stream(&path, &settings_owned))
            .await
            .map_err(|e| CaptureError::TransportIo(format!("open task failed: {e}")))??;

        if let Some(latency) = settings.latency_timer_ms {
            set_latency_timer(&info.port, latency);
        }

        info!(
            port = %info.port,
            serial = info.serial_number.as_deref().unwrap_or("-"),
            baud = settings.baud_rate,
            "Serial link opened"
        );
        self.stream = Some(stream);
        self.info = Some(info.clone());
        Ok(info)
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Some(mut stream) = self.stream.take() {
            // Best effort; the port is released on drop either way.
            let _ = stream.shutdown().await;
            debug!(port = ?self.info.as_ref().map(|i| &i.port), "Serial link closed");
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> AppResult<usize> {
        let stream = self.stream.as_mut().ok_or_else(not_open)?;
        match tokio::time::timeout(timeout, stream.read(buf)).await {
            Ok(Ok(0)) => Err(CaptureError::TransportIo("device closed the link".to_string())),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Ok(Err(e)) => Err(CaptureError::TransportIo(e.to_string())),
            Err(_) => Ok(0),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        let stream = self.stream.as_mut().ok_or_else(not_open)?;
        stream
            .write_all(data)
            .await
            .map_err(|e| CaptureError::TransportIo(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| CaptureError::TransportIo(e.to_string()))
    }

    fn device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

fn open_stream(path: &str, settings: &SerialSettings) -> AppResult<SerialStream> {
    let data_bits = match settings.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let stop_bits = match settings.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };
    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };

    tokio_serial::new(path, settings.baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| classify_open_error(path, e))
}

/// Map an open failure onto absent vs. busy.
fn classify_open_error(path: &str, err: tokio_serial::Error) -> CaptureError {
    use tokio_serial::ErrorKind;

    let busy = match err.kind {
        ErrorKind::NoDevice => false,
        ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => true,
        ErrorKind::Io(std::io::ErrorKind::NotFound) => false,
        _ => {
            let text = err.description.to_lowercase();
            text.contains("busy") || text.contains("in use") || text.contains("access is denied")
        }
    };
    if busy {
        CaptureError::TransportBusy(format!("{path}: {}", err.description))
    } else {
        CaptureError::TransportUnavailable(format!("{path}: {}", err.description))
    }
}

#[cfg(target_os = "linux")]
fn set_latency_timer(port: &str, latency_ms: u8) {
    let Some(name) = std::path::Path::new(port).file_name() else {
        return;
    };
    let sysfs = std::path::Path::new("/sys/bus/usb-serial/devices")
        .join(name)
        .join("latency_timer");
    match std::fs::write(&sysfs, latency_ms.to_string()) {
        Ok(()) => debug!(port, latency_ms, "Latency timer set"),
        Err(e) => warn!(port, latency_ms, error = %e, "Could not set latency timer"),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_latency_timer(port: &str, latency_ms: u8) {
    debug!(port, latency_ms, "Latency timer is only configurable on Linux");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn usb(name: &str, serial: Option<&str>) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x0403,
                pid: 0x6001,
                serial_number: serial.map(str::to_string),
                manufacturer: Some("FTDI".to_string()),
                product: Some("FT232R".to_string()),
            }),
        }
    }

    #[test]
    fn test_select_by_serial_number() {
        let ports = vec![usb("/dev/ttyUSB0", Some("A1")), usb("/dev/ttyUSB1", Some("B2"))];
        let info = PortSelector::SerialNumber("B2".into())
            .select(&ports)
            .unwrap();
        assert_eq!(info.port, "/dev/ttyUSB1");
        assert_eq!(info.model.as_deref(), Some("FT232R"));
    }

    #[test]
    fn test_select_first_usb_skips_non_usb() {
        let ports = vec![
            SerialPortInfo {
                port_name: "/dev/ttyS0".into(),
                port_type: SerialPortType::Unknown,
            },
            usb("/dev/ttyUSB3", None),
        ];
        let info = PortSelector::FirstUsb.select(&ports).unwrap();
        assert_eq!(info.port, "/dev/ttyUSB3");
        assert_eq!(info.instrument_key(), "/dev/ttyUSB3");
    }

    #[test]
    fn test_no_match_is_none() {
        let ports = vec![usb("/dev/ttyUSB0", Some("A1"))];
        assert!(PortSelector::Path("/dev/ttyACM0".into()).select(&ports).is_none());
    }

    #[test]
    fn test_classify_open_errors() {
        let busy = tokio_serial::Error::new(
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied),
            "Permission denied",
        );
        assert!(matches!(
            classify_open_error("/dev/ttyUSB0", busy),
            CaptureError::TransportBusy(_)
        ));
        let gone = tokio_serial::Error::new(tokio_serial::ErrorKind::NoDevice, "No such device");
        assert!(matches!(
            classify_open_error("/dev/ttyUSB0", gone),
            CaptureError::TransportUnavailable(_)
        ));
    }
}
