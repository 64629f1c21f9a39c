//! Serial port transport
//!
//! Async serial communication using tokio-serial with the magic/length
//! stream framing. When no port is configured the first likely radio is
//! auto-detected on every connect attempt, so a radio plugged in later is
//! picked up by the reconnect loop.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace};

use super::codec::{encode_stream_frame, heartbeat, StreamFramer};
use super::Transport;
use crate::config::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};
use crate::error::{BridgeError, Result};

/// Buffer size for reading from serial port
const READ_BUFFER_SIZE: usize = 512;

/// Common serial port paths for radios on different platforms
const COMMON_DEVICE_PATHS: &[&str] = &[
    // Linux
    "/dev/ttyUSB*",
    "/dev/ttyACM*",
    "/dev/serial/by-id/usb-Silicon_Labs_CP210x_USB_to_UART_Bridge*",
    // macOS
    "/dev/cu.usbserial-*",
    "/dev/cu.SLAB_USBtoUART*",
    "/dev/cu.usbmodem*",
];

/// USB vendor ids of common radio boards (CP210x, FTDI, ESP32, CH340)
const KNOWN_VIDS: [u16; 4] = [0x10C4, 0x0403, 0x303A, 0x1A86];

/// Serial transport
pub struct SerialTransport {
    /// Configured port; `None` means auto-detect
    configured: Option<PathBuf>,
    /// Port actually opened
    port_path: Option<PathBuf>,
    baud_rate: u32,
    timeout: Duration,
    stream: Option<SerialStream>,
    framer: StreamFramer,
    name: String,
}

impl SerialTransport {
    /// Create a transport for a fixed port
    pub fn new(port: impl AsRef<Path>) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());
        Self {
            configured: Some(port_path),
            port_path: None,
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stream: None,
            framer: StreamFramer::new(),
            name,
        }
    }

    /// Create a transport that picks the first detected radio
    pub fn auto_detect() -> Self {
        Self {
            configured: None,
            port_path: None,
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stream: None,
            framer: StreamFramer::new(),
            name: "serial:auto".to_string(),
        }
    }

    /// Set the baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The port in use, once connected
    pub fn port_path(&self) -> Option<&Path> {
        self.port_path.as_deref()
    }

    fn fail(&mut self) {
        self.stream = None;
        self.framer.clear();
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let path = match &self.configured {
            Some(path) => path.clone(),
            None => detect_serial_port()
                .ok_or_else(|| BridgeError::PortNotFound("no radio detected".to_string()))?,
        };
        info!(port = %path.display(), baud = self.baud_rate, "Connecting to serial port");

        if !path.exists() {
            return Err(BridgeError::PortNotFound(path.display().to_string()));
        }

        let stream = tokio_serial::new(path.to_string_lossy(), self.baud_rate)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| BridgeError::OpenFailed {
                transport: path.display().to_string(),
                reason: e.to_string(),
            })?;

        self.stream = Some(stream);
        self.framer.clear();
        info!(port = %path.display(), "Connected to radio");
        self.port_path = Some(path);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stream = None;
        self.framer.clear();
        if let Some(path) = self.port_path.take() {
            info!(port = %path.display(), "Disconnected from serial port");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        if let Some(frame) = self.framer.next_frame()? {
            return Ok(Some(frame));
        }

        let stream = self.stream.as_mut().ok_or(BridgeError::Disconnected)?;
        let mut buf = [0u8; READ_BUFFER_SIZE];
        match stream.read(&mut buf).await {
            Ok(0) => {
                // EOF - device unplugged
                self.fail();
                Err(BridgeError::Disconnected)
            }
            Ok(n) => {
                trace!(bytes = n, "Read from serial port");
                self.framer.push(&buf[..n]);
                self.framer.next_frame()
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(e) => {
                error!(error = %e, "Serial read error");
                self.fail();
                Err(BridgeError::ReadError(e.to_string()))
            }
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let packet = encode_stream_frame(frame)?;
        let stream = self.stream.as_mut().ok_or(BridgeError::Disconnected)?;
        debug!(size = packet.len(), "Writing frame");

        if let Err(e) = stream.write_all(&packet).await {
            error!(error = %e, "Serial write error");
            self.fail();
            return Err(BridgeError::WriteError(e.to_string()));
        }
        stream
            .flush()
            .await
            .map_err(|e| BridgeError::WriteError(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    async fn probe(&mut self) -> Result<()> {
        if let Some(path) = &self.port_path {
            if !path.exists() {
                self.fail();
                return Err(BridgeError::PortNotFound(path.display().to_string()));
            }
        }
        let stream = self.stream.as_mut().ok_or(BridgeError::Disconnected)?;
        if let Err(e) = stream.write_all(&heartbeat()).await {
            self.fail();
            return Err(BridgeError::WriteError(format!("heartbeat failed: {}", e)));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("configured", &self.configured)
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("connected", &self.stream.is_some())
            .field("buffered", &self.framer.buffered())
            .finish()
    }
}

/// Find a connected radio by scanning serial ports
///
/// USB devices from known radio vendors are preferred; otherwise the first
/// existing path matching a common device pattern is returned.
pub fn detect_serial_port() -> Option<PathBuf> {
    if let Ok(ports) = serialport::available_ports() {
        for port in ports {
            if let serialport::SerialPortType::UsbPort(usb) = &port.port_type {
                if KNOWN_VIDS.contains(&usb.vid) {
                    debug!(
                        port = %port.port_name,
                        vid = format_args!("{:#06X}", usb.vid),
                        "Serial device matches known vendor"
                    );
                    return Some(PathBuf::from(port.port_name));
                }
            }
        }
    }

    COMMON_DEVICE_PATHS
        .iter()
        .filter_map(|pattern| glob::glob(pattern).ok())
        .flat_map(|entries| entries.flatten())
        .find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_state() {
        let t = SerialTransport::new("/dev/ttyUSB0");
        assert!(!t.is_connected());
        assert_eq!(t.name(), "serial:/dev/ttyUSB0");
        assert!(t.port_path().is_none());
    }

    #[test]
    fn test_auto_detect_name() {
        let t = SerialTransport::auto_detect().with_baud_rate(115_200);
        assert_eq!(t.name(), "serial:auto");
        assert_eq!(t.baud_rate, 115_200);
    }

    #[tokio::test]
    async fn test_missing_port_is_transport_error() {
        let mut t = SerialTransport::new("/dev/does-not-exist-meshbridge");
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, BridgeError::PortNotFound(_)));
        assert!(err.is_retriable());
    }
}
