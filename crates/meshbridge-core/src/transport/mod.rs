//! Transport adapters for radio communication
//!
//! Each adapter wraps one physical connection method to the radio:
//!
//! - [`TcpTransport`] - TCP socket to a radio with a network interface (`tcp` feature)
//! - [`SerialTransport`] - USB/UART serial port (`serial` feature)
//!
//! The connection manager owns a priority-ordered list of adapters and
//! keeps at most one of them connected at a time.
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```

pub mod codec;

#[cfg(feature = "serial")]
mod serial;
#[cfg(feature = "serial")]
pub use serial::{detect_serial_port, SerialTransport};

#[cfg(feature = "tcp")]
mod tcp;
#[cfg(feature = "tcp")]
pub use tcp::TcpTransport;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::TransportConfig;
use crate::error::{BridgeError, Result};

/// Trait for radio transports
///
/// Frames exchanged through this trait are radio frames with any stream
/// framing already removed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection
    async fn connect(&mut self) -> Result<()>;

    /// Close the connection
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Read a frame from the radio
    ///
    /// Returns `None` if no complete frame is available yet.
    /// Returns `Err` on connection/read errors. Must be cancel safe: a
    /// cancelled call loses no bytes.
    async fn read_frame(&mut self) -> Result<Option<Bytes>>;

    /// Write a frame to the radio
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Check that the link is still alive
    ///
    /// Called periodically while connected. The default only checks local
    /// state; stream transports write a heartbeat.
    async fn probe(&mut self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BridgeError::Disconnected)
        }
    }

    /// Get the transport name (for logging)
    fn name(&self) -> &str;
}

/// Build transports from configuration, preserving priority order
pub fn open_transports(configs: &[TransportConfig]) -> Result<Vec<Box<dyn Transport>>> {
    if configs.is_empty() {
        return Err(BridgeError::MissingConfig("transports".to_string()));
    }
    configs.iter().map(build_transport).collect()
}

fn build_transport(config: &TransportConfig) -> Result<Box<dyn Transport>> {
    match config {
        #[cfg(feature = "tcp")]
        TransportConfig::Tcp { host, port } => Ok(Box::new(TcpTransport::new(host.clone(), *port))),
        #[cfg(not(feature = "tcp"))]
        TransportConfig::Tcp { .. } => Err(BridgeError::InvalidConfig(
            "tcp transport configured but the `tcp` feature is disabled".to_string(),
        )),
        #[cfg(feature = "serial")]
        TransportConfig::Serial { port, baud_rate } => {
            let transport = match port {
                Some(path) => SerialTransport::new(path),
                None => SerialTransport::auto_detect(),
            };
            Ok(Box::new(transport.with_baud_rate(*baud_rate)))
        }
        #[cfg(not(feature = "serial"))]
        TransportConfig::Serial { .. } => Err(BridgeError::InvalidConfig(
            "serial transport configured but the `serial` feature is disabled".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_transports_is_configuration_error() {
        let err = open_transports(&[]).err().unwrap();
        assert!(err.is_fatal());
    }

    #[cfg(feature = "tcp")]
    #[test]
    fn test_open_preserves_order() {
        let transports = open_transports(&[
            TransportConfig::Tcp {
                host: "radio-a".to_string(),
                port: 4403,
            },
            TransportConfig::Tcp {
                host: "radio-b".to_string(),
                port: 4404,
            },
        ])
        .unwrap();
        let names: Vec<&str> = transports.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["tcp:radio-a:4403", "tcp:radio-b:4404"]);
        assert!(!transports[0].is_connected());
    }
}
