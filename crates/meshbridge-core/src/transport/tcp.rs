//! TCP transport for radios exposing a network socket
//!
//! Uses the same magic/length stream framing as the serial port.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace};

use super::codec::{encode_stream_frame, heartbeat, StreamFramer};
use super::Transport;
use crate::config::DEFAULT_TIMEOUT_MS;
use crate::error::{BridgeError, Result};

const READ_BUFFER_SIZE: usize = 512;

/// TCP transport
pub struct TcpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
    framer: StreamFramer,
    name: String,
}

impl TcpTransport {
    /// Create a new TCP transport for `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let name = format!("tcp:{}:{}", host, port);
        Self {
            host,
            port,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stream: None,
            framer: StreamFramer::new(),
            name,
        }
    }

    /// Set the connect timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn fail(&mut self) {
        self.stream = None;
        self.framer.clear();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        info!(host = %self.host, port = self.port, "Connecting to radio over TCP");

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| BridgeError::ConnectionTimeout {
                duration_ms: self.timeout.as_millis() as u64,
            })?
            .map_err(|e| BridgeError::OpenFailed {
                transport: self.name.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        self.stream = Some(stream);
        self.framer.clear();
        info!(transport = %self.name, "Connected to radio");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.framer.clear();
        info!(transport = %self.name, "Disconnected from radio");
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
                self.fail();
                Err(BridgeError::Disconnected)
            }
            Ok(n) => {
                trace!(bytes = n, "Read from TCP stream");
                self.framer.push(&buf[..n]);
                self.framer.next_frame()
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                error!(error = %e, "TCP read error");
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
            error!(error = %e, "TCP write error");
            self.fail();
            return Err(BridgeError::WriteError(e.to_string()));
        }
        Ok(())
    }

    async fn probe(&mut self) -> Result<()> {
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

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connected", &self.stream.is_some())
            .field("buffered", &self.framer.buffered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_transport_name() {
        let t = TcpTransport::new("192.168.1.20", 4403);
        assert_eq!(t.name(), "tcp:192.168.1.20:4403");
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn test_read_and_write_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let radio = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(&encode_stream_frame(b"from-radio").unwrap())
                .await
                .unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        let mut transport = TcpTransport::new("127.0.0.1", port);
        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        let frame = loop {
            if let Some(frame) = transport.read_frame().await.unwrap() {
                break frame;
            }
        };
        assert_eq!(frame.as_ref(), b"from-radio");

        transport.write_frame(b"to-radio").await.unwrap();
        let written = radio.await.unwrap();
        assert_eq!(written, encode_stream_frame(b"to-radio").unwrap());
    }

    #[tokio::test]
    async fn test_peer_close_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut transport = TcpTransport::new("127.0.0.1", port);
        transport.connect().await.unwrap();
        let err = loop {
            match transport.read_frame().await {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert!(err.is_retriable());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = TcpTransport::new("127.0.0.1", port);
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_retriable());
    }
}
