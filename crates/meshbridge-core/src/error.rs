//! Error types for bridge operations
//!
//! Errors are grouped into five classes that decide how the bridge reacts:
//! transport failures feed the reconnect policy, protocol errors drop the
//! offending frame, plugin faults are contained at the dispatch boundary,
//! capacity errors are absorbed by the queue eviction policy, and
//! configuration errors are the only class that stops the process.

use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Transport Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Transport could not be opened
    #[error("Failed to open transport {transport}: {reason}")]
    OpenFailed {
        /// Transport name
        transport: String,
        /// Failure reason
        reason: String,
    },

    /// Read error on the active transport
    #[error("Transport read error: {0}")]
    ReadError(String),

    /// Write error on the active transport
    #[error("Transport write error: {0}")]
    WriteError(String),

    /// Link is not connected
    #[error("Link disconnected")]
    Disconnected,

    /// Connection timeout
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Every configured transport failed
    #[error("All {attempted} transports failed to connect")]
    AllTransportsFailed {
        /// Number of transports tried
        attempted: usize,
    },

    // ===== Protocol Errors =====
    /// Invalid magic number in a stream frame
    #[error("Invalid magic number: expected 0x94C3, got 0x{got:04X}")]
    InvalidMagic {
        /// The received magic number
        got: u16,
    },

    /// Frame could not be decoded
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Unknown port number in frame header
    #[error("Unknown port number: {0}")]
    UnknownPort(u8),

    /// Text payload is not valid UTF-8
    #[error("Frame payload is not valid UTF-8")]
    InvalidUtf8,

    /// Invalid node ID format
    #[error("Invalid node ID format: {0}")]
    InvalidNodeId(String),

    // ===== Plugin Errors =====
    /// A plugin hook failed, panicked or timed out
    #[error("Plugin {plugin} faulted in {hook}: {reason}")]
    PluginFault {
        /// Plugin identifier
        plugin: String,
        /// Hook that faulted
        hook: String,
        /// Failure description
        reason: String,
    },

    /// No plugin with this identifier is known
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    /// Plugin directory exists but no implementation is registered for it
    #[error("No implementation registered for plugin: {0}")]
    NoImplementation(String),

    /// The plugin has been unloaded; its context is no longer usable
    #[error("Plugin {0} is unloaded")]
    PluginUnloaded(String),

    // ===== Capacity Errors =====
    /// Outbound queue is full
    #[error("Outbound queue full ({depth} requests)")]
    QueueFull {
        /// Configured queue depth
        depth: usize,
    },

    /// Outbound text was empty
    #[error("Outbound text is empty")]
    EmptyMessage,

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // ===== General Errors =====
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelError(String),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The error classes the bridge distinguishes when deciding how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Recovered by the reconnect policy
    Transport,
    /// Malformed frame, dropped and logged
    Protocol,
    /// Contained at the dispatch boundary
    Plugin,
    /// Resolved by queue eviction
    Capacity,
    /// Fatal at startup
    Configuration,
    /// Internal plumbing failures
    Internal,
}

impl BridgeError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectionTimeout { .. }
                | BridgeError::Disconnected
                | BridgeError::ReadError(_)
                | BridgeError::WriteError(_)
                | BridgeError::OpenFailed { .. }
                | BridgeError::PortNotFound(_)
                | BridgeError::AllTransportsFailed { .. }
                | BridgeError::Io(_)
        )
    }

    /// Check if this is a protocol error (bad data from the radio)
    pub fn is_protocol_error(&self) -> bool {
        self.class() == ErrorClass::Protocol
    }

    /// Check if this error must stop the process
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Configuration
    }

    /// Classify the error
    pub fn class(&self) -> ErrorClass {
        match self {
            BridgeError::PortNotFound(_)
            | BridgeError::OpenFailed { .. }
            | BridgeError::ReadError(_)
            | BridgeError::WriteError(_)
            | BridgeError::Disconnected
            | BridgeError::ConnectionTimeout { .. }
            | BridgeError::AllTransportsFailed { .. }
            | BridgeError::Io(_) => ErrorClass::Transport,
            BridgeError::InvalidMagic { .. }
            | BridgeError::InvalidFrame(_)
            | BridgeError::UnknownPort(_)
            | BridgeError::InvalidUtf8
            | BridgeError::InvalidNodeId(_) => ErrorClass::Protocol,
            BridgeError::PluginFault { .. }
            | BridgeError::UnknownPlugin(_)
            | BridgeError::NoImplementation(_)
            | BridgeError::PluginUnloaded(_) => ErrorClass::Plugin,
            BridgeError::QueueFull { .. } | BridgeError::EmptyMessage => ErrorClass::Capacity,
            BridgeError::InvalidConfig(_) | BridgeError::MissingConfig(_) => {
                ErrorClass::Configuration
            }
            BridgeError::Internal(_)
            | BridgeError::ChannelError(_)
            | BridgeError::ChannelClosed
            | BridgeError::Json(_) => ErrorClass::Internal,
        }
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::PortNotFound(_) => "PORT_NOT_FOUND",
            BridgeError::OpenFailed { .. } => "OPEN_FAILED",
            BridgeError::ReadError(_) => "READ_ERROR",
            BridgeError::WriteError(_) => "WRITE_ERROR",
            BridgeError::Disconnected => "DISCONNECTED",
            BridgeError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            BridgeError::AllTransportsFailed { .. } => "ALL_TRANSPORTS_FAILED",
            BridgeError::InvalidMagic { .. } => "INVALID_MAGIC",
            BridgeError::InvalidFrame(_) => "INVALID_FRAME",
            BridgeError::UnknownPort(_) => "UNKNOWN_PORT",
            BridgeError::InvalidUtf8 => "INVALID_UTF8",
            BridgeError::InvalidNodeId(_) => "INVALID_NODE_ID",
            BridgeError::PluginFault { .. } => "PLUGIN_FAULT",
            BridgeError::UnknownPlugin(_) => "UNKNOWN_PLUGIN",
            BridgeError::NoImplementation(_) => "NO_IMPLEMENTATION",
            BridgeError::PluginUnloaded(_) => "PLUGIN_UNLOADED",
            BridgeError::QueueFull { .. } => "QUEUE_FULL",
            BridgeError::EmptyMessage => "EMPTY_MESSAGE",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::MissingConfig(_) => "MISSING_CONFIG",
            BridgeError::Internal(_) => "INTERNAL_ERROR",
            BridgeError::ChannelError(_) => "CHANNEL_ERROR",
            BridgeError::ChannelClosed => "CHANNEL_CLOSED",
            BridgeError::Json(_) => "JSON_ERROR",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for BridgeError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => BridgeError::PortNotFound(err.description),
            serialport::ErrorKind::Io(kind) => {
                BridgeError::Io(std::io::Error::new(kind, err.description))
            }
            _ => BridgeError::OpenFailed {
                transport: String::from("serial"),
                reason: err.description,
            },
        }
    }
}

// Conversion from tokio mpsc send error
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BridgeError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BridgeError::ChannelError(err.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for BridgeError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        BridgeError::ChannelClosed
    }
}
