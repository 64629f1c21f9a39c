//! Plugin bridge for LoRa mesh radios
//!
//! This crate connects a LoRa mesh radio to a set of in-process plugins:
//! inbound text from the mesh is classified and handed to plugins, and
//! whatever they send back is chunked and paced onto the radio link.
//!
//! # Architecture
//!
//! The bridge is four cooperating components:
//!
//! 1. **Connection Manager** - owns the single radio link, walks the
//!    transport priority list, reconnects with bounded backoff, and detects
//!    silent failures with a liveness probe
//! 2. **Message Dispatcher** - loop prevention, command recognition and
//!    routing, emergency fan-out, observer notification
//! 3. **Extension Host** - plugin discovery, lifecycle, health, and the
//!    command and webhook route tables
//! 4. **Outbound Scheduler** - chunking, pacing, priority and the bounded
//!    send queue
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use meshbridge_core::{BridgeConfig, MeshBridge, PluginCatalog};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::load("bridge.json").await?;
//!     let catalog = PluginCatalog::new().with("hello", HelloPlugin::default);
//!
//!     let (bridge, handle) = MeshBridge::from_config(config, catalog)?;
//!     let task = tokio::spawn(bridge.run());
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await?;
//!     task.await??;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port transport (requires `libudev-dev` on Linux)
//! - `tcp` - TCP transport for radios with a network interface (default)
//! - `full` - Enable all transports
//!
//! # Commands
//!
//! Commands take the form `/<name>-<alias> [args]`, where the alias is a
//! short per-deployment suffix so several bridges can share one mesh. A
//! reserved set (`/ping`, `/test`, `/emergency`, `/911`) works without it.
//!
//! # Loop Prevention
//!
//! Everything the bridge replies starts with the machine marker (`m@i- `
//! by default). Marked inbound text, and any text from a node that sent
//! marked text recently, is never answered.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Foundations
pub mod config;
pub mod error;
pub mod frame;
pub mod message;
pub mod persist;

// Radio link
pub mod connection;
pub mod transport;

// Outbound path
pub mod scheduler;

// Inbound path
pub mod command;
pub mod dispatcher;
pub mod suppression;

// Plugins
pub mod builtin;
pub mod host;

// Service
pub mod bridge;
pub mod status;

// Testing utilities
pub mod test_utils;

pub use bridge::{BridgeHandle, MeshBridge};
pub use command::{Command, CommandParser};
pub use config::{
    BridgeConfig, BridgeConfigBuilder, CommandConfig, CustomCommand, LivenessConfig,
    LoopPreventionConfig, NodeConfig, PluginHostConfig, ReconnectConfig, ResponseConfig,
    SchedulerConfig, TransportConfig,
};
pub use connection::{ConnectionHandle, ConnectionManager, LinkState, LinkStats};
pub use dispatcher::{DispatchOutcome, DispatchStats, Dispatcher};
pub use error::{BridgeError, ErrorClass, Result};
pub use frame::{Port, RadioFrame};
pub use host::{
    Capabilities, Capability, EmergencyAlert, ExtensionHost, MessageEvent, Plugin, PluginCatalog,
    PluginContext, PluginMetadata, PluginRegistration, RouteRegistrar, SendOutcome,
};
pub use message::{Coordinates, InboundMessage, NodeId, OutboundRequest, Priority, Target};
pub use scheduler::{EnqueueReceipt, OutboundScheduler, Ticket, TicketStatus};
pub use status::BridgeStatus;
pub use suppression::SeenNodeSuppressionSet;
pub use transport::Transport;

#[cfg(feature = "serial")]
pub use transport::SerialTransport;
#[cfg(feature = "tcp")]
pub use transport::TcpTransport;

// Protocol constants re-exports
pub use config::{
    DEFAULT_BAUD_RATE, DEFAULT_FRAME_SIZE, DEFAULT_MACHINE_MARKER, DEFAULT_TCP_PORT,
    LORA_MAX_PAYLOAD, STREAM_MAGIC,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(STREAM_MAGIC, 0x94C3);
        assert_eq!(LORA_MAX_PAYLOAD, 237);
        assert_eq!(DEFAULT_TCP_PORT, 4403);
        assert_eq!(DEFAULT_MACHINE_MARKER, "m@i- ");
    }
}
