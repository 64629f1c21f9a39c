//! Message types flowing through the bridge
//!
//! [`InboundMessage`] is produced by the connection manager once a text
//! frame is decoded and is handed by value to the dispatcher and then to
//! plugin hooks. [`OutboundRequest`] is what hooks and plugins hand to the
//! outbound scheduler.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

/// Node identifier on the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The broadcast address
    pub const BROADCAST: NodeId = NodeId(0xFFFF_FFFF);

    /// Whether this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = BridgeError;

    /// Accepts `!1a2b3c4d`, `0x1a2b3c4d` or a decimal number
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = if let Some(hex) = s.strip_prefix('!') {
            u32::from_str_radix(hex, 16)
        } else if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16)
        } else {
            s.parse::<u32>()
        };
        parsed
            .map(NodeId)
            .map_err(|_| BridgeError::InvalidNodeId(s.to_string()))
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        NodeId(id)
    }
}

/// A reported position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// When the radio obtained the fix
    pub fixed_at: Option<DateTime<Utc>>,
}

impl Coordinates {
    /// Build from the radio's fixed-point representation (1e-7 degrees)
    pub fn from_fixed(latitude_i: i32, longitude_i: i32, unix_time: u32) -> Self {
        let fixed_at = if unix_time == 0 {
            None
        } else {
            Utc.timestamp_opt(i64::from(unix_time), 0).single()
        };
        Self {
            latitude: f64::from(latitude_i) * 1e-7,
            longitude: f64::from(longitude_i) * 1e-7,
            fixed_at,
        }
    }

    /// Link to the position on a public map
    pub fn maps_url(&self) -> String {
        format!(
            "https://maps.google.com/?q={:.6},{:.6}",
            self.latitude, self.longitude
        )
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}, {:.6}", self.latitude, self.longitude)
    }
}

/// A text message received from the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Sending node
    pub sender_id: NodeId,
    /// Sender short name (falls back to the node id)
    pub sender_short_name: String,
    /// Sender long name
    pub sender_long_name: String,
    /// Message body
    pub text: String,
    /// Channel the message arrived on
    pub channel_index: u8,
    /// Addressed to this node rather than broadcast
    pub is_direct: bool,
    /// Reception time
    pub received_at: DateTime<Utc>,
    /// Arrived through a relay gateway rather than over the air
    pub arrived_via_relay: bool,
    /// Radio packet id
    pub packet_id: u32,
    /// Last position reported by the sender, if any
    pub position: Option<Coordinates>,
}

impl InboundMessage {
    /// Create a broadcast message with placeholder sender names
    pub fn new(sender_id: NodeId, text: impl Into<String>, channel_index: u8) -> Self {
        Self {
            sender_id,
            sender_short_name: sender_id.to_string(),
            sender_long_name: sender_id.to_string(),
            text: text.into(),
            channel_index,
            is_direct: false,
            received_at: Utc::now(),
            arrived_via_relay: false,
            packet_id: 0,
            position: None,
        }
    }

    /// Mark as a direct message
    pub fn direct(mut self) -> Self {
        self.is_direct = true;
        self
    }

    /// Mark as relayed
    pub fn relayed(mut self) -> Self {
        self.arrived_via_relay = true;
        self
    }

    /// Set sender names
    pub fn with_names(mut self, short: impl Into<String>, long: impl Into<String>) -> Self {
        self.sender_short_name = short.into();
        self.sender_long_name = long.into();
        self
    }

    /// Attach the sender's position
    pub fn with_position(mut self, position: Coordinates) -> Self {
        self.position = Some(position);
        self
    }
}

/// Where an outbound message goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Target {
    /// Broadcast on a channel
    Broadcast {
        /// Channel index
        channel: u8,
    },
    /// Direct message to one node
    Direct {
        /// Destination node
        destination: NodeId,
    },
}

/// Outbound priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Regular traffic
    Normal,
    /// Preempts queued normal traffic and is never dropped
    Emergency,
}

/// Origin used for messages generated by the bridge itself
pub const CORE_ORIGIN: &str = "core";

/// A logical message waiting to be transmitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    /// Text to send
    pub text: String,
    /// Destination
    pub target: Target,
    /// Plugin that produced the request
    pub origin: String,
    /// Priority class
    pub priority: Priority,
}

impl OutboundRequest {
    /// Broadcast on `channel`
    pub fn broadcast(text: impl Into<String>, channel: u8) -> Self {
        Self {
            text: text.into(),
            target: Target::Broadcast { channel },
            origin: CORE_ORIGIN.to_string(),
            priority: Priority::Normal,
        }
    }

    /// Direct message to `destination`
    pub fn direct(text: impl Into<String>, destination: NodeId) -> Self {
        Self {
            text: text.into(),
            target: Target::Direct { destination },
            origin: CORE_ORIGIN.to_string(),
            priority: Priority::Normal,
        }
    }

    /// Reply to an inbound message the way it arrived: direct messages are
    /// answered directly, broadcasts on the same channel
    pub fn reply_to(message: &InboundMessage, text: impl Into<String>) -> Self {
        if message.is_direct {
            Self::direct(text, message.sender_id)
        } else {
            Self::broadcast(text, message.channel_index)
        }
    }

    /// Set the originating plugin
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether this is emergency traffic
    pub fn is_emergency(&self) -> bool {
        self.priority == Priority::Emergency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display_and_parse() {
        let id = NodeId(0x1a2b_3c4d);
        assert_eq!(id.to_string(), "!1a2b3c4d");
        assert_eq!("!1a2b3c4d".parse::<NodeId>().unwrap(), id);
        assert_eq!("0x1A2B3C4D".parse::<NodeId>().unwrap(), id);
        assert_eq!("439041101".parse::<NodeId>().unwrap(), id);
        assert!("!zz".parse::<NodeId>().is_err());
        assert!(NodeId::BROADCAST.is_broadcast());
    }

    #[test]
    fn test_coordinates_from_fixed() {
        let c = Coordinates::from_fixed(377_749_000, -1_224_194_000, 0);
        assert!((c.latitude - 37.7749).abs() < 1e-6);
        assert!((c.longitude + 122.4194).abs() < 1e-6);
        assert!(c.fixed_at.is_none());
        assert!(c.maps_url().contains("37.774900,-122.419400"));
    }

    #[test]
    fn test_reply_follows_arrival_mode() {
        let msg = InboundMessage::new(NodeId(7), "hi", 2);
        let reply = OutboundRequest::reply_to(&msg, "hello");
        assert_eq!(reply.target, Target::Broadcast { channel: 2 });

        let dm = InboundMessage::new(NodeId(7), "hi", 0).direct();
        let reply = OutboundRequest::reply_to(&dm, "hello");
        assert_eq!(
            reply.target,
            Target::Direct {
                destination: NodeId(7)
            }
        );
        assert_eq!(reply.origin, CORE_ORIGIN);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Emergency > Priority::Normal);
        let req = OutboundRequest::broadcast("x", 0).with_priority(Priority::Emergency);
        assert!(req.is_emergency());
    }
}
