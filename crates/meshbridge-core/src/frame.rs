//! Radio frame codec
//!
//! A radio frame is the unit exchanged with the device once the stream
//! framing (magic + length) has been stripped:
//!
//! ```text
//! offset  size  field
//! 0       4     from node id   (big-endian)
//! 4       4     to node id     (0xFFFFFFFF = broadcast)
//! 8       4     packet id
//! 12      1     port
//! 13      1     channel index
//! 14      1     flags          (bit 0 relayed, bit 1 want-ack)
//! 15..          payload
//! ```
//!
//! Text payloads are UTF-8. Position payloads carry latitude and longitude
//! in 1e-7 degrees plus a fix time; node-info payloads carry the short and
//! long names.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::error::{BridgeError, Result};
use crate::message::{Coordinates, NodeId};

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 15;

const FLAG_RELAYED: u8 = 0b0000_0001;
const FLAG_WANT_ACK: u8 = 0b0000_0010;

/// Application port a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    /// UTF-8 text message
    Text,
    /// Position report
    Position,
    /// Node name announcement
    NodeInfo,
    /// Any other application; ignored by the bridge
    Other(u8),
}

impl Port {
    /// Wire value
    pub fn as_u8(self) -> u8 {
        match self {
            Port::Text => 1,
            Port::Position => 3,
            Port::NodeInfo => 4,
            Port::Other(n) => n,
        }
    }
}

impl From<u8> for Port {
    fn from(value: u8) -> Self {
        match value {
            1 => Port::Text,
            3 => Port::Position,
            4 => Port::NodeInfo,
            n => Port::Other(n),
        }
    }
}

/// Decoded radio frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioFrame {
    /// Sender
    pub from: NodeId,
    /// Recipient
    pub to: NodeId,
    /// Packet id
    pub packet_id: u32,
    /// Application port
    pub port: Port,
    /// Channel index
    pub channel: u8,
    /// Arrived through a relay gateway
    pub relayed: bool,
    /// Sender requests an acknowledgement
    pub want_ack: bool,
    /// Payload bytes
    pub payload: Bytes,
}

impl RadioFrame {
    /// Build an outgoing text frame with a fresh packet id
    pub fn text(from: NodeId, to: NodeId, channel: u8, text: &str) -> Self {
        Self {
            from,
            to,
            packet_id: rand::thread_rng().gen(),
            port: Port::Text,
            channel,
            relayed: false,
            want_ack: !to.is_broadcast(),
            payload: Bytes::copy_from_slice(text.as_bytes()),
        }
    }

    /// Decode a frame
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(BridgeError::InvalidFrame(format!(
                "frame of {} bytes is shorter than the {} byte header",
                data.len(),
                HEADER_LEN
            )));
        }

        let mut buf = data;
        let from = NodeId(buf.get_u32());
        let to = NodeId(buf.get_u32());
        let packet_id = buf.get_u32();
        let port = Port::from(buf.get_u8());
        let channel = buf.get_u8();
        let flags = buf.get_u8();

        Ok(Self {
            from,
            to,
            packet_id,
            port,
            channel,
            relayed: flags & FLAG_RELAYED != 0,
            want_ack: flags & FLAG_WANT_ACK != 0,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Encode a frame
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.from.0);
        buf.put_u32(self.to.0);
        buf.put_u32(self.packet_id);
        buf.put_u8(self.port.as_u8());
        buf.put_u8(self.channel);
        let mut flags = 0;
        if self.relayed {
            flags |= FLAG_RELAYED;
        }
        if self.want_ack {
            flags |= FLAG_WANT_ACK;
        }
        buf.put_u8(flags);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Whether the frame is addressed to everyone
    pub fn is_broadcast(&self) -> bool {
        self.to.is_broadcast()
    }

    /// Interpret the payload as text
    pub fn text_payload(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload).map_err(|_| BridgeError::InvalidUtf8)
    }

    /// Interpret the payload as a position report
    pub fn position_payload(&self) -> Result<Coordinates> {
        if self.payload.len() < 12 {
            return Err(BridgeError::InvalidFrame(format!(
                "position payload of {} bytes, expected 12",
                self.payload.len()
            )));
        }
        let mut buf = &self.payload[..];
        let lat = buf.get_i32();
        let lon = buf.get_i32();
        let time = buf.get_u32();
        Ok(Coordinates::from_fixed(lat, lon, time))
    }

    /// Interpret the payload as a node-info announcement
    pub fn node_info_payload(&self) -> Result<(String, String)> {
        let (&short_len, rest) = self
            .payload
            .split_first()
            .ok_or_else(|| BridgeError::InvalidFrame("empty node-info payload".to_string()))?;
        let short_len = usize::from(short_len);
        if rest.len() < short_len {
            return Err(BridgeError::InvalidFrame(
                "node-info short name overruns payload".to_string(),
            ));
        }
        let short = std::str::from_utf8(&rest[..short_len]).map_err(|_| BridgeError::InvalidUtf8)?;
        let long = std::str::from_utf8(&rest[short_len..]).map_err(|_| BridgeError::InvalidUtf8)?;
        Ok((short.to_string(), long.to_string()))
    }
}

/// Encode a position payload
pub fn encode_position(latitude_i: i32, longitude_i: i32, unix_time: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_i32(latitude_i);
    buf.put_i32(longitude_i);
    buf.put_u32(unix_time);
    buf.freeze()
}

/// Encode a node-info payload
pub fn encode_node_info(short_name: &str, long_name: &str) -> Bytes {
    let short = &short_name.as_bytes()[..short_name.len().min(u8::MAX as usize)];
    let mut buf = BytesMut::with_capacity(1 + short.len() + long_name.len());
    buf.put_u8(short.len() as u8);
    buf.put_slice(short);
    buf.put_slice(long_name.as_bytes());
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_text_frame(from: u32, to: u32, channel: u8, flags: u8, text: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&from.to_be_bytes());
        data.extend_from_slice(&to.to_be_bytes());
        data.extend_from_slice(&42u32.to_be_bytes());
        data.push(1);
        data.push(channel);
        data.push(flags);
        data.extend_from_slice(text);
        data
    }

    #[test]
    fn test_decode_text_frame() {
        let data = raw_text_frame(0x12345678, 0xFFFFFFFF, 2, 0b01, b"Hello from LoRa!");
        let frame = RadioFrame::decode(&data).unwrap();
        assert_eq!(frame.from, NodeId(0x12345678));
        assert!(frame.is_broadcast());
        assert_eq!(frame.packet_id, 42);
        assert_eq!(frame.port, Port::Text);
        assert_eq!(frame.channel, 2);
        assert!(frame.relayed);
        assert!(!frame.want_ack);
        assert_eq!(frame.text_payload().unwrap(), "Hello from LoRa!");
    }

    #[test]
    fn test_short_frame_is_protocol_error() {
        let err = RadioFrame::decode(&[0u8; 10]).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_invalid_utf8_is_protocol_error() {
        let data = raw_text_frame(1, 2, 0, 0, &[0xff, 0xfe, 0x41]);
        let frame = RadioFrame::decode(&data).unwrap();
        assert!(matches!(frame.text_payload(), Err(BridgeError::InvalidUtf8)));
    }

    #[test]
    fn test_encoded_frame_layout() {
        let frame = RadioFrame::text(NodeId(1), NodeId(0xABCD), 3, "hey");
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_LEN + 3);
        assert_eq!(&bytes[4..8], &0xABCDu32.to_be_bytes());
        assert_eq!(bytes[12], 1);
        assert_eq!(bytes[13], 3);
        // direct frames request an ack
        assert_eq!(bytes[14], FLAG_WANT_ACK);
        assert_eq!(RadioFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_position_payload() {
        let mut frame = RadioFrame::text(NodeId(5), NodeId::BROADCAST, 0, "");
        frame.port = Port::Position;
        frame.payload = encode_position(515_000_000, -1_270_000, 1_700_000_000);
        let pos = frame.position_payload().unwrap();
        assert!((pos.latitude - 51.5).abs() < 1e-6);
        assert!(pos.fixed_at.is_some());

        frame.payload = Bytes::from_static(&[1, 2, 3]);
        assert!(frame.position_payload().is_err());
    }

    #[test]
    fn test_node_info_payload() {
        let mut frame = RadioFrame::text(NodeId(5), NodeId::BROADCAST, 0, "");
        frame.port = Port::NodeInfo;
        frame.payload = encode_node_info("BASE", "Base Camp Relay");
        assert_eq!(
            frame.node_info_payload().unwrap(),
            ("BASE".to_string(), "Base Camp Relay".to_string())
        );

        frame.payload = Bytes::from_static(&[9, b'a']);
        assert!(frame.node_info_payload().is_err());
    }

    #[test]
    fn test_unknown_port_preserved() {
        assert_eq!(Port::from(67), Port::Other(67));
        assert_eq!(Port::Other(67).as_u8(), 67);
    }
}
