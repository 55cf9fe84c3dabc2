//! Message reassembly.
//!
//! A logical message is the concatenation of packet payloads up to and
//! including the packet flagged end-of-message.

use bytes::{Bytes, BytesMut};
use tds_protocol::packet::{PacketStatus, PacketType};

use crate::packet_codec::Packet;

/// A complete logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Type of the first packet.
    pub packet_type: PacketType,
    /// Status bits of the first packet, end-of-message excluded.
    pub status: PacketStatus,
    /// Concatenated payload.
    pub payload: Bytes,
}

impl Message {
    /// Payload length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Buffers packet payloads until end-of-message.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    buffer: BytesMut,
    packet_type: Option<PacketType>,
    status: PacketStatus,
    packet_count: usize,
}

impl MessageAssembler {
    /// An empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a packet; returns the message it completes, if any.
    pub fn push(&mut self, packet: Packet) -> Option<Message> {
        if self.packet_type.is_none() {
            self.status = packet.header.status - PacketStatus::END_OF_MESSAGE;
        }
        let packet_type = *self.packet_type.get_or_insert(packet.header.packet_type);
        self.buffer.extend_from_slice(&packet.payload);
        self.packet_count += 1;

        if !packet.is_end_of_message() {
            return None;
        }

        tracing::trace!(
            ?packet_type,
            packets = self.packet_count,
            bytes = self.buffer.len(),
            "message complete"
        );
        self.packet_type = None;
        self.packet_count = 0;
        Some(Message {
            packet_type,
            status: std::mem::take(&mut self.status),
            payload: self.buffer.split().freeze(),
        })
    }

    /// Whether a message is partially buffered.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        self.packet_type.is_some()
    }

    /// Packets buffered for the current message.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packet_count
    }

    /// Drop any partial message.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.packet_type = None;
        self.status = PacketStatus::NORMAL;
        self.packet_count = 0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::packet::PacketHeader;

    fn packet(eom: bool, payload: &'static [u8]) -> Packet {
        let status = if eom {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        Packet::new(
            PacketHeader::new(PacketType::TabularResult, status, 0),
            Bytes::from_static(payload),
        )
    }

    #[test]
    fn test_single_packet_message() {
        let mut assembler = MessageAssembler::new();
        let message = assembler.push(packet(true, b"hello")).unwrap();
        assert_eq!(message.packet_type, PacketType::TabularResult);
        assert_eq!(&message.payload[..], b"hello");
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_multi_packet_message() {
        let mut assembler = MessageAssembler::new();
        assert!(assembler.push(packet(false, b"hello ")).is_none());
        assert!(assembler.push(packet(false, b"world")).is_none());
        assert_eq!(assembler.packet_count(), 2);

        let message = assembler.push(packet(true, b"!")).unwrap();
        assert_eq!(&message.payload[..], b"hello world!");
        assert_eq!(assembler.packet_count(), 0);
    }

    #[test]
    fn test_empty_eom_packet() {
        let mut assembler = MessageAssembler::new();
        let message = assembler.push(packet(true, b"")).unwrap();
        assert!(message.is_empty());
    }

    #[test]
    fn test_status_of_first_packet() {
        let mut assembler = MessageAssembler::new();
        let first = Packet::new(
            PacketHeader::new(PacketType::SqlBatch, PacketStatus::RESET_CONNECTION, 0),
            Bytes::from_static(b"a"),
        );
        assert!(assembler.push(first).is_none());
        let message = assembler.push(packet(true, b"b")).unwrap();
        assert_eq!(message.status, PacketStatus::RESET_CONNECTION);

        let message = assembler.push(packet(true, b"c")).unwrap();
        assert_eq!(message.status, PacketStatus::NORMAL);
    }

    #[test]
    fn test_clear() {
        let mut assembler = MessageAssembler::new();
        assembler.push(packet(false, b"partial"));
        assembler.clear();
        assert!(!assembler.has_partial());
    }
}
