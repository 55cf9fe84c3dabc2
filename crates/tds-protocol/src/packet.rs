//! TDS packet header definitions and message-to-packet splitting.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// TDS packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Smallest packet size a server may negotiate.
pub const MIN_PACKET_SIZE: usize = 512;

/// Largest packet size a server may negotiate.
pub const MAX_PACKET_SIZE: usize = 32767;

/// Default TDS packet size.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// TDS packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// SQL batch request.
    SqlBatch = 0x01,
    /// Remote procedure call.
    Rpc = 0x03,
    /// Tabular response.
    TabularResult = 0x04,
    /// Attention signal.
    Attention = 0x06,
    /// Bulk load data.
    BulkLoad = 0x07,
    /// Transaction manager request.
    TransactionManager = 0x0E,
    /// TDS7+ login packet.
    Tds7Login = 0x10,
    /// SSPI authentication.
    Sspi = 0x11,
    /// Pre-login packet.
    PreLogin = 0x12,
}

impl PacketType {
    /// Create a packet type from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::SqlBatch),
            0x03 => Ok(Self::Rpc),
            0x04 => Ok(Self::TabularResult),
            0x06 => Ok(Self::Attention),
            0x07 => Ok(Self::BulkLoad),
            0x0E => Ok(Self::TransactionManager),
            0x10 => Ok(Self::Tds7Login),
            0x11 => Ok(Self::Sspi),
            0x12 => Ok(Self::PreLogin),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

bitflags! {
    /// TDS packet status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketStatus: u8 {
        /// Normal packet, more packets to follow.
        const NORMAL = 0x00;
        /// End of message (last packet).
        const END_OF_MESSAGE = 0x01;
        /// Sender asks the receiver to discard the message.
        const IGNORE_EVENT = 0x02;
        /// Reset connection (SQL Server 2000+).
        const RESET_CONNECTION = 0x08;
        /// Reset connection but keep transaction state.
        const RESET_CONNECTION_KEEP_TRANSACTION = 0x10;
    }
}

/// TDS packet header.
///
/// Every TDS packet begins with an 8-byte header that describes
/// the packet type, status, and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type of packet.
    pub packet_type: PacketType,
    /// Status flags.
    pub status: PacketStatus,
    /// Total packet length including header.
    pub length: u16,
    /// Server process ID (SPID).
    pub spid: u16,
    /// Packet sequence number (wraps at 255).
    pub packet_id: u8,
    /// Window (unused, should be 0).
    pub window: u8,
}

impl PacketHeader {
    /// Create a new packet header.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            spid: 0,
            packet_id: 0,
            window: 0,
        }
    }

    /// Parse a packet header from bytes.
    ///
    /// The length field is validated against the legal range; a header
    /// announcing fewer than eight bytes means the stream is desynchronized.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: PACKET_HEADER_SIZE,
                actual: src.remaining(),
            });
        }

        let packet_type = PacketType::from_u8(src.get_u8())?;
        let status_byte = src.get_u8();
        let status = PacketStatus::from_bits(status_byte)
            .ok_or(ProtocolError::InvalidPacketStatus(status_byte))?;
        let length = src.get_u16();
        if (length as usize) < PACKET_HEADER_SIZE || length as usize > MAX_PACKET_SIZE {
            return Err(ProtocolError::InvalidPacketLength(length as usize));
        }
        let spid = src.get_u16();
        let packet_id = src.get_u8();
        let window = src.get_u8();

        Ok(Self {
            packet_type,
            status,
            length,
            spid,
            packet_id,
            window,
        })
    }

    /// Encode the packet header to bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.packet_type as u8);
        dst.put_u8(self.status.bits());
        dst.put_u16(self.length);
        dst.put_u16(self.spid);
        dst.put_u8(self.packet_id);
        dst.put_u8(self.window);
    }

    /// Encode the packet header to a new `Bytes` buffer.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Get the payload length (total length minus header).
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        self.length.saturating_sub(PACKET_HEADER_SIZE as u16) as usize
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }

    /// Set the packet ID (sequence number).
    #[must_use]
    pub const fn with_packet_id(mut self, id: u8) -> Self {
        self.packet_id = id;
        self
    }

    /// Set the SPID.
    #[must_use]
    pub const fn with_spid(mut self, spid: u16) -> Self {
        self.spid = spid;
        self
    }
}

/// Read the total packet length from a buffer without consuming it.
///
/// Returns `None` until at least the first four header bytes are present.
#[must_use]
pub fn peek_packet_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    Some(u16::from_be_bytes([buf[2], buf[3]]) as usize)
}

/// Split a logical message into framed packets.
///
/// Each packet carries at most `max_packet_size - 8` payload bytes. The
/// end-of-message bit is set on the final packet only, reset bits on the
/// first packet only, and packet ids count up from `start_id` wrapping at
/// 256. An empty payload still produces a single header-only packet.
pub fn build_packets(
    packet_type: PacketType,
    status: PacketStatus,
    spid: u16,
    payload: &[u8],
    start_id: u8,
    max_packet_size: usize,
) -> Result<Vec<Bytes>, ProtocolError> {
    if max_packet_size <= PACKET_HEADER_SIZE || max_packet_size > MAX_PACKET_SIZE {
        return Err(ProtocolError::InvalidPacketLength(max_packet_size));
    }
    let chunk_size = max_packet_size - PACKET_HEADER_SIZE;
    let reset = status
        & (PacketStatus::RESET_CONNECTION | PacketStatus::RESET_CONNECTION_KEEP_TRANSACTION);
    let trailing = status & PacketStatus::IGNORE_EVENT;

    let chunk_count = payload.len().div_ceil(chunk_size).max(1);
    let mut packets = Vec::with_capacity(chunk_count);
    let mut packet_id = start_id;

    for index in 0..chunk_count {
        let start = index * chunk_size;
        let end = (start + chunk_size).min(payload.len());
        let chunk = &payload[start..end];

        let mut flags = PacketStatus::NORMAL;
        if index == 0 {
            flags |= reset;
        }
        if index + 1 == chunk_count {
            flags |= PacketStatus::END_OF_MESSAGE | trailing;
        }

        let header = PacketHeader {
            packet_type,
            status: flags,
            length: (PACKET_HEADER_SIZE + chunk.len()) as u16,
            spid,
            packet_id,
            window: 0,
        };

        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + chunk.len());
        header.encode(&mut buf);
        buf.put_slice(chunk);
        packets.push(buf.freeze());
        packet_id = packet_id.wrapping_add(1);
    }

    Ok(packets)
}

/// Reassemble framed packets into one logical message.
///
/// Stops at the first end-of-message packet; a sequence without one is
/// incomplete. The message type is taken from the first packet.
pub fn assemble<I, P>(packets: I) -> Result<(PacketType, Bytes), ProtocolError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut message_type = None;
    let mut payload = BytesMut::new();

    for packet in packets {
        let mut raw = packet.as_ref();
        let header = PacketHeader::decode(&mut raw)?;
        let body_len = header.payload_length();
        if raw.len() < body_len {
            return Err(ProtocolError::IncompletePacket {
                expected: header.length as usize,
                actual: PACKET_HEADER_SIZE + raw.len(),
            });
        }
        message_type.get_or_insert(header.packet_type);
        payload.put_slice(&raw[..body_len]);

        if header.is_end_of_message() {
            return message_type
                .map(|t| (t, payload.freeze()))
                .ok_or(ProtocolError::UnexpectedEof);
        }
    }

    Err(ProtocolError::UnexpectedEof)
}
