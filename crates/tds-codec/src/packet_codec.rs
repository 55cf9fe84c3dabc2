//! Packet-level `tokio-util` codec.

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::packet::{
    peek_packet_length, PacketHeader, MAX_PACKET_SIZE, PACKET_HEADER_SIZE,
};
use tds_protocol::ProtocolError;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

/// One TDS packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header.
    pub header: PacketHeader,
    /// Payload without the header.
    pub payload: Bytes,
}

impl Packet {
    /// Pair a header with its payload.
    #[must_use]
    pub fn new(header: PacketHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Whether this packet ends its message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }
}

/// Splits a byte stream into TDS packets and writes packets back out.
///
/// Decoding peeks the big-endian length at header offset 2 and waits until
/// that many bytes are buffered. A length below the header size or above the
/// configured maximum means the stream is out of sync and is fatal.
#[derive(Debug, Clone)]
pub struct TdsCodec {
    max_packet_size: usize,
}

impl TdsCodec {
    /// A codec accepting packets up to the protocol maximum.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    /// Limit accepted packets to `size` bytes.
    #[must_use]
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.clamp(PACKET_HEADER_SIZE, MAX_PACKET_SIZE);
        self
    }

    /// Largest accepted packet.
    #[must_use]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn check_length(&self, length: usize) -> Result<(), CodecError> {
        if length < PACKET_HEADER_SIZE {
            return Err(ProtocolError::InvalidPacketLength(length).into());
        }
        if length > self.max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size: length,
                max: self.max_packet_size,
            });
        }
        Ok(())
    }
}

impl Default for TdsCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TdsCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }
        let Some(length) = peek_packet_length(src) else {
            return Ok(None);
        };
        self.check_length(length)?;

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut raw = src.split_to(length).freeze();
        let header = PacketHeader::decode(&mut raw)?;

        tracing::trace!(
            packet_type = ?header.packet_type,
            length,
            packet_id = header.packet_id,
            eom = header.is_end_of_message(),
            "decoded packet"
        );

        Ok(Some(Packet::new(header, raw)))
    }
}

impl Encoder<Packet> for TdsCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = PACKET_HEADER_SIZE + item.payload.len();
        self.check_length(length)?;

        let header = PacketHeader {
            length: length as u16,
            ..item.header
        };
        dst.reserve(length);
        header.encode(dst);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// Pre-framed packets, as produced by `tds_protocol::build_packets`.
impl Encoder<Bytes> for TdsCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = peek_packet_length(&item).ok_or(ProtocolError::UnexpectedEof)?;
        self.check_length(length)?;
        if length != item.len() {
            return Err(ProtocolError::IncompletePacket {
                expected: length,
                actual: item.len(),
            }
            .into());
        }

        tracing::trace!(length, "encoded packet");
        dst.extend_from_slice(&item);
        Ok(())
    }
}
