//! Protocol-level error types.

use thiserror::Error;

/// Errors produced while encoding or decoding TDS wire structures.
///
/// Every variant describes a condition the byte stream cannot recover from:
/// TDS tokens carry no generic length prefix, so once a parser fails the
/// remainder of the message cannot be resynchronized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Packet type byte is not a known TDS packet type.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Packet status byte carries undefined bits.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Packet length header is outside the legal range.
    #[error("invalid packet length: {0}")]
    InvalidPacketLength(usize),

    /// Not enough bytes to decode a complete packet.
    #[error("incomplete packet: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Input ended in the middle of a structure.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Token tag with no registered parser.
    #[error("unknown token tag: 0x{0:02X}")]
    UnknownToken(u8),

    /// A row token arrived before any column metadata.
    #[error("row token received without preceding COLMETADATA")]
    MissingColumnMetadata,

    /// Malformed partially length-prefixed value.
    #[error("invalid PLP value: {0}")]
    InvalidPlp(String),

    /// Unknown PreLogin option tag.
    #[error("invalid PreLogin option: 0x{0:02X}")]
    InvalidPreloginOption(u8),

    /// Text could not be decoded in the expected character set.
    #[error("string encoding error: {0}")]
    StringEncoding(String),

    /// A field held a value outside its defined domain.
    #[error("invalid value for {field}: {value}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: u64,
    },

    /// Data type code not defined by MS-TDS.
    #[error("unsupported data type: 0x{0:02X}")]
    UnsupportedType(u8),
}
