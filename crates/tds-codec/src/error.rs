//! Codec error types.

use std::io;

use tds_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised while framing TDS packets.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The underlying transport failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A packet or message violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A packet exceeded the negotiated size.
    #[error("packet of {size} bytes exceeds maximum of {max}")]
    PacketTooLarge {
        /// Declared packet length.
        size: usize,
        /// Largest accepted packet.
        max: usize,
    },

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport still held unread bytes when it was taken back.
    #[error("{0} unread bytes left in the read buffer")]
    TrailingData(usize),
}

impl CodecError {
    /// Whether the stream can no longer be trusted. Every codec error is.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        true
    }
}
