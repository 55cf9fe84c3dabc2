//! # tds-codec
//!
//! Async framing for TDS packets.
//!
//! This crate turns a byte stream into TDS packets and packets into whole
//! messages, on top of `tokio-util`'s codec framework:
//!
//! ```text
//! transport -> TdsCodec (packets) -> MessageAssembler (messages) -> caller
//! ```
//!
//! A length below the header size or above the configured maximum means the
//! stream is out of sync; every [`CodecError`] is fatal to the connection.
//!
//! [`Connection`] drives the request/reply exchanges of the handshake and can
//! then be split so a single task owns the read half while writes go through
//! the other.
//!
//! ```rust,ignore
//! use tds_codec::Connection;
//! use tds_protocol::PacketType;
//!
//! let mut conn = Connection::new(stream);
//! conn.send_message(PacketType::PreLogin, &prelogin, false).await?;
//! let reply = conn.read_message().await?;
//! let (reader, writer) = conn.into_split();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod framed;
pub mod message;
pub mod packet_codec;

pub use connection::{read_message, write_message, Connection};
pub use error::CodecError;
pub use framed::{PacketReader, PacketStream, PacketWriter};
pub use message::{Message, MessageAssembler};
pub use packet_codec::{Packet, TdsCodec};
