//! # tds-protocol
//!
//! IO-agnostic building blocks of the MS-TDS (Tabular Data Stream) protocol
//! spoken by Microsoft SQL Server.
//!
//! The crate covers the parts of a client that need no socket:
//!
//! - packet framing ([`packet`]): splitting a message into packets and
//!   reassembling them
//! - the token stream ([`token`], [`dispatch`]): decoding server responses
//!   with version-dependent field widths and PLP values ([`plp`])
//! - session state ([`session`]): folding ENVCHANGE and LOGINACK into the
//!   per-connection record
//! - request payloads: [`prelogin`], [`login7`], [`sql_batch`] and [`rpc`]
//!
//! Async I/O lives in `tds-codec` and the connection state machine in
//! `tds-engine`.
//!
//! ## Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use tds_protocol::{Done, TdsVersion, Token, TokenDispatcher, TokenType};
//!
//! let mut wire = BytesMut::new();
//! Done::new(Some(3)).encode(&mut wire, TokenType::Done, TdsVersion::V7_4);
//!
//! let mut dispatcher = TokenDispatcher::new(TdsVersion::V7_4);
//! let tokens = dispatcher.parse_all(wire.freeze()).unwrap();
//! assert!(matches!(tokens[0], Token::Done(done) if done.row_count == 3));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod collation;
pub mod dispatch;
pub mod error;
pub mod login7;
pub mod packet;
pub mod plp;
pub mod prelogin;
pub mod rpc;
pub mod session;
pub mod sql_batch;
pub mod token;
pub mod types;
pub mod version;

pub use collation::Collation;
pub use dispatch::{TokenDispatcher, TokenParserFn, TokenRegistry, TokenStream};
pub use error::ProtocolError;
pub use login7::{FeatureExtension, FeatureId, Login7, OptionFlags1, OptionFlags2, OptionFlags3, TypeFlags};
pub use packet::{
    assemble, build_packets, peek_packet_length, PacketHeader, PacketStatus, PacketType,
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE,
};
pub use plp::{read_plp, write_plp, PLP_NULL, PLP_UNKNOWN_LENGTH};
pub use prelogin::{EncryptionLevel, PreLogin, PreLoginOption};
pub use rpc::{ParamStatus, ProcId, ProcName, RpcOptionFlags, RpcParam, RpcRequest};
pub use session::SessionState;
pub use sql_batch::{encode_sql_batch, AllHeaders, SqlBatch};
pub use token::{
    ColMetaData, ColumnMeta, Done, DoneStatus, EnvChange, EnvChangeType, EnvChangeValue,
    FeatureAck, FeatureExtAck, LoginAck, Order, ParseContext, ReturnValue, RowData,
    ServerMessage, Token, TokenType,
};
pub use types::{ColumnFlags, LengthStrategy, TypeId};
pub use version::TdsVersion;
