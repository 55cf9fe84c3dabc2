//! Client error types.

use std::io;
use std::sync::Arc;

use tds_codec::CodecError;
use tds_protocol::{ProtocolError, ServerMessage};
use tds_tls::TlsError;
use thiserror::Error;

/// Errors that can occur during client operations.
///
/// Errors are `Clone` so that one connection failure can be delivered to
/// every pending consumer; non-cloneable sources are held behind an `Arc`.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(Arc<CodecError>),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(Arc<TlsError>),

    /// Server returned an error.
    #[error("server error {number}: {message}")]
    Server {
        /// Error number.
        number: i32,
        /// Error class/severity (0-25).
        class: u8,
        /// Error state.
        state: u8,
        /// Error message.
        message: String,
        /// Server name where error occurred.
        server: Option<String>,
        /// Stored procedure name (if applicable).
        procedure: Option<String>,
        /// Line number in the SQL batch or procedure.
        line: u32,
    },

    /// Login was rejected or never acknowledged.
    #[error("login failed: {0}")]
    LoginFailed(String),

    /// The connection is closed.
    #[error("connection closed")]
    Closed,

    /// Connection timeout occurred.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// The request was cancelled with an attention signal.
    #[error("request cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation not allowed in the current connection state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::ConnectionClosed => Self::Closed,
            CodecError::Protocol(e) => Self::Protocol(e),
            other => Self::Codec(Arc::new(other)),
        }
    }
}

impl From<TlsError> for Error {
    fn from(e: TlsError) -> Self {
        match e {
            TlsError::ConnectionClosed => Self::Closed,
            other => Self::Tls(Arc::new(other)),
        }
    }
}

impl From<ServerMessage> for Error {
    fn from(msg: ServerMessage) -> Self {
        Self::Server {
            number: msg.number,
            class: msg.class,
            state: msg.state,
            message: msg.message,
            server: Some(msg.server).filter(|s| !s.is_empty()),
            procedure: Some(msg.procedure).filter(|s| !s.is_empty()),
            line: msg.line,
        }
    }
}

impl Error {
    /// Check if this error ends the connection.
    ///
    /// Framing, transport and TLS failures leave the stream unusable, as does
    /// a server error of severity 20 or above. Other server errors only abort
    /// the result they arrived in.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::Protocol(_)
            | Self::Codec(_)
            | Self::Tls(_)
            | Self::Closed
            | Self::LoginFailed(_)
            | Self::ConnectionTimeout => true,
            Self::Server { class, .. } => *class >= ServerMessage::FATAL_CLASS,
            Self::Cancelled | Self::Config(_) | Self::InvalidState(_) => false,
        }
    }

    /// Check if this is a server error with a specific number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        matches!(self, Self::Server { number: n, .. } if *n == number)
    }

    /// Get the error class/severity if this is a server error.
    ///
    /// SQL Server error classes range from 0-25:
    /// - 0-10: Informational
    /// - 11-16: User errors
    /// - 17-19: Resource/hardware errors
    /// - 20-25: System errors (connection terminating)
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        match self {
            Self::Server { class, .. } => Some(*class),
            _ => None,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_conversion() {
        let mut msg = ServerMessage::new(208, 16, "Invalid object name 'nope'.");
        msg.line = 3;
        let err = Error::from(msg);

        assert!(err.is_server_error(208));
        assert_eq!(err.class(), Some(16));
        assert!(!err.is_fatal());
        assert!(matches!(
            err,
            Error::Server {
                server: None,
                procedure: None,
                line: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_severity_20_is_fatal() {
        let err = Error::from(ServerMessage::new(4014, 20, "fatal"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_codec_close_maps_to_closed() {
        assert!(matches!(
            Error::from(CodecError::ConnectionClosed),
            Error::Closed
        ));
        assert!(matches!(
            Error::from(CodecError::TrailingData(3)),
            Error::Codec(_)
        ));
    }

    #[test]
    fn test_clone_shares_io_error() {
        let err = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        let copy = err.clone();
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), copy.to_string());
    }

    #[test]
    fn test_non_fatal_kinds() {
        assert!(!Error::Cancelled.is_fatal());
        assert!(!Error::InvalidState("busy".into()).is_fatal());
        assert!(!Error::Config("bad".into()).is_fatal());
    }
}
