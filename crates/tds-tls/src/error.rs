//! TLS error types.

use thiserror::Error;

/// Errors raised while negotiating or using TLS.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The handshake could not complete.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// The host name is not a valid TLS server name.
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// A configured root certificate was rejected.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The TLS configuration is unusable.
    #[error("TLS configuration error: {0}")]
    Configuration(String),

    /// A non-PreLogin packet arrived while handshake records were expected.
    #[error("unexpected packet type 0x{0:02X} during TLS handshake")]
    UnexpectedPacket(u8),

    /// A handshake packet carried an invalid length.
    #[error("invalid handshake packet length {0}")]
    InvalidPacketLength(usize),

    /// I/O error on the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by rustls.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    /// The peer closed the connection mid-handshake.
    #[error("connection closed during TLS negotiation")]
    ConnectionClosed,
}
