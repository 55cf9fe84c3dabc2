//! # tds-tls
//!
//! TLS for TDS connections, negotiated inside the protocol's own framing.
//!
//! TDS 7.x negotiates encryption in the PreLogin exchange. When the server
//! answers that encryption is on or required, the client runs a TLS handshake
//! whose records are carried as PreLogin packet payloads:
//!
//! ```text
//! TCP connect -> PreLogin (cleartext) -> TLS handshake in PreLogin packets
//!             -> Login7 and everything after (TDS packets inside TLS records)
//! ```
//!
//! [`PreLoginFraming`] adds and strips that framing underneath a
//! tokio-rustls client. [`TlsConnector::connect`] runs the handshake through
//! it, switches it to pass-through, and returns a [`TlsStream`].
//!
//! Server certificates are validated against the bundled web PKI roots unless
//! custom roots are configured. `trust_server_certificate` disables
//! validation and logs a warning.
//!
//! ```rust,ignore
//! use tds_tls::{TlsConfig, TlsConnector};
//!
//! let connector = TlsConnector::new(TlsConfig::new())?;
//! let transport = connector.connect(tcp_stream, "sql.example.com").await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod error;
pub mod handshake;

pub use config::{TlsConfig, TlsVersion};
pub use connector::{TlsConnector, TlsStream};
pub use error::TlsError;
pub use handshake::{HandshakeState, PreLoginFraming};
