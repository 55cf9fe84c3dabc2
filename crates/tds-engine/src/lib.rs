//! # tds-engine
//!
//! Async SQL Server connection engine.
//!
//! A [`Client`] takes a socket through the TDS handshake (PreLogin, TLS if
//! the server wants it, Login7) and then hands it to a background driver
//! task. Requests are queued; responses come back as nested streams:
//!
//! ```text
//! Client::execute -> QueryResults (one item per result)
//!                      -> QueryResult (rows, update count, out params)
//! ```
//!
//! Row values are left undecoded; each [`Row`] carries the column metadata
//! that describes them. Reading is demand-driven, so a result nobody polls
//! keeps the server waiting instead of filling memory.
//!
//! ## Connection lifecycle
//!
//! ```text
//! Disconnected -> PreLoginSent -> [TlsNegotiating] -> LoginSent -> Ready
//!                                                     any -> Closed
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use futures_util::StreamExt;
//! use tds_engine::{Client, Config};
//!
//! let config = Config::from_connection_string(
//!     "Server=localhost;Database=test;User Id=sa;Password=secret;TrustServerCertificate=true",
//! )?;
//! let client = Client::connect(config).await?;
//!
//! let mut results = client.execute("SELECT name FROM sys.databases")?;
//! while let Some(result) = results.next().await {
//!     let mut result = result?;
//!     while let Some(segment) = result.next().await {
//!         if let Some(row) = segment?.as_row() {
//!             println!("{:?}", row.get(0));
//!         }
//!     }
//! }
//! client.close().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
mod driver;
pub mod error;
mod handshake;
mod outbound;
pub mod pipeline;
pub mod state;
pub mod transport;

pub use client::Client;
pub use config::{Config, EncryptMode, TimeoutConfig};
pub use error::{Error, Result};
pub use pipeline::{QueryResult, QueryResults, Row, Segment};
pub use state::{Lifecycle, LifecycleState};
pub use transport::{BoxedTransport, Transport};

pub use tds_protocol::{PacketType, RpcParam, RpcRequest, SessionState, TdsVersion};
pub use tds_tls::TlsConfig;
