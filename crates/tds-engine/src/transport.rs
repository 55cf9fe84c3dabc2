//! Byte transports a connection can run over.

use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream the driver task can own.
///
/// Implemented for every `AsyncRead + AsyncWrite` type that can move to
/// another task: TCP sockets, the TLS transport and in-memory pipes.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport, so plain and TLS connections share one driver.
pub type BoxedTransport = Box<dyn Transport>;
