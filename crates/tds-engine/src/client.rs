//! SQL Server client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tds_protocol::packet::PacketType;
use tds_protocol::{RpcRequest, SessionState, SqlBatch};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::config::Config;
use crate::driver::{ConnectionShared, Driver};
use crate::error::{Error, Result};
use crate::handshake;
use crate::outbound::Outbound;
use crate::pipeline::{PipelineShared, QueryResults};
use crate::state::{Lifecycle, LifecycleState};
use crate::transport::{BoxedTransport, Transport};

/// A logged-in connection.
///
/// Requests are half-duplex: a new request is accepted only once the
/// results of the previous one were consumed or dropped. Request methods
/// return immediately with a [`QueryResults`] stream; a background task
/// writes the request and feeds the stream as the consumer reads it.
///
/// Dropping the client closes the connection.
pub struct Client {
    shared: Arc<ConnectionShared>,
    state: watch::Receiver<LifecycleState>,
    last: Mutex<Option<Weak<PipelineShared>>>,
    reset_next: AtomicBool,
}

impl Client {
    /// Open a TCP connection to `config.host` and log in.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        tracing::info!(host = %config.host, port = config.port, "connecting to SQL Server");

        let addr = (config.host.as_str(), config.port);
        let tcp = tokio::time::timeout(config.timeouts.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectionTimeout)??;
        tcp.set_nodelay(true)?;

        Self::connect_with(tcp, config).await
    }

    /// Log in over an already open transport.
    ///
    /// TLS, if negotiated, is layered on top of `stream`.
    pub async fn connect_with<S: Transport>(stream: S, config: Config) -> Result<Self> {
        config.validate()?;
        let lifecycle = Lifecycle::new();
        let transport: BoxedTransport = Box::new(stream);

        let established = match handshake::establish(transport, &config, &lifecycle).await {
            Ok(established) => established,
            Err(e) => {
                tracing::warn!(error = %e, "connection attempt failed");
                lifecycle.close();
                return Err(e);
            }
        };

        let state = lifecycle.subscribe();
        let shared = Arc::new(ConnectionShared::new(established.session));
        let driver = Driver::new(established.connection, Arc::clone(&shared), lifecycle);
        tokio::spawn(driver.run());

        Ok(Self {
            shared,
            state,
            last: Mutex::new(None),
            reset_next: AtomicBool::new(false),
        })
    }

    /// Run a SQL batch.
    pub fn execute(&self, sql: &str) -> Result<QueryResults> {
        let payload = {
            let session = self.shared.session.read();
            SqlBatch::new(sql)
                .with_transaction(session.transaction_descriptor)
                .encode(session.tds_version)
        };
        self.submit(PacketType::SqlBatch, payload)
    }

    /// Run a remote procedure call.
    ///
    /// The active transaction descriptor replaces whatever `request` carries.
    pub fn execute_rpc(&self, request: RpcRequest) -> Result<QueryResults> {
        let payload = {
            let session = self.shared.session.read();
            request
                .with_transaction(session.transaction_descriptor)
                .encode(session.tds_version)
        };
        self.submit(PacketType::Rpc, payload)
    }

    /// Send a pre-encoded request message of any type.
    pub fn send_message(
        &self,
        packet_type: PacketType,
        payload: impl Into<Bytes>,
    ) -> Result<QueryResults> {
        self.submit(packet_type, payload.into())
    }

    fn submit(&self, packet_type: PacketType, payload: Bytes) -> Result<QueryResults> {
        self.ensure_ready()?;

        let mut last = self.last.lock();
        if let Some(previous) = last.as_ref().and_then(Weak::upgrade) {
            if !previous.is_settled() {
                return Err(Error::InvalidState(
                    "results of the previous request are still being read".into(),
                ));
            }
        }

        let pipeline = PipelineShared::new(self.shared.outbound.wake_handle());
        let reset = self.reset_next.swap(false, Ordering::AcqRel);
        self.shared.outbound.push(Outbound::Request {
            packet_type,
            payload,
            reset,
            pipeline: Arc::clone(&pipeline),
        });
        *last = Some(Arc::downgrade(&pipeline));
        drop(last);

        // The driver may have shut down between the check and the push.
        if self.state().is_closed() {
            self.shared.fail_queued(&Error::Closed);
        }
        Ok(QueryResults::new(pipeline))
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Ready => Ok(()),
            LifecycleState::Closed => Err(Error::Closed),
            other => Err(Error::InvalidState(format!("connection is {other}"))),
        }
    }

    /// Interrupt the latest request.
    ///
    /// Its results end with [`Error::Cancelled`], once the server has
    /// acknowledged if the request was already sent. A request still queued
    /// never reaches the server. With nothing outstanding this does nothing.
    pub fn cancel(&self) {
        if !self.state().is_closed() {
            self.shared.outbound.push(Outbound::Attention);
        }
    }

    /// Have the server reset the session before the next request.
    pub fn reset_on_next_request(&self) {
        self.reset_next.store(true, Ordering::Release);
    }

    /// Snapshot of the session state.
    #[must_use]
    pub fn session(&self) -> SessionState {
        self.shared.session.read().clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Whether the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Close the connection and wait for the driver to stop.
    ///
    /// Results still being read fail with [`Error::Closed`].
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.shared.outbound.push(Outbound::Close);
        let mut state = self.state.clone();
        // An error means the driver is gone, which is closed too.
        let _ = state.wait_for(|s| s.is_closed()).await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.shared.outbound.push(Outbound::Close);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
