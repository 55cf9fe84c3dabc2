//! Connection driver.
//!
//! One task per connection owns both socket halves. It writes queued
//! requests one at a time, turns response tokens into pipeline items and
//! keeps the session state current. The client side talks to it only
//! through [`ConnectionShared`]: the outbound queue and the session lock.
//!
//! Reads are demand-driven. While a request is in flight the driver reads
//! only when its consumer has outstanding credit, so an unread result
//! applies backpressure all the way to the server. When idle it keeps
//! reading to notice the peer closing.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tds_codec::{write_message, Connection, Packet, PacketReader, PacketWriter};
use tds_protocol::packet::{PacketStatus, PacketType};
use tds_protocol::{EnvChange, ProtocolError, ServerMessage, SessionState, Token, TokenDispatcher};
use tokio::io::{ReadHalf, WriteHalf};

use crate::error::{Error, Result};
use crate::outbound::{Control, Outbound, OutboundQueue};
use crate::pipeline::{Item, PipelineShared, Row, Segment, SegmentBuilder};
use crate::state::Lifecycle;
use crate::transport::BoxedTransport;

type Reader = PacketReader<ReadHalf<BoxedTransport>>;
type Writer = PacketWriter<WriteHalf<BoxedTransport>>;

/// State the client and the driver both touch.
#[derive(Debug)]
pub(crate) struct ConnectionShared {
    pub(crate) outbound: OutboundQueue,
    pub(crate) session: RwLock<SessionState>,
}

impl ConnectionShared {
    pub(crate) fn new(session: SessionState) -> Self {
        Self {
            outbound: OutboundQueue::new(),
            session: RwLock::new(session),
        }
    }

    /// Fail every request still waiting to be written.
    pub(crate) fn fail_queued(&self, error: &Error) {
        for item in self.outbound.drain() {
            if let Outbound::Request { pipeline, .. } = item {
                pipeline.fail(error.clone());
            }
        }
    }
}

/// The request whose response is being read.
struct InFlight {
    pipeline: Arc<PipelineShared>,
    builder: SegmentBuilder,
    attention_sent: bool,
    attention_acked: bool,
    /// Attention came from an explicit cancel rather than a dropped stream.
    cancelled_by_client: bool,
}

impl InFlight {
    fn new(pipeline: Arc<PipelineShared>) -> Self {
        Self {
            pipeline,
            builder: SegmentBuilder::default(),
            attention_sent: false,
            attention_acked: false,
            cancelled_by_client: false,
        }
    }

    /// Tokens after an attention are discarded until its acknowledgement.
    fn draining(&self) -> bool {
        self.attention_sent
    }
}

/// Response bytes not yet parsed into tokens.
///
/// A token split across packets is retried only once the buffer has doubled
/// since the failed attempt, so a value spanning many packets is parsed a
/// logarithmic number of times rather than once per packet.
#[derive(Debug, Default)]
struct TokenBuffer {
    bytes: BytesMut,
    retry_at: usize,
}

impl TokenBuffer {
    fn push(&mut self, payload: &[u8]) {
        self.bytes.extend_from_slice(payload);
    }

    /// The buffered bytes, if a parse attempt is due.
    fn take(&mut self, end_of_message: bool) -> Option<Bytes> {
        if !end_of_message && self.bytes.len() < self.retry_at {
            return None;
        }
        Some(self.bytes.split().freeze())
    }

    /// Keep `rest`, the start of an incomplete token, for the next packet.
    fn restore(&mut self, rest: Bytes) {
        self.retry_at = rest.len().saturating_mul(2);
        self.bytes = rest
            .try_into_mut()
            .unwrap_or_else(|shared| BytesMut::from(&shared[..]));
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }
}

enum Event {
    Wake,
    Packet(Option<std::result::Result<Packet, tds_codec::CodecError>>),
}

pub(crate) struct Driver {
    reader: Reader,
    writer: Writer,
    shared: Arc<ConnectionShared>,
    lifecycle: Lifecycle,
    dispatcher: TokenDispatcher,
    /// Payload bytes of a token split across packets.
    pending: TokenBuffer,
    packet_size: usize,
    current: Option<InFlight>,
}

impl Driver {
    pub(crate) fn new(
        connection: Connection<BoxedTransport>,
        shared: Arc<ConnectionShared>,
        lifecycle: Lifecycle,
    ) -> Self {
        let packet_size = connection.packet_size();
        let version = shared.session.read().tds_version;
        let (reader, writer) = connection.into_split();
        Self {
            reader,
            writer,
            shared,
            lifecycle,
            dispatcher: TokenDispatcher::new(version),
            pending: TokenBuffer::default(),
            packet_size,
            current: None,
        }
    }

    /// Serve the connection until it is closed or fails.
    pub(crate) async fn run(mut self) {
        let error = match self.serve().await {
            Ok(()) => {
                tracing::debug!("closing connection on request");
                Error::Closed
            }
            Err(e) => {
                tracing::error!(error = %e, "connection failed");
                e
            }
        };

        self.lifecycle.close();
        if let Some(current) = self.current.take() {
            current.pipeline.fail(error);
        }
        self.shared.fail_queued(&Error::Closed);
        if let Err(e) = SinkExt::<Packet>::close(&mut self.writer).await {
            tracing::debug!(error = %e, "error shutting down transport");
        }
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            self.shared.outbound.begin_drain();

            while let Some(control) = self.shared.outbound.pop_control() {
                match control {
                    Control::Close => return Ok(()),
                    Control::Attention { unsent } => self.cancel(unsent).await?,
                }
            }

            let abandoned = self
                .current
                .as_ref()
                .is_some_and(|c| !c.attention_sent && c.pipeline.is_cancelled());
            if abandoned {
                tracing::debug!("results dropped, cancelling request");
                self.send_attention().await?;
            }

            if self.current.is_none() {
                if let Some(Outbound::Request {
                    packet_type,
                    payload,
                    reset,
                    pipeline,
                }) = self.shared.outbound.pop_request()
                {
                    self.send_request(packet_type, &payload, reset, pipeline)
                        .await?;
                    continue;
                }
            }

            let wants_data = match &self.current {
                None => true,
                Some(current) => current.draining() || current.pipeline.has_demand(),
            };

            let event = tokio::select! {
                () = self.shared.outbound.notified() => Event::Wake,
                packet = self.reader.next(), if wants_data => Event::Packet(packet),
            };

            match event {
                Event::Wake => {}
                Event::Packet(Some(packet)) => self.on_packet(packet?)?,
                Event::Packet(None) => {
                    tracing::debug!("server closed the connection");
                    return Err(Error::Closed);
                }
            }
        }
    }

    async fn send_request(
        &mut self,
        packet_type: PacketType,
        payload: &Bytes,
        reset: bool,
        pipeline: Arc<PipelineShared>,
    ) -> Result<()> {
        if pipeline.is_cancelled() {
            tracing::debug!(?packet_type, "request dropped before it was sent");
            pipeline.finish();
            return Ok(());
        }

        let status = if reset {
            PacketStatus::RESET_CONNECTION
        } else {
            PacketStatus::NORMAL
        };
        tracing::debug!(?packet_type, bytes = payload.len(), reset, "sending request");
        if let Err(e) =
            write_message(&mut self.writer, packet_type, status, payload, self.packet_size).await
        {
            let error = Error::from(e);
            pipeline.fail(error.clone());
            return Err(error);
        }
        self.current = Some(InFlight::new(pipeline));
        Ok(())
    }

    /// Explicit cancel. A request not yet written fails without reaching
    /// the server; otherwise the one in flight is interrupted.
    async fn cancel(&mut self, unsent: Vec<Arc<PipelineShared>>) -> Result<()> {
        if !unsent.is_empty() {
            tracing::debug!(requests = unsent.len(), "cancelled before sending");
            for pipeline in unsent {
                pipeline.fail(Error::Cancelled);
            }
            return Ok(());
        }

        match self.current.as_mut() {
            Some(current) if !current.attention_sent => {
                current.cancelled_by_client = true;
                self.send_attention().await
            }
            Some(_) => Ok(()),
            None => {
                tracing::debug!("cancel with no request in flight");
                Ok(())
            }
        }
    }

    async fn send_attention(&mut self) -> Result<()> {
        tracing::debug!("sending attention");
        write_message(
            &mut self.writer,
            PacketType::Attention,
            PacketStatus::NORMAL,
            &[],
            self.packet_size,
        )
        .await?;
        if let Some(current) = self.current.as_mut() {
            current.attention_sent = true;
        }
        Ok(())
    }

    fn on_packet(&mut self, packet: Packet) -> Result<()> {
        if self.current.is_none() {
            tracing::warn!(
                bytes = packet.payload.len(),
                "discarding data received with no request in flight"
            );
            return Ok(());
        }
        if packet.header.packet_type != PacketType::TabularResult {
            return Err(ProtocolError::InvalidPacketType(packet.header.packet_type as u8).into());
        }

        let end_of_message = packet.is_end_of_message();
        self.pending.push(&packet.payload);
        let Some(mut buf) = self.pending.take(end_of_message) else {
            tracing::trace!(buffered = self.pending.len(), "token continues in next packet");
            return Ok(());
        };

        loop {
            match self.dispatcher.parse_next(&mut buf) {
                Ok(Some(token)) => self.on_token(token)?,
                Ok(None) => break,
                // The rest of the token is in the next packet.
                Err(ProtocolError::UnexpectedEof) if !end_of_message => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.pending.restore(buf);

        if end_of_message {
            self.end_of_message();
        }
        Ok(())
    }

    fn on_token(&mut self, token: Token) -> Result<()> {
        // Session changes apply even to a response being discarded.
        if let Token::EnvChange(change) = &token {
            self.apply_env_change(change);
            return Ok(());
        }
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };

        if current.draining() {
            match &token {
                Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done)
                    if done.is_attention_ack() =>
                {
                    tracing::debug!("attention acknowledged");
                    current.attention_acked = true;
                }
                Token::Error(msg) if msg.is_fatal() => return Err(fatal(msg.clone())),
                _ => {}
            }
            return Ok(());
        }

        match token {
            Token::Row(row) => {
                let columns = self
                    .dispatcher
                    .context()
                    .metadata
                    .clone()
                    .ok_or(ProtocolError::MissingColumnMetadata)?;
                current
                    .pipeline
                    .push(Item::Segment(Segment::Row(Row::new(columns, row))));
            }
            Token::ReturnStatus(status) => {
                current
                    .pipeline
                    .push(Item::Segment(Segment::ReturnStatus(status)));
            }
            Token::ReturnValue(value) => current.builder.return_value(value),
            Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done) => {
                for item in current.builder.done(&done) {
                    current.pipeline.push(item);
                }
            }
            Token::Error(msg) => {
                if msg.is_fatal() {
                    return Err(fatal(msg));
                }
                tracing::debug!(
                    number = msg.number,
                    class = msg.class,
                    message = %msg.message,
                    "server error"
                );
                current.pipeline.push(Item::Error(Error::from(msg)));
            }
            Token::Info(msg) => {
                tracing::info!(number = msg.number, message = %msg.message, "server message");
            }
            // Installed in the dispatcher context by the parser.
            Token::ColMetaData(_) => {}
            other => tracing::trace!(token = ?other, "ignoring token"),
        }
        Ok(())
    }

    fn end_of_message(&mut self) {
        let Some(current) = self.current.as_ref() else {
            return;
        };
        // The acknowledgement may arrive in a later message.
        if current.attention_sent && !current.attention_acked {
            return;
        }

        if let Some(current) = self.current.take() {
            if current.attention_sent && current.cancelled_by_client {
                current.pipeline.fail(Error::Cancelled);
            } else {
                current.pipeline.finish();
            }
        }
        self.dispatcher.clear_metadata();
    }

    fn apply_env_change(&mut self, change: &EnvChange) {
        tracing::debug!(env_type = ?change.env_type, "environment change");
        let mut session = self.shared.session.write();
        let before = session.packet_size;
        *session = SessionState::apply(change, std::mem::take(&mut *session));
        if session.packet_size != before {
            self.packet_size = session.packet_size as usize;
            tracing::debug!(packet_size = self.packet_size, "packet size changed");
        }
    }
}

fn fatal(msg: ServerMessage) -> Error {
    tracing::error!(
        number = msg.number,
        class = msg.class,
        message = %msg.message,
        "fatal server error"
    );
    Error::from(msg)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::{
        ColMetaData, ColumnMeta, Done, EnvChangeType, RowData, TdsVersion, TokenType, TypeId,
    };

    /// Feed `stream` through a buffer in packet-sized chunks; returns the
    /// tokens and the number of parse attempts.
    fn feed(stream: &[u8], chunk: usize) -> (Vec<Token>, usize) {
        let mut dispatcher = TokenDispatcher::new(TdsVersion::V7_4);
        let mut pending = TokenBuffer::default();
        let mut tokens = Vec::new();
        let mut attempts = 0;

        let chunks: Vec<&[u8]> = stream.chunks(chunk).collect();
        for (i, payload) in chunks.iter().enumerate() {
            let end_of_message = i + 1 == chunks.len();
            pending.push(payload);
            let Some(mut buf) = pending.take(end_of_message) else {
                continue;
            };
            attempts += 1;
            loop {
                match dispatcher.parse_next(&mut buf) {
                    Err(ProtocolError::UnexpectedEof) if !end_of_message => break,
                    result => match result.unwrap() {
                        Some(token) => tokens.push(token),
                        None => break,
                    },
                }
            }
            pending.restore(buf);
        }
        (tokens, attempts)
    }

    #[test]
    fn test_large_value_is_not_reparsed_per_packet() {
        let meta = ColMetaData::new(vec![
            ColumnMeta::new("blob", TypeId::BigVarBinary).with_max_length(0xFFFF),
        ]);
        let value = vec![0xAB; 1 << 20];
        let mut stream = Vec::new();
        meta.encode(&mut stream);
        RowData {
            values: vec![Some(Bytes::from(value.clone()))],
        }
        .encode(&mut stream, &meta);
        Done::new(Some(1)).encode(&mut stream, TokenType::Done, TdsVersion::V7_4);

        let packets = stream.len().div_ceil(4088);
        let (tokens, attempts) = feed(&stream, 4088);
        assert!(matches!(
            &tokens[1],
            Token::Row(row) if row.values[0].as_deref() == Some(&value[..])
        ));
        assert!(matches!(tokens[2], Token::Done(_)));
        assert!(packets > 200);
        assert!(attempts < 20, "{attempts} parse attempts for {packets} packets");
    }

    #[test]
    fn test_small_split_token_is_retried_with_next_packet() {
        let mut pending = TokenBuffer::default();
        pending.push(&[1, 2, 3]);
        let buf = pending.take(false).unwrap();
        pending.restore(buf);

        pending.push(&[4, 5, 6]);
        assert_eq!(&pending.take(false).unwrap()[..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_end_of_message_always_parses() {
        let mut pending = TokenBuffer::default();
        pending.push(&[0; 100]);
        let buf = pending.take(false).unwrap();
        pending.restore(buf);

        pending.push(&[0; 10]);
        assert!(pending.take(false).is_none());
        assert_eq!(pending.take(true).unwrap().len(), 110);
    }

    #[test]
    fn test_fail_queued() {
        let shared = ConnectionShared::new(SessionState::new(TdsVersion::V7_4));
        let pipeline = PipelineShared::new(shared.outbound.wake_handle());
        shared.outbound.push(Outbound::Request {
            packet_type: PacketType::SqlBatch,
            payload: Bytes::from_static(b"x"),
            reset: false,
            pipeline: Arc::clone(&pipeline),
        });
        shared.outbound.push(Outbound::Close);

        shared.fail_queued(&Error::Closed);
        assert!(shared.outbound.drain().is_empty());
        assert!(pipeline.is_settled());
    }

    #[test]
    fn test_session_lock_applies_changes() {
        let shared = ConnectionShared::new(SessionState::new(TdsVersion::V7_4));
        let change = EnvChange::text(EnvChangeType::Database, "app", "master");
        let mut session = shared.session.write();
        *session = SessionState::apply(&change, std::mem::take(&mut *session));
        drop(session);
        assert_eq!(shared.session.read().database.as_deref(), Some("app"));
    }
}
