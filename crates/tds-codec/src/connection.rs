//! Message-level connection over a packet stream.
//!
//! [`Connection`] is used while the handshake owns the socket: it sends whole
//! messages and reads whole replies. Once the session is ready it is taken
//! apart, either with [`Connection::into_inner`] to layer TLS underneath or
//! with [`Connection::into_split`] to hand the halves to a driver task.

use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use tds_protocol::packet::{
    build_packets, PacketStatus, PacketType, DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE,
    MIN_PACKET_SIZE,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use crate::error::CodecError;
use crate::framed::{PacketReader, PacketStream, PacketWriter};
use crate::message::{Message, MessageAssembler};

/// Client packets always start a message at id 1.
const FIRST_PACKET_ID: u8 = 1;

/// Frame `payload` and write it to `sink`, then flush.
///
/// `status` may carry the reset or ignore bits; end-of-message is added on
/// the final packet.
pub async fn write_message<S>(
    sink: &mut S,
    packet_type: PacketType,
    status: PacketStatus,
    payload: &[u8],
    packet_size: usize,
) -> Result<(), CodecError>
where
    S: Sink<Bytes, Error = CodecError> + Unpin,
{
    let packets = build_packets(packet_type, status, 0, payload, FIRST_PACKET_ID, packet_size)?;
    tracing::trace!(
        ?packet_type,
        packets = packets.len(),
        bytes = payload.len(),
        "sending message"
    );
    for packet in packets {
        sink.feed(packet).await?;
    }
    sink.flush().await
}

/// A TDS connection that exchanges whole messages.
pub struct Connection<T> {
    stream: PacketStream<T>,
    assembler: MessageAssembler,
    packet_size: usize,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a transport using the default packet size.
    pub fn new(transport: T) -> Self {
        Self {
            stream: PacketStream::new(transport),
            assembler: MessageAssembler::new(),
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }

    /// Set the outbound packet size, clamped to the negotiable range.
    #[must_use]
    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.set_packet_size(size);
        self
    }

    /// Change the outbound packet size, clamped to the negotiable range.
    pub fn set_packet_size(&mut self, size: usize) {
        self.packet_size = size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE);
    }

    /// Outbound packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Read the next complete message.
    ///
    /// The peer closing the stream, even between messages, is
    /// [`CodecError::ConnectionClosed`]: nothing in the handshake tolerates
    /// a missing reply.
    pub async fn read_message(&mut self) -> Result<Message, CodecError> {
        loop {
            match self.stream.next().await {
                Some(Ok(packet)) => {
                    if let Some(message) = self.assembler.push(packet) {
                        return Ok(message);
                    }
                }
                Some(Err(e)) => return Err(e),
                None => {
                    if self.assembler.has_partial() {
                        tracing::debug!(
                            packets = self.assembler.packet_count(),
                            "connection closed mid-message"
                        );
                    }
                    return Err(CodecError::ConnectionClosed);
                }
            }
        }
    }

    /// Send a complete message, split into packets of the current size.
    ///
    /// With `reset` set, the first packet asks the server to reset the
    /// session before running the request.
    pub async fn send_message(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
        reset: bool,
    ) -> Result<(), CodecError> {
        let status = if reset {
            PacketStatus::RESET_CONNECTION
        } else {
            PacketStatus::NORMAL
        };
        write_message(
            &mut self.stream,
            packet_type,
            status,
            payload,
            self.packet_size,
        )
        .await
    }

    /// Send a header-only Attention packet.
    pub async fn send_attention(&mut self) -> Result<(), CodecError> {
        tracing::debug!("sending attention");
        self.send_message(PacketType::Attention, &[], false).await
    }

    /// Take the transport back.
    ///
    /// Fails if bytes were read past the last message, since they would be
    /// lost with the framing layer.
    pub fn into_inner(self) -> Result<T, CodecError> {
        let (transport, _codec, read_buf) = self.stream.into_parts();
        if !read_buf.is_empty() {
            return Err(CodecError::TrailingData(read_buf.len()));
        }
        Ok(transport)
    }

    /// Split into independently owned read and write halves.
    ///
    /// Bytes already buffered by the read side carry over to the reader.
    pub fn into_split(self) -> (PacketReader<ReadHalf<T>>, PacketWriter<WriteHalf<T>>) {
        let (transport, codec, read_buf) = self.stream.into_parts();
        let (read_half, write_half) = tokio::io::split(transport);
        let reader = PacketReader::with_buffer(read_half, codec.clone(), &read_buf);
        let writer = PacketWriter::with_codec(write_half, codec);
        (reader, writer)
    }
}

impl<T> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("packet_size", &self.packet_size)
            .field("has_partial_message", &self.assembler.has_partial())
            .finish_non_exhaustive()
    }
}

/// Read-side helper for split connections: assembles packets from a
/// [`PacketReader`] into messages.
pub async fn read_message<R>(
    reader: &mut PacketReader<R>,
    assembler: &mut MessageAssembler,
) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    while let Some(packet) = reader.next().await {
        if let Some(message) = assembler.push(packet?) {
            return Ok(message);
        }
    }
    Err(CodecError::ConnectionClosed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::packet::{assemble, PacketHeader, PACKET_HEADER_SIZE};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn read_packets(peer: &mut tokio::io::DuplexStream, count: usize) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        for _ in 0..count {
            let mut header = [0u8; PACKET_HEADER_SIZE];
            peer.read_exact(&mut header).await.unwrap();
            let length = u16::from_be_bytes([header[2], header[3]]) as usize;
            let mut packet = header.to_vec();
            packet.resize(length, 0);
            peer.read_exact(&mut packet[PACKET_HEADER_SIZE..])
                .await
                .unwrap();
            packets.push(packet);
        }
        packets
    }

    fn framed(packet_type: PacketType, payload: &[u8], packet_size: usize) -> Vec<u8> {
        build_packets(packet_type, PacketStatus::empty(), 0, payload, 1, packet_size)
            .unwrap()
            .concat()
    }

    #[tokio::test]
    async fn test_send_message_splits_packets() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut conn = Connection::new(client).with_packet_size(512);

        let payload = vec![7u8; 1200];
        conn.send_message(PacketType::SqlBatch, &payload, true)
            .await
            .unwrap();

        let packets = read_packets(&mut server, 3).await;
        let mut first = &packets[0][..];
        let header = PacketHeader::decode(&mut first).unwrap();
        assert!(header.status.contains(PacketStatus::RESET_CONNECTION));
        assert_eq!(header.packet_id, 1);

        let (packet_type, assembled) = assemble(&packets).unwrap();
        assert_eq!(packet_type, PacketType::SqlBatch);
        assert_eq!(&assembled[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_read_message_reassembles() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut conn = Connection::new(client);

        let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        server
            .write_all(&framed(PacketType::TabularResult, &payload, 512))
            .await
            .unwrap();

        let message = conn.read_message().await.unwrap();
        assert_eq!(message.packet_type, PacketType::TabularResult);
        assert_eq!(&message.payload[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_read_message_after_close() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);
        drop(server);
        assert!(matches!(
            conn.read_message().await,
            Err(CodecError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_attention() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);
        conn.send_attention().await.unwrap();

        let packets = read_packets(&mut server, 1).await;
        assert_eq!(packets[0].len(), PACKET_HEADER_SIZE);
        assert_eq!(packets[0][0], PacketType::Attention as u8);
        assert_eq!(packets[0][1], PacketStatus::END_OF_MESSAGE.bits());
    }

    #[tokio::test]
    async fn test_into_inner_rejects_buffered_bytes() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = Connection::new(client);

        let mut bytes = framed(PacketType::TabularResult, b"one", 512);
        bytes.extend_from_slice(&framed(PacketType::TabularResult, b"two", 512));
        server.write_all(&bytes).await.unwrap();

        conn.read_message().await.unwrap();
        assert!(matches!(conn.into_inner(), Err(CodecError::TrailingData(11))));
    }

    #[tokio::test]
    async fn test_into_split_keeps_buffered_bytes() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = Connection::new(client);

        let mut bytes = framed(PacketType::TabularResult, b"one", 512);
        bytes.extend_from_slice(&framed(PacketType::TabularResult, b"two", 512));
        server.write_all(&bytes).await.unwrap();

        assert_eq!(&conn.read_message().await.unwrap().payload[..], b"one");

        let (mut reader, mut writer) = conn.into_split();
        let mut assembler = MessageAssembler::new();
        let message = read_message(&mut reader, &mut assembler).await.unwrap();
        assert_eq!(&message.payload[..], b"two");

        write_message(
            &mut writer,
            PacketType::SqlBatch,
            PacketStatus::NORMAL,
            b"hi",
            512,
        )
        .await
        .unwrap();
        let packets = read_packets(&mut server, 1).await;
        assert_eq!(&packets[0][PACKET_HEADER_SIZE..], b"hi");
    }
}
