//! TLS handshake carried inside TDS PreLogin packets.
//!
//! Until the handshake finishes, every TLS record travels as the payload of a
//! PreLogin packet. [`PreLoginFraming`] sits between rustls and the socket:
//! records written during the handshake are collected and sent on flush
//! behind a synthesized header (end-of-message, spid 0, packet id 1), and
//! server packets have their header checked and stripped before rustls sees
//! them. Once [`PreLoginFraming::handshake_complete`] is called the wrapper
//! is a pass-through and TLS records go directly on the wire.

use std::cmp;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tds_protocol::packet::{
    MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType, build_packets,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::TlsError;

/// Where the handshake stands, as seen from the framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Records are waiting to be framed and sent.
    NeedWrap,
    /// Waiting for the next server PreLogin packet.
    NeedUnwrap,
    /// An unwrapped payload is buffered but not yet consumed by rustls.
    NeedTask,
    /// The handshake is complete; bytes pass through untouched.
    Done,
}

/// Wraps handshake records in PreLogin packets.
pub struct PreLoginFraming<S> {
    stream: S,
    handshaking: bool,

    header: [u8; PACKET_HEADER_SIZE],
    header_filled: usize,
    payload: BytesMut,
    payload_filled: usize,
    inbound: BytesMut,

    // Starts with a gap that receives the packet header.
    outbound: BytesMut,
    framed: Bytes,
}

impl<S> PreLoginFraming<S> {
    /// Wrap `stream` for the duration of a handshake.
    pub fn new(stream: S) -> Self {
        let mut outbound = BytesMut::with_capacity(4096);
        outbound.put_bytes(0, PACKET_HEADER_SIZE);
        Self {
            stream,
            handshaking: true,
            header: [0; PACKET_HEADER_SIZE],
            header_filled: 0,
            payload: BytesMut::new(),
            payload_filled: 0,
            inbound: BytesMut::new(),
            outbound,
            framed: Bytes::new(),
        }
    }

    /// Stop framing. Everything after this goes directly to the stream.
    pub fn handshake_complete(&mut self) {
        if !self.inbound.is_empty() || self.header_filled > 0 {
            tracing::warn!(
                buffered = self.inbound.len() + self.header_filled,
                "discarding handshake bytes left after completion"
            );
        }
        self.handshaking = false;
    }

    /// What the handshake needs next.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        if !self.handshaking {
            HandshakeState::Done
        } else if self.outbound.len() > PACKET_HEADER_SIZE || !self.framed.is_empty() {
            HandshakeState::NeedWrap
        } else if !self.inbound.is_empty() {
            HandshakeState::NeedTask
        } else {
            HandshakeState::NeedUnwrap
        }
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// The wrapped stream, mutably.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Unwrap the stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Turn the buffered records into one or more PreLogin packets.
    fn frame_outbound(&mut self) -> io::Result<Bytes> {
        let mut records = self.outbound.split();
        self.outbound.put_bytes(0, PACKET_HEADER_SIZE);

        let length = records.len();
        if length <= MAX_PACKET_SIZE {
            put_header(&mut &mut records[..PACKET_HEADER_SIZE], length as u16);
            tracing::trace!(length, "wrapped TLS flight");
            return Ok(records.freeze());
        }

        let packets = build_packets(
            PacketType::PreLogin,
            PacketStatus::NORMAL,
            0,
            &records[PACKET_HEADER_SIZE..],
            1,
            MAX_PACKET_SIZE,
        )
        .map_err(|e| invalid_data(TlsError::HandshakeFailed(e.to_string())))?;
        tracing::trace!(length, packets = packets.len(), "wrapped TLS flight");

        let mut framed = BytesMut::with_capacity(length + packets.len() * PACKET_HEADER_SIZE);
        for packet in &packets {
            framed.put_slice(packet);
        }
        Ok(framed.freeze())
    }
}

impl<S: AsyncWrite + Unpin> PreLoginFraming<S> {
    fn poll_send(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.framed.is_empty() {
            let n = ready!(Pin::new(&mut self.stream).poll_write(cx, &self.framed))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.framed.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> PreLoginFraming<S> {
    /// Read the next server packet into `inbound`.
    ///
    /// Resolves to `false` when the stream ends cleanly between packets.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        while self.header_filled < PACKET_HEADER_SIZE {
            let mut buf = ReadBuf::new(&mut self.header[self.header_filled..]);
            ready!(Pin::new(&mut self.stream).poll_read(cx, &mut buf))?;
            let n = buf.filled().len();
            if n == 0 {
                if self.header_filled == 0 {
                    return Poll::Ready(Ok(false));
                }
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }
            self.header_filled += n;
            if self.header_filled == PACKET_HEADER_SIZE {
                let length = check_header(&self.header)?;
                self.payload = BytesMut::zeroed(length - PACKET_HEADER_SIZE);
                self.payload_filled = 0;
            }
        }

        while self.payload_filled < self.payload.len() {
            let mut buf = ReadBuf::new(&mut self.payload[self.payload_filled..]);
            ready!(Pin::new(&mut self.stream).poll_read(cx, &mut buf))?;
            let n = buf.filled().len();
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }
            self.payload_filled += n;
        }

        self.header_filled = 0;
        let payload = std::mem::take(&mut self.payload);
        tracing::trace!(length = payload.len(), "unwrapped TLS packet");
        self.inbound.unsplit(payload);
        Poll::Ready(Ok(true))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for PreLoginFraming<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.handshaking {
            return Pin::new(&mut this.stream).poll_read(cx, buf);
        }

        // A flight whose flush stalled must still reach the server.
        if !this.framed.is_empty() {
            if let Poll::Ready(Err(e)) = this.poll_send(cx) {
                return Poll::Ready(Err(e));
            }
        }

        while this.inbound.is_empty() {
            if !ready!(this.poll_fill(cx))? {
                return Poll::Ready(Ok(()));
            }
        }
        let n = cmp::min(buf.remaining(), this.inbound.len());
        buf.put_slice(&this.inbound.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PreLoginFraming<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.handshaking {
            return Pin::new(&mut this.stream).poll_write(cx, buf);
        }
        this.outbound.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.handshaking {
            if this.framed.is_empty() && this.outbound.len() > PACKET_HEADER_SIZE {
                this.framed = this.frame_outbound()?;
            }
            ready!(this.poll_send(cx))?;
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl<S> std::fmt::Debug for PreLoginFraming<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreLoginFraming")
            .field("state", &self.state())
            .field("inbound", &self.inbound.len())
            .field("outbound", &(self.outbound.len() - PACKET_HEADER_SIZE))
            .field("framed", &self.framed.len())
            .finish_non_exhaustive()
    }
}

/// Validate a server packet header and return the packet length.
fn check_header(header: &[u8; PACKET_HEADER_SIZE]) -> io::Result<usize> {
    if header[0] != PacketType::PreLogin as u8 {
        return Err(invalid_data(TlsError::UnexpectedPacket(header[0])));
    }
    let length = u16::from_be_bytes([header[2], header[3]]) as usize;
    if length < PACKET_HEADER_SIZE {
        return Err(invalid_data(TlsError::InvalidPacketLength(length)));
    }
    Ok(length)
}

fn invalid_data(err: TlsError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Encode a PreLogin packet header into the first bytes of `dst`.
pub(crate) fn put_header(dst: &mut impl BufMut, length: u16) {
    PacketHeader::new(PacketType::PreLogin, PacketStatus::END_OF_MESSAGE, length)
        .with_packet_id(1)
        .encode(dst);
}
