//! Framed packet streams.
//!
//! - [`PacketStream`] reads and writes over one transport; the handshake uses it.
//! - [`PacketReader`] and [`PacketWriter`] are the halves a connection driver
//!   owns once the transport is split.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures_core::Stream;
use futures_util::Sink;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, FramedRead, FramedWrite};

use crate::error::CodecError;
use crate::packet_codec::{Packet, TdsCodec};

pin_project! {
    /// Bidirectional packet stream over a transport.
    pub struct PacketStream<T> {
        #[pin]
        inner: Framed<T, TdsCodec>,
    }
}

impl<T> PacketStream<T>
where
    T: AsyncRead + AsyncWrite,
{
    /// Frame `transport` with the default codec.
    pub fn new(transport: T) -> Self {
        Self::with_codec(transport, TdsCodec::new())
    }

    /// Frame `transport` with a configured codec.
    pub fn with_codec(transport: T, codec: TdsCodec) -> Self {
        Self {
            inner: Framed::new(transport, codec),
        }
    }

    /// The underlying transport.
    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }

    /// The codec.
    pub fn codec_mut(&mut self) -> &mut TdsCodec {
        self.inner.codec_mut()
    }

    /// Bytes read from the transport but not yet framed.
    pub fn read_buffer(&self) -> &BytesMut {
        self.inner.read_buffer()
    }

    /// Take the transport back along with any unframed read bytes.
    pub fn into_parts(self) -> (T, TdsCodec, BytesMut) {
        let parts = self.inner.into_parts();
        (parts.io, parts.codec, parts.read_buf)
    }
}

impl<T> Stream for PacketStream<T>
where
    T: AsyncRead + Unpin,
{
    type Item = Result<Packet, CodecError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

impl<T, I> Sink<I> for PacketStream<T>
where
    T: AsyncWrite + Unpin,
    TdsCodec: Encoder<I, Error = CodecError>,
{
    type Error = CodecError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: I) -> Result<(), Self::Error> {
        self.project().inner.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close(cx)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PacketStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketStream")
            .field("transport", self.inner.get_ref())
            .finish()
    }
}

pin_project! {
    /// Read half: a stream of packets.
    pub struct PacketReader<T> {
        #[pin]
        inner: FramedRead<T, TdsCodec>,
        // Framed before the split; yielded ahead of the transport.
        ready: VecDeque<Result<Packet, CodecError>>,
    }
}

impl<T> PacketReader<T>
where
    T: AsyncRead,
{
    /// Frame `transport` with a configured codec.
    pub fn with_codec(transport: T, codec: TdsCodec) -> Self {
        Self {
            inner: FramedRead::new(transport, codec),
            ready: VecDeque::new(),
        }
    }

    /// Frame `transport`, starting with bytes already received.
    ///
    /// Complete packets in `buffered` are framed up front and yielded before
    /// the transport is polled; a trailing partial packet waits in the read
    /// buffer for the rest of its bytes.
    pub fn with_buffer(transport: T, mut codec: TdsCodec, buffered: &[u8]) -> Self {
        let mut buf = BytesMut::from(buffered);
        let mut ready = VecDeque::new();
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(packet)) => ready.push_back(Ok(packet)),
                Ok(None) => break,
                Err(e) => {
                    ready.push_back(Err(e));
                    buf.clear();
                    break;
                }
            }
        }

        let mut reader = Self::with_codec(transport, codec);
        reader.ready = ready;
        reader.inner.read_buffer_mut().extend_from_slice(&buf);
        reader
    }

    /// The codec.
    pub fn codec_mut(&mut self) -> &mut TdsCodec {
        self.inner.decoder_mut()
    }
}

impl<T> Stream for PacketReader<T>
where
    T: AsyncRead + Unpin,
{
    type Item = Result<Packet, CodecError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if let Some(item) = this.ready.pop_front() {
            return Poll::Ready(Some(item));
        }
        this.inner.poll_next(cx)
    }
}

impl<T> std::fmt::Debug for PacketReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader")
            .field("ready", &self.ready.len())
            .field("buffered", &self.inner.read_buffer().len())
            .finish()
    }
}

pin_project! {
    /// Write half: a sink of packets.
    pub struct PacketWriter<T> {
        #[pin]
        inner: FramedWrite<T, TdsCodec>,
    }
}

impl<T> PacketWriter<T>
where
    T: AsyncWrite,
{
    /// Frame `transport` with a configured codec.
    pub fn with_codec(transport: T, codec: TdsCodec) -> Self {
        Self {
            inner: FramedWrite::new(transport, codec),
        }
    }

    /// The underlying transport.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T, I> Sink<I> for PacketWriter<T>
where
    T: AsyncWrite + Unpin,
    TdsCodec: Encoder<I, Error = CodecError>,
{
    type Error = CodecError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: I) -> Result<(), Self::Error> {
        self.project().inner.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close(cx)
    }
}

impl<T> std::fmt::Debug for PacketWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter").finish_non_exhaustive()
    }
}
