//! Async frame reader.
//!
//! Reads frames off a byte stream one field at a time, so each field is
//! validated as soon as it arrives. The header byte is checked before any
//! further read, and an oversized length is rejected before the payload is
//! read.

use crate::error::ProtocolError;
use crate::frame::{check_length, decode_length, length_extension, FrameHeader};
use crate::message::Message;
use crate::READ_BUFFER_SIZE;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    max_payload: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_payload: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            max_payload,
        }
    }

    /// Reads until at least `n` bytes are buffered.
    ///
    /// Returns `Ok(false)` if the stream ended before any byte was buffered
    /// and `at_boundary` is set. Any other end of stream is a truncation.
    async fn fill(&mut self, n: usize, at_boundary: bool) -> Result<bool, ProtocolError> {
        while self.buffer.len() < n {
            self.buffer.reserve(n - self.buffer.len());
            let read = self.inner.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if at_boundary && self.buffer.is_empty() {
                    return Ok(false);
                }
                return Err(ProtocolError::Truncated {
                    needed: n - self.buffer.len(),
                });
            }
        }
        Ok(true)
    }

    async fn read_exact_bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        self.fill(n, false).await?;
        Ok(self.buffer.split_to(n).freeze())
    }

    /// Reads and validates a header byte.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames.
    pub async fn read_header(&mut self) -> Result<Option<FrameHeader>, ProtocolError> {
        if !self.fill(1, true).await? {
            return Ok(None);
        }
        let byte = self.buffer.get_u8();
        FrameHeader::parse(byte).map(Some)
    }

    pub async fn read_channel_id(&mut self) -> Result<u16, ProtocolError> {
        self.fill(2, false).await?;
        Ok(self.buffer.get_u16())
    }

    pub async fn read_message_id(&mut self) -> Result<u64, ProtocolError> {
        self.fill(8, false).await?;
        Ok(self.buffer.get_u64())
    }

    /// Reads a length prefix and checks it against the payload ceiling.
    pub async fn read_length(&mut self) -> Result<usize, ProtocolError> {
        self.fill(1, false).await?;
        let marker = self.buffer.get_u8();
        let width = length_extension(marker);
        self.fill(width, false).await?;
        let len = decode_length(marker, &self.buffer[..width]);
        self.buffer.advance(width);
        check_length(len, self.max_payload)
    }

    pub async fn read_payload(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        self.read_exact_bytes(len).await
    }

    /// Reads one complete message.
    ///
    /// Returns `Ok(None)` when the peer closed the stream between frames.
    pub async fn read_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        let Some(header) = self.read_header().await? else {
            return Ok(None);
        };
        let layout = header.layout()?;
        let mut message = Message::new(header.opcode);

        if layout.channel_id {
            message = message.with_channel_id(self.read_channel_id().await?);
        }
        if layout.message_id {
            message = message.with_message_id(self.read_message_id().await?);
        }
        if layout.payload {
            let len = self.read_length().await?;
            message = message.with_payload(self.read_payload(len).await?);
        }

        Ok(Some(message))
    }

    /// Returns the number of bytes read from the stream but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
