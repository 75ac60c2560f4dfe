//! Encoder and decoder for wirebus frames held in memory.
//!
//! The decoder validates fields as soon as their bytes are available: an
//! unknown opcode or a reserved bit fails on the first byte, and an oversized
//! length fails before any payload byte has arrived.

use crate::error::ProtocolError;
use crate::frame::{
    check_length, decode_length, length_extension, FrameHeader, CHANNEL_ID_SIZE, MESSAGE_ID_SIZE,
};
use crate::message::Message;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BytesMut};

/// Encodes messages into frames.
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    max_payload: usize,
}

impl Encoder {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Encodes a message into a new buffer.
    pub fn encode(&self, message: &Message) -> Result<BytesMut, ProtocolError> {
        message.encode(self.max_payload)
    }

    /// Appends an encoded message to `buf`.
    pub fn encode_into(&self, message: &Message, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        message.encode_into(buf, self.max_payload)
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

/// Decodes one message from the front of `buf`.
///
/// Returns `Ok(Some(message))` and consumes its bytes if a complete frame is
/// buffered, `Ok(None)` if more data is needed (nothing is consumed), or
/// `Err` as soon as a buffered field is invalid.
pub fn decode(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Message>, ProtocolError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let header = FrameHeader::parse(first)?;
    let layout = header.layout()?;
    let mut pos = 1;

    let mut channel_id = 0;
    if layout.channel_id {
        let Some(raw) = buf.get(pos..pos + CHANNEL_ID_SIZE) else {
            return Ok(None);
        };
        channel_id = u16::from_be_bytes([raw[0], raw[1]]);
        pos += CHANNEL_ID_SIZE;
    }

    let mut message_id = None;
    if layout.message_id {
        let Some(raw) = buf.get(pos..pos + MESSAGE_ID_SIZE) else {
            return Ok(None);
        };
        let mut id = [0u8; MESSAGE_ID_SIZE];
        id.copy_from_slice(raw);
        message_id = Some(u64::from_be_bytes(id));
        pos += MESSAGE_ID_SIZE;
    }

    let mut payload_len = 0;
    if layout.payload {
        let Some(&marker) = buf.get(pos) else {
            return Ok(None);
        };
        pos += 1;
        let width = length_extension(marker);
        let Some(extension) = buf.get(pos..pos + width) else {
            return Ok(None);
        };
        pos += width;
        payload_len = check_length(decode_length(marker, extension), max_payload)?;
        if buf.len() < pos + payload_len {
            return Ok(None);
        }
    }

    buf.advance(pos);
    let payload = buf.split_to(payload_len).freeze();

    let mut message = Message::new(header.opcode)
        .with_channel_id(channel_id)
        .with_payload(payload);
    if let Some(id) = message_id {
        message = message.with_message_id(id);
    }
    Ok(Some(message))
}
