//! The `Message` value type.

use crate::error::{ErrorCode, ProtocolError};
use crate::frame::{
    length_prefix_size, put_length, FrameFlags, FrameHeader, Opcode, CHANNEL_ID_SIZE,
    MESSAGE_ID_SIZE,
};
use bytes::{BufMut, Bytes, BytesMut};

/// A single protocol message.
///
/// Messages are immutable once built. Which fields are meaningful depends on
/// the opcode; see the table in [`crate::frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    opcode: Opcode,
    message_id: Option<u64>,
    channel_id: u16,
    payload: Bytes,
}

impl Message {
    /// Creates an empty message with the given opcode.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            message_id: None,
            channel_id: 0,
            payload: Bytes::new(),
        }
    }

    pub fn with_channel_id(mut self, channel_id: u16) -> Self {
        self.channel_id = channel_id;
        self
    }

    pub fn with_message_id(mut self, message_id: u64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// SUB request for a channel name.
    pub fn subscribe(name: &str) -> Self {
        Self::new(Opcode::Sub).with_payload(Bytes::copy_from_slice(name.as_bytes()))
    }

    /// UNSUB request for a channel ID.
    pub fn unsubscribe(channel_id: u16) -> Self {
        Self::new(Opcode::Unsub).with_channel_id(channel_id)
    }

    /// PUB request carrying a payload for a channel.
    pub fn publish(channel_id: u16, payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pub)
            .with_channel_id(channel_id)
            .with_payload(payload)
    }

    /// MSG delivery for a channel.
    pub fn deliver(channel_id: u16, payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Msg)
            .with_channel_id(channel_id)
            .with_payload(payload)
    }

    /// ACK of a delivered message.
    pub fn ack(channel_id: u16, message_id: u64) -> Self {
        Self::new(Opcode::Ack)
            .with_channel_id(channel_id)
            .with_message_id(message_id)
    }

    /// INFO_CHANNEL_ID reply announcing the ID assigned to a channel name.
    pub fn channel_info(channel_id: u16, name: &str) -> Self {
        Self::new(Opcode::InfoChannelId)
            .with_channel_id(channel_id)
            .with_payload(Bytes::copy_from_slice(name.as_bytes()))
    }

    pub fn ping() -> Self {
        Self::new(Opcode::Ping)
    }

    pub fn pong() -> Self {
        Self::new(Opcode::Pong)
    }

    /// CLOSE with an optional human-readable reason.
    pub fn close(reason: &str) -> Self {
        Self::new(Opcode::Close).with_payload(Bytes::copy_from_slice(reason.as_bytes()))
    }

    /// ERR frame. The payload is the error code name, a space, and the text.
    pub fn error(code: ErrorCode, text: &str) -> Self {
        let payload = format!("{} {}", code, text);
        Self::new(Opcode::Err).with_payload(payload.into_bytes())
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn message_id(&self) -> Option<u64> {
        self.message_id
    }

    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Interprets the payload as a channel name (SUB and INFO_CHANNEL_ID).
    pub fn channel_name(&self) -> Result<&str, ProtocolError> {
        parse_channel_name(&self.payload)
    }

    /// Splits an ERR payload into its code and text.
    pub fn error_parts(&self) -> (Option<ErrorCode>, String) {
        let text = String::from_utf8_lossy(&self.payload).into_owned();
        if let Some((code, rest)) = text.split_once(' ') {
            if let Some(code) = ErrorCode::parse(code) {
                return (Some(code), rest.to_string());
            }
        }
        (ErrorCode::parse(&text), text)
    }

    /// Checks that the message can be put on the wire.
    pub fn validate(&self, max_payload: usize) -> Result<(), ProtocolError> {
        if self.message_id.is_some() && !self.opcode.allows_message_id() {
            return Err(ProtocolError::UnexpectedMessageId(self.opcode));
        }
        if self.opcode == Opcode::Ack && self.message_id.is_none() {
            return Err(ProtocolError::MissingMessageId(self.opcode));
        }
        if !self.opcode.has_channel_id() && self.channel_id != 0 {
            return Err(ProtocolError::UnexpectedChannelId(self.opcode));
        }
        if !self.opcode.has_payload() && !self.payload.is_empty() {
            return Err(ProtocolError::UnexpectedPayload(self.opcode));
        }
        let max = max_payload.min(u32::MAX as usize);
        if self.payload.len() > max {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len() as u64,
                max,
            });
        }
        Ok(())
    }

    /// Returns the header byte for this message.
    pub fn header(&self) -> FrameHeader {
        let flags = if self.message_id.is_some() {
            FrameFlags::new().with_message_id()
        } else {
            FrameFlags::new()
        };
        FrameHeader::new(self.opcode, flags)
    }

    /// Returns the number of bytes the encoded frame occupies.
    pub fn encoded_len(&self) -> usize {
        let mut len = 1;
        if self.opcode.has_channel_id() {
            len += CHANNEL_ID_SIZE;
        }
        if self.message_id.is_some() {
            len += MESSAGE_ID_SIZE;
        }
        if self.opcode.has_payload() {
            len += length_prefix_size(self.payload.len()) + self.payload.len();
        }
        len
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut, max_payload: usize) -> Result<(), ProtocolError> {
        self.validate(max_payload)?;
        buf.reserve(self.encoded_len());

        buf.put_u8(self.header().to_byte());

        if self.opcode.has_channel_id() {
            buf.put_u16(self.channel_id);
        }

        if let Some(message_id) = self.message_id {
            buf.put_u64(message_id);
        }

        if self.opcode.has_payload() {
            put_length(buf, self.payload.len());
            buf.put_slice(&self.payload);
        }

        Ok(())
    }

    /// Encodes the message into a new buffer.
    pub fn encode(&self, max_payload: usize) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf, max_payload)?;
        Ok(buf)
    }
}

/// Validates a raw channel name.
pub fn parse_channel_name(raw: &[u8]) -> Result<&str, ProtocolError> {
    if raw.is_empty() {
        return Err(ProtocolError::InvalidChannelName("empty"));
    }
    std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidChannelName("not UTF-8"))
}

/// Builds an outbound message whose payload is written incrementally.
///
/// The payload capacity is fixed at construction; writes past it fail with
/// [`ProtocolError::PayloadFull`] once no space remains.
#[derive(Debug)]
pub struct MessageBuilder {
    opcode: Opcode,
    message_id: Option<u64>,
    channel_id: u16,
    payload: BytesMut,
    capacity: usize,
}

impl MessageBuilder {
    pub fn new(opcode: Opcode, capacity: usize) -> Self {
        Self {
            opcode,
            message_id: None,
            channel_id: 0,
            payload: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn channel_id(mut self, channel_id: u16) -> Self {
        self.channel_id = channel_id;
        self
    }

    pub fn message_id(mut self, message_id: u64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Returns the number of payload bytes that can still be written.
    pub fn remaining(&self) -> usize {
        self.capacity - self.payload.len()
    }

    /// Appends as much of `data` as fits and returns the number of bytes taken.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError> {
        if data.is_empty() {
            return Ok(0);
        }
        let space = self.remaining();
        if space == 0 {
            return Err(ProtocolError::PayloadFull {
                capacity: self.capacity,
            });
        }
        let n = data.len().min(space);
        self.payload.extend_from_slice(&data[..n]);
        Ok(n)
    }

    pub fn build(self) -> Message {
        Message {
            opcode: self.opcode,
            message_id: self.message_id,
            channel_id: self.channel_id,
            payload: self.payload.freeze(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_PAYLOAD_SIZE;

    #[test]
    fn test_subscribe_encoding() {
        let encoded = Message::subscribe("orders").encode(MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(&encoded[..], b"\x10\x06orders");
    }

    #[test]
    fn test_unsubscribe_encoding() {
        let encoded = Message::unsubscribe(0x1234).encode(MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(&encoded[..], &[0x18, 0x12, 0x34]);
    }

    #[test]
    fn test_ping_encoding() {
        let encoded = Message::ping().encode(MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(&encoded[..], &[0x20]);
    }

    #[test]
    fn test_msg_with_id_encoding() {
        let msg = Message::deliver(7, &b"X"[..]).with_message_id(1);
        let encoded = msg.encode(MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(
            &encoded[..],
            &[0x3C, 0x00, 0x07, 0, 0, 0, 0, 0, 0, 0, 1, 0x01, b'X']
        );
        assert_eq!(encoded.len(), msg.encoded_len());
    }

    #[test]
    fn test_ack_encoding() {
        let encoded = Message::ack(2, 9).encode(MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(&encoded[..], &[0x44, 0x00, 0x02, 0, 0, 0, 0, 0, 0, 0, 9]);
    }

    #[test]
    fn test_ack_requires_message_id() {
        let msg = Message::new(Opcode::Ack).with_channel_id(2);
        let result = msg.encode(MAX_PAYLOAD_SIZE);
        assert!(matches!(
            result,
            Err(ProtocolError::MissingMessageId(Opcode::Ack))
        ));
    }

    #[test]
    fn test_message_id_rejected_on_pub() {
        let msg = Message::publish(1, &b"a"[..]).with_message_id(3);
        let result = msg.encode(MAX_PAYLOAD_SIZE);
        assert!(matches!(
            result,
            Err(ProtocolError::UnexpectedMessageId(Opcode::Pub))
        ));
    }

    #[test]
    fn test_payload_rejected_on_ping() {
        let msg = Message::ping().with_payload(&b"x"[..]);
        assert!(matches!(
            msg.encode(MAX_PAYLOAD_SIZE),
            Err(ProtocolError::UnexpectedPayload(Opcode::Ping))
        ));
    }

    #[test]
    fn test_channel_id_rejected_on_ping() {
        let msg = Message::ping().with_channel_id(5);
        assert!(matches!(
            msg.validate(MAX_PAYLOAD_SIZE),
            Err(ProtocolError::UnexpectedChannelId(Opcode::Ping))
        ));
        assert!(Message::unsubscribe(5).validate(MAX_PAYLOAD_SIZE).is_ok());
    }

    #[test]
    fn test_payload_too_large() {
        let msg = Message::publish(1, vec![0u8; 11]);
        assert!(matches!(
            msg.encode(10),
            Err(ProtocolError::PayloadTooLarge { size: 11, max: 10 })
        ));
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(Message::subscribe("a.b").channel_name().unwrap(), "a.b");
        assert!(Message::new(Opcode::Sub).channel_name().is_err());
        let bad = Message::new(Opcode::Sub).with_payload(vec![0xFF, 0xFE]);
        assert!(matches!(
            bad.channel_name(),
            Err(ProtocolError::InvalidChannelName(_))
        ));
    }

    #[test]
    fn test_error_parts() {
        let msg = Message::error(ErrorCode::ChannelNotFound, "channel 12 not found");
        let (code, text) = msg.error_parts();
        assert_eq!(code, Some(ErrorCode::ChannelNotFound));
        assert_eq!(text, "channel 12 not found");

        let msg = Message::new(Opcode::Err).with_payload(&b"something odd"[..]);
        let (code, text) = msg.error_parts();
        assert_eq!(code, None);
        assert_eq!(text, "something odd");
    }

    #[test]
    fn test_builder_echoes_name() {
        let name = b"orders";
        let mut builder = MessageBuilder::new(Opcode::InfoChannelId, name.len()).channel_id(42);
        assert_eq!(builder.write(name).unwrap(), 6);
        assert_eq!(builder.remaining(), 0);

        let msg = builder.build();
        assert_eq!(msg, Message::channel_info(42, "orders"));
    }

    #[test]
    fn test_builder_partial_and_full() {
        let mut builder = MessageBuilder::new(Opcode::Msg, 4);
        assert_eq!(builder.write(b"abcdef").unwrap(), 4);
        assert!(matches!(
            builder.write(b"g"),
            Err(ProtocolError::PayloadFull { capacity: 4 })
        ));
        assert_eq!(builder.write(b"").unwrap(), 0);
        assert_eq!(builder.build().payload().as_ref(), b"abcd");
    }
}
