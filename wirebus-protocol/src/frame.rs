//! Frame header and field layout.
//!
//! Every frame starts with a single header byte, followed by the fields its
//! opcode requires, in this fixed order:
//!
//! ```text
//! +--------------------------+----------------+----------------+--------+---------+
//! | opcode:5 | mid:1 | rsv:2 | channel_id u16 | message_id u64 | length | payload |
//! +--------------------------+----------------+----------------+--------+---------+
//! ```
//!
//! | opcode          | channel_id | message_id       | length + payload |
//! |-----------------|------------|------------------|------------------|
//! | CLOSE           |            |                  | yes              |
//! | ERR             |            |                  | yes              |
//! | SUB             |            |                  | yes              |
//! | UNSUB           | yes        |                  |                  |
//! | PING, PONG      |            |                  |                  |
//! | PUB             | yes        |                  | yes              |
//! | MSG             | yes        | if flag set      | yes              |
//! | ACK             | yes        | if flag set      |                  |
//! | INFO_CHANNEL_ID | yes        |                  | yes              |
//!
//! The length field is one byte for values up to 253, `254` followed by a
//! big-endian `u16`, or `255` followed by a big-endian `u32`.

use crate::error::ProtocolError;
use bytes::BufMut;
use std::fmt;

/// Length marker announcing a `u16` length.
pub const LENGTH_U16_MARKER: u8 = 254;

/// Length marker announcing a `u32` length.
pub const LENGTH_U32_MARKER: u8 = 255;

/// Size of the channel ID field.
pub const CHANNEL_ID_SIZE: usize = 2;

/// Size of the message ID field.
pub const MESSAGE_ID_SIZE: usize = 8;

/// Frame operation discriminator, stored in the top five bits of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Close = 0x00,
    Err = 0x08,
    Sub = 0x10,
    Unsub = 0x18,
    Ping = 0x20,
    Pong = 0x28,
    Pub = 0x30,
    Msg = 0x38,
    Ack = 0x40,
    InfoChannelId = 0x48,
}

impl Opcode {
    /// Header bits holding the opcode.
    pub const MASK: u8 = 0b1111_1000;

    pub const ALL: [Opcode; 10] = [
        Opcode::Close,
        Opcode::Err,
        Opcode::Sub,
        Opcode::Unsub,
        Opcode::Ping,
        Opcode::Pong,
        Opcode::Pub,
        Opcode::Msg,
        Opcode::Ack,
        Opcode::InfoChannelId,
    ];

    /// Resolves the opcode from a header byte. Flag bits are ignored.
    pub fn from_header(byte: u8) -> Result<Self, ProtocolError> {
        let bits = byte & Self::MASK;
        Self::ALL
            .into_iter()
            .find(|op| op.bits() == bits)
            .ok_or(ProtocolError::InvalidOpcode(bits))
    }

    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Whether frames with this opcode carry a channel ID.
    pub fn has_channel_id(self) -> bool {
        matches!(
            self,
            Opcode::Unsub | Opcode::Pub | Opcode::Msg | Opcode::Ack | Opcode::InfoChannelId
        )
    }

    /// Whether frames with this opcode may carry a message ID.
    pub fn allows_message_id(self) -> bool {
        matches!(self, Opcode::Msg | Opcode::Ack)
    }

    /// Whether frames with this opcode carry a length-prefixed payload.
    pub fn has_payload(self) -> bool {
        matches!(
            self,
            Opcode::Sub
                | Opcode::Close
                | Opcode::Err
                | Opcode::Pub
                | Opcode::Msg
                | Opcode::InfoChannelId
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::Close => "CLOSE",
            Opcode::Err => "ERR",
            Opcode::Sub => "SUB",
            Opcode::Unsub => "UNSUB",
            Opcode::Ping => "PING",
            Opcode::Pong => "PONG",
            Opcode::Pub => "PUB",
            Opcode::Msg => "MSG",
            Opcode::Ack => "ACK",
            Opcode::InfoChannelId => "INFO_CHANNEL_ID",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flag bits in the low three bits of the header byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// A message ID field follows the channel ID.
    pub const MESSAGE_ID: u8 = 1 << 2;
    /// Reserved, must be zero.
    pub const RSV2: u8 = 1 << 1;
    /// Reserved, must be zero.
    pub const RSV1: u8 = 1 << 0;

    const RESERVED_MASK: u8 = Self::RSV1 | Self::RSV2;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_message_id(mut self) -> Self {
        self.0 |= Self::MESSAGE_ID;
        self
    }

    pub fn has_message_id(&self) -> bool {
        self.0 & Self::MESSAGE_ID != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Extracts the flags from a header byte, rejecting set reserved bits.
    pub fn from_header(byte: u8) -> Result<Self, ProtocolError> {
        let bits = byte & !Opcode::MASK;
        if bits & Self::RESERVED_MASK != 0 {
            return Err(ProtocolError::ReservedBitsSet(bits));
        }
        Ok(Self(bits))
    }
}

/// A parsed header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: Opcode,
    pub flags: FrameFlags,
}

impl FrameHeader {
    pub fn new(opcode: Opcode, flags: FrameFlags) -> Self {
        Self { opcode, flags }
    }

    /// Parses a header byte.
    ///
    /// The opcode is validated before the reserved bits, and a message ID
    /// flag is only accepted on opcodes that allow one.
    pub fn parse(byte: u8) -> Result<Self, ProtocolError> {
        let opcode = Opcode::from_header(byte)?;
        let flags = FrameFlags::from_header(byte)?;
        if flags.has_message_id() && !opcode.allows_message_id() {
            return Err(ProtocolError::UnexpectedMessageId(opcode));
        }
        Ok(Self { opcode, flags })
    }

    pub fn to_byte(self) -> u8 {
        self.opcode.bits() | self.flags.bits()
    }

    /// Returns which fields follow this header.
    ///
    /// Both the buffer decoder and the stream reader walk this layout, so the
    /// field grammar lives in one place.
    pub fn layout(&self) -> Result<FrameLayout, ProtocolError> {
        let message_id = self.flags.has_message_id();
        if self.opcode == Opcode::Ack && !message_id {
            return Err(ProtocolError::MissingMessageId(self.opcode));
        }
        Ok(FrameLayout {
            channel_id: self.opcode.has_channel_id(),
            message_id,
            payload: self.opcode.has_payload(),
        })
    }
}

/// Fields present after a header byte, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub channel_id: bool,
    pub message_id: bool,
    pub payload: bool,
}

/// Returns how many bytes follow a length marker.
pub fn length_extension(marker: u8) -> usize {
    match marker {
        LENGTH_U16_MARKER => 2,
        LENGTH_U32_MARKER => 4,
        _ => 0,
    }
}

/// Decodes a length from its marker and the `length_extension(marker)`
/// bytes that followed it.
pub fn decode_length(marker: u8, extension: &[u8]) -> u64 {
    if extension.is_empty() {
        return marker as u64;
    }
    extension
        .iter()
        .fold(0, |len, byte| (len << 8) | u64::from(*byte))
}

/// Returns the number of bytes the length prefix for `len` occupies.
pub fn length_prefix_size(len: usize) -> usize {
    if len < LENGTH_U16_MARKER as usize {
        1
    } else if len <= u16::MAX as usize {
        3
    } else {
        5
    }
}

/// Writes the length prefix for `len`, selecting the shortest encoding.
///
/// Callers must have checked `len <= u32::MAX`.
pub fn put_length(buf: &mut impl BufMut, len: usize) {
    if len < LENGTH_U16_MARKER as usize {
        buf.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        buf.put_u8(LENGTH_U16_MARKER);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(LENGTH_U32_MARKER);
        buf.put_u32(len as u32);
    }
}

/// Checks a decoded length against the payload ceiling.
pub fn check_length(len: u64, max: usize) -> Result<usize, ProtocolError> {
    if len > max as u64 {
        return Err(ProtocolError::PayloadTooLarge { size: len, max });
    }
    Ok(len as usize)
}
