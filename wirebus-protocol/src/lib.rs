//! # wirebus-protocol
//!
//! Wire protocol implementation for wirebus.
//!
//! This crate provides:
//! - The one-byte frame header (opcode + flag bits) and variable-length fields
//! - The `Message` value type and an incremental `MessageBuilder`
//! - A buffer based `Encoder` and `codec::decode`
//! - An async `FrameReader` that assembles frames field by field off a socket
//! - Error types and stable error codes

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod reader;

pub use codec::Encoder;
pub use error::{ErrorCode, ProtocolError};
pub use frame::{FrameFlags, FrameHeader, Opcode};
pub use message::{Message, MessageBuilder};
pub use reader::FrameReader;

/// Default port for the wirebus broker.
pub const DEFAULT_PORT: u16 = 7420;

/// Default maximum payload size (512 KiB).
pub const MAX_PAYLOAD_SIZE: usize = 512 * 1024;

/// Default capacity of channel inbound and connection outbound queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Initial size of the stream reader's buffer (4 KiB).
pub const READ_BUFFER_SIZE: usize = 4 * 1024;
