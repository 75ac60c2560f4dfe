//! Protocol error types and error codes.

use crate::frame::Opcode;
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur while framing or reading messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),

    #[error("reserved bits set in frame header: {0:#010b}")]
    ReservedBitsSet(u8),

    #[error("message id not allowed for {0}")]
    UnexpectedMessageId(Opcode),

    #[error("{0} requires a message id")]
    MissingMessageId(Opcode),

    #[error("{0} does not carry a channel id")]
    UnexpectedChannelId(Opcode),

    #[error("{0} does not carry a payload")]
    UnexpectedPayload(Opcode),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: usize },

    #[error("truncated frame: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("payload full: capacity {capacity} bytes")]
    PayloadFull { capacity: usize },

    #[error("invalid channel name: {0}")]
    InvalidChannelName(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns the stable error code reported to peers for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            ProtocolError::Io(_) => ErrorCode::Transport,
            _ => ErrorCode::BadFrame,
        }
    }
}

/// Stable error codes carried at the start of `Err` frame payloads.
///
/// These codes are part of the protocol contract and must remain stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BadFrame,
    PayloadTooLarge,
    ChannelNotFound,
    ChannelLimitReached,
    UnexpectedOpcode,
    Transport,
    Timeout,
    ShuttingDown,
}

impl ErrorCode {
    const ALL: [ErrorCode; 8] = [
        ErrorCode::BadFrame,
        ErrorCode::PayloadTooLarge,
        ErrorCode::ChannelNotFound,
        ErrorCode::ChannelLimitReached,
        ErrorCode::UnexpectedOpcode,
        ErrorCode::Transport,
        ErrorCode::Timeout,
        ErrorCode::ShuttingDown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadFrame => "BAD_FRAME",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::ChannelNotFound => "CHANNEL_NOT_FOUND",
            ErrorCode::ChannelLimitReached => "CHANNEL_LIMIT_REACHED",
            ErrorCode::UnexpectedOpcode => "UNEXPECTED_OPCODE",
            ErrorCode::Transport => "TRANSPORT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Parses a code from its wire name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_str() == s)
    }

    /// Returns whether the connection is closed after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorCode::ChannelLimitReached)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
