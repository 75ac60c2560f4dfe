//! Broker and server error types.

use thiserror::Error;
use wirebus_protocol::{ErrorCode, Opcode};

/// Registry errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("channel {0} not found")]
    ChannelNotFound(u16),

    #[error("all channel ids are in use")]
    ChannelIdsExhausted,

    #[error("connection closed")]
    ConnectionClosed,
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] wirebus_protocol::ProtocolError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("no frame received within the keepalive window")]
    ReadTimeout,

    #[error("write timed out")]
    WriteTimeout,

    #[error("unexpected opcode from client: {0}")]
    UnexpectedOpcode(Opcode),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::Transport,
            ServerError::Protocol(e) => e.error_code(),
            ServerError::Broker(BrokerError::ChannelNotFound(_)) => ErrorCode::ChannelNotFound,
            ServerError::Broker(BrokerError::ChannelIdsExhausted) => ErrorCode::ChannelLimitReached,
            ServerError::Broker(BrokerError::ConnectionClosed) => ErrorCode::Transport,
            ServerError::ReadTimeout | ServerError::WriteTimeout => ErrorCode::Timeout,
            ServerError::UnexpectedOpcode(_) => ErrorCode::UnexpectedOpcode,
            ServerError::ShuttingDown => ErrorCode::ShuttingDown,
        }
    }

    /// Returns whether the connection is torn down after this error.
    pub fn is_fatal(&self) -> bool {
        self.error_code().is_fatal()
    }

    /// Returns whether the peer should be sent an ERR frame before closing.
    ///
    /// Transport failures leave nothing to report to.
    pub fn reports_to_peer(&self) -> bool {
        !matches!(
            self.error_code(),
            ErrorCode::Transport | ErrorCode::Timeout
        )
    }
}
