//! Observability sink for broker events.
//!
//! Every drop, delivery and lifecycle transition in the broker is reported
//! through an [`EventSink`]. Sinks must not block: they are called from the
//! broadcaster and connection tasks, sometimes while a registry lock is held.

use crate::connection::ConnectionId;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use wirebus_protocol::{ErrorCode, Opcode};

/// Why a message was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The channel's inbound queue was full.
    ChannelQueueFull,
    /// A subscriber's outbound queue was full.
    ConnectionQueueFull,
    /// A subscriber's outbound queue was already closed.
    ConnectionClosed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::ChannelQueueFull => "channel_queue_full",
            DropReason::ConnectionQueueFull => "connection_queue_full",
            DropReason::ConnectionClosed => "connection_closed",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives broker events. All methods default to no-ops.
pub trait EventSink: Send + Sync {
    fn frame_received(&self, _opcode: Opcode) {}

    fn message_published(&self, _channel_id: u16) {}

    fn message_dropped(
        &self,
        _channel_id: u16,
        _connection: Option<ConnectionId>,
        _reason: DropReason,
    ) {
    }

    fn message_delivered(&self, _channel_id: u16, _subscribers: usize) {}

    fn channel_created(&self, _channel_id: u16, _name: &str) {}

    fn channel_reclaimed(&self, _channel_id: u16, _name: &str) {}

    fn connection_opened(&self, _connection: ConnectionId, _addr: SocketAddr) {}

    fn connection_closed(&self, _connection: ConnectionId, _addr: SocketAddr) {}

    fn protocol_error(&self, _connection: ConnectionId, _code: ErrorCode, _message: &str) {}
}

/// Logs events with `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn frame_received(&self, opcode: Opcode) {
        tracing::trace!(%opcode, "frame received");
    }

    fn message_dropped(&self, channel_id: u16, connection: Option<ConnectionId>, reason: DropReason) {
        match connection {
            Some(conn) => tracing::warn!(channel_id, %conn, %reason, "message dropped"),
            None => tracing::warn!(channel_id, %reason, "message dropped"),
        }
    }

    fn message_delivered(&self, channel_id: u16, subscribers: usize) {
        tracing::trace!(channel_id, subscribers, "message delivered");
    }

    fn channel_created(&self, channel_id: u16, name: &str) {
        tracing::debug!(channel_id, name, "channel created");
    }

    fn channel_reclaimed(&self, channel_id: u16, name: &str) {
        tracing::debug!(channel_id, name, "channel reclaimed");
    }

    fn connection_opened(&self, connection: ConnectionId, addr: SocketAddr) {
        tracing::info!(%connection, %addr, "client connected");
    }

    fn connection_closed(&self, connection: ConnectionId, addr: SocketAddr) {
        tracing::info!(%connection, %addr, "client disconnected");
    }

    fn protocol_error(&self, connection: ConnectionId, code: ErrorCode, message: &str) {
        tracing::debug!(%connection, %code, message, "protocol error");
    }
}

/// Forwards every event to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn frame_received(&self, opcode: Opcode) {
        for sink in &self.sinks {
            sink.frame_received(opcode);
        }
    }

    fn message_published(&self, channel_id: u16) {
        for sink in &self.sinks {
            sink.message_published(channel_id);
        }
    }

    fn message_dropped(&self, channel_id: u16, connection: Option<ConnectionId>, reason: DropReason) {
        for sink in &self.sinks {
            sink.message_dropped(channel_id, connection, reason);
        }
    }

    fn message_delivered(&self, channel_id: u16, subscribers: usize) {
        for sink in &self.sinks {
            sink.message_delivered(channel_id, subscribers);
        }
    }

    fn channel_created(&self, channel_id: u16, name: &str) {
        for sink in &self.sinks {
            sink.channel_created(channel_id, name);
        }
    }

    fn channel_reclaimed(&self, channel_id: u16, name: &str) {
        for sink in &self.sinks {
            sink.channel_reclaimed(channel_id, name);
        }
    }

    fn connection_opened(&self, connection: ConnectionId, addr: SocketAddr) {
        for sink in &self.sinks {
            sink.connection_opened(connection, addr);
        }
    }

    fn connection_closed(&self, connection: ConnectionId, addr: SocketAddr) {
        for sink in &self.sinks {
            sink.connection_closed(connection, addr);
        }
    }

    fn protocol_error(&self, connection: ConnectionId, code: ErrorCode, message: &str) {
        for sink in &self.sinks {
            sink.protocol_error(connection, code, message);
        }
    }
}

/// Sink that records events in memory, for tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub drops: parking_lot::Mutex<Vec<(u16, Option<ConnectionId>, DropReason)>>,
    pub created: parking_lot::Mutex<Vec<(u16, String)>>,
    pub reclaimed: parking_lot::Mutex<Vec<(u16, String)>>,
    pub errors: parking_lot::Mutex<Vec<(ConnectionId, ErrorCode)>>,
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn message_dropped(&self, channel_id: u16, connection: Option<ConnectionId>, reason: DropReason) {
        self.drops.lock().push((channel_id, connection, reason));
    }

    fn channel_created(&self, channel_id: u16, name: &str) {
        self.created.lock().push((channel_id, name.to_string()));
    }

    fn channel_reclaimed(&self, channel_id: u16, name: &str) {
        self.reclaimed.lock().push((channel_id, name.to_string()));
    }

    fn protocol_error(&self, connection: ConnectionId, code: ErrorCode, _message: &str) {
        self.errors.lock().push((connection, code));
    }
}
