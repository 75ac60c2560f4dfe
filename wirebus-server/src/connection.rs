//! Per-socket connection state.
//!
//! A connection owns a bounded outbound queue drained by its write task, the
//! set of channels it subscribes to, and a lifecycle state that moves
//! `Active -> Closing -> Closed` exactly once.

use crate::channel::{Channel, Subscriber};
use crate::error::ServerError;
use crate::sink::DropReason;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;
use wirebus_protocol::Message;

/// Unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }
}

struct Membership {
    /// Cleared once teardown has started; no channel may be attached after.
    open: bool,
    channels: HashMap<u16, Arc<Channel>>,
}

/// A live client connection.
pub struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    outbound: mpsc::Sender<Arc<Message>>,
    membership: Mutex<Membership>,
    state: watch::Sender<ConnectionState>,
}

impl Connection {
    /// Creates a connection and the receiving end of its outbound queue.
    pub fn new(addr: SocketAddr, queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<Message>>) {
        let (outbound, rx) = mpsc::channel(queue_capacity);
        let (state, _) = watch::channel(ConnectionState::Active);
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            addr,
            outbound,
            membership: Mutex::new(Membership {
                open: true,
                channels: HashMap::new(),
            }),
            state,
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Returns the handle a channel uses to deliver to this connection.
    pub fn subscriber(&self) -> Subscriber {
        Subscriber::new(self.id, self.outbound.clone())
    }

    /// Enqueues a message without waiting.
    pub fn try_enqueue(&self, message: Arc<Message>) -> Result<(), DropReason> {
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => DropReason::ConnectionQueueFull,
            TrySendError::Closed(_) => DropReason::ConnectionClosed,
        })
    }

    /// Records a subscription. Refused once teardown has started.
    pub(crate) fn attach(&self, channel: Arc<Channel>) -> bool {
        let mut membership = self.membership.lock();
        if !membership.open {
            return false;
        }
        membership.channels.insert(channel.id(), channel);
        true
    }

    /// Removes a subscription, returning the channel if it was present.
    pub(crate) fn detach(&self, channel_id: u16) -> Option<Arc<Channel>> {
        self.membership.lock().channels.remove(&channel_id)
    }

    /// Closes membership and takes every subscribed channel.
    ///
    /// Returns `None` if membership was already closed, so teardown runs once.
    pub(crate) fn take_channels(&self) -> Option<Vec<Arc<Channel>>> {
        let mut membership = self.membership.lock();
        if !membership.open {
            return None;
        }
        membership.open = false;
        Some(
            std::mem::take(&mut membership.channels)
                .into_values()
                .collect(),
        )
    }

    pub fn is_subscribed(&self, channel_id: u16) -> bool {
        self.membership.lock().channels.contains_key(&channel_id)
    }

    /// Returns the IDs of all subscribed channels.
    pub fn channel_ids(&self) -> Vec<u16> {
        self.membership.lock().channels.keys().copied().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.membership.lock().channels.len()
    }

    /// Starts teardown. Returns `true` for the call that moved the state out
    /// of `Active`.
    pub fn close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_active() {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn mark_closed(&self) {
        self.state.send_replace(ConnectionState::Closed);
    }

    /// Drains the outbound queue to `writer` until the connection leaves
    /// `Active`, then flushes what is queued within one write timeout and
    /// shuts the writer down.
    ///
    /// A write failure or timeout closes the connection.
    pub(crate) async fn run_writer<W>(
        self: Arc<Self>,
        mut writer: W,
        mut rx: mpsc::Receiver<Arc<Message>>,
        write_timeout: Duration,
        max_payload: usize,
    ) where
        W: AsyncWrite + Unpin,
    {
        let mut state = self.watch_state();
        let mut buf = BytesMut::with_capacity(wirebus_protocol::READ_BUFFER_SIZE);

        let result = loop {
            tokio::select! {
                biased;

                message = rx.recv() => {
                    let Some(message) = message else { break Ok(()) };
                    if let Err(e) = write_frame(&mut writer, &mut buf, &message, write_timeout, max_payload).await {
                        break Err(e);
                    }
                }
                _ = async { let _ = state.wait_for(|s| !s.is_active()).await; } => break Ok(()),
            }
        };

        match result {
            Ok(()) => {
                let drain = async {
                    while let Ok(message) = rx.try_recv() {
                        write_frame(&mut writer, &mut buf, &message, write_timeout, max_payload)
                            .await?;
                    }
                    Ok::<(), ServerError>(())
                };
                match tokio::time::timeout(write_timeout, drain).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!(conn = %self.id, "drain failed: {}", e),
                    Err(_) => tracing::debug!(conn = %self.id, "drain timed out"),
                }
            }
            Err(e) => {
                tracing::debug!(conn = %self.id, "write failed: {}", e);
                self.close();
            }
        }

        let _ = tokio::time::timeout(write_timeout, writer.shutdown()).await;
    }
}

async fn write_frame<W>(
    writer: &mut W,
    buf: &mut BytesMut,
    message: &Message,
    write_timeout: Duration,
    max_payload: usize,
) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    buf.clear();
    if let Err(e) = message.encode_into(buf, max_payload) {
        tracing::warn!(opcode = %message.opcode(), "dropping unencodable message: {}", e);
        return Ok(());
    }
    match tokio::time::timeout(write_timeout, writer.write_all(buf)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ServerError::WriteTimeout),
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}
