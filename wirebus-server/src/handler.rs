//! Inbound frame dispatch.

use crate::broker::Broker;
use crate::connection::Connection;
use crate::error::{BrokerError, ServerError};
use crate::sink::DropReason;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::time::Instant;
use wirebus_protocol::{ErrorCode, FrameReader, Message, MessageBuilder, Opcode};

/// What the read loop does after a frame has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The peer proved liveness; extend the read deadline.
    KeepAlive,
    /// The peer sent CLOSE.
    Close,
}

/// Handles frames read from one connection.
pub struct FrameHandler {
    broker: Arc<Broker>,
    conn: Arc<Connection>,
    keepalive: Duration,
}

impl FrameHandler {
    pub fn new(broker: Arc<Broker>, conn: Arc<Connection>, keepalive: Duration) -> Self {
        Self {
            broker,
            conn,
            keepalive,
        }
    }

    /// Reads and dispatches frames until the peer closes, the connection
    /// leaves `Active`, or a fatal error occurs.
    ///
    /// `accepted_at` starts the first keepalive window.
    pub async fn run<R>(&self, reader: &mut FrameReader<R>, accepted_at: Instant) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut state = self.conn.watch_state();
        let mut deadline = accepted_at + self.keepalive;

        loop {
            let read = tokio::select! {
                biased;

                _ = state.wait_for(|s| !s.is_active()) => return Ok(()),
                read = tokio::time::timeout_at(deadline, reader.read_message()) => read,
            };

            let message = match read {
                Ok(result) => result?,
                Err(_) => return Err(ServerError::ReadTimeout),
            };
            let Some(message) = message else {
                tracing::debug!(conn = %self.conn.id(), "peer closed stream");
                return Ok(());
            };

            match self.dispatch(message).await? {
                Flow::Continue => {}
                Flow::KeepAlive => deadline = Instant::now() + self.keepalive,
                Flow::Close => return Ok(()),
            }
        }
    }

    /// Handles one inbound message.
    pub async fn dispatch(&self, message: Message) -> Result<Flow, ServerError> {
        let opcode = message.opcode();
        self.broker.sink().frame_received(opcode);
        tracing::trace!(conn = %self.conn.id(), %opcode, channel_id = message.channel_id(), "frame");

        match opcode {
            Opcode::Sub => self.handle_subscribe(&message).await,
            Opcode::Unsub => {
                self.broker.unsubscribe(&self.conn, message.channel_id());
                Ok(Flow::Continue)
            }
            Opcode::Ping => {
                self.reply(Message::pong(), 0)?;
                Ok(Flow::KeepAlive)
            }
            Opcode::Pong => Ok(Flow::KeepAlive),
            Opcode::Pub => self.handle_publish(message),
            Opcode::Ack => {
                // Validated only; nothing is redelivered.
                let channel_id = message.channel_id();
                if self.broker.channel_by_id(channel_id).is_none() {
                    return Err(BrokerError::ChannelNotFound(channel_id).into());
                }
                Ok(Flow::Continue)
            }
            Opcode::Close => {
                if !message.payload().is_empty() {
                    tracing::debug!(
                        conn = %self.conn.id(),
                        reason = %String::from_utf8_lossy(message.payload()),
                        "peer sent close"
                    );
                }
                Ok(Flow::Close)
            }
            Opcode::Err | Opcode::Msg | Opcode::InfoChannelId => {
                Err(ServerError::UnexpectedOpcode(opcode))
            }
        }
    }

    async fn handle_subscribe(&self, message: &Message) -> Result<Flow, ServerError> {
        let name = message.channel_name()?;

        let channel = match self.broker.subscribe(&self.conn, name) {
            Ok(channel) => channel,
            Err(e @ BrokerError::ChannelIdsExhausted) => {
                tracing::warn!(conn = %self.conn.id(), name, "cannot create channel: {}", e);
                let reply = Message::error(ErrorCode::ChannelLimitReached, &e.to_string());
                self.reply(reply, 0)?;
                return Ok(Flow::Continue);
            }
            Err(e) => return Err(e.into()),
        };

        let mut reply =
            MessageBuilder::new(Opcode::InfoChannelId, name.len()).channel_id(channel.id());
        reply.write(name.as_bytes())?;
        self.reply(reply.build(), channel.id())?;
        Ok(Flow::Continue)
    }

    /// Queues a reply to this connection without waiting.
    ///
    /// A full outbound queue drops the reply and reports it; the read task
    /// never waits on the writer.
    fn reply(&self, message: Message, channel_id: u16) -> Result<(), ServerError> {
        match self.conn.try_enqueue(Arc::new(message)) {
            Ok(()) => Ok(()),
            Err(DropReason::ConnectionClosed) => Err(BrokerError::ConnectionClosed.into()),
            Err(reason) => {
                self.broker
                    .sink()
                    .message_dropped(channel_id, Some(self.conn.id()), reason);
                Ok(())
            }
        }
    }

    fn handle_publish(&self, message: Message) -> Result<Flow, ServerError> {
        let channel_id = message.channel_id();
        let channel = self
            .broker
            .channel_by_id(channel_id)
            .ok_or(BrokerError::ChannelNotFound(channel_id))?;
        channel.publish(Message::deliver(channel_id, message.payload().clone()));
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::sink::{RecordingSink, TracingSink};
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn setup() -> (FrameHandler, Arc<Broker>, Arc<Connection>, mpsc::Receiver<Arc<Message>>) {
        let broker = Arc::new(Broker::with_sink(BrokerConfig::default(), Arc::new(TracingSink)));
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let (conn, rx) = Connection::new(addr, 16);
        broker.connect(conn.clone());
        let handler = FrameHandler::new(broker.clone(), conn.clone(), Duration::from_secs(30));
        (handler, broker, conn, rx)
    }

    #[tokio::test]
    async fn test_subscribe_replies_with_channel_info() {
        let (handler, broker, conn, mut rx) = setup();
        let flow = handler.dispatch(Message::subscribe("orders")).await.unwrap();
        assert_eq!(flow, Flow::Continue);

        let reply = rx.recv().await.unwrap();
        let channel = broker.channel_by_name("orders").unwrap();
        assert_eq!(reply.opcode(), Opcode::InfoChannelId);
        assert_eq!(reply.channel_id(), channel.id());
        assert_eq!(reply.channel_name().unwrap(), "orders");
        assert!(conn.is_subscribed(channel.id()));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_empty_name() {
        let (handler, _, _, _rx) = setup();
        let err = handler
            .dispatch(Message::new(Opcode::Sub))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::BadFrame);
    }

    #[tokio::test]
    async fn test_ping_replies_pong_and_keeps_alive() {
        let (handler, _, _, mut rx) = setup();
        assert_eq!(
            handler.dispatch(Message::ping()).await.unwrap(),
            Flow::KeepAlive
        );
        assert_eq!(rx.recv().await.unwrap().opcode(), Opcode::Pong);
        assert_eq!(
            handler.dispatch(Message::pong()).await.unwrap(),
            Flow::KeepAlive
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reply_dropped_when_outbound_queue_full() {
        let sink = Arc::new(RecordingSink::default());
        let broker = Arc::new(Broker::with_sink(BrokerConfig::default(), sink.clone()));
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let (conn, mut rx) = Connection::new(addr, 1);
        broker.connect(conn.clone());
        let handler = FrameHandler::new(broker.clone(), conn.clone(), Duration::from_secs(30));

        // Nothing drains the queue, so the second reply has nowhere to go.
        let dispatch = handler.dispatch(Message::ping());
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), dispatch)
                .await
                .unwrap()
                .unwrap(),
            Flow::KeepAlive
        );
        let dispatch = handler.dispatch(Message::subscribe("orders"));
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), dispatch)
                .await
                .unwrap()
                .unwrap(),
            Flow::Continue
        );

        let channel = broker.channel_by_name("orders").unwrap();
        assert!(conn.is_subscribed(channel.id()));
        assert_eq!(
            sink.drops.lock().clone(),
            vec![(channel.id(), Some(conn.id()), DropReason::ConnectionQueueFull)]
        );
        assert_eq!(rx.recv().await.unwrap().opcode(), Opcode::Pong);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_to_unknown_channel_is_fatal() {
        let (handler, _, _, _rx) = setup();
        let err = handler
            .dispatch(Message::publish(42, &b"x"[..]))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ChannelNotFound);
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_publish_delivers_to_subscriber() {
        let (handler, _, _, mut rx) = setup();
        handler.dispatch(Message::subscribe("orders")).await.unwrap();
        let info = rx.recv().await.unwrap();

        handler
            .dispatch(Message::publish(info.channel_id(), &b"X"[..]))
            .await
            .unwrap();
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.opcode(), Opcode::Msg);
        assert_eq!(delivered.channel_id(), info.channel_id());
        assert_eq!(delivered.payload().as_ref(), b"X");
    }

    #[tokio::test]
    async fn test_ack_validates_channel() {
        let (handler, broker, _, _rx) = setup();
        let channel = broker.get_or_create_channel("orders").unwrap();
        assert_eq!(
            handler
                .dispatch(Message::ack(channel.id(), 1))
                .await
                .unwrap(),
            Flow::Continue
        );
        let missing = channel.id().wrapping_add(1);
        let err = handler
            .dispatch(Message::ack(missing, 1))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ChannelNotFound);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_noop() {
        let (handler, _, _, _rx) = setup();
        assert_eq!(
            handler.dispatch(Message::unsubscribe(9)).await.unwrap(),
            Flow::Continue
        );
    }

    #[tokio::test]
    async fn test_server_opcodes_from_client_rejected() {
        let (handler, _, _, _rx) = setup();
        for message in [
            Message::deliver(1, &b"x"[..]),
            Message::error(ErrorCode::BadFrame, "x"),
            Message::channel_info(1, "x"),
        ] {
            let err = handler.dispatch(message).await.unwrap_err();
            assert_eq!(err.error_code(), ErrorCode::UnexpectedOpcode);
        }
    }

    #[tokio::test]
    async fn test_close_ends_loop() {
        let (handler, _, _, _rx) = setup();
        assert_eq!(
            handler.dispatch(Message::close("bye")).await.unwrap(),
            Flow::Close
        );
    }

    #[tokio::test]
    async fn test_run_times_out_without_keepalive() {
        let (handler, _, _, _rx) = setup();
        let handler = FrameHandler {
            keepalive: Duration::from_millis(50),
            ..handler
        };
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, wirebus_protocol::MAX_PAYLOAD_SIZE);
        let err = handler.run(&mut reader, Instant::now()).await.unwrap_err();
        assert!(matches!(err, ServerError::ReadTimeout));
    }

    #[tokio::test]
    async fn test_run_stops_when_connection_closes() {
        let (handler, _, conn, _rx) = setup();
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, wirebus_protocol::MAX_PAYLOAD_SIZE);
        conn.close();
        handler.run(&mut reader, Instant::now()).await.unwrap();
    }
}
