//! High-level client API.

use crate::connection::{ClientEvent, Connection, ConnectionConfig};
use crate::error::ClientError;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use wirebus_protocol::Message;

/// High-level client for a wirebus broker.
pub struct Client {
    conn: Arc<Connection>,
    /// Channel IDs learned from the broker, by name.
    channels: Mutex<HashMap<String, u16>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Connects to the broker.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Sends CLOSE and shuts the connection down.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Returns a receiver for delivered messages, broker errors and the
    /// final `Closed` event.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.conn.events()
    }

    /// Subscribes to a channel and returns the ID the broker assigned it.
    pub async fn subscribe(&self, name: &str) -> Result<u16, ClientError> {
        let channel_id = self.conn.subscribe(name).await?;
        self.channels.lock().await.insert(name.to_string(), channel_id);
        tracing::debug!(name, channel_id, "subscribed");
        Ok(channel_id)
    }

    /// Unsubscribes from a channel by ID.
    pub async fn unsubscribe(&self, channel_id: u16) -> Result<(), ClientError> {
        self.conn.send(Message::unsubscribe(channel_id)).await?;
        self.channels.lock().await.retain(|_, id| *id != channel_id);
        Ok(())
    }

    /// Publishes a payload to a channel by ID.
    pub async fn publish(&self, channel_id: u16, payload: impl Into<Bytes>) -> Result<(), ClientError> {
        self.conn.send(Message::publish(channel_id, payload)).await
    }

    /// Publishes without waiting for room in the outbound queue.
    pub async fn try_publish(
        &self,
        channel_id: u16,
        payload: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        self.conn.try_send(Message::publish(channel_id, payload)).await
    }

    /// Publishes a payload to a channel by name.
    ///
    /// The first publish to an unknown name subscribes to it to learn the
    /// channel ID, so this client also receives its own messages there.
    pub async fn publish_to(&self, name: &str, payload: impl Into<Bytes>) -> Result<u16, ClientError> {
        let channel_id = self.channel_id(name).await?;
        self.publish(channel_id, payload).await?;
        Ok(channel_id)
    }

    /// Acknowledges a delivered message.
    pub async fn ack(&self, channel_id: u16, message_id: u64) -> Result<(), ClientError> {
        self.conn.send(Message::ack(channel_id, message_id)).await
    }

    /// Pings the broker and returns the round-trip time.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        self.conn.ping().await
    }

    /// Returns the cached ID for a channel name, subscribing if unknown.
    async fn channel_id(&self, name: &str) -> Result<u16, ClientError> {
        if let Some(id) = self.channels.lock().await.get(name) {
            return Ok(*id);
        }
        self.subscribe(name).await
    }

    /// Returns the channels this client has subscribed to.
    pub async fn subscriptions(&self) -> Vec<(String, u16)> {
        let mut subscriptions: Vec<_> = self
            .channels
            .lock()
            .await
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect();
        subscriptions.sort();
        subscriptions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use wirebus_server::{ChannelRetention, Server, ServerConfig};

    const WAIT: Duration = Duration::from_secs(2);

    async fn start(config: impl FnOnce(ServerConfig) -> ServerConfig) -> (Arc<Server>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(config(ServerConfig::new(addr))));
        let running = server.clone();
        tokio::spawn(async move { running.run_with_listener(listener).await });
        (server, addr)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let client = Client::new(
            ConnectionConfig::new(addr)
                .with_ping_interval(None)
                .with_request_timeout(WAIT),
        );
        client.connect().await.unwrap();
        client
    }

    async fn next_message(events: &mut broadcast::Receiver<ClientEvent>) -> (u16, Bytes) {
        loop {
            match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
                ClientEvent::Message {
                    channel_id,
                    payload,
                    ..
                } => return (channel_id, payload),
                ClientEvent::Closed => panic!("connection closed"),
                ClientEvent::Error { .. } => {}
            }
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_other_subscriber() {
        let (_server, addr) = start(|c| c).await;
        let alice = connect(addr).await;
        let bob = connect(addr).await;
        let mut bob_events = bob.events();

        let id = alice.subscribe("orders").await.unwrap();
        assert_eq!(bob.subscribe("orders").await.unwrap(), id);

        alice.publish(id, &b"X"[..]).await.unwrap();
        assert_eq!(
            next_message(&mut bob_events).await,
            (id, Bytes::from_static(b"X"))
        );
    }

    #[tokio::test]
    async fn test_publish_to_learns_channel_id() {
        let (server, addr) = start(|c| c).await;
        let publisher = connect(addr).await;
        let mut events = publisher.events();

        let id = publisher.publish_to("metrics", &b"1"[..]).await.unwrap();
        assert_eq!(server.broker().channel_by_name("metrics").unwrap().id(), id);
        assert_eq!(publisher.publish_to("metrics", &b"2"[..]).await.unwrap(), id);
        assert_eq!(
            publisher.subscriptions().await,
            vec![("metrics".to_string(), id)]
        );

        assert_eq!(next_message(&mut events).await.1.as_ref(), b"1");
        assert_eq!(next_message(&mut events).await.1.as_ref(), b"2");
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (server, addr) = start(|c| c).await;
        let client = connect(addr).await;
        let id = client.subscribe("orders").await.unwrap();
        client.unsubscribe(id).await.unwrap();
        assert!(client.subscriptions().await.is_empty());

        // The ping reply proves the broker handled the unsubscribe first.
        client.ping().await.unwrap();
        let channel = server.broker().channel_by_id(id).unwrap();
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_ack_and_ping() {
        let (_server, addr) = start(|c| c).await;
        let client = connect(addr).await;
        let id = client.subscribe("orders").await.unwrap();
        client.ack(id, 7).await.unwrap();
        assert!(client.ping().await.unwrap() < WAIT);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_publish_to_unknown_id_reports_error_and_closes() {
        let (_server, addr) = start(|c| c).await;
        let client = connect(addr).await;
        let mut events = client.events();

        client.publish(4242, &b"x"[..]).await.unwrap();
        match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            ClientEvent::Error { code, .. } => {
                assert_eq!(code, Some(wirebus_protocol::ErrorCode::ChannelNotFound))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap(),
            ClientEvent::Closed
        );
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_close_removes_connection_from_broker() {
        let (server, addr) = start(|mut c| {
            c.broker.retention = ChannelRetention::ReclaimWhenEmpty;
            c
        })
        .await;
        let client = connect(addr).await;
        client.subscribe("orders").await.unwrap();
        assert_eq!(server.broker().channel_count(), 1);

        client.close().await.unwrap();
        let deadline = tokio::time::Instant::now() + WAIT;
        while server.broker().connection_count() > 0 || server.broker().channel_count() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "broker kept state");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_oversized_publish_rejected_locally() {
        let (_server, addr) = start(|c| c).await;
        let client = Client::new(
            ConnectionConfig::new(addr)
                .with_ping_interval(None)
                .with_max_payload(8),
        );
        client.connect().await.unwrap();
        assert!(matches!(
            client.publish(1, vec![0u8; 9]).await,
            Err(ClientError::Protocol(_))
        ));
        assert!(client.is_connected());
    }
}
