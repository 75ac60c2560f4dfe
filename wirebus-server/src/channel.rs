//! Channels and their broadcaster tasks.

use crate::connection::ConnectionId;
use crate::sink::{DropReason, EventSink};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use wirebus_protocol::Message;

/// Non-owning handle a channel holds for each subscribing connection.
#[derive(Clone)]
pub struct Subscriber {
    id: ConnectionId,
    sender: mpsc::Sender<Arc<Message>>,
}

impl Subscriber {
    pub fn new(id: ConnectionId, sender: mpsc::Sender<Arc<Message>>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

/// A named topic with a broker-assigned ID.
///
/// Published messages go onto a bounded inbound queue; a dedicated
/// broadcaster task pops them in order and hands each one to every current
/// subscriber without waiting. Full queues drop rather than block.
pub struct Channel {
    id: u16,
    name: String,
    inbound: mpsc::Sender<Arc<Message>>,
    subscribers: Mutex<HashMap<ConnectionId, Subscriber>>,
    sink: Arc<dyn EventSink>,
}

impl Channel {
    /// Creates a channel and starts its broadcaster.
    ///
    /// The broadcaster holds only a weak reference and exits once the
    /// channel is dropped. Must be called within a tokio runtime.
    pub fn spawn(
        id: u16,
        name: impl Into<String>,
        queue_capacity: usize,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let (inbound, rx) = mpsc::channel(queue_capacity);
        let channel = Arc::new(Self {
            id,
            name: name.into(),
            inbound,
            subscribers: Mutex::new(HashMap::new()),
            sink,
        });
        tokio::spawn(broadcast(Arc::downgrade(&channel), rx));
        channel
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a message for fan-out. Returns `false` if it was dropped.
    pub fn publish(&self, message: Message) -> bool {
        match self.inbound.try_send(Arc::new(message)) {
            Ok(()) => {
                self.sink.message_published(self.id);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.sink
                    .message_dropped(self.id, None, DropReason::ChannelQueueFull);
                false
            }
        }
    }

    /// Hands one message to every current subscriber.
    ///
    /// Returns the number of subscribers that accepted it.
    pub fn fan_out(&self, message: &Arc<Message>) -> usize {
        let targets: Vec<Subscriber> = self.subscribers.lock().values().cloned().collect();

        let mut delivered = 0;
        for target in &targets {
            match target.sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.sink.message_dropped(
                        self.id,
                        Some(target.id),
                        DropReason::ConnectionQueueFull,
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    self.sink.message_dropped(
                        self.id,
                        Some(target.id),
                        DropReason::ConnectionClosed,
                    );
                }
            }
        }
        self.sink.message_delivered(self.id, delivered);
        delivered
    }

    /// Adds a subscriber. Returns `false` if it was already present.
    pub(crate) fn add_subscriber(&self, subscriber: Subscriber) -> bool {
        self.subscribers
            .lock()
            .insert(subscriber.id, subscriber)
            .is_none()
    }

    /// Removes a subscriber. Returns `false` if it was not present.
    pub(crate) fn remove_subscriber(&self, id: ConnectionId) -> bool {
        self.subscribers.lock().remove(&id).is_some()
    }

    pub fn has_subscriber(&self, id: ConnectionId) -> bool {
        self.subscribers.lock().contains_key(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

async fn broadcast(channel: Weak<Channel>, mut rx: mpsc::Receiver<Arc<Message>>) {
    while let Some(message) = rx.recv().await {
        let Some(channel) = channel.upgrade() else {
            break;
        };
        channel.fan_out(&message);
    }
    tracing::trace!("broadcaster stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{RecordingSink, TracingSink};
    use std::time::Duration;

    fn subscriber(capacity: usize) -> (Subscriber, mpsc::Receiver<Arc<Message>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Subscriber::new(ConnectionId::new(), tx), rx)
    }

    async fn recv(rx: &mut mpsc::Receiver<Arc<Message>>) -> Arc<Message> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let channel = Channel::spawn(7, "orders", 16, Arc::new(TracingSink));
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (sub, rx) = subscriber(16);
            assert!(channel.add_subscriber(sub));
            receivers.push(rx);
        }
        assert_eq!(channel.subscriber_count(), 3);

        for payload in ["m1", "m2", "m3"] {
            assert!(channel.publish(Message::deliver(7, payload.as_bytes().to_vec())));
        }

        for rx in &mut receivers {
            for expected in ["m1", "m2", "m3"] {
                let message = recv(rx).await;
                assert_eq!(message.channel_id(), 7);
                assert_eq!(message.payload().as_ref(), expected.as_bytes());
            }
        }
    }

    #[tokio::test]
    async fn test_full_subscriber_queue_drops_for_that_subscriber_only() {
        let sink = Arc::new(RecordingSink::default());
        let channel = Channel::spawn(1, "t", 16, sink.clone());

        let (slow, _slow_rx) = subscriber(1);
        let slow_id = slow.id();
        let (fast, mut fast_rx) = subscriber(4);
        channel.add_subscriber(slow);
        channel.add_subscriber(fast);

        let first = Arc::new(Message::deliver(1, &b"1"[..]));
        let second = Arc::new(Message::deliver(1, &b"2"[..]));
        assert_eq!(channel.fan_out(&first), 2);
        assert_eq!(channel.fan_out(&second), 1);

        assert_eq!(recv(&mut fast_rx).await.payload().as_ref(), b"1");
        assert_eq!(recv(&mut fast_rx).await.payload().as_ref(), b"2");
        assert_eq!(
            sink.drops.lock().as_slice(),
            &[(1, Some(slow_id), DropReason::ConnectionQueueFull)]
        );
    }

    #[tokio::test]
    async fn test_publish_drops_when_inbound_full() {
        let sink = Arc::new(RecordingSink::default());
        // Current-thread runtime: the broadcaster cannot run until we yield.
        let channel = Channel::spawn(2, "t", 2, sink.clone());
        assert!(channel.publish(Message::deliver(2, &b"a"[..])));
        assert!(channel.publish(Message::deliver(2, &b"b"[..])));
        assert!(!channel.publish(Message::deliver(2, &b"c"[..])));
        assert_eq!(
            sink.drops.lock().as_slice(),
            &[(2, None, DropReason::ChannelQueueFull)]
        );
    }

    #[tokio::test]
    async fn test_removed_subscriber_receives_nothing() {
        let channel = Channel::spawn(3, "t", 16, Arc::new(TracingSink));
        let (sub, mut rx) = subscriber(4);
        let id = sub.id();
        channel.add_subscriber(sub);
        assert!(channel.has_subscriber(id));
        assert!(channel.remove_subscriber(id));
        assert!(!channel.remove_subscriber(id));
        assert!(channel.is_empty());

        assert_eq!(channel.fan_out(&Arc::new(Message::deliver(3, &b"x"[..]))), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcaster_exits_when_channel_dropped() {
        let channel = Channel::spawn(4, "t", 4, Arc::new(TracingSink));
        let weak = Arc::downgrade(&channel);
        drop(channel);
        tokio::task::yield_now().await;
        assert!(weak.upgrade().is_none());
    }
}
