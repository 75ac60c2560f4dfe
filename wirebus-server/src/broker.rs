//! Channel and connection registry.
//!
//! Lock order is broker, then channel, then connection. The registry lock is
//! never held across an await.

use crate::channel::Channel;
use crate::config::ChannelRetention;
use crate::connection::{Connection, ConnectionId};
use crate::error::BrokerError;
use crate::sink::{EventSink, TracingSink};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use wirebus_protocol::{Message, DEFAULT_QUEUE_CAPACITY};

/// Random draws made before falling back to a linear scan.
const RANDOM_ID_ATTEMPTS: usize = 64;

/// Number of distinct channel IDs.
const ID_SPACE: usize = u16::MAX as usize + 1;

/// Source of candidate channel IDs.
pub type IdSource = Box<dyn Fn() -> u16 + Send + Sync>;

/// Broker settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Capacity of each channel's inbound queue.
    pub channel_queue_capacity: usize,
    /// Channel lifetime policy.
    pub retention: ChannelRetention,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            channel_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retention: ChannelRetention::Forever,
        }
    }
}

#[derive(Default)]
struct ChannelMaps {
    by_name: HashMap<String, Arc<Channel>>,
    by_id: HashMap<u16, Arc<Channel>>,
}

/// Process-wide registry of channels and live connections.
pub struct Broker {
    config: BrokerConfig,
    channels: RwLock<ChannelMaps>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    sink: Arc<dyn EventSink>,
    id_source: IdSource,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    pub fn with_sink(config: BrokerConfig, sink: Arc<dyn EventSink>) -> Self {
        Self::with_id_source(config, sink, Box::new(rand::random::<u16>))
    }

    /// Creates a broker drawing candidate channel IDs from `id_source`.
    pub fn with_id_source(
        config: BrokerConfig,
        sink: Arc<dyn EventSink>,
        id_source: IdSource,
    ) -> Self {
        Self {
            config,
            channels: RwLock::new(ChannelMaps::default()),
            connections: DashMap::new(),
            sink,
            id_source,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    pub fn channel_by_name(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().by_name.get(name).cloned()
    }

    pub fn channel_by_id(&self, id: u16) -> Option<Arc<Channel>> {
        self.channels.read().by_id.get(&id).cloned()
    }

    /// Returns the channel named `name`, creating it if needed.
    ///
    /// Concurrent callers with the same name converge on one channel.
    pub fn get_or_create_channel(&self, name: &str) -> Result<Arc<Channel>, BrokerError> {
        if let Some(channel) = self.channel_by_name(name) {
            return Ok(channel);
        }
        let mut maps = self.channels.write();
        self.get_or_insert(&mut maps, name)
    }

    fn get_or_insert(&self, maps: &mut ChannelMaps, name: &str) -> Result<Arc<Channel>, BrokerError> {
        if let Some(channel) = maps.by_name.get(name) {
            return Ok(channel.clone());
        }

        let id = self.allocate_id(maps)?;
        let channel = Channel::spawn(
            id,
            name,
            self.config.channel_queue_capacity,
            self.sink.clone(),
        );
        maps.by_name.insert(name.to_string(), channel.clone());
        maps.by_id.insert(id, channel.clone());
        self.sink.channel_created(id, name);
        Ok(channel)
    }

    /// Picks an unused ID: random draws first, then a wrapping scan from a
    /// random start.
    fn allocate_id(&self, maps: &ChannelMaps) -> Result<u16, BrokerError> {
        for _ in 0..RANDOM_ID_ATTEMPTS {
            let id = (self.id_source)();
            if !maps.by_id.contains_key(&id) {
                return Ok(id);
            }
        }

        if maps.by_id.len() >= ID_SPACE {
            return Err(BrokerError::ChannelIdsExhausted);
        }

        let start = (self.id_source)();
        (0..=u16::MAX)
            .map(|offset| start.wrapping_add(offset))
            .find(|id| !maps.by_id.contains_key(id))
            .ok_or(BrokerError::ChannelIdsExhausted)
    }

    /// Subscribes a connection to the channel named `name`, creating it if
    /// needed, and links both directions.
    pub fn subscribe(&self, conn: &Connection, name: &str) -> Result<Arc<Channel>, BrokerError> {
        // Linking happens under the registry lock so a reclaim cannot remove
        // the channel between lookup and link.
        {
            let maps = self.channels.read();
            if let Some(channel) = maps.by_name.get(name) {
                Self::link(conn, channel)?;
                return Ok(channel.clone());
            }
        }

        let mut maps = self.channels.write();
        let channel = self.get_or_insert(&mut maps, name)?;
        if let Err(e) = Self::link(conn, &channel) {
            self.reclaim_locked(&mut maps, &channel);
            return Err(e);
        }
        Ok(channel)
    }

    fn link(conn: &Connection, channel: &Arc<Channel>) -> Result<(), BrokerError> {
        channel.add_subscriber(conn.subscriber());
        if !conn.attach(channel.clone()) {
            channel.remove_subscriber(conn.id());
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(())
    }

    /// Unsubscribes a connection from a channel.
    ///
    /// Returns `false` if the connection was not subscribed.
    pub fn unsubscribe(&self, conn: &Connection, channel_id: u16) -> bool {
        let Some(channel) = conn.detach(channel_id) else {
            return false;
        };
        channel.remove_subscriber(conn.id());
        self.maybe_reclaim(&channel);
        true
    }

    /// Registers a live connection.
    pub fn connect(&self, conn: Arc<Connection>) {
        self.sink.connection_opened(conn.id(), conn.addr());
        self.connections.insert(conn.id(), conn);
    }

    /// Removes a connection from the live set and from every channel it
    /// subscribes to. Runs at most once per connection.
    pub fn disconnect(&self, conn: &Connection) {
        let Some(channels) = conn.take_channels() else {
            return;
        };
        for channel in &channels {
            channel.remove_subscriber(conn.id());
            self.maybe_reclaim(channel);
        }
        if self.connections.remove(&conn.id()).is_some() {
            self.sink.connection_closed(conn.id(), conn.addr());
        }
    }

    fn maybe_reclaim(&self, channel: &Arc<Channel>) {
        if self.config.retention != ChannelRetention::ReclaimWhenEmpty || !channel.is_empty() {
            return;
        }
        let mut maps = self.channels.write();
        self.reclaim_locked(&mut maps, channel);
    }

    fn reclaim_locked(&self, maps: &mut ChannelMaps, channel: &Arc<Channel>) {
        if self.config.retention != ChannelRetention::ReclaimWhenEmpty {
            return;
        }
        // Re-checked under the write lock: no subscribe can link now.
        if !channel.is_empty() {
            return;
        }
        let registered = maps
            .by_id
            .get(&channel.id())
            .is_some_and(|c| Arc::ptr_eq(c, channel));
        if !registered {
            return;
        }
        maps.by_id.remove(&channel.id());
        maps.by_name.remove(channel.name());
        self.sink.channel_reclaimed(channel.id(), channel.name());
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| c.value().clone())
    }

    /// Starts teardown on every live connection, first queueing `farewell`
    /// to each one when given.
    pub fn close_all(&self, farewell: Option<Arc<Message>>) {
        for entry in self.connections.iter() {
            let conn = entry.value();
            if let Some(ref message) = farewell {
                let _ = conn.try_enqueue(message.clone());
            }
            conn.close();
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().by_id.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Returns `(id, name)` for every live channel.
    pub fn channel_names(&self) -> Vec<(u16, String)> {
        self.channels
            .read()
            .by_id
            .values()
            .map(|c| (c.id(), c.name().to_string()))
            .collect()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordingSink;
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU16, Ordering};

    fn connection() -> Arc<Connection> {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        Connection::new(addr, 16).0
    }

    fn reclaiming() -> BrokerConfig {
        BrokerConfig {
            retention: ChannelRetention::ReclaimWhenEmpty,
            ..Default::default()
        }
    }

    /// Membership is symmetric: a connection is in a channel's subscriber
    /// set iff the channel is in the connection's set.
    fn assert_symmetric(broker: &Broker, conns: &[Arc<Connection>]) {
        for (id, _) in broker.channel_names() {
            let channel = broker.channel_by_id(id).unwrap();
            for conn in conns {
                assert_eq!(
                    channel.has_subscriber(conn.id()),
                    conn.is_subscribed(id),
                    "channel {} / conn {}",
                    id,
                    conn.id()
                );
            }
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let broker = Broker::default();
        let a = broker.get_or_create_channel("orders").unwrap();
        let b = broker.get_or_create_channel("orders").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(broker.channel_count(), 1);
        assert!(Arc::ptr_eq(&broker.channel_by_id(a.id()).unwrap(), &a));
        assert!(broker.channel_by_name("missing").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_unique_ids() {
        let broker = Arc::new(Broker::default());
        let mut handles = Vec::new();
        for t in 0..8 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..250 {
                    // Each name is requested by two tasks.
                    let name = format!("ch-{}", (t / 2) * 250 + i);
                    broker.get_or_create_channel(&name).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let channels = broker.channel_names();
        assert_eq!(channels.len(), 1000);
        let ids: HashSet<u16> = channels.iter().map(|(id, _)| *id).collect();
        let names: HashSet<&str> = channels.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(ids.len(), 1000);
        assert_eq!(names.len(), 1000);
        for (id, name) in &channels {
            assert_eq!(broker.channel_by_name(name).unwrap().id(), *id);
        }
    }

    #[tokio::test]
    async fn test_forced_collisions_fall_back_to_scan() {
        // Always proposes 5, so every channel after the first needs the scan.
        let broker = Broker::with_id_source(
            BrokerConfig::default(),
            Arc::new(TracingSink),
            Box::new(|| 5),
        );
        let a = broker.get_or_create_channel("a").unwrap();
        let b = broker.get_or_create_channel("b").unwrap();
        let c = broker.get_or_create_channel("c").unwrap();
        assert_eq!(a.id(), 5);
        assert_eq!(b.id(), 6);
        assert_eq!(c.id(), 7);
    }

    #[tokio::test]
    async fn test_scan_wraps_around() {
        let broker = Broker::with_id_source(
            BrokerConfig::default(),
            Arc::new(TracingSink),
            Box::new(|| u16::MAX),
        );
        assert_eq!(broker.get_or_create_channel("a").unwrap().id(), u16::MAX);
        assert_eq!(broker.get_or_create_channel("b").unwrap().id(), 0);
    }

    #[tokio::test]
    async fn test_id_space_exhausted() {
        let next = Arc::new(AtomicU16::new(0));
        let source = next.clone();
        let broker = Broker::with_id_source(
            BrokerConfig {
                channel_queue_capacity: 1,
                ..Default::default()
            },
            Arc::new(TracingSink),
            Box::new(move || source.fetch_add(1, Ordering::Relaxed)),
        );
        for i in 0..ID_SPACE {
            broker.get_or_create_channel(&i.to_string()).unwrap();
        }
        assert_eq!(broker.channel_count(), ID_SPACE);
        assert!(matches!(
            broker.get_or_create_channel("one-too-many"),
            Err(BrokerError::ChannelIdsExhausted)
        ));
        // Existing names still resolve.
        assert!(broker.get_or_create_channel("0").is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_links_both_directions() {
        let broker = Broker::default();
        let a = connection();
        let b = connection();
        broker.connect(a.clone());
        broker.connect(b.clone());

        let ch_a = broker.subscribe(&a, "orders").unwrap();
        let ch_b = broker.subscribe(&b, "orders").unwrap();
        assert_eq!(ch_a.id(), ch_b.id());
        assert_eq!(ch_a.subscriber_count(), 2);
        assert_eq!(a.subscription_count(), 1);

        // Subscribing twice is harmless.
        broker.subscribe(&a, "orders").unwrap();
        assert_eq!(ch_a.subscriber_count(), 2);

        assert!(broker.unsubscribe(&a, ch_a.id()));
        assert!(!broker.unsubscribe(&a, ch_a.id()));
        assert!(!broker.unsubscribe(&a, 999));
        assert_symmetric(&broker, &[a, b]);
    }

    #[tokio::test]
    async fn test_membership_symmetry_after_mixed_operations() {
        let broker = Broker::new(reclaiming());
        let conns: Vec<_> = (0..4).map(|_| connection()).collect();
        for conn in &conns {
            broker.connect(conn.clone());
        }

        let names = ["a", "b", "c"];
        for (i, conn) in conns.iter().enumerate() {
            for name in &names[..=(i % 3)] {
                broker.subscribe(conn, name).unwrap();
            }
        }
        assert_symmetric(&broker, &conns);

        let a = broker.channel_by_name("a").unwrap().id();
        broker.unsubscribe(&conns[0], a);
        broker.disconnect(&conns[1]);
        assert_symmetric(&broker, &conns);

        broker.subscribe(&conns[1], "a").unwrap_err();
        broker.subscribe(&conns[2], "d").unwrap();
        assert_symmetric(&broker, &conns);
    }

    #[tokio::test]
    async fn test_disconnect_removes_everywhere() {
        let broker = Broker::default();
        let conn = connection();
        broker.connect(conn.clone());
        let a = broker.subscribe(&conn, "a").unwrap();
        let b = broker.subscribe(&conn, "b").unwrap();
        assert_eq!(broker.connection_count(), 1);

        broker.disconnect(&conn);
        assert_eq!(broker.connection_count(), 0);
        assert!(!a.has_subscriber(conn.id()));
        assert!(!b.has_subscriber(conn.id()));
        assert_eq!(conn.subscription_count(), 0);
        assert_eq!(a.fan_out(&Arc::new(Message::deliver(a.id(), &b"x"[..]))), 0);

        // Second disconnect is a no-op; forever retention keeps channels.
        broker.disconnect(&conn);
        assert_eq!(broker.channel_count(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_after_disconnect_is_refused() {
        let broker = Broker::default();
        let conn = connection();
        broker.connect(conn.clone());
        broker.disconnect(&conn);

        let err = broker.subscribe(&conn, "late").unwrap_err();
        assert!(matches!(err, BrokerError::ConnectionClosed));
        let channel = broker.channel_by_name("late").unwrap();
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_when_empty() {
        let sink = Arc::new(RecordingSink::default());
        let broker = Broker::with_sink(reclaiming(), sink.clone());
        let a = connection();
        let b = connection();

        let channel = broker.subscribe(&a, "orders").unwrap();
        broker.subscribe(&b, "orders").unwrap();
        let id = channel.id();

        broker.unsubscribe(&a, id);
        assert!(broker.channel_by_id(id).is_some());

        broker.disconnect(&b);
        assert!(broker.channel_by_id(id).is_none());
        assert!(broker.channel_by_name("orders").is_none());
        assert_eq!(
            sink.reclaimed.lock().as_slice(),
            &[(id, "orders".to_string())]
        );

        // The name can be reused for a fresh channel.
        let fresh = broker.subscribe(&a, "orders").unwrap();
        assert!(!Arc::ptr_eq(&fresh, &channel));
    }

    #[tokio::test]
    async fn test_failed_link_does_not_leak_channel_under_reclaim() {
        let broker = Broker::new(reclaiming());
        let conn = connection();
        broker.disconnect(&conn);
        assert!(broker.subscribe(&conn, "ghost").is_err());
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_forever_retention_keeps_empty_channels() {
        let broker = Broker::default();
        let conn = connection();
        let channel = broker.subscribe(&conn, "orders").unwrap();
        broker.unsubscribe(&conn, channel.id());
        assert!(broker.channel_by_id(channel.id()).is_some());
    }

    #[tokio::test]
    async fn test_close_all() {
        let broker = Broker::default();
        let a = connection();
        let b = connection();
        broker.connect(a.clone());
        broker.connect(b.clone());
        broker.close_all(Some(Arc::new(Message::ping())));
        assert!(!a.state().is_active());
        assert!(!b.state().is_active());
        assert!(broker.connection(a.id()).is_some());
    }
}
