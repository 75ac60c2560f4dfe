//! Connection management.

use crate::error::ClientError;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use wirebus_protocol::message::parse_channel_name;
use wirebus_protocol::{
    Encoder, ErrorCode, FrameReader, Message, Opcode, DEFAULT_QUEUE_CAPACITY, MAX_PAYLOAD_SIZE,
};

/// Default interval between keepalive pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of the client event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Broker address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// How long to wait for a reply or for room in the outbound queue.
    pub request_timeout: Duration,
    /// Deadline for writing one frame to the socket.
    pub write_timeout: Duration,
    /// Keepalive ping interval. `None` disables the pinger.
    pub ping_interval: Option<Duration>,
    /// Largest payload accepted in either direction.
    pub max_payload: usize,
    /// Capacity of the outbound frame queue.
    pub queue_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            max_payload: MAX_PAYLOAD_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Something the broker pushed to this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A message delivered on a subscribed channel.
    Message {
        channel_id: u16,
        message_id: Option<u64>,
        payload: Bytes,
    },
    /// An ERR frame.
    Error {
        code: Option<ErrorCode>,
        text: String,
    },
    /// The connection ended.
    Closed,
}

type SubscribeReply = oneshot::Sender<Result<u16, ClientError>>;

/// Requests awaiting a reply, in the order their frames were queued.
///
/// The broker answers SUB and PING strictly in arrival order, so replies
/// are matched to the front of each queue. Channel info also echoes the
/// name, which lets a reply the broker dropped under backpressure be
/// detected. A `None` pong waiter belongs to the keepalive pinger.
#[derive(Default)]
struct Pending {
    subscribes: VecDeque<(String, SubscribeReply)>,
    pongs: VecDeque<Option<oneshot::Sender<Instant>>>,
}

struct Shared {
    pending: Mutex<Pending>,
    /// Serializes frames that expect a reply so queue order matches wire order.
    request_order: Mutex<()>,
    connected: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<ClientEvent>,
}

impl Shared {
    /// Marks the connection finished and wakes every waiter. Runs once.
    async fn finish(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut pending = self.pending.lock().await;
        tracing::debug!(
            subscribes = pending.subscribes.len(),
            pings = pending.pongs.len(),
            "dropping pending requests"
        );
        pending.subscribes.clear();
        pending.pongs.clear();
        drop(pending);
        let _ = self.events.send(ClientEvent::Closed);
    }
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    pinger: Option<JoinHandle<()>>,
}

/// A connection to a wirebus broker.
pub struct Connection {
    config: ConnectionConfig,
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    tasks: Mutex<Tasks>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            shared: Arc::new(Shared {
                pending: Mutex::new(Pending::default()),
                request_order: Mutex::new(()),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                events,
            }),
            outbound: Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Returns a receiver for broker-pushed events.
    ///
    /// Only events sent after this call are observed.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Connects to the broker and starts the background tasks.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut outbound = self.outbound.lock().await;
        if outbound.is_some() {
            return Ok(());
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ConnectionClosed);
        }

        tracing::debug!("connecting to {}", self.config.addr);
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| {
            tracing::debug!("connect timed out");
            ClientError::Timeout
        })??;

        // Frames are small and latency bound.
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        self.shared.connected.store(true, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().await;
        tasks.writer = Some(tokio::spawn(write_loop(
            write_half,
            rx,
            Encoder::new(self.config.max_payload),
            self.config.write_timeout,
            self.shared.clone(),
        )));
        tasks.reader = Some(tokio::spawn(read_loop(
            FrameReader::new(read_half, self.config.max_payload),
            self.shared.clone(),
            tx.downgrade(),
        )));
        if let Some(interval) = self.config.ping_interval {
            tasks.pinger = Some(tokio::spawn(ping_loop(
                self.shared.clone(),
                tx.downgrade(),
                interval,
            )));
        }
        *outbound = Some(tx);

        tracing::debug!("connected to {}", self.config.addr);
        Ok(())
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn sender(&self) -> Result<mpsc::Sender<Message>, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.outbound
            .lock()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    /// Queues a frame, waiting up to the request timeout for room.
    pub async fn send(&self, message: Message) -> Result<(), ClientError> {
        message.validate(self.config.max_payload)?;
        let sender = self.sender().await?;
        match tokio::time::timeout(self.config.request_timeout, sender.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Queues a frame without waiting.
    pub async fn try_send(&self, message: Message) -> Result<(), ClientError> {
        message.validate(self.config.max_payload)?;
        let sender = self.sender().await?;
        sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => ClientError::QueueFull,
            TrySendError::Closed(_) => ClientError::ConnectionClosed,
        })
    }

    /// Subscribes to a channel by name and waits for its ID.
    pub async fn subscribe(&self, name: &str) -> Result<u16, ClientError> {
        parse_channel_name(name.as_bytes())?;
        let message = Message::subscribe(name);
        let (tx, rx) = oneshot::channel();

        {
            let _order = self.shared.request_order.lock().await;
            self.shared
                .pending
                .lock()
                .await
                .subscribes
                .push_back((name.to_string(), tx));
            if let Err(e) = self.send(message).await {
                self.shared.pending.lock().await.subscribes.pop_back();
                return Err(e);
            }
        }
        tracing::debug!(name, "subscribe sent");

        // A timed-out waiter stays queued so later replies still line up.
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Sends a PING and returns the round-trip time.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let (tx, rx) = oneshot::channel();
        let sent_at = Instant::now();

        {
            let _order = self.shared.request_order.lock().await;
            self.shared.pending.lock().await.pongs.push_back(Some(tx));
            if let Err(e) = self.send(Message::ping()).await {
                self.shared.pending.lock().await.pongs.pop_back();
                return Err(e);
            }
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(received_at)) => Ok(received_at.saturating_duration_since(sent_at)),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Sends CLOSE, drains the outbound queue and stops the background tasks.
    pub async fn close(&self) -> Result<(), ClientError> {
        let Some(sender) = self.outbound.lock().await.take() else {
            return Ok(());
        };
        tracing::debug!("closing connection");

        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        if let Some(pinger) = tasks.pinger.take() {
            pinger.abort();
        }

        let _ = tokio::time::timeout(
            self.config.request_timeout,
            sender.send(Message::close("")),
        )
        .await;
        // The writer drains and shuts the socket down once the last sender is gone.
        drop(sender);
        if let Some(writer) = tasks.writer.take() {
            let _ = writer.await;
        }

        if let Some(mut reader) = tasks.reader.take() {
            if tokio::time::timeout(self.config.request_timeout, &mut reader)
                .await
                .is_err()
            {
                tracing::debug!("broker did not close the stream, aborting reader");
                reader.abort();
            }
        }

        self.shared.finish().await;
        Ok(())
    }

    /// Returns the number of requests waiting for a reply.
    pub async fn pending_count(&self) -> usize {
        let pending = self.shared.pending.lock().await;
        pending.subscribes.len() + pending.pongs.iter().filter(|p| p.is_some()).count()
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Message>,
    encoder: Encoder,
    write_timeout: Duration,
    shared: Arc<Shared>,
) {
    while let Some(message) = rx.recv().await {
        let frame = match encoder.encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(opcode = %message.opcode(), "dropping unencodable frame: {}", e);
                continue;
            }
        };
        match tokio::time::timeout(write_timeout, writer.write_all(&frame)).await {
            Ok(Ok(())) => tracing::trace!(opcode = %message.opcode(), "frame written"),
            Ok(Err(e)) => {
                tracing::debug!("write failed: {}", e);
                break;
            }
            Err(_) => {
                tracing::debug!("write timed out after {:?}", write_timeout);
                break;
            }
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
    let _ = writer.shutdown().await;
    tracing::debug!("writer stopped");
}

async fn read_loop(
    mut reader: FrameReader<OwnedReadHalf>,
    shared: Arc<Shared>,
    outbound: mpsc::WeakSender<Message>,
) {
    loop {
        let message = match reader.read_message().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!("broker closed the stream");
                break;
            }
            Err(e) => {
                tracing::debug!("read failed: {}", e);
                let _ = shared.events.send(ClientEvent::Error {
                    code: Some(e.error_code()),
                    text: e.to_string(),
                });
                break;
            }
        };
        dispatch(&shared, &outbound, message).await;
    }
    shared.finish().await;
}

async fn dispatch(shared: &Shared, outbound: &mpsc::WeakSender<Message>, message: Message) {
    match message.opcode() {
        Opcode::Msg => {
            let _ = shared.events.send(ClientEvent::Message {
                channel_id: message.channel_id(),
                message_id: message.message_id(),
                payload: message.payload().clone(),
            });
        }
        Opcode::InfoChannelId => {
            let channel_id = message.channel_id();
            let name = message.channel_name().unwrap_or_default();
            let mut pending = shared.pending.lock().await;
            let Some(pos) = pending
                .subscribes
                .iter()
                .position(|(expected, _)| expected == name)
            else {
                tracing::warn!(channel_id, name, "unsolicited channel info");
                return;
            };
            // Replies come in request order, so anything queued ahead of the
            // match lost its reply on the broker side.
            for (expected, reply) in pending.subscribes.drain(..pos) {
                tracing::debug!(name = %expected, "subscribe reply dropped by broker");
                let _ = reply.send(Err(ClientError::Broker(format!(
                    "no reply for subscribe to {:?}",
                    expected
                ))));
            }
            if let Some((_, reply)) = pending.subscribes.pop_front() {
                let _ = reply.send(Ok(channel_id));
            }
        }
        Opcode::Err => {
            let (code, text) = message.error_parts();
            tracing::debug!(?code, text = %text, "broker error");
            if code == Some(ErrorCode::ChannelLimitReached) {
                if let Some((_, reply)) = shared.pending.lock().await.subscribes.pop_front() {
                    let _ = reply.send(Err(ClientError::Broker(text.clone())));
                }
            }
            let _ = shared.events.send(ClientEvent::Error { code, text });
        }
        Opcode::Pong => {
            if let Some(Some(waiter)) = shared.pending.lock().await.pongs.pop_front() {
                let _ = waiter.send(Instant::now());
            }
        }
        Opcode::Ping => {
            if let Some(sender) = outbound.upgrade() {
                let _ = sender.try_send(Message::pong());
            }
        }
        Opcode::Close => tracing::debug!("broker sent close"),
        opcode => tracing::warn!(%opcode, "ignoring unexpected frame from broker"),
    }
}

async fn ping_loop(shared: Arc<Shared>, outbound: mpsc::WeakSender<Message>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(sender) = outbound.upgrade() else {
            break;
        };
        let _order = shared.request_order.lock().await;
        let mut pending = shared.pending.lock().await;
        pending.pongs.push_back(None);
        match sender.try_send(Message::ping()) {
            Ok(()) => tracing::trace!("keepalive ping queued"),
            Err(TrySendError::Full(_)) => {
                pending.pongs.pop_back();
                tracing::debug!("outbound queue full, skipping keepalive ping");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}
