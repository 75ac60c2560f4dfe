//! TCP server implementation.

use crate::broker::{Broker, BrokerConfig};
use crate::config::Config;
use crate::connection::Connection;
use crate::error::ServerError;
use crate::handler::FrameHandler;
use crate::metrics::Metrics;
use crate::sink::{EventSink, FanoutSink, TracingSink};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::Instant;
use wirebus_protocol::{
    ErrorCode, FrameReader, Message, DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY, MAX_PAYLOAD_SIZE,
};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Read deadline extension granted by each PING or PONG.
    pub keepalive: Duration,
    /// Per-frame write deadline.
    pub write_timeout: Duration,
    /// Maximum payload size.
    pub max_payload: usize,
    /// Capacity of each connection's outbound queue.
    pub connection_queue_capacity: usize,
    /// Registry settings.
    pub broker: BrokerConfig,
    /// Where broker events are reported.
    pub sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("keepalive", &self.keepalive)
            .field("write_timeout", &self.write_timeout)
            .field("max_payload", &self.max_payload)
            .field("connection_queue_capacity", &self.connection_queue_capacity)
            .field("broker", &self.broker)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_connections: 10_000,
            keepalive: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            max_payload: MAX_PAYLOAD_SIZE,
            connection_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            broker: BrokerConfig::default(),
            sink: Arc::new(TracingSink),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the server configuration from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            max_connections: config.network.max_connections,
            keepalive: config.network.keepalive(),
            write_timeout: config.network.write_timeout(),
            max_payload: config.limits.max_payload_size,
            connection_queue_capacity: config.limits.connection_queue_capacity,
            broker: BrokerConfig {
                channel_queue_capacity: config.limits.channel_queue_capacity,
                retention: config.channels.retention,
            },
            sink: Arc::new(TracingSink),
        }
    }

    /// Sets the event sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Reports events to `metrics` as well as the log.
    pub fn with_metrics(self, metrics: Arc<Metrics>) -> Self {
        let sink = FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(metrics);
        self.with_sink(Arc::new(sink))
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP server for the wirebus broker.
pub struct Server {
    config: ServerConfig,
    broker: Arc<Broker>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        let broker = Arc::new(Broker::with_sink(config.broker.clone(), config.sink.clone()));
        Self::with_broker(config, broker)
    }

    /// Creates a server around an existing broker.
    pub fn with_broker(config: ServerConfig, broker: Arc<Broker>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            broker,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Runs the accept loop on an already bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let accepted_at = Instant::now();
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let broker = self.broker.clone();
                            let stats = self.stats.clone();
                            let config = self.config.clone();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    stream,
                                    addr,
                                    accepted_at,
                                    broker,
                                    &config,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Serves one connection until it is torn down.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        accepted_at: Instant,
        broker: Arc<Broker>,
        config: &ServerConfig,
    ) -> Result<(), ServerError> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
        }

        let (conn, outbound) = Connection::new(addr, config.connection_queue_capacity);
        broker.connect(conn.clone());

        let (read_half, write_half) = stream.into_split();
        let writer = tokio::spawn(conn.clone().run_writer(
            write_half,
            outbound,
            config.write_timeout,
            config.max_payload,
        ));

        let handler = FrameHandler::new(broker.clone(), conn.clone(), config.keepalive);
        let mut reader = FrameReader::new(read_half, config.max_payload);
        let result = handler.run(&mut reader, accepted_at).await;

        if let Err(ref e) = result {
            let code = e.error_code();
            let text = e.to_string();
            broker.sink().protocol_error(conn.id(), code, &text);
            if e.reports_to_peer() {
                // Best effort: dropped if the queue is full.
                let _ = conn.try_enqueue(Arc::new(Message::error(code, &text)));
            }
        }

        conn.close();
        broker.disconnect(&conn);
        drop(reader);
        if let Err(e) = writer.await {
            tracing::error!("[{}] Writer task failed: {}", addr, e);
        }
        conn.mark_closed();

        result
    }

    /// Initiates server shutdown.
    ///
    /// Stops the accept loop and closes every live connection, telling each
    /// peer why.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let farewell = Message::error(ErrorCode::ShuttingDown, "server shutting down");
        self.broker.close_all(Some(Arc::new(farewell)));
    }

    /// Waits until every connection task has finished, up to `timeout`.
    ///
    /// Returns `false` if connections were still active when it expired.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.stats.connections_active.load(Ordering::Relaxed) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
