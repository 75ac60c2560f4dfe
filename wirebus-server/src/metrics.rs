//! Prometheus metrics for the wirebus broker.
//!
//! This module provides:
//! - Metrics registry with counters and gauges
//! - An [`EventSink`] implementation that feeds them
//! - HTTP server to expose metrics at `/metrics` endpoint

use crate::connection::ConnectionId;
use crate::sink::{DropReason, EventSink};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use wirebus_protocol::{ErrorCode, Opcode};

/// Prometheus metrics for the broker.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Currently live channels.
    pub channels_active: Gauge,
    /// Frames received by opcode.
    pub frames_received_total: CounterVec,
    /// Messages accepted onto a channel queue.
    pub messages_published_total: Counter,
    /// Message copies handed to subscriber queues.
    pub messages_delivered_total: Counter,
    /// Messages dropped by reason.
    pub messages_dropped_total: CounterVec,
    /// Connections terminated by error code.
    pub protocol_errors_total: CounterVec,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "wirebus_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "wirebus_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        // Channels
        let channels_active = Gauge::with_opts(Opts::new(
            "wirebus_channels_active",
            "Number of live channels",
        ))?;
        registry.register(Box::new(channels_active.clone()))?;

        // Frames
        let frames_received_total = CounterVec::new(
            Opts::new("wirebus_frames_received_total", "Total frames received by opcode"),
            &["opcode"],
        )?;
        registry.register(Box::new(frames_received_total.clone()))?;

        // Messages
        let messages_published_total = Counter::with_opts(Opts::new(
            "wirebus_messages_published_total",
            "Total messages accepted onto channel queues",
        ))?;
        registry.register(Box::new(messages_published_total.clone()))?;

        let messages_delivered_total = Counter::with_opts(Opts::new(
            "wirebus_messages_delivered_total",
            "Total message copies handed to subscriber queues",
        ))?;
        registry.register(Box::new(messages_delivered_total.clone()))?;

        let messages_dropped_total = CounterVec::new(
            Opts::new("wirebus_messages_dropped_total", "Total messages dropped by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(messages_dropped_total.clone()))?;

        // Errors
        let protocol_errors_total = CounterVec::new(
            Opts::new(
                "wirebus_protocol_errors_total",
                "Total connection errors by error code",
            ),
            &["code"],
        )?;
        registry.register(Box::new(protocol_errors_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            channels_active,
            frames_received_total,
            messages_published_total,
            messages_delivered_total,
            messages_dropped_total,
            protocol_errors_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl EventSink for Metrics {
    fn frame_received(&self, opcode: Opcode) {
        self.frames_received_total
            .with_label_values(&[opcode.as_str()])
            .inc();
    }

    fn message_published(&self, _channel_id: u16) {
        self.messages_published_total.inc();
    }

    fn message_dropped(&self, _channel_id: u16, _connection: Option<ConnectionId>, reason: DropReason) {
        self.messages_dropped_total
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    fn message_delivered(&self, _channel_id: u16, subscribers: usize) {
        self.messages_delivered_total.inc_by(subscribers as f64);
    }

    fn channel_created(&self, _channel_id: u16, _name: &str) {
        self.channels_active.inc();
    }

    fn channel_reclaimed(&self, _channel_id: u16, _name: &str) {
        self.channels_active.dec();
    }

    fn connection_opened(&self, _connection: ConnectionId, _addr: SocketAddr) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    fn connection_closed(&self, _connection: ConnectionId, _addr: SocketAddr) {
        self.connections_active.dec();
    }

    fn protocol_error(&self, _connection: ConnectionId, code: ErrorCode, _message: &str) {
        self.protocol_errors_total
            .with_label_values(&[code.as_str()])
            .inc();
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn text_response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => text_response(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                Bytes::from(body),
            ),
            Err(e) => {
                tracing::error!("Failed to encode metrics: {}", e);
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    Bytes::from(e.to_string()),
                )
            }
        },
        "/health" | "/healthz" => {
            text_response(StatusCode::OK, "text/plain", Bytes::from_static(b"OK"))
        }
        _ => text_response(
            StatusCode::NOT_FOUND,
            "text/plain",
            Bytes::from_static(b"Not Found"),
        ),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.connections_total.inc();
        metrics.connections_active.inc();
        metrics
            .frames_received_total
            .with_label_values(&["PING"])
            .inc();
        metrics
            .protocol_errors_total
            .with_label_values(&["BAD_FRAME"])
            .inc();

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();

        assert!(encoded.contains("wirebus_connections_total"));
        assert!(encoded.contains("wirebus_connections_active"));
        assert!(encoded.contains("wirebus_frames_received_total"));
        assert!(encoded.contains("wirebus_protocol_errors_total"));
    }

    #[test]
    fn test_sink_updates_metrics() {
        let metrics = Metrics::new().unwrap();
        let conn = ConnectionId::new();
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        metrics.connection_opened(conn, addr);
        metrics.channel_created(1, "orders");
        metrics.channel_created(2, "trades");
        metrics.channel_reclaimed(2, "trades");
        metrics.frame_received(Opcode::Pub);
        metrics.message_published(1);
        metrics.message_delivered(1, 3);
        metrics.message_dropped(1, Some(conn), DropReason::ConnectionQueueFull);
        metrics.protocol_error(conn, ErrorCode::BadFrame, "reserved bits set");

        assert_eq!(metrics.connections_active.get(), 1.0);
        assert_eq!(metrics.channels_active.get(), 1.0);
        assert_eq!(metrics.messages_delivered_total.get(), 3.0);

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("wirebus_messages_dropped_total{reason=\"connection_queue_full\"} 1"));
        assert!(encoded.contains("wirebus_frames_received_total{opcode=\"PUB\"} 1"));
        assert!(encoded.contains("wirebus_protocol_errors_total{code=\"BAD_FRAME\"} 1"));

        metrics.connection_closed(conn, addr);
        assert_eq!(metrics.connections_active.get(), 0.0);
    }

    #[tokio::test]
    async fn test_metrics_http_endpoint() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.connections_total.inc();

        // Reserve a free port, then hand it to the server.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(run_metrics_server(addr, metrics.clone(), shutdown_rx));

        let mut stream = None;
        for _ in 0..50 {
            match tokio::net::TcpStream::connect(addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        }
        let mut stream = stream.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("wirebus_connections_total 1"));

        shutdown_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
