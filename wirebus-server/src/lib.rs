//! # wirebus-server
//!
//! Broker for wirebus.
//!
//! This crate provides:
//! - TCP connection handling with async I/O
//! - Frame dispatch with keepalive deadlines
//! - The channel/connection registry and per-channel fan-out
//! - Drop-on-full backpressure reported through an event sink
//! - Prometheus metrics and layered configuration

pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod sink;

pub use broker::{Broker, BrokerConfig};
pub use channel::{Channel, Subscriber};
pub use config::{ChannelRetention, Config, ConfigError, LimitsConfig, MetricsConfig, NetworkConfig};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{BrokerError, ServerError};
pub use handler::FrameHandler;
pub use metrics::Metrics;
pub use server::{Server, ServerConfig, ServerStats};
pub use sink::{DropReason, EventSink, FanoutSink, TracingSink};
