//! # wirebus-client
//!
//! Client library for wirebus.
//!
//! This crate provides:
//! - Async TCP connection with background read and write tasks
//! - Periodic keepalive pings
//! - Subscribe/publish API with channel IDs resolved by name
//! - A broadcast stream of delivered messages and broker errors

pub mod client;
pub mod connection;
pub mod error;

pub use client::Client;
pub use connection::{ClientEvent, Connection, ConnectionConfig, DEFAULT_PING_INTERVAL};
pub use error::ClientError;
