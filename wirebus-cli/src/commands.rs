//! Command execution.

use crate::Commands;
use bytes::Bytes;
use colored::Colorize;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::broadcast::error::RecvError;
use wirebus_client::{Client, ClientEvent};

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl => unreachable!(),

        Commands::Ping { count } => {
            let mut output = Vec::new();
            for seq in 0..count.max(1) {
                let rtt = client.ping().await?;
                output.push(format!(
                    "{} seq={} time={:.2}ms",
                    "PONG".green(),
                    seq,
                    rtt.as_secs_f64() * 1000.0
                ));
            }
            Ok(output.join("\n"))
        }

        Commands::Pub {
            channel,
            payload,
            repeat,
        } => {
            let payload = parse_payload_arg(&payload)?;
            let repeat = repeat.max(1);
            let mut channel_id = 0;
            for _ in 0..repeat {
                channel_id = client.publish_to(&channel, payload.clone()).await?;
            }
            // Round trip so the broker has read every PUB before CLOSE.
            client.ping().await?;
            Ok(format!(
                "{} {} message(s) ({}) to {} (id {})",
                "Published".green(),
                repeat,
                format_bytes(payload.len() as u64),
                channel.cyan(),
                channel_id
            ))
        }

        Commands::Sub {
            channels,
            count,
            json,
        } => {
            stream_messages(client, &channels, count, json).await?;
            Ok(String::new())
        }
    }
}

/// Subscribes to `channels` and prints deliveries until Ctrl+C, the broker
/// closes the connection, or `limit` messages have been printed.
async fn stream_messages(
    client: &Client,
    channels: &[String],
    limit: Option<u64>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    // Subscribe to events before any SUB so no delivery is missed.
    let mut events = client.events();
    let mut names = HashMap::new();
    for name in channels {
        let id = client.subscribe(name).await?;
        eprintln!("{} {} (id {})", "Subscribed to".green(), name.cyan(), id);
        names.insert(id, name.clone());
    }
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    let mut printed = 0u64;
    while limit.map_or(true, |limit| printed < limit) {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ClientEvent::Message { channel_id, message_id, payload }) => {
                    let name = names.get(&channel_id).map(String::as_str).unwrap_or("?");
                    if json {
                        let line = MessageLine::new(name, channel_id, message_id, &payload);
                        println!("{}", serde_json::to_string(&line)?);
                    } else {
                        println!("[{}] {}", name.cyan(), format_payload(&payload));
                    }
                    printed += 1;
                }
                Ok(ClientEvent::Error { text, .. }) => {
                    eprintln!("{}: {}", "Broker error".red(), text);
                }
                Ok(ClientEvent::Closed) | Err(RecvError::Closed) => {
                    eprintln!("{}", "Connection closed".red());
                    break;
                }
                Err(RecvError::Lagged(n)) => {
                    eprintln!("{}: lagged {} events", "Warning".yellow(), n);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping...".dimmed());
                break;
            }
        }
    }
    Ok(())
}

/// One delivered message, as printed by `sub --json`.
#[derive(Debug, Serialize)]
pub struct MessageLine<'a> {
    pub channel: &'a str,
    pub channel_id: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,
    pub payload: String,
    pub encoding: &'static str,
}

impl<'a> MessageLine<'a> {
    pub fn new(channel: &'a str, channel_id: u16, message_id: Option<u64>, payload: &[u8]) -> Self {
        let (payload, encoding) = match std::str::from_utf8(payload) {
            Ok(text) => (text.to_string(), "utf8"),
            Err(_) => (hex::encode(payload), "hex"),
        };
        Self {
            channel,
            channel_id,
            message_id,
            payload,
            encoding,
        }
    }
}

/// Parses a payload argument (either inline text or @file).
pub fn parse_payload_arg(arg: &str) -> Result<Bytes, std::io::Error> {
    if let Some(path) = arg.strip_prefix('@') {
        Ok(Bytes::from(std::fs::read(path)?))
    } else {
        Ok(Bytes::copy_from_slice(arg.as_bytes()))
    }
}

/// Shows UTF-8 payloads as text and anything else as hex.
pub fn format_payload(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("0x{}", hex::encode(payload)),
    }
}

/// Formats bytes as human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
