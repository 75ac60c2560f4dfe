//! wirebus-cli - Command-line interface for wirebus
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wirebus_client::{Client, ConnectionConfig};

#[derive(Parser)]
#[command(name = "wirebus-cli")]
#[command(about = "Command-line interface for the wirebus pub/sub broker")]
#[command(version)]
struct Cli {
    /// Broker address
    #[arg(short, long, env = "WIREBUS_SERVER", default_value = "127.0.0.1:7420")]
    server: SocketAddr,

    /// Seconds to wait for the broker to accept the connection
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start interactive REPL
    Repl,

    /// Ping the broker
    Ping {
        /// Number of pings to send
        #[arg(short, long, default_value = "1")]
        count: u32,
    },

    /// Subscribe to channels and print delivered messages
    Sub {
        /// Channel names
        #[arg(required = true)]
        channels: Vec<String>,

        /// Exit after this many messages
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Print one JSON object per message
        #[arg(long)]
        json: bool,
    },

    /// Publish a payload to a channel
    Pub {
        /// Channel name
        channel: String,

        /// Payload text (or @file to read it from a file)
        payload: String,

        /// Publish the payload this many times
        #[arg(short, long, default_value = "1")]
        repeat: u32,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    tracing::debug!(server = %cli.server, "starting wirebus-cli");

    let config = ConnectionConfig::new(cli.server)
        .with_connect_timeout(Duration::from_secs(cli.connect_timeout));
    let client = Client::new(config);

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(client, cli.server).await?;
        }
        Some(cmd) => {
            client.connect().await.map_err(|e| {
                eprintln!("{}: {}", "Connection failed".red(), e);
                e
            })?;

            let result = commands::execute(&client, cmd).await;
            let _ = client.close().await;

            match result {
                Ok(output) => {
                    if !output.is_empty() {
                        println!("{}", output);
                    }
                }
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
