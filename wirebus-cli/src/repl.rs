//! Interactive REPL.

use crate::commands::{format_bytes, format_payload};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use wirebus_client::{Client, ClientEvent};

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help
  ping                          Ping the broker

  sub <channel> [channel...]    Subscribe to channels
  unsub <channel|id>            Unsubscribe from a channel
  subs                          List subscriptions

  pub <channel> <payload...>    Publish a payload
  ack <channel|id> <msg_id>     Acknowledge a delivered message

  quit, exit                    Exit the REPL

Delivered messages are printed as they arrive.
"#;

pub async fn run(client: Client, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "wirebus CLI".bold().cyan());
    println!("Connecting to {}...", addr);

    let client = Arc::new(client);
    let printer = spawn_printer(client.clone());
    client.connect().await?;
    println!("{}", "Connected!".green());

    // Create readline editor
    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    // Load history
    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".wirebus_history"))
        .unwrap_or_else(|_| ".wirebus_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        if !client.is_connected() {
            println!("{}", "Connection lost.".red());
            break;
        }
        let prompt = format!("{} ", "wirebus>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&client, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break, // Exit command
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    // Save history
    let _ = rl.save_history(&history_path);

    // Disconnect
    let _ = client.close().await;
    printer.abort();
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

/// Prints deliveries and broker errors in the background.
fn spawn_printer(client: Arc<Client>) -> JoinHandle<()> {
    let mut events = client.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClientEvent::Message {
                    channel_id,
                    message_id,
                    payload,
                }) => {
                    let name = channel_name(&client, channel_id).await;
                    let id = message_id.map(|id| format!(" #{}", id)).unwrap_or_default();
                    println!("\n[{}{}] {}", name.cyan(), id.dimmed(), format_payload(&payload));
                }
                Ok(ClientEvent::Error { text, .. }) => {
                    println!("\n{}: {}", "Broker error".red(), text);
                }
                Ok(ClientEvent::Closed) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(n)) => {
                    println!("\n{}: lagged {} events", "Warning".yellow(), n);
                }
            }
        }
    })
}

async fn channel_name(client: &Client, channel_id: u16) -> String {
    client
        .subscriptions()
        .await
        .into_iter()
        .find(|(_, id)| *id == channel_id)
        .map(|(name, _)| name)
        .unwrap_or_else(|| channel_id.to_string())
}

/// Resolves a channel argument given either as a name or a numeric ID.
async fn resolve_channel(client: &Client, arg: &str) -> Option<u16> {
    if let Some((_, id)) = client
        .subscriptions()
        .await
        .into_iter()
        .find(|(name, _)| name == arg)
    {
        return Some(id);
    }
    arg.parse().ok()
}

async fn execute_repl_command(
    client: &Client,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() {
        return Ok(Some(String::new()));
    }

    let cmd = parts[0].to_lowercase();
    let args = &parts[1..];

    match cmd.as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "ping" => {
            let rtt = client.ping().await?;
            Ok(Some(format!(
                "{} ({:.2}ms)",
                "PONG".green(),
                rtt.as_secs_f64() * 1000.0
            )))
        }

        "sub" | "s" => {
            if args.is_empty() {
                return Ok(Some("Usage: sub <channel> [channel...]".to_string()));
            }
            let mut output = Vec::new();
            for name in args {
                let id = client.subscribe(name).await?;
                output.push(format!("{} {} (id {})", "Subscribed".green(), name.cyan(), id));
            }
            Ok(Some(output.join("\n")))
        }

        "unsub" | "u" => {
            let Some(arg) = args.first() else {
                return Ok(Some("Usage: unsub <channel|id>".to_string()));
            };
            let Some(id) = resolve_channel(client, arg).await else {
                return Ok(Some(format!("{}: unknown channel {}", "Warning".yellow(), arg)));
            };
            client.unsubscribe(id).await?;
            Ok(Some(format!("{} {}", "Unsubscribed".green(), arg.cyan())))
        }

        "subs" => {
            let subscriptions = client.subscriptions().await;
            if subscriptions.is_empty() {
                return Ok(Some("No subscriptions".yellow().to_string()));
            }
            let mut output = String::new();
            for (name, id) in subscriptions {
                output.push_str(&format!("  {} (id {})\n", name.cyan(), id));
            }
            Ok(Some(output))
        }

        "pub" | "p" => {
            if args.len() < 2 {
                return Ok(Some("Usage: pub <channel> <payload...>".to_string()));
            }
            let payload = args[1..].join(" ");
            let id = client.publish_to(args[0], payload.clone().into_bytes()).await?;
            Ok(Some(format!(
                "{} {} to {} (id {})",
                "Published".green(),
                format_bytes(payload.len() as u64),
                args[0].cyan(),
                id
            )))
        }

        "ack" => {
            if args.len() < 2 {
                return Ok(Some("Usage: ack <channel|id> <msg_id>".to_string()));
            }
            let Some(id) = resolve_channel(client, args[0]).await else {
                return Ok(Some(format!("{}: unknown channel {}", "Warning".yellow(), args[0])));
            };
            let message_id: u64 = args[1].parse()?;
            client.ack(id, message_id).await?;
            Ok(Some(format!("{} #{}", "Acked".green(), message_id)))
        }

        _ => Ok(Some(format!(
            "Unknown command: {}. Type 'help' for help.",
            cmd
        ))),
    }
}
