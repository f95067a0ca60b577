//! # Interactive Console
//!
//! Line-oriented command interface for a running [`Node`]. Input lines are
//! parsed into [`Command`]s; node events are printed as they arrive. A bad
//! command prints an error and the console keeps going.

use anyhow::Result;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use crate::node::{Node, NodeEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { address: String, port: u16 },
    Disconnect { peer_id: String },
    List,
    Send { peer_id: String, text: String },
    Broadcast { text: String },
    Ping { peer_id: String },
    Share { peer_id: String },
    Info,
    Help,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}', type 'help' for a list of commands")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

const HELP: &str = "\
Commands:
  connect <address> <port>    Connect to a peer
  disconnect <peer_id>        Close the session with a peer
  list                        List known peers
  send <peer_id> <message>    Send a text message to one peer
  broadcast <message>         Send a text message to every connected peer
  ping <peer_id>              Ping a peer
  share <peer_id>             Send a peer your connected peers
  info                        Show the local peer
  help                        Show this help
  quit | exit                 Leave the console";

/// Parse one input line.
///
/// Message text keeps its inner whitespace; only the separator after the
/// peer id (or after `broadcast`) is removed.
pub fn parse_command(line: &str) -> Result<Command, ConsoleError> {
    let line = line.trim();
    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim_start()),
        None => (line, ""),
    };

    match name {
        "" => Err(ConsoleError::Empty),
        "connect" => {
            let mut args = rest.split_whitespace();
            match (args.next(), args.next(), args.next()) {
                (Some(address), Some(port), None) => Ok(Command::Connect {
                    address: address.to_string(),
                    port: port
                        .parse()
                        .map_err(|_| ConsoleError::InvalidPort(port.to_string()))?,
                }),
                _ => Err(ConsoleError::Usage("connect <address> <port>")),
            }
        }
        "disconnect" => single_arg(rest, "disconnect <peer_id>")
            .map(|peer_id| Command::Disconnect { peer_id }),
        "ping" => single_arg(rest, "ping <peer_id>").map(|peer_id| Command::Ping { peer_id }),
        "share" => single_arg(rest, "share <peer_id>").map(|peer_id| Command::Share { peer_id }),
        "send" => match rest.split_once(char::is_whitespace) {
            Some((peer_id, text)) if !text.trim().is_empty() => Ok(Command::Send {
                peer_id: peer_id.to_string(),
                text: text.trim_start().to_string(),
            }),
            _ => Err(ConsoleError::Usage("send <peer_id> <message>")),
        },
        "broadcast" if !rest.is_empty() => Ok(Command::Broadcast {
            text: rest.to_string(),
        }),
        "broadcast" => Err(ConsoleError::Usage("broadcast <message>")),
        "list" => Ok(Command::List),
        "info" => Ok(Command::Info),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(ConsoleError::UnknownCommand(other.to_string())),
    }
}

fn single_arg(rest: &str, usage: &'static str) -> Result<String, ConsoleError> {
    let mut args = rest.split_whitespace();
    match (args.next(), args.next()) {
        (Some(arg), None) => Ok(arg.to_string()),
        _ => Err(ConsoleError::Usage(usage)),
    }
}

/// Run the console until `quit`, end of input, or Ctrl-C.
pub async fn run(node: &Node, mut events: mpsc::UnboundedReceiver<NodeEvent>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{}", "Type 'help' for a list of commands.".dimmed());

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("Console input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => execute(node, command).await,
                    Err(e) => println!("{} {}", "Error:".red().bold(), e),
                }
            }
            Some(event) = events.recv() => print_event(&event),
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    Ok(())
}

async fn execute(node: &Node, command: Command) {
    let outcome = match command {
        Command::Connect { address, port } => node
            .connect(&address, port)
            .await
            .map(|()| format!("Connecting to {}:{}", address, port)),
        Command::Disconnect { peer_id } => Ok(if node.disconnect(&peer_id) {
            format!("Disconnected from {}", peer_id)
        } else {
            format!("Not connected to {}", peer_id)
        }),
        Command::List => {
            print_peers(node);
            return;
        }
        Command::Send { peer_id, text } => node
            .send(&peer_id, &text)
            .map(|()| format!("Sent to {}", peer_id)),
        Command::Broadcast { text } => {
            let count = node.broadcast(&text);
            Ok(format!("Broadcast to {} peer(s)", count))
        }
        Command::Ping { peer_id } => node
            .ping(&peer_id)
            .map(|()| format!("Ping sent to {}", peer_id)),
        Command::Share { peer_id } => node
            .share_peers(&peer_id)
            .map(|count| format!("Shared {} peer(s) with {}", count, peer_id)),
        Command::Info => {
            let local = node.local_peer_info();
            Ok(format!(
                "Peer ID: {}\nListening on port {}\nPublic key: {}",
                local.id,
                local.port,
                hex::encode(&local.public_key)
            ))
        }
        Command::Help => Ok(HELP.to_string()),
        Command::Quit => return,
    };

    match outcome {
        Ok(message) => println!("{}", message),
        Err(e) => println!("{} {}", "Error:".red().bold(), e),
    }
}

fn print_peers(node: &Node) {
    let peers = node.list_peers();
    if peers.is_empty() {
        println!("No known peers.");
        return;
    }

    println!("{}", format!("Known peers ({}):", peers.len()).bold());
    for peer in peers {
        let status = if peer.connected {
            "connected".green()
        } else {
            "offline".dimmed()
        };
        println!("  {} {} [{}]", peer.id.cyan(), peer.endpoint(), status);
    }
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::Connected(peer_id) => {
            println!("{} {}", "+".green().bold(), format!("Peer {} connected", peer_id).green())
        }
        NodeEvent::Disconnected(peer_id) => {
            println!("{} {}", "-".red().bold(), format!("Peer {} disconnected", peer_id).red())
        }
        NodeEvent::Text { peer_id, text } => println!("[{}] {}", peer_id.cyan(), text),
        NodeEvent::Pong { peer_id } => println!("Pong from {}", peer_id.cyan()),
        NodeEvent::PeerList { peer_id, peers } => {
            println!("Peer list from {} ({}):", peer_id.cyan(), peers.len());
            for peer in peers {
                println!("  {}", peer);
            }
        }
    }
}
