//! # Command Line Interface
//!
//! This module provides the command-line interface for PeerChat, including
//! argument parsing, command definitions, and command implementations.
//!
//! ## Commands
//!
//! - `init` - Initialize PeerChat configuration and generate node identity
//! - `id` - Display the current node's peer ID and public key
//! - `run` - Start a node and open the interactive console

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::Config;
use crate::crypto::Identity;
use crate::node::Node;

/// Command-line interface structure for PeerChat.
#[derive(Parser)]
#[command(name = "peerchat")]
#[command(about = "A peer-to-peer messaging overlay over plain TCP")]
#[command(version = "1.0.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands for PeerChat.
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize PeerChat configuration and generate node identity
    Init,

    /// Display the current node's peer ID and public key
    Id,

    /// Start a node and open the interactive console
    Run {
        /// Port to listen on (overrides the configured port)
        #[arg(short, long)]
        port: Option<u16>,
        /// Peer to connect to at startup, as host:port
        #[arg(short, long)]
        connect: Option<String>,
        /// File used to load and save known peers
        #[arg(long)]
        peers_file: Option<PathBuf>,
    },
}

/// Initialize PeerChat configuration and generate node identity.
///
/// Overwrites any existing configuration with defaults and generates a
/// fresh identity.
pub async fn init() -> Result<()> {
    info!("Initializing PeerChat...");

    let config = Config::init().await?;
    info!("Configuration initialized at: {}", config.config_path().display());

    let identity = Identity::generate()?;
    identity.save(&config.identity_path())?;
    info!("Node identity saved to: {}", config.identity_path().display());

    println!("{}", "PeerChat initialized successfully!".green().bold());
    println!("Peer ID: {}", identity.peer_id());

    Ok(())
}

/// Display the current node's peer ID and public key.
pub async fn show_id() -> Result<()> {
    let config = Config::load().await?;
    let identity = Identity::load_or_generate(&config.identity_path())?;

    println!("Peer ID:    {}", identity.peer_id());
    println!("Public key: {}", hex::encode(identity.public_key_bytes()));
    Ok(())
}

/// Run a node until the console exits.
///
/// A bind failure aborts startup. A failed startup connection is reported
/// and the node keeps running.
pub async fn run(
    port: Option<u16>,
    connect: Option<String>,
    peers_file: Option<PathBuf>,
) -> Result<()> {
    let mut config = Config::load_or_init().await?;
    if let Some(port) = port {
        config.listen_port = port;
    }
    if let Some(peers_file) = peers_file {
        config.peers_file = peers_file;
    }
    let target = connect.as_deref().map(parse_endpoint).transpose()?;

    let identity = Identity::load_or_generate(&config.identity_path())?;
    let (node, events) = Node::from_config(identity, &config);

    match node.load_peers().await {
        Ok(count) => info!("Loaded {} known peer(s)", count),
        Err(e) => warn!("Could not load known peers: {}", e),
    }

    let addr = node
        .start(config.listen_port)
        .await
        .with_context(|| format!("Could not listen on port {}", config.listen_port))?;

    println!("{}", "PeerChat node running".green().bold());
    println!("Peer ID: {}", node.identity().peer_id().cyan());
    println!("Listening on: {}", addr);

    if let Some((host, port)) = target {
        if let Err(e) = node.connect(&host, port).await {
            println!("{} {}", "Error:".red().bold(), e);
        }
    }

    let console_result = crate::console::run(&node, events).await;
    node.shutdown().await?;
    console_result
}

/// Split `host:port`, taking the last colon as the separator.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("Expected host:port, got '{}'", endpoint))?;
    if host.is_empty() {
        anyhow::bail!("Missing host in '{}'", endpoint);
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("Invalid port in '{}'", endpoint))?;
    Ok((host.to_string(), port))
}
