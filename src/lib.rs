//! # PeerChat
//!
//! A peer-to-peer messaging overlay over plain TCP.
//!
//! Every node listens for inbound connections and dials outbound ones. A
//! connection becomes usable once both ends have exchanged a handshake
//! carrying their peer ID and public key; from then on either side can send
//! typed, timestamped frames to the other.
//!
//! ## Core Modules
//!
//! - [`wire`] - Binary frame codec and payload layouts
//! - [`peers`] - Peer directory with flat-file persistence
//! - [`transport`] - Listener, sessions and handshake binding
//! - [`crypto`] - Node identity, signatures and shared secrets
//! - [`node`] - One running peer: identity, directory and transport together
//! - [`console`] - Interactive command console
//! - [`config`] - Configuration management and storage
//! - [`cli`] - Command-line interface
//!
//! ## Quick Start
//!
//! ```bash
//! # Initialize PeerChat
//! peerchat init
//!
//! # Start a node and connect to another one
//! peerchat run --port 9000 --connect 192.168.1.20:9000
//! ```

pub mod cli;
pub mod config;
pub mod console;
pub mod crypto;
pub mod node;
pub mod peers;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use crypto::Identity;
pub use node::{Node, NodeEvent};
pub use peers::{PeerDirectory, PeerRecord};
pub use transport::{Transport, TransportConfig, TransportError};
pub use wire::{CodecError, MessageKind, WireMessage};
