//! # Peer Directory
//!
//! Thread-safe map of peer identity to metadata, plus the local peer's own
//! record. All reads return snapshots; no caller ever holds a reference into
//! the map.
//!
//! ## Persistence format
//!
//! One record per line, pipe-delimited, public key as lowercase hex:
//!
//! ```text
//! <id>|<address>|<port>|<hex public key>
//! ```
//!
//! The local peer is never written. Loading merges into the current map by
//! id; malformed lines are skipped one at a time.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

/// Whether `id` can be stored in the directory and written to the peers
/// file: non-empty, no field separator, no control characters.
pub fn is_valid_peer_id(id: &str) -> bool {
    !id.is_empty() && !id.chars().any(|c| c == '|' || c.is_control())
}

/// Metadata about one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub public_key: Vec<u8>,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    /// `address:port` as advertised to other peers.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.id,
            self.address,
            self.port,
            hex::encode(&self.public_key)
        )
    }

    fn from_line(line: &str) -> Option<Self> {
        let mut fields = line.splitn(4, '|');
        let id = fields.next()?;
        let address = fields.next()?;
        let port = fields.next()?.parse::<u16>().ok()?;
        let public_key = hex::decode(fields.next()?).ok()?;

        if !is_valid_peer_id(id) {
            return None;
        }

        Some(Self {
            id: id.to_string(),
            address: address.to_string(),
            port,
            public_key,
            connected: false,
            last_seen: Utc::now(),
        })
    }
}

/// Shared peer directory. Cloning yields another handle to the same map.
#[derive(Clone, Default)]
pub struct PeerDirectory {
    peers: Arc<RwLock<HashMap<String, PeerRecord>>>,
    local: Arc<RwLock<PeerRecord>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any existing record with the same id.
    pub fn add_or_replace(&self, record: PeerRecord) {
        debug!("Storing peer {}", record.id);
        self.peers.write().insert(record.id.clone(), record);
    }

    pub fn remove(&self, peer_id: &str) {
        self.peers.write().remove(peer_id);
    }

    /// Update the connection flag and refresh `last_seen`. Unknown ids are ignored.
    pub fn set_connected(&self, peer_id: &str, connected: bool) {
        if let Some(record) = self.peers.write().get_mut(peer_id) {
            record.connected = connected;
            record.last_seen = Utc::now();
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn list_all(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    pub fn list_connected(&self) -> Vec<PeerRecord> {
        self.peers
            .read()
            .values()
            .filter(|record| record.connected)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn set_local(&self, record: PeerRecord) {
        *self.local.write() = record;
    }

    /// The local peer. Empty until [`PeerDirectory::set_local`] is called.
    pub fn get_local(&self) -> PeerRecord {
        self.local.read().clone()
    }

    /// Write all non-local records to `path`, replacing its contents.
    ///
    /// Returns the number of records written.
    pub async fn save(&self, path: &Path) -> Result<usize> {
        let lines: Vec<String> = self.peers.read().values().map(PeerRecord::to_line).collect();

        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }

        fs::write(path, content)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to save peers to {}: {}", path.display(), e))?;

        info!("Saved {} peer(s) to {}", lines.len(), path.display());
        Ok(lines.len())
    }

    /// Merge records from `path` into the directory, overwriting by id.
    ///
    /// A missing file loads nothing. Returns the number of records loaded.
    pub async fn load(&self, path: &Path) -> Result<usize> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No peers file at {}", path.display());
                return Ok(0);
            }
            Err(e) => {
                anyhow::bail!("Failed to load peers from {}: {}", path.display(), e);
            }
        };

        let mut records = Vec::new();
        for (number, line) in content.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            match PeerRecord::from_line(line) {
                Some(record) => records.push(record),
                None => warn!("Skipping malformed peer entry at {}:{}", path.display(), number + 1),
            }
        }

        let loaded = records.len();
        {
            let mut peers = self.peers.write();
            for record in records {
                peers.insert(record.id.clone(), record);
            }
        }

        info!("Loaded {} peer(s) from {}", loaded, path.display());
        Ok(loaded)
    }
}
