//! # Transport
//!
//! Session management for PeerChat: the listening socket, outbound
//! connections, and one session per live TCP connection.
//!
//! ## Session lifecycle
//!
//! Every session starts **unbound**: the remote identity is unknown until
//! a `Handshake` frame arrives. Outbound sessions send our own handshake as
//! their first frame. When the remote handshake is decoded the session is
//! **bound** to the declared peer id, indexed by it, recorded in the
//! [`PeerDirectory`], and the connection handler fires with `true`. Inbound
//! sessions answer the first handshake with ours, so both sides learn each
//! other's identity without a separate acknowledgment.
//!
//! Frames received before binding are held back (up to
//! [`TransportConfig::max_pending_frames`] frames and
//! [`TransportConfig::max_pending_bytes`] payload bytes) and delivered right
//! after the connection handler, in arrival order.
//!
//! A handshake whose peer id is empty or contains `|` or control characters
//! is a protocol violation, as is one announcing our own id.
//!
//! A session closes on read/write error, protocol violation (oversized or
//! malformed frame), explicit disconnect, or [`Transport::stop`]. The
//! connection handler fires with `false` only for sessions that were bound.
//!
//! At most one bound session exists per peer id. A newer successful
//! handshake for the same id replaces the older session in the index before
//! the older socket is closed.
//!
//! ## Concurrency
//!
//! Each session runs a reader task and a writer task. Writes go through an
//! unbounded per-session queue drained by the writer, so frames from
//! concurrent senders never interleave. The session registry is one
//! `parking_lot::Mutex`; it is never held across an `.await` or while
//! invoking a handler. Closing a session aborts both tasks, which drops the
//! socket halves.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::peers::{is_valid_peer_id, PeerDirectory, PeerRecord};
use crate::wire::{
    declared_payload_len, CodecError, HandshakePayload, MessageKind, WireMessage, HEADER_LEN,
    MAX_PAYLOAD_LEN,
};

/// Invoked with `(peer_id, message)` for every frame from a bound session.
pub type MessageHandler = Arc<dyn Fn(&str, &WireMessage) + Send + Sync>;

/// Invoked with `(peer_id, connected)` when a session binds or a bound session closes.
pub type ConnectionHandler = Arc<dyn Fn(&str, bool) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out connecting to {address}")]
    ConnectTimeout { address: String },
    #[error("transport is already running")]
    AlreadyRunning,
    #[error("no connected peer with id {0}")]
    UnknownPeer(String),
    #[error("session closed")]
    SessionClosed,
    #[error("frame payload of {declared} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { declared: usize, limit: usize },
    #[error("more than {0} frames received before handshake")]
    PendingOverflow(usize),
    #[error("more than {0} payload bytes received before handshake")]
    PendingBytesExceeded(usize),
    #[error("invalid peer id {0:?} in handshake")]
    InvalidPeerId(String),
    #[error("peer announced our own id")]
    SelfConnection,
    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunables for a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub max_payload_len: usize,
    pub max_pending_frames: usize,
    pub max_pending_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_payload_len: MAX_PAYLOAD_LEN,
            max_pending_frames: 32,
            max_pending_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Unbound,
    Bound(String),
}

type SessionId = u64;

struct SessionHandle {
    direction: Direction,
    remote_addr: SocketAddr,
    /// Host and port we dialed, for outbound sessions.
    dialed: Option<(String, u16)>,
    state: SessionState,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionHandle {
    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[derive(Default)]
struct SessionRegistry {
    sessions: HashMap<SessionId, SessionHandle>,
    bound: HashMap<String, SessionId>,
}

#[derive(Default)]
struct Handlers {
    message: Option<MessageHandler>,
    connection: Option<ConnectionHandler>,
}

/// Frames held back until the session binds.
#[derive(Default)]
struct PendingFrames {
    frames: Vec<WireMessage>,
    bytes: usize,
}

struct Listener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

struct Inner {
    directory: PeerDirectory,
    config: TransportConfig,
    registry: Mutex<SessionRegistry>,
    handlers: RwLock<Handlers>,
    listener: Mutex<Option<Listener>>,
    next_session_id: AtomicU64,
}

/// Owns the listening socket and every live session.
///
/// Cloning yields another handle to the same transport.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

/// Non-owning handle, for handlers that need to reply through the transport.
#[derive(Clone)]
pub struct WeakTransport {
    inner: Weak<Inner>,
}

impl WeakTransport {
    pub fn upgrade(&self) -> Option<Transport> {
        self.inner.upgrade().map(|inner| Transport { inner })
    }
}

impl Transport {
    pub fn new(directory: PeerDirectory, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                directory,
                config,
                registry: Mutex::new(SessionRegistry::default()),
                handlers: RwLock::new(Handlers::default()),
                listener: Mutex::new(None),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakTransport {
        WeakTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn set_message_handler(&self, handler: Option<MessageHandler>) {
        self.inner.handlers.write().message = handler;
    }

    pub fn set_connection_handler(&self, handler: Option<ConnectionHandler>) {
        self.inner.handlers.write().connection = handler;
    }

    /// Listen on all interfaces at `port` and start accepting sessions.
    ///
    /// Returns the bound address; port 0 picks a free port.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, TransportError> {
        if self.inner.listener.lock().is_some() {
            return Err(TransportError::AlreadyRunning);
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|source| TransportError::Bind { port, source })?;
        let local_addr = listener.local_addr()?;

        let mut slot = self.inner.listener.lock();
        if slot.is_some() {
            return Err(TransportError::AlreadyRunning);
        }
        let task = tokio::spawn(accept_loop(self.inner.clone(), listener));
        *slot = Some(Listener { local_addr, task });

        info!("Transport listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Close the listener and every session, then wait for their tasks.
    ///
    /// Calling `stop` on a stopped transport does nothing.
    pub async fn stop(&self) {
        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            listener.task.abort();
            let _ = listener.task.await;
            info!("Transport stopped listening on {}", listener.local_addr);
        }

        let (sessions, peers) = {
            let mut registry = self.inner.registry.lock();
            let sessions: Vec<SessionHandle> =
                registry.sessions.drain().map(|(_, session)| session).collect();
            let peers: Vec<String> = registry.bound.drain().map(|(peer_id, _)| peer_id).collect();
            (sessions, peers)
        };

        let mut tasks = Vec::new();
        for session in sessions {
            session.abort();
            tasks.extend(session.tasks);
        }
        join_all(tasks).await;

        for peer_id in peers {
            self.inner.mark_disconnected(&peer_id);
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().as_ref().map(|l| l.local_addr)
    }

    /// Open an outbound session and send our handshake on it.
    ///
    /// Returns once the TCP connection is established; binding happens when
    /// the remote handshake arrives.
    pub async fn connect_to_peer(&self, address: &str, port: u16) -> Result<(), TransportError> {
        let target = format!("{}:{}", address, port);
        info!("Connecting to peer at {}", target);

        let stream = tokio::time::timeout(
            self.inner.config.connect_timeout,
            TcpStream::connect((address, port)),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            address: target.clone(),
        })?
        .map_err(|source| TransportError::Connect {
            address: target.clone(),
            source,
        })?;

        let local = self.inner.directory.get_local();
        let hello = WireMessage::handshake(&local.id, &local.public_key)?;

        self.inner.spawn_session(
            stream,
            Direction::Outbound,
            Some((address.to_string(), port)),
            Some(hello),
        )?;
        Ok(())
    }

    /// Close the bound session for `peer_id`. Returns `false` if there was none.
    pub fn disconnect_peer(&self, peer_id: &str) -> bool {
        let session = {
            let mut registry = self.inner.registry.lock();
            registry
                .bound
                .remove(peer_id)
                .and_then(|id| registry.sessions.remove(&id))
        };

        match session {
            Some(session) => {
                info!("Disconnecting peer {}", peer_id);
                session.abort();
                self.inner.mark_disconnected(peer_id);
                true
            }
            None => false,
        }
    }

    /// Queue `message` on the bound session for `peer_id`.
    ///
    /// Fails with [`TransportError::UnknownPeer`] when no bound session
    /// exists. Delivery is not confirmed.
    pub fn send_message(&self, peer_id: &str, message: &WireMessage) -> Result<(), TransportError> {
        let outbound = {
            let registry = self.inner.registry.lock();
            registry
                .bound
                .get(peer_id)
                .and_then(|id| registry.sessions.get(id))
                .map(|session| session.outbound.clone())
        }
        .ok_or_else(|| TransportError::UnknownPeer(peer_id.to_string()))?;

        outbound
            .send(message.serialize())
            .map_err(|_| TransportError::SessionClosed)
    }

    /// Queue `message` on every bound session. Returns how many sessions it was queued on.
    pub fn broadcast_message(&self, message: &WireMessage) -> usize {
        let targets: Vec<mpsc::UnboundedSender<Vec<u8>>> = {
            let registry = self.inner.registry.lock();
            registry
                .bound
                .values()
                .filter_map(|id| registry.sessions.get(id))
                .map(|session| session.outbound.clone())
                .collect()
        };

        let frame = message.serialize();
        targets
            .iter()
            .filter(|outbound| outbound.send(frame.clone()).is_ok())
            .count()
    }

    /// Ids of peers with a bound session.
    pub fn connected_peers(&self) -> Vec<String> {
        self.inner.registry.lock().bound.keys().cloned().collect()
    }

    /// Number of live sessions, bound or not.
    pub fn session_count(&self) -> usize {
        self.inner.registry.lock().sessions.len()
    }
}

impl Inner {
    fn spawn_session(
        self: &Arc<Self>,
        stream: TcpStream,
        direction: Direction,
        dialed: Option<(String, u16)>,
        greeting: Option<WireMessage>,
    ) -> Result<SessionId, TransportError> {
        let remote_addr = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", remote_addr, e);
        }

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();

        if let Some(greeting) = greeting {
            // Queued before the writer starts, so it is always the first frame.
            let _ = outbound.send(greeting.serialize());
        }

        self.registry.lock().sessions.insert(
            id,
            SessionHandle {
                direction,
                remote_addr,
                dialed,
                state: SessionState::Unbound,
                outbound,
                tasks: Vec::new(),
            },
        );

        let writer_task = tokio::spawn(write_loop(self.clone(), id, writer, queue));
        let reader_task = tokio::spawn(read_loop(self.clone(), id, reader));

        let mut registry = self.registry.lock();
        match registry.sessions.get_mut(&id) {
            Some(session) => session.tasks = vec![reader_task, writer_task],
            None => {
                // Closed before we got here; make sure nothing keeps running.
                reader_task.abort();
                writer_task.abort();
            }
        }

        debug!("Session {} opened ({:?}, {})", id, direction, remote_addr);
        Ok(id)
    }

    fn handle_frame(
        &self,
        id: SessionId,
        message: WireMessage,
        pending: &mut PendingFrames,
    ) -> Result<(), TransportError> {
        let state = self
            .registry
            .lock()
            .sessions
            .get(&id)
            .map(|session| session.state.clone())
            .ok_or(TransportError::SessionClosed)?;

        let handshake = if message.kind() == MessageKind::Handshake {
            Some(HandshakePayload::decode(message.payload())?)
        } else {
            None
        };

        match (state, handshake) {
            (SessionState::Bound(peer_id), handshake) => {
                if let Some(handshake) = handshake {
                    if handshake.peer_id != peer_id {
                        warn!(
                            "Peer {} sent a handshake for {}; keeping the original binding",
                            peer_id, handshake.peer_id
                        );
                    }
                }
                self.dispatch(&peer_id, &message);
            }
            (SessionState::Unbound, Some(handshake)) => {
                self.bind_session(id, &handshake)?;
                pending.bytes = 0;
                for early in pending.frames.drain(..) {
                    self.dispatch(&handshake.peer_id, &early);
                }
                self.dispatch(&handshake.peer_id, &message);
            }
            (SessionState::Unbound, None) => {
                if pending.frames.len() >= self.config.max_pending_frames {
                    return Err(TransportError::PendingOverflow(self.config.max_pending_frames));
                }
                let bytes = pending.bytes + message.payload().len();
                if bytes > self.config.max_pending_bytes {
                    return Err(TransportError::PendingBytesExceeded(self.config.max_pending_bytes));
                }
                debug!("Session {} holding {:?} frame until handshake", id, message.kind());
                pending.bytes = bytes;
                pending.frames.push(message);
            }
        }

        Ok(())
    }

    fn bind_session(&self, id: SessionId, handshake: &HandshakePayload) -> Result<(), TransportError> {
        if !is_valid_peer_id(&handshake.peer_id) {
            return Err(TransportError::InvalidPeerId(handshake.peer_id.clone()));
        }

        let local = self.directory.get_local();
        if !local.id.is_empty() && handshake.peer_id == local.id {
            return Err(TransportError::SelfConnection);
        }

        let (direction, remote_addr, dialed, outbound, superseded) = {
            let mut registry = self.registry.lock();
            let session = registry
                .sessions
                .get_mut(&id)
                .ok_or(TransportError::SessionClosed)?;
            session.state = SessionState::Bound(handshake.peer_id.clone());
            let direction = session.direction;
            let remote_addr = session.remote_addr;
            let dialed = session.dialed.clone();
            let outbound = session.outbound.clone();

            // Swap the index entry first so concurrent sends never see the old session.
            let superseded = registry
                .bound
                .insert(handshake.peer_id.clone(), id)
                .filter(|previous| *previous != id)
                .and_then(|previous| registry.sessions.remove(&previous));

            (direction, remote_addr, dialed, outbound, superseded)
        };

        if let Some(old) = superseded {
            info!(
                "Session {} supersedes previous session for peer {} ({})",
                id, handshake.peer_id, old.remote_addr
            );
            old.abort();
        }

        if direction == Direction::Inbound {
            let reply = WireMessage::handshake(&local.id, &local.public_key)?;
            outbound
                .send(reply.serialize())
                .map_err(|_| TransportError::SessionClosed)?;
        }

        let (address, port) = match (direction, dialed) {
            (Direction::Outbound, Some(dialed)) => dialed,
            _ => self
                .directory
                .get(&handshake.peer_id)
                .map(|known| (known.address, known.port))
                .unwrap_or_else(|| (remote_addr.ip().to_string(), remote_addr.port())),
        };

        self.directory.add_or_replace(PeerRecord {
            id: handshake.peer_id.clone(),
            address,
            port,
            public_key: handshake.public_key.clone(),
            connected: true,
            last_seen: chrono::Utc::now(),
        });

        info!(
            "Session {} bound to peer {} ({:?}, {})",
            id, handshake.peer_id, direction, remote_addr
        );
        self.notify_connection(&handshake.peer_id, true);
        Ok(())
    }

    /// Remove a session from the registry and abort its tasks.
    fn close_session(&self, id: SessionId) {
        let (session, peer_id) = {
            let mut registry = self.registry.lock();
            let Some(session) = registry.sessions.remove(&id) else {
                return;
            };
            let peer_id = match &session.state {
                SessionState::Bound(peer_id) if registry.bound.get(peer_id) == Some(&id) => {
                    registry.bound.remove(peer_id);
                    Some(peer_id.clone())
                }
                _ => None,
            };
            (session, peer_id)
        };

        session.abort();
        debug!("Session {} closed ({})", id, session.remote_addr);

        if let Some(peer_id) = peer_id {
            info!("Peer {} disconnected", peer_id);
            self.mark_disconnected(&peer_id);
        }
    }

    fn mark_disconnected(&self, peer_id: &str) {
        self.directory.set_connected(peer_id, false);
        self.notify_connection(peer_id, false);
    }

    fn dispatch(&self, peer_id: &str, message: &WireMessage) {
        let handler = self.handlers.read().message.clone();
        if let Some(handler) = handler {
            handler(peer_id, message);
        }
    }

    fn notify_connection(&self, peer_id: &str, connected: bool) {
        let handler = self.handlers.read().connection.clone();
        if let Some(handler) = handler {
            handler(peer_id, connected);
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("Accepted connection from {}", addr);
                if let Err(e) = inner.spawn_session(stream, Direction::Inbound, None, None) {
                    warn!("Failed to set up session for {}: {}", addr, e);
                }
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                // Back off so a persistent error (e.g. fd exhaustion) does not spin.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_loop(inner: Arc<Inner>, id: SessionId, mut reader: OwnedReadHalf) {
    let mut pending = PendingFrames::default();

    loop {
        let result = match read_frame(&mut reader, inner.config.max_payload_len).await {
            Ok(message) => inner.handle_frame(id, message, &mut pending),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {}
            Err(TransportError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Session {} reached end of stream", id);
                break;
            }
            Err(TransportError::SessionClosed) => break,
            Err(e) => {
                warn!("Closing session {}: {}", id, e);
                break;
            }
        }
    }

    inner.close_session(id);
}

async fn write_loop(
    inner: Arc<Inner>,
    id: SessionId,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            warn!("Write failed on session {}: {}", id, e);
            inner.close_session(id);
            return;
        }
    }

    let _ = writer.shutdown().await;
}

/// Read one frame, rejecting declared payloads above `max_payload` before allocating.
async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<WireMessage, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let declared = declared_payload_len(&header);
    if declared > max_payload {
        return Err(TransportError::FrameTooLarge {
            declared,
            limit: max_payload,
        });
    }

    let mut frame = vec![0u8; HEADER_LEN + declared];
    frame[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEADER_LEN..]).await?;

    Ok(WireMessage::deserialize(&frame)?)
}
