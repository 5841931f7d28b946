//! Player Sessions
//!
//! A session is one connected player: identity, display data, last known
//! position, and the outbound queue drained by its connection's writer task.
//! The registry holds every joined session keyed by identity.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use serde::{Serialize, Deserialize};
use tokio::sync::{mpsc, Notify};

use crate::core::vector::Vec3f;
use crate::network::protocol::{Packet, PlayerInfo};

/// Unique session identifier.
///
/// Implements Ord for BTreeMap keys; serializes as a UUID string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    /// Random identity.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    /// Parse from a UUID string.
    pub fn parse(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outbound batch queue type.
pub type OutboundQueue = mpsc::Sender<Vec<Packet>>;

/// Per-connection serial number, distinguishes a replaced connection from
/// its successor with the same identity.
pub type ConnectionSerial = u64;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Delivery failure for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Outbound queue is full (slow client).
    #[error("outbound queue full for {0}")]
    QueueFull(SessionId),

    /// Connection writer is gone.
    #[error("session {0} disconnected")]
    Disconnected(SessionId),
}

/// Cloneable handle used to push one ordered batch to a session.
#[derive(Clone, Debug)]
pub struct Outbox {
    id: SessionId,
    queue: OutboundQueue,
}

impl Outbox {
    /// Create an outbox for `id` backed by `queue`.
    pub fn new(id: SessionId, queue: OutboundQueue) -> Self {
        Self { id, queue }
    }

    /// Recipient identity.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Enqueue a batch without waiting. The batch is delivered as one frame.
    pub fn deliver(&self, batch: Vec<Packet>) -> Result<(), DeliveryError> {
        self.queue.try_send(batch).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull(self.id),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Disconnected(self.id),
        })
    }
}

/// Who a connection claims to be, as established by the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionProfile {
    /// Identity.
    pub id: SessionId,
    /// Display name.
    pub username: String,
    /// Appearance reference.
    pub skin: String,
}

/// A joined player.
#[derive(Debug)]
pub struct PlayerSession {
    /// Identity and display data.
    pub profile: SessionProfile,
    /// Last reported position.
    pub pos: Vec3f,
    /// Last reported orientation.
    pub rotate: Vec3f,
    serial: ConnectionSerial,
    outbox: Outbox,
    closer: Arc<Notify>,
}

impl PlayerSession {
    /// Create a session delivering to `queue`.
    pub fn new(profile: SessionProfile, queue: OutboundQueue) -> Self {
        let outbox = Outbox::new(profile.id, queue);
        Self {
            profile,
            pos: Vec3f::default(),
            rotate: Vec3f::default(),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            outbox,
            closer: Arc::new(Notify::new()),
        }
    }

    /// Identity.
    pub fn id(&self) -> SessionId {
        self.profile.id
    }

    /// Connection serial.
    pub fn serial(&self) -> ConnectionSerial {
        self.serial
    }

    /// Delivery handle.
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Signal fired by [`close`](Self::close). The connection task waits on it.
    pub fn close_signal(&self) -> Arc<Notify> {
        self.closer.clone()
    }

    /// Ask the owning connection to shut down.
    pub fn close(&self) {
        self.closer.notify_one();
    }

    /// Descriptor announced to other players.
    pub fn descriptor(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.profile.id,
            username: self.profile.username.clone(),
            skin: self.profile.skin.clone(),
            pos: self.pos,
            rotate: self.rotate,
        }
    }
}

// =============================================================================
// SESSION REGISTRY
// =============================================================================

/// All joined sessions, at most one per identity.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, PlayerSession>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, returning the one it replaced (same identity).
    pub fn insert(&mut self, session: PlayerSession) -> Option<PlayerSession> {
        self.sessions.insert(session.id(), session)
    }

    /// Remove a session by identity.
    pub fn remove(&mut self, id: &SessionId) -> Option<PlayerSession> {
        self.sessions.remove(id)
    }

    /// Remove a session only if it is still the given connection.
    pub fn remove_connection(&mut self, id: &SessionId, serial: ConnectionSerial) -> Option<PlayerSession> {
        match self.sessions.get(id) {
            Some(s) if s.serial() == serial => self.sessions.remove(id),
            _ => None,
        }
    }

    /// Look up a session.
    pub fn get(&self, id: &SessionId) -> Option<&PlayerSession> {
        self.sessions.get(id)
    }

    /// Look up a session for mutation.
    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut PlayerSession> {
        self.sessions.get_mut(id)
    }

    /// Whether the identity is registered.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of joined sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether nobody is joined.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Iterate sessions in identity order.
    pub fn iter(&self) -> impl Iterator<Item = &PlayerSession> {
        self.sessions.values()
    }

    /// Outboxes of every session not in `exclude`.
    pub fn outboxes_except(&self, exclude: &[SessionId]) -> Vec<Outbox> {
        self.sessions
            .values()
            .filter(|s| !exclude.contains(&s.id()))
            .map(PlayerSession::outbox)
            .collect()
    }

    /// Outboxes of the registered sessions among `targets`, minus `exclude`.
    ///
    /// Targets that are not registered are skipped.
    pub fn outboxes_of<'a, I>(&self, targets: I, exclude: &[SessionId]) -> Vec<Outbox>
    where
        I: IntoIterator<Item = &'a SessionId>,
    {
        targets
            .into_iter()
            .filter(|id| !exclude.contains(id))
            .filter_map(|id| self.sessions.get(id))
            .map(PlayerSession::outbox)
            .collect()
    }
}
