//! World Instance
//!
//! The aggregate every connection task shares through an `Arc<World>`.
//!
//! One `tokio::sync::Mutex` guards the chunk store, the session registry and
//! the entity service together. Every operation does its mutation and
//! resolves its recipients under that lock, then releases it and delivers.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::core::clock::{refresh, WorldState};
use crate::core::coord::ChunkAddr;
use crate::core::vector::Vec3f;
use crate::network::protocol::{
    ChatMessage, Command, InboundEnvelope, Packet, PlayerLeaveInfo, ProtocolError, ServerMessage,
};
use crate::network::session::{ConnectionSerial, PlayerSession, SessionId, SessionRegistry};
use crate::world::broadcast::{deliver_all, send_all, Delivery, DeliveryReport};
use crate::world::chunk::{ChunkError, ChunkStore};
use crate::world::dispatch;
use crate::world::entity::{ChestManager, EntityError, EntityService};
use crate::world::storage::{ChunkStorage, StorageError, WorldDirectory};

/// Display name of system chat lines.
pub const SYSTEM_USERNAME: &str = "<SERVER>";

/// World configuration.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Directory holding all world directories.
    pub worlds_root: PathBuf,
    /// World id (directory name).
    pub world_id: String,
    /// Seed for a newly created world.
    pub seed: String,
    /// Identities allowed to place protected blocks.
    pub admins: BTreeSet<SessionId>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            worlds_root: PathBuf::from("worlds"),
            world_id: "default".to_string(),
            seed: "default".to_string(),
            admins: BTreeSet::new(),
        }
    }
}

impl WorldConfig {
    /// Create config from environment variables, falling back to defaults.
    ///
    /// `VOXEL_ADMINS` is a comma-separated list of UUIDs.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worlds_root: std::env::var("VOXEL_WORLDS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.worlds_root),
            world_id: std::env::var("VOXEL_WORLD_ID").unwrap_or(defaults.world_id),
            seed: std::env::var("VOXEL_WORLD_SEED").unwrap_or(defaults.seed),
            admins: std::env::var("VOXEL_ADMINS")
                .map(|v| parse_admins(&v))
                .unwrap_or(defaults.admins),
        }
    }
}

fn parse_admins(list: &str) -> BTreeSet<SessionId> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            let id = SessionId::parse(s);
            if id.is_none() {
                warn!("Ignoring invalid admin id {:?}", s);
            }
            id
        })
        .collect()
}

/// World errors.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    /// Persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Chunk rejected or failed to load.
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// Entity service failure.
    #[error("entity error: {0}")]
    Entity(#[from] EntityError),

    /// Command could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// State behind the world lock.
pub(crate) struct WorldInner {
    pub(crate) chunks: ChunkStore,
    pub(crate) sessions: SessionRegistry,
    pub(crate) entities: Box<dyn EntityService>,
}

/// A running world.
pub struct World {
    id: String,
    seed: String,
    create_time: DateTime<Utc>,
    admins: BTreeSet<SessionId>,
    inner: Mutex<WorldInner>,
}

impl World {
    /// Open (or create) the world directory described by `config`.
    pub fn open(config: &WorldConfig) -> Result<Self, WorldError> {
        let dir = WorldDirectory::open(&config.worlds_root, &config.world_id, &config.seed)?;
        let entities = ChestManager::open(dir.chests_path())?;
        let meta = dir.meta();

        info!("World {} ready at {}", meta.id, dir.path().display());
        Ok(Self::new(
            meta.id.clone(),
            meta.seed.clone(),
            meta.create_time,
            Arc::new(dir.chunk_storage()),
            Box::new(entities),
        )
        .with_admins(config.admins.iter().copied()))
    }

    /// World over explicit storage and entity service.
    pub fn new(
        id: impl Into<String>,
        seed: impl Into<String>,
        create_time: DateTime<Utc>,
        storage: Arc<dyn ChunkStorage>,
        entities: Box<dyn EntityService>,
    ) -> Self {
        Self {
            id: id.into(),
            seed: seed.into(),
            create_time,
            admins: BTreeSet::new(),
            inner: Mutex::new(WorldInner {
                chunks: ChunkStore::new(storage),
                sessions: SessionRegistry::new(),
                entities,
            }),
        }
    }

    /// Replace the admin set.
    pub fn with_admins(mut self, admins: impl IntoIterator<Item = SessionId>) -> Self {
        self.admins = admins.into_iter().collect();
        self
    }

    /// World id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Terrain seed.
    pub fn seed(&self) -> &str {
        &self.seed
    }

    /// Creation time.
    pub fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    /// Whether `id` may place protected blocks.
    pub fn is_admin(&self, id: &SessionId) -> bool {
        self.admins.contains(id)
    }

    /// Age and time of day right now.
    pub fn world_state(&self) -> WorldState {
        refresh(Utc::now(), self.create_time)
    }

    // =========================================================================
    // SESSION LIFECYCLE
    // =========================================================================

    /// Register a session and announce it.
    ///
    /// A session already registered under the same identity is closed and
    /// evicted first. The newcomer receives its own `player_join` along with
    /// everyone else, then the roster, then the world state.
    #[instrument(skip(self, session), fields(session = %session.id()))]
    pub async fn join(&self, session: PlayerSession) -> DeliveryReport {
        let id = session.id();
        let username = session.profile.username.clone();

        let deliveries = {
            let mut inner = self.inner.lock().await;

            if let Some(old) = inner.sessions.remove(&id) {
                let evicted = inner.chunks.unsubscribe_all(&id);
                inner.entities.forget_session(&id);
                old.close();
                info!("Replaced existing session {} ({} chunks evicted)", id, evicted);
            }

            let newcomer = session.outbox();
            let announce = Packet::new(ServerMessage::PlayerJoin(session.descriptor()));
            let roster: Vec<Packet> = inner
                .sessions
                .iter()
                .map(|s| Packet::new(ServerMessage::PlayerJoin(s.descriptor())))
                .collect();
            inner.sessions.insert(session);

            vec![
                send_all(&inner.sessions, vec![announce], &[]),
                Delivery::unicast(newcomer.clone(), roster),
                send_all(&inner.sessions, vec![system_chat(format!("{} joined", username))], &[id]),
                Delivery::unicast(newcomer, vec![Packet::new(ServerMessage::WorldState(self.world_state()))]),
            ]
        };

        info!("Player {} joined world {}", username, self.id);
        deliver_all(deliveries)
    }

    /// Remove a session and announce its departure.
    ///
    /// Returns false when `serial` no longer owns the identity (the
    /// connection was replaced), in which case nothing happens.
    #[instrument(skip(self))]
    pub async fn leave(&self, id: SessionId, serial: ConnectionSerial) -> bool {
        let delivery = {
            let mut inner = self.inner.lock().await;

            let Some(session) = inner.sessions.remove_connection(&id, serial) else {
                debug!("Stale leave for {}", id);
                return false;
            };
            inner.chunks.unsubscribe_all(&id);
            inner.entities.forget_session(&id);

            let username = session.profile.username.clone();
            send_all(
                &inner.sessions,
                vec![
                    Packet::new(ServerMessage::PlayerLeave(PlayerLeaveInfo { id, username: username.clone() })),
                    system_chat(format!("{} left the game", username)),
                ],
                &[id],
            )
        };

        info!("Player {} left world {}", id, self.id);
        delivery.deliver();
        true
    }

    /// Decode and execute one command from connection `serial` of `sender`.
    ///
    /// A failed command mutates nothing and sends nothing. Commands still
    /// queued on a replaced connection are dropped.
    #[instrument(skip(self, envelope), fields(command = %envelope.name))]
    pub async fn dispatch(
        &self,
        envelope: &InboundEnvelope,
        sender: SessionId,
        serial: ConnectionSerial,
    ) -> Result<DeliveryReport, WorldError> {
        let command = Command::decode(envelope)?;

        let deliveries = {
            let mut inner = self.inner.lock().await;
            dispatch::route(self, &mut inner, command, sender, serial, envelope.id.clone())?
        };

        Ok(deliver_all(deliveries))
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// Number of joined sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    /// Number of chunks in memory.
    pub async fn chunk_count(&self) -> usize {
        self.inner.lock().await.chunks.len()
    }

    /// Whether a chunk is in memory.
    pub async fn has_chunk(&self, addr: ChunkAddr) -> bool {
        self.inner.lock().await.chunks.contains(&addr)
    }

    /// Observers of a chunk, if it is in memory.
    pub async fn chunk_observers(&self, addr: ChunkAddr) -> Option<Vec<SessionId>> {
        let inner = self.inner.lock().await;
        inner
            .chunks
            .get(&addr)
            .map(|c| c.observers().iter().copied().collect())
    }

    /// Last reported position and orientation of a session.
    pub async fn session_pose(&self, id: SessionId) -> Option<(Vec3f, Vec3f)> {
        let inner = self.inner.lock().await;
        inner.sessions.get(&id).map(|s| (s.pos, s.rotate))
    }
}

fn system_chat(text: String) -> Packet {
    Packet::new(ServerMessage::ChatSendMessage(ChatMessage {
        username: SYSTEM_USERNAME.to_string(),
        text,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vector::Vector3;
    use crate::network::protocol::{BlockItem, BlockSetParams};
    use crate::network::session::SessionProfile;
    use crate::world::entity::SlotItem;
    use crate::world::storage::{MemoryChunkStorage, ModifyList};
    use rand::Rng;
    use std::sync::atomic::{AtomicBool, Ordering};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Client {
        id: SessionId,
        serial: ConnectionSerial,
        rx: mpsc::Receiver<Vec<Packet>>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<Vec<ServerMessage>> {
            let mut batches = Vec::new();
            while let Ok(batch) = self.rx.try_recv() {
                batches.push(batch.into_iter().map(|p| p.message).collect());
            }
            batches
        }
    }

    fn test_world(storage: Arc<MemoryChunkStorage>) -> World {
        World::new("test", "seed", Utc::now(), storage, Box::new(ChestManager::in_memory()))
    }

    async fn connect(world: &World, n: u8, name: &str) -> Client {
        let id = SessionId::from_bytes([n; 16]);
        let (tx, rx) = mpsc::channel(64);
        let session = PlayerSession::new(
            SessionProfile { id, username: name.to_string(), skin: "base".to_string() },
            tx,
        );
        let serial = session.serial();
        world.join(session).await;
        Client { id, serial, rx }
    }

    fn envelope(name: &str, data: serde_json::Value) -> InboundEnvelope {
        InboundEnvelope { name: name.to_string(), data, id: None }
    }

    #[tokio::test]
    async fn test_join_sequence() {
        let world = test_world(Arc::new(MemoryChunkStorage::new()));
        let mut a = connect(&world, 1, "alice").await;

        let batches = a.drain();
        assert_eq!(batches.len(), 2);
        assert!(matches!(&batches[0][0], ServerMessage::PlayerJoin(p) if p.id == a.id));
        assert!(matches!(batches[1][0], ServerMessage::WorldState(_)));

        let mut b = connect(&world, 2, "bob").await;

        let to_a = a.drain();
        assert!(matches!(&to_a[0][0], ServerMessage::PlayerJoin(p) if p.username == "bob"));
        assert_eq!(
            to_a[1][0],
            ServerMessage::ChatSendMessage(ChatMessage {
                username: SYSTEM_USERNAME.to_string(),
                text: "bob joined".to_string(),
            })
        );

        let to_b = b.drain();
        assert_eq!(to_b.len(), 3);
        assert!(matches!(&to_b[0][0], ServerMessage::PlayerJoin(p) if p.id == b.id));
        assert!(matches!(&to_b[1][0], ServerMessage::PlayerJoin(p) if p.id == a.id));
        assert!(matches!(to_b[2][0], ServerMessage::WorldState(_)));
        assert_eq!(world.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_chat_excludes_sender_and_stamps_name() {
        let world = test_world(Arc::new(MemoryChunkStorage::new()));
        let mut a = connect(&world, 1, "A").await;
        a.drain();

        world
            .dispatch(&envelope("chat_send_message", json!({"text": "anyone?"})), a.id, a.serial)
            .await
            .unwrap();
        assert!(a.drain().is_empty());

        let mut b = connect(&world, 2, "B").await;
        a.drain();
        b.drain();

        world
            .dispatch(&envelope("chat_send_message", json!({"text": "hi", "username": "admin"})), a.id, a.serial)
            .await
            .unwrap();

        assert!(a.drain().is_empty());
        assert_eq!(
            b.drain(),
            vec![vec![ServerMessage::ChatSendMessage(ChatMessage {
                username: "A".to_string(),
                text: "hi".to_string(),
            })]]
        );
    }

    #[tokio::test]
    async fn test_modify_list_replay() {
        let world = test_world(Arc::new(MemoryChunkStorage::new()));
        let mut a = connect(&world, 1, "A").await;
        let mut b = connect(&world, 2, "B").await;
        a.drain();
        b.drain();

        world.dispatch(&envelope("chunk_add", json!({"pos": {"x": 0, "y": 0, "z": 0}})), a.id, a.serial).await.unwrap();
        world
            .dispatch(&envelope("block_set", json!({"pos": {"x": 1, "y": 2, "z": 3}, "item": {"id": 5}})), a.id, a.serial)
            .await
            .unwrap();

        let to_a = a.drain();
        assert!(matches!(&to_a[0][0], ServerMessage::ChunkLoaded(l) if l.modify_list.is_empty()));
        assert!(matches!(&to_a[1][0], ServerMessage::BlockSet(c) if c.pos == Vector3::new(1, 2, 3)));
        assert!(b.drain().is_empty());

        world.dispatch(&envelope("chunk_add", json!({"pos": {"x": 0, "y": 0, "z": 0}})), b.id, b.serial).await.unwrap();
        let to_b = b.drain();
        match &to_b[0][0] {
            ServerMessage::ChunkLoaded(loaded) => {
                assert_eq!(loaded.modify_list, vec![BlockSetParams {
                    pos: Vector3::new(1, 2, 3),
                    item: BlockItem::new(5),
                }]);
            }
            other => panic!("Wrong message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_chunk_add_creates_one_chunk() {
        let storage = Arc::new(MemoryChunkStorage::new());
        let world = Arc::new(test_world(storage.clone()));
        let mut clients = Vec::new();
        for n in 1..=16 {
            clients.push(connect(&world, n, "p").await);
        }

        let handles: Vec<_> = clients
            .iter()
            .map(|c| {
                let world = world.clone();
                let (id, serial) = (c.id, c.serial);
                tokio::spawn(async move {
                    world.dispatch(&envelope("chunk_add", json!({"pos": {"x": 4, "y": 0, "z": -2}})), id, serial).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let addr = Vector3::new(4, 0, -2);
        assert_eq!(world.chunk_count().await, 1);
        assert_eq!(storage.load_count(), 1);
        assert_eq!(world.chunk_observers(addr).await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_chunk_remove_evicts_last_observer() {
        let world = test_world(Arc::new(MemoryChunkStorage::new()));
        let a = connect(&world, 1, "A").await;
        let pos = json!({"pos": {"x": -1, "y": 0, "z": 0}});

        world.dispatch(&envelope("chunk_add", pos.clone()), a.id, a.serial).await.unwrap();
        assert!(world.has_chunk(Vector3::new(-1, 0, 0)).await);

        world.dispatch(&envelope("chunk_remove", pos), a.id, a.serial).await.unwrap();
        assert!(!world.has_chunk(Vector3::new(-1, 0, 0)).await);
    }

    #[tokio::test]
    async fn test_leave_unsubscribes_and_announces() {
        let world = test_world(Arc::new(MemoryChunkStorage::new()));
        let mut a = connect(&world, 1, "A").await;
        let b = connect(&world, 2, "B").await;
        world.dispatch(&envelope("chunk_add", json!({"pos": {"x": 0, "y": 0, "z": 0}})), b.id, b.serial).await.unwrap();
        a.drain();

        assert!(world.leave(b.id, b.serial).await);

        assert_eq!(world.chunk_count().await, 0);
        assert_eq!(world.session_count().await, 1);
        let to_a = a.drain();
        assert!(matches!(&to_a[0][0], ServerMessage::PlayerLeave(p) if p.id == b.id));
        assert!(matches!(&to_a[0][1], ServerMessage::ChatSendMessage(m) if m.username == SYSTEM_USERNAME));
    }

    #[tokio::test]
    async fn test_identity_collision_evicts_old_session() {
        let world = test_world(Arc::new(MemoryChunkStorage::new()));
        let old = connect(&world, 1, "A").await;
        world.dispatch(&envelope("chunk_add", json!({"pos": {"x": 0, "y": 0, "z": 0}})), old.id, old.serial).await.unwrap();

        let new = connect(&world, 1, "A").await;
        assert_eq!(world.session_count().await, 1);
        assert_eq!(world.chunk_count().await, 0);

        // the replaced connection's cleanup must not remove its successor
        assert!(!world.leave(old.id, old.serial).await);
        assert_eq!(world.session_count().await, 1);
        assert!(world.leave(new.id, new.serial).await);
        assert_eq!(world.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_replaced_connection_commands_dropped() {
        let world = test_world(Arc::new(MemoryChunkStorage::new()));
        let old = connect(&world, 1, "A").await;
        let mut new = connect(&world, 1, "A").await;
        new.drain();

        let chunk = json!({"pos": {"x": 0, "y": 0, "z": 0}});
        let report = world.dispatch(&envelope("chunk_add", chunk.clone()), old.id, old.serial).await.unwrap();
        assert_eq!(report, DeliveryReport::default());
        assert_eq!(world.chunk_count().await, 0);

        let state = json!({
            "pos": {"x": 9.0, "y": 9.0, "z": 9.0},
            "rotate": {"x": 0.0, "y": 0.0, "z": 0.0}
        });
        let (before, _) = world.session_pose(new.id).await.unwrap();
        world.dispatch(&envelope("player_state", state), old.id, old.serial).await.unwrap();
        assert_eq!(world.session_pose(new.id).await.unwrap().0, before);
        assert!(new.drain().is_empty());

        world.dispatch(&envelope("chunk_add", chunk), new.id, new.serial).await.unwrap();
        assert_eq!(world.chunk_observers(Vector3::ZERO).await, Some(vec![new.id]));
        assert!(matches!(&new.drain()[0][0], ServerMessage::ChunkLoaded(_)));
    }

    #[tokio::test]
    async fn test_player_state_updates_pose() {
        let world = test_world(Arc::new(MemoryChunkStorage::new()));
        let mut a = connect(&world, 1, "A").await;
        let mut b = connect(&world, 2, "B").await;
        a.drain();
        b.drain();

        let state = json!({
            "pos": {"x": 1.5, "y": 70.0, "z": -3.25},
            "rotate": {"x": 0.0, "y": 0.0, "z": 1.0}
        });
        world.dispatch(&envelope("player_state", state), a.id, a.serial).await.unwrap();

        let (pos, _) = world.session_pose(a.id).await.unwrap();
        assert_eq!(pos, Vec3f::new(1.5, 70.0, -3.25));
        assert!(a.drain().is_empty());
        assert!(matches!(&b.drain()[0][0], ServerMessage::PlayerState(s) if s.id == a.id && s.username == "A"));
    }

    #[tokio::test]
    async fn test_malformed_command_changes_nothing() {
        let world = test_world(Arc::new(MemoryChunkStorage::new()));
        let mut a = connect(&world, 1, "A").await;
        a.drain();

        let result = world.dispatch(&envelope("chunk_add", json!({"pos": "here"})), a.id, a.serial).await;
        assert!(matches!(result, Err(WorldError::Protocol(_))));
        assert_eq!(world.chunk_count().await, 0);
        assert!(a.drain().is_empty());

        let report = world.dispatch(&envelope("fly_to_moon", json!({})), a.id, a.serial).await.unwrap();
        assert_eq!(report, DeliveryReport::default());
    }

    #[tokio::test]
    async fn test_bedrock_rejected_without_broadcast() {
        let world = test_world(Arc::new(MemoryChunkStorage::new()));
        let mut a = connect(&world, 1, "A").await;
        world.dispatch(&envelope("chunk_add", json!({"pos": {"x": 0, "y": 0, "z": 0}})), a.id, a.serial).await.unwrap();
        a.drain();

        let result = world
            .dispatch(&envelope("block_set", json!({"pos": {"x": 0, "y": 0, "z": 0}, "item": {"id": 1}})), a.id, a.serial)
            .await;
        assert!(matches!(result, Err(WorldError::Chunk(ChunkError::ProtectedBlock(1)))));
        assert!(a.drain().is_empty());
    }

    #[tokio::test]
    async fn test_admin_may_place_bedrock() {
        let admin = SessionId::from_bytes([1; 16]);
        let world = test_world(Arc::new(MemoryChunkStorage::new())).with_admins([admin]);
        let a = connect(&world, 1, "A").await;

        world
            .dispatch(&envelope("block_set", json!({"pos": {"x": 0, "y": 0, "z": 0}, "item": {"id": 1}})), a.id, a.serial)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_chest_round_trip() {
        let world = test_world(Arc::new(MemoryChunkStorage::new()));
        let mut a = connect(&world, 1, "A").await;
        world.dispatch(&envelope("chunk_add", json!({"pos": {"x": 0, "y": 0, "z": 0}})), a.id, a.serial).await.unwrap();
        a.drain();

        world
            .dispatch(
                &envelope("create_entity", json!({
                    "pos": {"x": 2, "y": 2, "z": 2},
                    "item": {"id": 54, "entity_id": "chest-a"}
                })),
                a.id,
                a.serial,
            )
            .await
            .unwrap();
        assert!(matches!(&a.drain()[0][0], ServerMessage::BlockSet(c) if c.item.entity_id.as_deref() == Some("chest-a")));

        let mut load = envelope("load_chest", json!({"entity_id": "chest-a"}));
        load.id = Some("7".to_string());
        world.dispatch(&load, a.id, a.serial).await.unwrap();
        let batch = a.rx.try_recv().unwrap();
        assert_eq!(batch[0].id.as_deref(), Some("7"));
        assert!(matches!(&batch[0].message, ServerMessage::ChestContent(c) if c.slots.is_empty()));

        world
            .dispatch(
                &envelope("set_chest_slot_item", json!({
                    "entity_id": "chest-a",
                    "slot_index": 4,
                    "item": {"id": 3, "count": 10}
                })),
                a.id,
                a.serial,
            )
            .await
            .unwrap();
        match &a.drain()[0][0] {
            ServerMessage::ChestContent(chest) => {
                assert_eq!(chest.slots.get(&4), Some(&SlotItem { id: 3, count: 10 }));
            }
            other => panic!("Wrong message: {:?}", other),
        }
    }

    /// Fails the first load, then behaves like memory storage.
    struct FlakyStorage {
        inner: MemoryChunkStorage,
        fail_next: AtomicBool,
    }

    impl ChunkStorage for FlakyStorage {
        fn load(&self, addr: ChunkAddr) -> Result<ModifyList, StorageError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone")));
            }
            self.inner.load(addr)
        }

        fn save(&self, addr: ChunkAddr, list: &ModifyList) -> Result<(), StorageError> {
            self.inner.save(addr, list)
        }
    }

    #[tokio::test]
    async fn test_create_entity_load_failure_leaves_no_chest() {
        let storage = Arc::new(FlakyStorage {
            inner: MemoryChunkStorage::new(),
            fail_next: AtomicBool::new(true),
        });
        let world = World::new("test", "seed", Utc::now(), storage, Box::new(ChestManager::in_memory()));
        let mut a = connect(&world, 1, "A").await;
        a.drain();

        let create = envelope("create_entity", json!({
            "pos": {"x": 2, "y": 2, "z": 2},
            "item": {"id": 54, "entity_id": "chest-a"}
        }));
        let result = world.dispatch(&create, a.id, a.serial).await;
        assert!(matches!(result, Err(WorldError::Chunk(ChunkError::Load(_)))));
        assert_eq!(world.chunk_count().await, 0);

        let load = envelope("load_chest", json!({"entity_id": "chest-a"}));
        let result = world.dispatch(&load, a.id, a.serial).await;
        assert!(matches!(result, Err(WorldError::Entity(EntityError::NotFound(_)))));

        // same id is free for the retry
        world.dispatch(&create, a.id, a.serial).await.unwrap();
        world.dispatch(&load, a.id, a.serial).await.unwrap();
        assert!(matches!(&a.drain()[0][0], ServerMessage::ChestContent(c) if c.slots.is_empty()));
    }

    #[tokio::test]
    async fn test_overwriting_chest_block_removes_chest() {
        let world = test_world(Arc::new(MemoryChunkStorage::new()));
        let a = connect(&world, 1, "A").await;
        let pos = json!({"x": 2, "y": 2, "z": 2});

        world
            .dispatch(
                &envelope("create_entity", json!({"pos": pos, "item": {"id": 54, "entity_id": "chest-a"}})),
                a.id,
                a.serial,
            )
            .await
            .unwrap();
        world
            .dispatch(&envelope("block_set", json!({"pos": pos, "item": {"id": 3}})), a.id, a.serial)
            .await
            .unwrap();

        let load = envelope("load_chest", json!({"entity_id": "chest-a"}));
        let result = world.dispatch(&load, a.id, a.serial).await;
        assert!(matches!(result, Err(WorldError::Entity(EntityError::NotFound(_)))));

        // the id can be placed again
        world
            .dispatch(
                &envelope("create_entity", json!({"pos": pos, "item": {"id": 54, "entity_id": "chest-a"}})),
                a.id,
                a.serial,
            )
            .await
            .unwrap();
        world.dispatch(&load, a.id, a.serial).await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_echoes_correlation_id() {
        let world = test_world(Arc::new(MemoryChunkStorage::new()));
        let mut a = connect(&world, 1, "A").await;
        a.drain();

        let mut ping = envelope("ping", json!(null));
        ping.id = Some("p1".to_string());
        world.dispatch(&ping, a.id, a.serial).await.unwrap();

        let batch = a.rx.try_recv().unwrap();
        assert_eq!(batch[0].id.as_deref(), Some("p1"));
        assert!(matches!(batch[0].message, ServerMessage::Pong { .. }));
    }

    #[tokio::test]
    async fn test_random_edits_keep_one_entry_per_cell() {
        let world = test_world(Arc::new(MemoryChunkStorage::new()));
        let a = connect(&world, 1, "A").await;
        world.dispatch(&envelope("chunk_add", json!({"pos": {"x": 0, "y": 0, "z": 0}})), a.id, a.serial).await.unwrap();

        let mut rng = rand::thread_rng();
        let mut cells = BTreeSet::new();
        for _ in 0..200 {
            let (x, y, z) = (rng.gen_range(0..4), rng.gen_range(0..4), rng.gen_range(0..4));
            cells.insert((x, y, z));
            let id = rng.gen_range(2..100);
            world
                .dispatch(&envelope("block_set", json!({"pos": {"x": x, "y": y, "z": z}, "item": {"id": id}})), a.id, a.serial)
                .await
                .unwrap();
        }

        let inner = world.inner.lock().await;
        let chunk = inner.chunks.get(&Vector3::ZERO).unwrap();
        assert_eq!(chunk.modify_list().len(), cells.len());
    }

    #[tokio::test]
    async fn test_world_reopen_keeps_changes() {
        let config = WorldConfig {
            worlds_root: std::env::temp_dir().join(format!("voxel-world-test-{}", uuid::Uuid::new_v4())),
            world_id: "persist".to_string(),
            ..Default::default()
        };

        {
            let world = World::open(&config).unwrap();
            let a = connect(&world, 1, "A").await;
            world
                .dispatch(&envelope("block_set", json!({"pos": {"x": -20, "y": 5, "z": 7}, "item": {"id": 9}})), a.id, a.serial)
                .await
                .unwrap();
        }

        let world = World::open(&config).unwrap();
        let mut a = connect(&world, 1, "A").await;
        a.drain();
        world.dispatch(&envelope("chunk_add", json!({"pos": {"x": -2, "y": 0, "z": 0}})), a.id, a.serial).await.unwrap();

        match &a.drain()[0][0] {
            ServerMessage::ChunkLoaded(loaded) => {
                assert_eq!(loaded.modify_list.len(), 1);
                assert_eq!(loaded.modify_list[0].pos, Vector3::new(-20, 5, 7));
            }
            other => panic!("Wrong message: {:?}", other),
        }

        let _ = std::fs::remove_dir_all(&config.worlds_root);
    }

    #[test]
    fn test_parse_admins_skips_invalid() {
        let admins = parse_admins("67e55044-10b1-426f-9247-bb680e5fe0c8, nope,,");
        assert_eq!(admins.len(), 1);
    }
}
