//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//!
//! Every frame carries a JSON envelope `{"name", "data", "id"}`. Inbound frames
//! hold a single envelope; outbound frames hold an array of envelopes that the
//! client processes in order (one batch).

use serde::{Serialize, Deserialize};

use crate::core::clock::WorldState;
use crate::core::coord::ChunkAddr;
use crate::core::vector::{Vector3, Vec3f};
use crate::network::session::SessionId;
use crate::world::entity::{Chest, SlotItem};

/// Command and message tags.
pub mod tags {
    /// Connection handshake (client -> server).
    pub const CONNECT: &str = "connect";
    /// Handshake accepted (server -> client).
    pub const CONNECTED: &str = "connected";
    /// A player entered the world.
    pub const PLAYER_JOIN: &str = "player_join";
    /// A player left the world.
    pub const PLAYER_LEAVE: &str = "player_leave";
    /// Chat line.
    pub const CHAT_SEND_MESSAGE: &str = "chat_send_message";
    /// Player position/orientation update.
    pub const PLAYER_STATE: &str = "player_state";
    /// Place or replace a block.
    pub const BLOCK_SET: &str = "block_set";
    /// Place a block that carries an entity (chest).
    pub const CREATE_ENTITY: &str = "create_entity";
    /// Client started rendering a chunk.
    pub const CHUNK_ADD: &str = "chunk_add";
    /// Client stopped rendering a chunk.
    pub const CHUNK_REMOVE: &str = "chunk_remove";
    /// Modify list replay for a subscribed chunk.
    pub const CHUNK_LOADED: &str = "chunk_loaded";
    /// World age and time of day.
    pub const WORLD_STATE: &str = "world_state";
    /// Request chest contents.
    pub const LOAD_CHEST: &str = "load_chest";
    /// Chest contents.
    pub const CHEST_CONTENT: &str = "chest_content";
    /// Change one chest slot.
    pub const SET_CHEST_SLOT_ITEM: &str = "set_chest_slot_item";
    /// Latency check.
    pub const PING: &str = "ping";
    /// Answer to a ping.
    pub const PONG: &str = "pong";
    /// Error notification.
    pub const ERROR: &str = "error";
}

/// Correlation id echoed back on replies.
pub type CorrelationId = String;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Raw inbound envelope. `data` stays opaque until the command is decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    /// Command tag.
    pub name: String,
    /// Command payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Optional correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
}

impl InboundEnvelope {
    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(s).map_err(ProtocolError::InvalidJson)
    }
}

/// Decoded inbound command, one variant per recognized tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Handshake; only meaningful as the first frame of a connection.
    Connect(ConnectRequest),
    /// Place or replace a block.
    BlockSet(BlockSetParams),
    /// Place a block carrying an entity.
    CreateEntity(BlockSetParams),
    /// Subscribe to a chunk.
    ChunkAdd(ChunkPosParams),
    /// Unsubscribe from a chunk.
    ChunkRemove(ChunkPosParams),
    /// Chat line.
    ChatSendMessage(ChatSendParams),
    /// Position/orientation update.
    PlayerState(PlayerStateParams),
    /// Request chest contents.
    LoadChest(LoadChestParams),
    /// Change one chest slot.
    SetChestSlotItem(SetChestSlotItemParams),
    /// Latency check.
    Ping,
    /// Tag this server does not handle.
    Unknown(String),
}

impl Command {
    /// Decode the envelope payload according to its tag.
    ///
    /// Unknown tags decode to [`Command::Unknown`]; only a recognized tag with
    /// a malformed payload is an error.
    pub fn decode(envelope: &InboundEnvelope) -> Result<Self, ProtocolError> {
        let name = envelope.name.as_str();
        let command = match name {
            tags::CONNECT => Command::Connect(payload(envelope)?),
            tags::BLOCK_SET => Command::BlockSet(payload(envelope)?),
            tags::CREATE_ENTITY => Command::CreateEntity(payload(envelope)?),
            tags::CHUNK_ADD => Command::ChunkAdd(payload(envelope)?),
            tags::CHUNK_REMOVE => Command::ChunkRemove(payload(envelope)?),
            tags::CHAT_SEND_MESSAGE => Command::ChatSendMessage(payload(envelope)?),
            tags::PLAYER_STATE => Command::PlayerState(payload(envelope)?),
            tags::LOAD_CHEST => Command::LoadChest(payload(envelope)?),
            tags::SET_CHEST_SLOT_ITEM => Command::SetChestSlotItem(payload(envelope)?),
            tags::PING => Command::Ping,
            other => Command::Unknown(other.to_string()),
        };
        Ok(command)
    }

    /// Tag this command was decoded from.
    pub fn name(&self) -> &str {
        match self {
            Command::Connect(_) => tags::CONNECT,
            Command::BlockSet(_) => tags::BLOCK_SET,
            Command::CreateEntity(_) => tags::CREATE_ENTITY,
            Command::ChunkAdd(_) => tags::CHUNK_ADD,
            Command::ChunkRemove(_) => tags::CHUNK_REMOVE,
            Command::ChatSendMessage(_) => tags::CHAT_SEND_MESSAGE,
            Command::PlayerState(_) => tags::PLAYER_STATE,
            Command::LoadChest(_) => tags::LOAD_CHEST,
            Command::SetChestSlotItem(_) => tags::SET_CHEST_SLOT_ITEM,
            Command::Ping => tags::PING,
            Command::Unknown(name) => name,
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(envelope: &InboundEnvelope) -> Result<T, ProtocolError> {
    serde_json::from_value(envelope.data.clone()).map_err(|source| ProtocolError::InvalidPayload {
        name: envelope.name.clone(),
        source,
    })
}

/// Connection handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// JWT, required when the server has authentication configured.
    #[serde(default)]
    pub token: Option<String>,
    /// Client-chosen identity (UUID string), honored only without auth.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Display name.
    pub username: String,
    /// Appearance reference.
    #[serde(default)]
    pub skin: Option<String>,
}

/// A block as stored in a chunk's modify list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockItem {
    /// Block type id. `0` is air.
    pub id: u32,
    /// Block power/durability fraction.
    #[serde(default = "default_power")]
    pub power: f32,
    /// Orientation.
    #[serde(default)]
    pub rotate: Option<Vec3f>,
    /// Entity bound to this block (chests).
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Free-form block data (sign text etc).
    #[serde(default)]
    pub extra_data: Option<String>,
}

fn default_power() -> f32 {
    1.0
}

impl BlockItem {
    /// Block id of air.
    pub const AIR: u32 = 0;
    /// Block id of bedrock.
    pub const BEDROCK: u32 = 1;

    /// Plain block with default power and no extras.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            power: default_power(),
            rotate: None,
            entity_id: None,
            extra_data: None,
        }
    }
}

/// Block change at a world position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSetParams {
    /// World block position.
    pub pos: Vector3,
    /// New block.
    pub item: BlockItem,
}

/// Chunk subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkPosParams {
    /// Chunk address.
    pub pos: ChunkAddr,
}

/// Chat line from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSendParams {
    /// Message text.
    pub text: String,
    /// Sender name as claimed by the client. Never trusted.
    #[serde(default)]
    pub username: Option<String>,
}

/// Player position/orientation update from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStateParams {
    /// Position.
    pub pos: Vec3f,
    /// Orientation.
    pub rotate: Vec3f,
}

/// Chest contents request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadChestParams {
    /// Chest entity id.
    pub entity_id: String,
}

/// Chest slot change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetChestSlotItemParams {
    /// Chest entity id.
    pub entity_id: String,
    /// Slot to change.
    pub slot_index: u32,
    /// New slot content, `None` empties the slot.
    #[serde(default)]
    pub item: Option<SlotItem>,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted.
    Connected(ConnectedInfo),
    /// A player entered the world (also used for the roster).
    PlayerJoin(PlayerInfo),
    /// A player left the world.
    PlayerLeave(PlayerLeaveInfo),
    /// Chat line.
    ChatSendMessage(ChatMessage),
    /// Another player moved.
    PlayerState(PlayerStateInfo),
    /// Block changed in a subscribed chunk.
    BlockSet(BlockSetParams),
    /// Modify list replay for a chunk.
    ChunkLoaded(ChunkLoaded),
    /// World age and time of day.
    WorldState(WorldState),
    /// Chest contents.
    ChestContent(Chest),
    /// Answer to a ping.
    Pong {
        /// Server wall clock, Unix milliseconds.
        server_time: i64,
    },
    /// Error message.
    Error(ServerError),
}

/// Handshake result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedInfo {
    /// Identity assigned to this connection.
    pub session_id: SessionId,
    /// World the session joined.
    pub world_id: String,
    /// Server version.
    pub server_version: String,
}

/// Public descriptor of a player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// Player identity.
    pub id: SessionId,
    /// Display name.
    pub username: String,
    /// Appearance reference.
    pub skin: String,
    /// Position.
    pub pos: Vec3f,
    /// Orientation.
    pub rotate: Vec3f,
}

/// Departure notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerLeaveInfo {
    /// Player identity.
    pub id: SessionId,
    /// Display name.
    pub username: String,
}

/// Chat line as delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender display name (`<SERVER>` for system lines).
    pub username: String,
    /// Message text.
    pub text: String,
}

/// Movement broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStateInfo {
    /// Player identity.
    pub id: SessionId,
    /// Display name.
    pub username: String,
    /// Position.
    pub pos: Vec3f,
    /// Orientation.
    pub rotate: Vec3f,
}

/// Modify list replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkLoaded {
    /// Chunk address.
    pub addr: ChunkAddr,
    /// Every recorded change, at world positions.
    pub modify_list: Vec<BlockSetParams>,
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// First frame was not a handshake.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Invalid input.
    InvalidInput,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

/// Outbound envelope: a message plus optional correlation id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Packet {
    /// Message (serialized as `name` + `data`).
    #[serde(flatten)]
    pub message: ServerMessage,
    /// Correlation id of the command this answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
}

impl Packet {
    /// Uncorrelated packet.
    pub fn new(message: ServerMessage) -> Self {
        Self { message, id: None }
    }

    /// Packet answering the command with the given correlation id.
    pub fn reply(message: ServerMessage, id: Option<CorrelationId>) -> Self {
        Self { message, id }
    }
}

impl From<ServerMessage> for Packet {
    fn from(message: ServerMessage) -> Self {
        Packet::new(message)
    }
}

/// Serialize a batch to the JSON array sent in one frame.
pub fn encode_batch(batch: &[Packet]) -> Result<String, serde_json::Error> {
    serde_json::to_string(batch)
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame is not a JSON envelope.
    #[error("invalid envelope: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Recognized command with a payload that does not match its type.
    #[error("invalid payload for {name}: {source}")]
    InvalidPayload {
        /// Command tag.
        name: String,
        /// Decode failure.
        #[source]
        source: serde_json::Error,
    },
}
