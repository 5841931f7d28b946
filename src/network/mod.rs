//! Network Layer
//!
//! WebSocket transport, wire protocol, token validation and the session
//! registry. World logic lives in `world/`.

pub mod auth;
pub mod protocol;
pub mod session;
pub mod server;

pub use auth::{AuthConfig, TokenClaims, AuthError, validate_token};
pub use protocol::{
    Command, InboundEnvelope, Packet, ServerMessage, BlockItem, BlockSetParams,
    ChunkLoaded, PlayerInfo, ProtocolError,
};
pub use session::{SessionId, PlayerSession, SessionProfile, SessionRegistry, Outbox, DeliveryError};
pub use server::{WorldServer, ServerConfig, WorldServerError};
