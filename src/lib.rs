//! # Voxel World Server
//!
//! Authoritative world model for a multiplayer voxel sandbox: chunked block
//! storage, player sessions, and command routing over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    VOXEL WORLD SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Pure primitives                           │
//! │  ├── vector.rs   - Integer and float 3D vectors              │
//! │  ├── coord.rs    - Block position -> chunk address           │
//! │  └── clock.rs    - World age and time of day                 │
//! │                                                              │
//! │  world/          - World model (behind one lock)             │
//! │  ├── instance.rs - World aggregate: join, leave, dispatch    │
//! │  ├── dispatch.rs - Command -> mutation + deliveries          │
//! │  ├── chunk.rs    - Chunks, observers, modify lists           │
//! │  ├── broadcast.rs- Recipient snapshots and delivery          │
//! │  ├── entity.rs   - Chests                                    │
//! │  └── storage.rs  - World directory and chunk persistence     │
//! │                                                              │
//! │  network/        - Networking                                │
//! │  ├── server.rs   - WebSocket server and handshake            │
//! │  ├── protocol.rs - Envelopes and message types               │
//! │  ├── session.rs  - Sessions, outboxes, registry              │
//! │  └── auth.rs     - JWT validation                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! All connections share one `Arc<World>`. Chunk map, session registry and
//! entity service sit behind a single async mutex; recipients are resolved
//! under it and messages are pushed after it is released, so a slow client
//! never holds up the world.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;
pub mod world;

// Re-export commonly used types
pub use self::core::{chunk_addr_of, ChunkAddr, Vector3, Vec3f, WorldState};
pub use network::{ServerConfig, SessionId, WorldServer};
pub use world::{World, WorldConfig, WorldError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
