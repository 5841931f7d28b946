//! World Model
//!
//! Chunks, block entities, persistence, and the shared [`World`] that routes
//! commands between sessions.

pub mod broadcast;
pub mod chunk;
mod dispatch;
pub mod entity;
pub mod instance;
pub mod storage;

pub use broadcast::{send_all, send_selected, Delivery, DeliveryReport};
pub use chunk::{Chunk, ChunkError, ChunkStore};
pub use entity::{Chest, ChestManager, EntityError, EntityService};
pub use instance::{World, WorldConfig, WorldError, SYSTEM_USERNAME};
pub use storage::{ChunkStorage, FileChunkStorage, MemoryChunkStorage, ModifyList, StorageError, WorldDirectory};
