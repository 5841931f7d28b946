//! Core world primitives.
//!
//! Pure value types and functions with no I/O: vectors, the chunk grid and
//! the world clock.

pub mod vector;
pub mod coord;
pub mod clock;

// Re-export core types
pub use vector::{Vector3, Vec3f};
pub use coord::{ChunkAddr, chunk_addr_of, block_local, chunk_origin, CHUNK_SIZE_X, CHUNK_SIZE_Y, CHUNK_SIZE_Z};
pub use clock::{WorldState, refresh, GAME_DAY_SECONDS, GAME_ONE_SECOND, REAL_SECONDS_PER_GAME_DAY};
