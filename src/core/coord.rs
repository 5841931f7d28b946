//! Spatial Index
//!
//! Maps world block positions onto the fixed chunk grid.
//!
//! Division floors toward negative infinity (`div_euclid`), so the block at
//! `x = -1` lives in chunk `-1`, not chunk `0`. Truncating division would
//! fold the boxes `[-15, 0]` and `[0, 15]` into the same chunk.

use super::vector::Vector3;

/// Chunk width along X (blocks).
pub const CHUNK_SIZE_X: i32 = 16;
/// Chunk height along Y (blocks).
pub const CHUNK_SIZE_Y: i32 = 32;
/// Chunk depth along Z (blocks).
pub const CHUNK_SIZE_Z: i32 = 16;

/// Address of a chunk on the chunk grid.
pub type ChunkAddr = Vector3;

/// Chunk containing the given block position.
#[inline]
pub fn chunk_addr_of(pos: Vector3) -> ChunkAddr {
    Vector3::new(
        pos.x.div_euclid(CHUNK_SIZE_X),
        pos.y.div_euclid(CHUNK_SIZE_Y),
        pos.z.div_euclid(CHUNK_SIZE_Z),
    )
}

/// Position of a block relative to its chunk origin.
///
/// Every component is in `[0, CHUNK_SIZE)` for its axis.
#[inline]
pub fn block_local(pos: Vector3) -> Vector3 {
    Vector3::new(
        pos.x.rem_euclid(CHUNK_SIZE_X),
        pos.y.rem_euclid(CHUNK_SIZE_Y),
        pos.z.rem_euclid(CHUNK_SIZE_Z),
    )
}

/// World position of a chunk's minimum corner.
#[inline]
pub fn chunk_origin(addr: ChunkAddr) -> Vector3 {
    Vector3::new(
        addr.x * CHUNK_SIZE_X,
        addr.y * CHUNK_SIZE_Y,
        addr.z * CHUNK_SIZE_Z,
    )
}
