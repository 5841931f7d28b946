//! Chunks and the Chunk Store
//!
//! A chunk is created the first time something needs it, loads its recorded
//! changes from storage, and lives in the store for as long as at least one
//! session observes it. None of these types lock; the world calls them with
//! its lock held.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error};

use crate::core::coord::{block_local, chunk_addr_of, chunk_origin, ChunkAddr};
use crate::network::protocol::{BlockItem, BlockSetParams, ChunkLoaded};
use crate::network::session::SessionId;
use crate::world::storage::{ChunkStorage, ModifyList, StorageError};

/// Chunk errors.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// Loading the chunk from storage failed.
    #[error("chunk load failed: {0}")]
    Load(#[from] StorageError),

    /// Block may only be placed by world admins.
    #[error("block {0} is protected")]
    ProtectedBlock(u32),

    /// Change does not fall inside this chunk.
    #[error("block {pos} is outside chunk {addr}")]
    OutsideChunk {
        /// Block position.
        pos: crate::core::vector::Vector3,
        /// Chunk address.
        addr: ChunkAddr,
    },
}

/// Reject blocks the session may not place.
pub fn check_block_change(item: &BlockItem, is_admin: bool) -> Result<(), ChunkError> {
    if item.id == BlockItem::BEDROCK && !is_admin {
        return Err(ChunkError::ProtectedBlock(item.id));
    }
    Ok(())
}

/// A loaded chunk.
#[derive(Debug, Clone)]
pub struct Chunk {
    addr: ChunkAddr,
    observers: BTreeSet<SessionId>,
    modify_list: ModifyList,
}

impl Chunk {
    /// Empty chunk (no observers, no changes).
    pub fn new(addr: ChunkAddr) -> Self {
        Self {
            addr,
            observers: BTreeSet::new(),
            modify_list: ModifyList::new(),
        }
    }

    /// Replace the modify list with what storage recorded.
    pub fn load(&mut self, storage: &dyn ChunkStorage) -> Result<(), StorageError> {
        self.modify_list = storage.load(self.addr)?;
        Ok(())
    }

    /// Chunk address.
    pub fn addr(&self) -> ChunkAddr {
        self.addr
    }

    /// Sessions observing this chunk.
    pub fn observers(&self) -> &BTreeSet<SessionId> {
        &self.observers
    }

    /// Recorded changes, keyed by block-local position.
    pub fn modify_list(&self) -> &ModifyList {
        &self.modify_list
    }

    /// Add an observer. Returns false if it was already observing.
    pub fn add_observer(&mut self, id: SessionId) -> bool {
        self.observers.insert(id)
    }

    /// Remove an observer. Returns false if it was not observing.
    pub fn remove_observer(&mut self, id: &SessionId) -> bool {
        self.observers.remove(id)
    }

    /// Full modify list at world positions, for a subscribing session.
    pub fn replay(&self) -> ChunkLoaded {
        let origin = chunk_origin(self.addr);
        ChunkLoaded {
            addr: self.addr,
            modify_list: self
                .modify_list
                .iter()
                .map(|(local, item)| BlockSetParams {
                    pos: origin + *local,
                    item: item.clone(),
                })
                .collect(),
        }
    }

    /// Validate and record a change. Later changes to the same cell replace
    /// earlier ones; the replaced item is returned.
    pub fn apply_block_change(&mut self, change: &BlockSetParams, is_admin: bool) -> Result<Option<BlockItem>, ChunkError> {
        if chunk_addr_of(change.pos) != self.addr {
            return Err(ChunkError::OutsideChunk { pos: change.pos, addr: self.addr });
        }
        check_block_change(&change.item, is_admin)?;

        Ok(self.modify_list.insert(block_local(change.pos), change.item.clone()))
    }
}

/// Accepted block change and who must hear about it.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    /// The change as recorded.
    pub change: BlockSetParams,
    /// Item previously recorded at that cell.
    pub replaced: Option<BlockItem>,
    /// Observers of the chunk at the time of the change.
    pub observers: Vec<SessionId>,
}

// =============================================================================
// CHUNK STORE
// =============================================================================

/// The world's chunk map.
pub struct ChunkStore {
    chunks: BTreeMap<ChunkAddr, Chunk>,
    storage: Arc<dyn ChunkStorage>,
}

impl ChunkStore {
    /// Empty store loading from `storage`.
    pub fn new(storage: Arc<dyn ChunkStorage>) -> Self {
        Self {
            chunks: BTreeMap::new(),
            storage,
        }
    }

    /// Number of chunks in memory.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether no chunk is in memory.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Look up a chunk without creating it.
    pub fn get(&self, addr: &ChunkAddr) -> Option<&Chunk> {
        self.chunks.get(addr)
    }

    /// Whether a chunk is in memory.
    pub fn contains(&self, addr: &ChunkAddr) -> bool {
        self.chunks.contains_key(addr)
    }

    /// Existing chunk, or a new one loaded from storage.
    ///
    /// A load failure inserts nothing.
    pub fn get_or_create(&mut self, addr: ChunkAddr) -> Result<&mut Chunk, StorageError> {
        use std::collections::btree_map::Entry;

        match self.chunks.entry(addr) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mut chunk = Chunk::new(addr);
                chunk.load(self.storage.as_ref())?;
                debug!("Loaded chunk {} ({} changes)", addr, chunk.modify_list.len());
                Ok(entry.insert(chunk))
            }
        }
    }

    /// Add `id` to the chunk's observers and return the replay it must receive.
    ///
    /// Re-subscribing is allowed and replays again.
    pub fn subscribe(&mut self, addr: ChunkAddr, id: SessionId) -> Result<ChunkLoaded, StorageError> {
        let chunk = self.get_or_create(addr)?;
        chunk.add_observer(id);
        Ok(chunk.replay())
    }

    /// Remove `id` from the chunk's observers, evicting the chunk when nobody
    /// is left. Returns true if the chunk was evicted.
    pub fn unsubscribe(&mut self, addr: ChunkAddr, id: &SessionId) -> bool {
        let Some(chunk) = self.chunks.get_mut(&addr) else {
            return false;
        };
        chunk.remove_observer(id);
        if chunk.observers.is_empty() {
            self.chunks.remove(&addr);
            debug!("Evicted chunk {}", addr);
            true
        } else {
            false
        }
    }

    /// Remove `id` from every chunk. Returns how many chunks were evicted.
    pub fn unsubscribe_all(&mut self, id: &SessionId) -> usize {
        let observed: Vec<ChunkAddr> = self
            .chunks
            .values()
            .filter(|c| c.observers.contains(id))
            .map(Chunk::addr)
            .collect();

        observed
            .into_iter()
            .filter(|addr| self.unsubscribe(*addr, id))
            .count()
    }

    /// Apply a block change to the chunk containing it and write it through
    /// to storage.
    ///
    /// A failed save is logged and the change stays in memory. A chunk that
    /// nobody observes is dropped again once its change is saved.
    pub fn apply_block_change(&mut self, change: BlockSetParams, is_admin: bool) -> Result<AppliedChange, ChunkError> {
        let addr = chunk_addr_of(change.pos);
        let storage = self.storage.clone();
        let chunk = self.get_or_create(addr)?;

        let replaced = chunk.apply_block_change(&change, is_admin)?;
        let observers: Vec<SessionId> = chunk.observers.iter().copied().collect();

        let saved = match storage.save(addr, &chunk.modify_list) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to save chunk {}: {}", addr, e);
                false
            }
        };

        if saved && observers.is_empty() {
            self.chunks.remove(&addr);
        }

        Ok(AppliedChange { change, replaced, observers })
    }

    /// Drop a chunk that nobody observes. Returns true if it was dropped.
    pub fn release_if_unobserved(&mut self, addr: ChunkAddr) -> bool {
        match self.chunks.get(&addr) {
            Some(chunk) if chunk.observers.is_empty() => {
                self.chunks.remove(&addr);
                true
            }
            _ => false,
        }
    }
}
