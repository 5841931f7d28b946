//! File-backed world persistence.
//!
//! Layout inside `<worlds_root>/<world_id>`:
//! ```text
//! world.json            - id, seed, creation time
//! chests.json           - block entities
//! chunks/
//!   {x}_{y}_{z}.bin     - bincode modify list per modified chunk
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::{debug, info};

use crate::core::coord::ChunkAddr;
use crate::core::vector::Vector3;
use crate::network::protocol::BlockItem;

/// Current schema version of `world.json`.
const WORLD_SCHEMA_VERSION: u32 = 1;

/// Block changes of one chunk, keyed by block-local position.
pub type ModifyList = BTreeMap<Vector3, BlockItem>;

/// Errors from world persistence.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `world.json` unreadable.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Chunk file unreadable.
    #[error("chunk encoding error: {0}")]
    Bincode(#[from] bincode::Error),

    /// World id is not a single path component.
    #[error("invalid world id: {0:?}")]
    InvalidWorldId(String),

    /// `world.json` written by an incompatible version.
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        /// Version found on disk.
        file_version: u32,
        /// Version this build writes.
        expected_version: u32,
    },

    /// `world.json` belongs to another world.
    #[error("world directory holds {found:?}, expected {expected:?}")]
    WorldMismatch {
        /// Id requested.
        expected: String,
        /// Id on disk.
        found: String,
    },
}

/// Metadata stored in `world.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldMeta {
    /// Schema version.
    pub schema_version: u32,
    /// World id.
    pub id: String,
    /// Terrain seed.
    pub seed: String,
    /// When the world was first created; the world clock counts from here.
    pub create_time: DateTime<Utc>,
}

/// A bootstrapped world directory.
#[derive(Debug, Clone)]
pub struct WorldDirectory {
    root: PathBuf,
    meta: WorldMeta,
}

impl WorldDirectory {
    /// Open `<worlds_root>/<world_id>`, creating it and its metadata if absent.
    ///
    /// `seed` is only used for a new world; an existing world keeps its seed.
    pub fn open(worlds_root: impl AsRef<Path>, world_id: &str, seed: &str) -> Result<Self, StorageError> {
        if world_id.is_empty()
            || world_id == "."
            || world_id == ".."
            || world_id.contains(['/', '\\'])
        {
            return Err(StorageError::InvalidWorldId(world_id.to_string()));
        }

        let root = worlds_root.as_ref().join(world_id);
        std::fs::create_dir_all(root.join("chunks"))?;

        let meta_path = root.join("world.json");
        let meta = if meta_path.exists() {
            let meta: WorldMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
            if meta.schema_version != WORLD_SCHEMA_VERSION {
                return Err(StorageError::SchemaMismatch {
                    file_version: meta.schema_version,
                    expected_version: WORLD_SCHEMA_VERSION,
                });
            }
            if meta.id != world_id {
                return Err(StorageError::WorldMismatch {
                    expected: world_id.to_string(),
                    found: meta.id,
                });
            }
            debug!("Opened world {} created {}", meta.id, meta.create_time);
            meta
        } else {
            let meta = WorldMeta {
                schema_version: WORLD_SCHEMA_VERSION,
                id: world_id.to_string(),
                seed: seed.to_string(),
                create_time: Utc::now(),
            };
            serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, &meta)?;
            info!("Created world {} at {}", world_id, root.display());
            meta
        };

        Ok(Self { root, meta })
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// World metadata.
    pub fn meta(&self) -> &WorldMeta {
        &self.meta
    }

    /// Chest file path.
    pub fn chests_path(&self) -> PathBuf {
        self.root.join("chests.json")
    }

    /// Chunk storage rooted in this directory.
    pub fn chunk_storage(&self) -> FileChunkStorage {
        FileChunkStorage::new(self.root.join("chunks"))
    }
}

// =============================================================================
// CHUNK STORAGE
// =============================================================================

/// Persistence for chunk modify lists.
///
/// Implementations are scoped to a single world.
pub trait ChunkStorage: Send + Sync {
    /// Recorded changes of a chunk; empty if it was never modified.
    fn load(&self, addr: ChunkAddr) -> Result<ModifyList, StorageError>;

    /// Replace the recorded changes of a chunk.
    fn save(&self, addr: ChunkAddr, list: &ModifyList) -> Result<(), StorageError>;
}

/// One bincode file per modified chunk.
#[derive(Debug, Clone)]
pub struct FileChunkStorage {
    dir: PathBuf,
}

impl FileChunkStorage {
    /// Storage writing into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn chunk_path(&self, addr: ChunkAddr) -> PathBuf {
        self.dir.join(format!("{}_{}_{}.bin", addr.x, addr.y, addr.z))
    }
}

impl ChunkStorage for FileChunkStorage {
    fn load(&self, addr: ChunkAddr) -> Result<ModifyList, StorageError> {
        let path = self.chunk_path(addr);
        if !path.exists() {
            return Ok(ModifyList::new());
        }
        let bytes = std::fs::read(&path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn save(&self, addr: ChunkAddr, list: &ModifyList) -> Result<(), StorageError> {
        let path = self.chunk_path(addr);
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, bincode::serialize(list)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Chunk storage held in memory; loses everything on drop.
#[derive(Debug, Default)]
pub struct MemoryChunkStorage {
    chunks: Mutex<BTreeMap<ChunkAddr, ModifyList>>,
    loads: AtomicUsize,
}

impl MemoryChunkStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `load` was called.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ChunkStorage for MemoryChunkStorage {
    fn load(&self, addr: ChunkAddr) -> Result<ModifyList, StorageError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(chunks.get(&addr).cloned().unwrap_or_default())
    }

    fn save(&self, addr: ChunkAddr, list: &ModifyList) -> Result<(), StorageError> {
        let mut chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
        chunks.insert(addr, list.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("voxel-world-test-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_open_creates_directory_and_meta() {
        let root = temp_root();
        let dir = WorldDirectory::open(&root, "alpha", "seed-1").unwrap();

        assert!(dir.path().join("world.json").exists());
        assert!(dir.path().join("chunks").is_dir());
        assert_eq!(dir.meta().id, "alpha");
        assert_eq!(dir.meta().seed, "seed-1");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_reopen_keeps_create_time_and_seed() {
        let root = temp_root();
        let first = WorldDirectory::open(&root, "alpha", "seed-1").unwrap();
        let second = WorldDirectory::open(&root, "alpha", "other-seed").unwrap();

        assert_eq!(first.meta(), second.meta());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_rejects_path_like_world_ids() {
        let root = temp_root();
        for bad in ["", "..", "a/b", "a\\b"] {
            assert!(matches!(
                WorldDirectory::open(&root, bad, "s"),
                Err(StorageError::InvalidWorldId(_))
            ));
        }
    }

    #[test]
    fn test_file_chunk_storage_roundtrip() {
        let root = temp_root();
        let dir = WorldDirectory::open(&root, "alpha", "s").unwrap();
        let storage = dir.chunk_storage();
        let addr = Vector3::new(-1, 0, 4);

        assert!(storage.load(addr).unwrap().is_empty());

        let mut list = ModifyList::new();
        list.insert(Vector3::new(1, 1, 1), BlockItem::new(3));
        let mut rotated = BlockItem::new(54);
        rotated.entity_id = Some("chest-1".to_string());
        list.insert(Vector3::new(15, 31, 0), rotated);
        storage.save(addr, &list).unwrap();

        assert_eq!(storage.load(addr).unwrap(), list);
        assert!(storage.load(Vector3::new(0, 0, 0)).unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_corrupt_chunk_file_is_an_error() {
        let root = temp_root();
        let dir = WorldDirectory::open(&root, "alpha", "s").unwrap();
        std::fs::write(dir.path().join("chunks").join("0_0_0.bin"), [0xff, 0xff, 0xff]).unwrap();

        let result = dir.chunk_storage().load(Vector3::ZERO);
        assert!(matches!(result, Err(StorageError::Bincode(_))));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_memory_storage_counts_loads() {
        let storage = MemoryChunkStorage::new();
        storage.load(Vector3::ZERO).unwrap();
        storage.load(Vector3::ZERO).unwrap();
        assert_eq!(storage.load_count(), 2);
    }
}
