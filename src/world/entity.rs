//! Block Entities
//!
//! Blocks that carry state beyond their id. Chests are the only kind: a
//! fixed number of item slots, persisted as a single JSON file next to the
//! world metadata.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::network::protocol::{BlockItem, LoadChestParams, SetChestSlotItemParams};
use crate::network::session::SessionId;

/// Number of slots in a chest.
pub const CHEST_SLOT_COUNT: u32 = 27;

/// Item stack in a chest slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotItem {
    /// Item id.
    pub id: u32,
    /// Stack size.
    pub count: u32,
}

/// A chest and its contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chest {
    /// Entity id.
    pub entity_id: String,
    /// Block the chest was placed as.
    pub item: BlockItem,
    /// Occupied slots.
    pub slots: BTreeMap<u32, SlotItem>,
}

/// Chest contents after a slot change, with everyone who has it open.
#[derive(Debug, Clone, PartialEq)]
pub struct ChestUpdate {
    /// Updated chest.
    pub chest: Chest,
    /// Sessions that loaded this chest.
    pub viewers: Vec<SessionId>,
}

/// Entity errors.
#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    /// No entity with that id.
    #[error("entity not found: {0}")]
    NotFound(String),

    /// Entity id already taken.
    #[error("entity already exists: {0}")]
    AlreadyExists(String),

    /// Slot index outside the chest.
    #[error("slot {0} out of range")]
    InvalidSlot(u32),

    /// Session edited a chest it never opened.
    #[error("session {session} has not opened chest {entity_id}")]
    NotViewing {
        /// Editing session.
        session: SessionId,
        /// Chest entity id.
        entity_id: String,
    },

    /// Failed to read or write the chest file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Chest file is corrupt.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Entity/inventory service used by the world.
///
/// Called with the world lock held, so implementations need no locking of
/// their own.
pub trait EntityService: Send {
    /// Register the entity a placed block carries, assigning its id when the
    /// item has none.
    fn create_entity(&mut self, item: &mut BlockItem) -> Result<(), EntityError>;

    /// Open a chest for `session` and return its contents.
    fn load_chest(&mut self, params: &LoadChestParams, session: &SessionId) -> Result<Chest, EntityError>;

    /// Change one slot of a chest `session` has open.
    fn set_chest_slot_item(
        &mut self,
        params: &SetChestSlotItemParams,
        session: &SessionId,
    ) -> Result<ChestUpdate, EntityError>;

    /// Delete an entity whose block was replaced.
    fn remove_entity(&mut self, entity_id: &str) -> Result<(), EntityError>;

    /// Drop every reference to a departed session.
    fn forget_session(&mut self, session: &SessionId);
}

/// Chest store, optionally backed by a JSON file.
#[derive(Debug, Default)]
pub struct ChestManager {
    chests: BTreeMap<String, Chest>,
    viewers: BTreeMap<String, BTreeSet<SessionId>>,
    path: Option<PathBuf>,
}

impl ChestManager {
    /// Store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Store persisted at `path`, loading existing chests if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EntityError> {
        let path = path.as_ref().to_path_buf();
        let chests = if path.exists() {
            serde_json::from_reader(std::fs::File::open(&path)?)?
        } else {
            BTreeMap::new()
        };
        debug!("Loaded {} chests from {}", chests.len(), path.display());

        Ok(Self {
            chests,
            viewers: BTreeMap::new(),
            path: Some(path),
        })
    }

    /// Number of chests.
    pub fn len(&self) -> usize {
        self.chests.len()
    }

    /// Whether there are no chests.
    pub fn is_empty(&self) -> bool {
        self.chests.is_empty()
    }

    /// Look up a chest.
    pub fn get(&self, entity_id: &str) -> Option<&Chest> {
        self.chests.get(entity_id)
    }

    fn save(&self) -> Result<(), EntityError> {
        if let Some(ref path) = self.path {
            let tmp = path.with_extension("json.tmp");
            serde_json::to_writer_pretty(std::fs::File::create(&tmp)?, &self.chests)?;
            std::fs::rename(&tmp, path)?;
        }
        Ok(())
    }
}

impl EntityService for ChestManager {
    fn create_entity(&mut self, item: &mut BlockItem) -> Result<(), EntityError> {
        let entity_id = item
            .entity_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();

        if self.chests.contains_key(&entity_id) {
            return Err(EntityError::AlreadyExists(entity_id));
        }

        self.chests.insert(entity_id.clone(), Chest {
            entity_id,
            item: item.clone(),
            slots: BTreeMap::new(),
        });
        self.save()
    }

    fn load_chest(&mut self, params: &LoadChestParams, session: &SessionId) -> Result<Chest, EntityError> {
        let chest = self
            .chests
            .get(&params.entity_id)
            .ok_or_else(|| EntityError::NotFound(params.entity_id.clone()))?
            .clone();

        self.viewers
            .entry(params.entity_id.clone())
            .or_default()
            .insert(*session);

        Ok(chest)
    }

    fn set_chest_slot_item(
        &mut self,
        params: &SetChestSlotItemParams,
        session: &SessionId,
    ) -> Result<ChestUpdate, EntityError> {
        if params.slot_index >= CHEST_SLOT_COUNT {
            return Err(EntityError::InvalidSlot(params.slot_index));
        }

        let viewing = self
            .viewers
            .get(&params.entity_id)
            .is_some_and(|v| v.contains(session));
        if !viewing {
            return Err(EntityError::NotViewing {
                session: *session,
                entity_id: params.entity_id.clone(),
            });
        }

        let chest = self
            .chests
            .get_mut(&params.entity_id)
            .ok_or_else(|| EntityError::NotFound(params.entity_id.clone()))?;

        match params.item {
            Some(item) if item.count > 0 => {
                chest.slots.insert(params.slot_index, item);
            }
            _ => {
                chest.slots.remove(&params.slot_index);
            }
        }

        let chest = chest.clone();
        self.save()?;

        let viewers = self
            .viewers
            .get(&params.entity_id)
            .map(|v| v.iter().copied().collect())
            .unwrap_or_default();

        Ok(ChestUpdate { chest, viewers })
    }

    fn remove_entity(&mut self, entity_id: &str) -> Result<(), EntityError> {
        if self.chests.remove(entity_id).is_none() {
            return Err(EntityError::NotFound(entity_id.to_string()));
        }
        self.viewers.remove(entity_id);
        debug!("Removed chest {}", entity_id);
        self.save()
    }

    fn forget_session(&mut self, session: &SessionId) {
        for viewers in self.viewers.values_mut() {
            viewers.remove(session);
        }
        self.viewers.retain(|_, v| !v.is_empty());
    }
}
