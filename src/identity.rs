//! Entity identity mapping between the backend id space and the client id space
//!
//! The backend numbers its entities with small ascending integers and reuses
//! them every time the process restarts. Clients must keep seeing the same ids
//! for the same logical objects, so the proxy issues its own ids from the top
//! of the signed 32-bit range downward. The two ranges never meet, which means
//! a translated value never needs a tag saying which space it came from.

use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// First client-space id handed out
pub const CLIENT_SPACE_TOP: i32 = i32::MAX;

/// Lowest client-space id. Allocation stops before crossing it.
pub const CLIENT_SPACE_FLOOR: i32 = 1 << 30;

/// Errors from the identity space
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// Every id between the top and the floor has been issued this run
    #[error("client id space exhausted at floor {floor}")]
    Exhausted { floor: i32 },
}

/// Metadata attached to an entity the first time it is seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityTag {
    /// Registry type id from the spawn packet, if the entity was spawned as an object
    pub entity_type: Option<i32>,
}

impl EntityTag {
    pub fn of_type(entity_type: i32) -> Self {
        Self {
            entity_type: Some(entity_type),
        }
    }

    fn merge(&mut self, other: EntityTag) {
        if other.entity_type.is_some() {
            self.entity_type = other.entity_type;
        }
    }
}

/// One logical object known to the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityEntry {
    pub backend_id: i32,
    pub client_id: i32,
    pub tag: EntityTag,
}

/// Bidirectional map for one backend epoch.
///
/// Entries live in an arena indexed from both sides. A relink overwrites the
/// slot it replaces; [`reset`](IdentitySpace::reset) drops the whole arena when
/// a cold start begins a new epoch. The allocation watermark survives resets so that
/// ids already given to connected clients are never issued twice.
#[derive(Debug)]
pub struct IdentitySpace {
    next_client: i64,
    floor: i32,
    entries: Vec<IdentityEntry>,
    /// Arena slots left unreferenced by a relink
    free: Vec<usize>,
    by_backend: HashMap<i32, usize>,
    /// `None` marks an id that was allocated but has no backend counterpart yet
    by_client: HashMap<i32, Option<usize>>,
    epoch: u64,
}

impl Default for IdentitySpace {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentitySpace {
    pub fn new() -> Self {
        Self::with_floor(CLIENT_SPACE_FLOOR)
    }

    /// Create a space whose client range ends at `floor` instead of the default
    pub fn with_floor(floor: i32) -> Self {
        Self {
            next_client: i64::from(CLIENT_SPACE_TOP),
            floor,
            entries: Vec::new(),
            free: Vec::new(),
            by_backend: HashMap::new(),
            by_client: HashMap::new(),
            epoch: 0,
        }
    }

    /// Number of cold starts this space has been through
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of linked backend/client pairs
    pub fn len(&self) -> usize {
        self.by_backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_backend.is_empty()
    }

    /// Whether `id` lies in the range this space issues client ids from
    pub fn is_client_space(&self, id: i32) -> bool {
        id >= self.floor
    }

    /// Issue the next unused client id
    pub fn allocate(&mut self) -> Result<i32, IdentityError> {
        if self.next_client < i64::from(self.floor) {
            return Err(IdentityError::Exhausted { floor: self.floor });
        }
        let id = self.next_client as i32;
        self.next_client -= 1;
        self.by_client.insert(id, None);
        Ok(id)
    }

    /// Link `backend_id` and `client_id`, merging `tag` into the entry.
    ///
    /// Calling this twice with the same pair only merges metadata. If either
    /// side is already linked to something else, that stale link is removed
    /// first so the map stays a bijection.
    pub fn associate(
        &mut self,
        backend_id: i32,
        client_id: i32,
        tag: Option<EntityTag>,
    ) -> IdentityEntry {
        let mut slot = None;
        if let Some(&index) = self.by_backend.get(&backend_id) {
            let entry = &mut self.entries[index];
            if entry.client_id == client_id {
                if let Some(tag) = tag {
                    entry.tag.merge(tag);
                }
                return *entry;
            }
            warn!(
                backend_id,
                old_client_id = entry.client_id,
                client_id,
                "Relinking backend entity to a different client id"
            );
            self.by_client.insert(entry.client_id, None);
            slot = Some(index);
        }

        if let Some(Some(index)) = self.by_client.get(&client_id).copied() {
            let stale_backend = self.entries[index].backend_id;
            debug!(client_id, stale_backend, backend_id, "Client id moved to a new backend entity");
            self.by_backend.remove(&stale_backend);
            match slot {
                None => slot = Some(index),
                Some(_) => self.free.push(index),
            }
        }

        let entry = IdentityEntry {
            backend_id,
            client_id,
            tag: tag.unwrap_or_default(),
        };
        let index = match slot.or_else(|| self.free.pop()) {
            Some(index) => {
                self.entries[index] = entry;
                index
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        self.by_backend.insert(backend_id, index);
        self.by_client.insert(client_id, Some(index));
        entry
    }

    /// Client id for a backend id, materializing a new one on first sight
    pub fn from_backend(&mut self, backend_id: i32) -> Result<i32, IdentityError> {
        self.from_backend_entry(backend_id, None)
            .map(|entry| entry.client_id)
    }

    /// Like [`from_backend`](Self::from_backend) but returns the whole entry.
    ///
    /// `tag` is only applied when the entry is created here; an existing entry
    /// is returned as is.
    pub fn from_backend_entry(
        &mut self,
        backend_id: i32,
        tag: Option<EntityTag>,
    ) -> Result<IdentityEntry, IdentityError> {
        if let Some(&index) = self.by_backend.get(&backend_id) {
            return Ok(self.entries[index]);
        }
        let client_id = self.allocate()?;
        Ok(self.associate(backend_id, client_id, tag))
    }

    /// Backend id for a client id; `None` means there is no live counterpart
    pub fn from_client(&self, client_id: i32) -> Option<i32> {
        self.from_client_entry(client_id)
            .map(|entry| entry.backend_id)
    }

    pub fn from_client_entry(&self, client_id: i32) -> Option<IdentityEntry> {
        self.by_client
            .get(&client_id)
            .copied()
            .flatten()
            .map(|index| self.entries[index])
    }

    /// Discard every entry and begin a new epoch
    pub fn reset(&mut self) {
        self.entries.clear();
        self.free.clear();
        self.by_backend.clear();
        self.by_client.clear();
        self.epoch += 1;
        debug!(epoch = self.epoch, "Identity space reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relinking_reuses_arena_slots() {
        let mut ids = IdentitySpace::new();
        let self_ref = ids.allocate().unwrap();
        for backend_id in 0..100 {
            ids.associate(backend_id, self_ref, None);
        }
        assert_eq!(ids.entries.len(), 1);
        assert_eq!(ids.len(), 1);
        assert_eq!(ids.from_client(self_ref), Some(99));

        // Moving both sides at once frees one slot for the next entry
        let other = ids.allocate().unwrap();
        ids.associate(500, other, None);
        ids.associate(500, self_ref, None);
        assert_eq!(ids.len(), 1);
        assert_eq!(ids.from_client(other), None);

        ids.associate(600, other, None);
        assert_eq!(ids.entries.len(), 2);
        assert_eq!(ids.from_client(self_ref), Some(500));
        assert_eq!(ids.from_client(other), Some(600));
    }

    #[test]
    fn test_allocate_counts_down_from_top() {
        let mut ids = IdentitySpace::new();
        assert_eq!(ids.allocate().unwrap(), i32::MAX);
        assert_eq!(ids.allocate().unwrap(), i32::MAX - 1);
        assert_eq!(ids.allocate().unwrap(), i32::MAX - 2);
    }

    #[test]
    fn test_from_backend_is_idempotent() {
        let mut ids = IdentitySpace::new();
        let first = ids.from_backend(12).unwrap();
        let second = ids.from_backend(12).unwrap();
        assert_eq!(first, second);
        assert_ne!(ids.from_backend(13).unwrap(), first);
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_from_client_misses_unknown_ids() {
        let mut ids = IdentitySpace::new();
        assert_eq!(ids.from_client(i32::MAX), None);

        // Allocated but never associated is still a miss
        let allocated = ids.allocate().unwrap();
        assert_eq!(ids.from_client(allocated), None);
        assert_eq!(ids.from_client(42), None);
    }

    #[test]
    fn test_round_trip_through_both_directions() {
        let mut ids = IdentitySpace::new();
        let client = ids.from_backend(7).unwrap();
        assert_eq!(ids.from_client(client), Some(7));
    }

    #[test]
    fn test_tag_visible_from_both_directions() {
        let mut ids = IdentitySpace::new();
        let entry = ids
            .from_backend_entry(3, Some(EntityTag::of_type(2)))
            .unwrap();
        assert_eq!(entry.tag.entity_type, Some(2));

        let by_client = ids.from_client_entry(entry.client_id).unwrap();
        assert_eq!(by_client.tag.entity_type, Some(2));
        assert_eq!(by_client.backend_id, 3);

        // Existing entries keep their original tag
        let again = ids
            .from_backend_entry(3, Some(EntityTag::of_type(99)))
            .unwrap();
        assert_eq!(again.tag.entity_type, Some(2));
    }

    #[test]
    fn test_associate_same_pair_is_idempotent() {
        let mut ids = IdentitySpace::new();
        let client = ids.allocate().unwrap();
        let first = ids.associate(5, client, None);
        let second = ids.associate(5, client, Some(EntityTag::of_type(9)));
        assert_eq!(first.client_id, second.client_id);
        assert_eq!(second.tag.entity_type, Some(9));
        assert_eq!(ids.len(), 1);
        assert_eq!(ids.from_backend(5).unwrap(), client);
    }

    #[test]
    fn test_associate_relink_keeps_bijection() {
        let mut ids = IdentitySpace::new();
        let materialized = ids.from_backend(1).unwrap();
        let player = ids.allocate().unwrap();

        ids.associate(1, player, None);

        assert_eq!(ids.from_backend(1).unwrap(), player);
        assert_eq!(ids.from_client(player), Some(1));
        assert_eq!(ids.from_client(materialized), None);
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_client_and_backend_ranges_stay_disjoint() {
        let floor = i32::MAX - 64;
        let mut ids = IdentitySpace::with_floor(floor);
        let mut issued = Vec::new();
        while let Ok(id) = ids.allocate() {
            issued.push(id);
        }
        assert_eq!(issued.len(), 65);
        assert!(issued.iter().all(|&id| id >= floor));
        assert!(issued.iter().all(|&id| ids.is_client_space(id)));
        assert!(!ids.is_client_space(0));
        assert!(!ids.is_client_space(10_000));
        assert_eq!(
            ids.allocate(),
            Err(IdentityError::Exhausted { floor })
        );
    }

    #[test]
    fn test_from_backend_fails_only_when_exhausted() {
        let mut ids = IdentitySpace::with_floor(i32::MAX);
        assert_eq!(ids.from_backend(0).unwrap(), i32::MAX);
        assert!(ids.from_backend(1).is_err());
        // Known ids still resolve
        assert_eq!(ids.from_backend(0).unwrap(), i32::MAX);
    }

    #[test]
    fn test_reset_discards_entries_but_not_watermark() {
        let mut ids = IdentitySpace::new();
        let player = ids.allocate().unwrap();
        ids.associate(0, player, None);
        ids.from_backend(1).unwrap();

        ids.reset();

        assert!(ids.is_empty());
        assert_eq!(ids.epoch(), 1);
        assert_eq!(ids.from_client(player), None);
        let next = ids.allocate().unwrap();
        assert!(next < player);
    }
}
