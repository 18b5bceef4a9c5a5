//! Entity reference rewriting for packets in flight
//!
//! Every packet that names an entity is rewritten between backend ids and
//! client ids. A reference with no counterpart makes the packet (or the
//! offending element) disappear rather than reach the other side carrying an
//! id that means something else there.

use crate::config::TranslationConfig;
use crate::identity::{EntityTag, IdentitySpace};
use crate::packet::{EntityMetadataPacket, Packet, RawPacket, SpawnEntityPacket, TagsPacket};
use serde_json::Value;
use tracing::debug;

/// Scalar fields holding an entity id in generic packets
pub const REFERENCE_FIELDS: &[&str] = &["entityId", "collectedEntityId", "collectorEntityId"];

/// Array fields holding entity ids in generic packets
pub const REFERENCE_ARRAY_FIELDS: &[&str] = &["entityIds", "passengers"];

/// Which way a packet is travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From a player to the backend: client ids become backend ids
    ToBackend,
    /// From the backend to a player: backend ids become client ids
    ToClient,
}

/// Result of translating one packet
#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    /// Send the rewritten packet on
    Forward(Packet),
    /// Discard the packet entirely
    Drop,
}

impl Translation {
    pub fn is_drop(&self) -> bool {
        matches!(self, Translation::Drop)
    }
}

/// Rewrites entity references using the rules configured per entity type
#[derive(Debug, Clone, Default)]
pub struct PacketTranslator {
    table: TranslationConfig,
}

impl PacketTranslator {
    pub fn new(table: TranslationConfig) -> Self {
        Self { table }
    }

    pub fn translate(
        &self,
        ids: &mut IdentitySpace,
        packet: Packet,
        direction: Direction,
    ) -> Translation {
        let translated = match packet {
            Packet::Tags(tags) => translate_tags(ids, tags, direction).map(Packet::Tags),
            Packet::EntityMetadata(update) => self
                .translate_metadata(ids, update, direction)
                .map(Packet::EntityMetadata),
            Packet::SpawnEntity(spawn) => self
                .translate_spawn(ids, spawn, direction)
                .map(Packet::SpawnEntity),
            Packet::Other(raw) => translate_generic(ids, raw, direction).map(Packet::Other),
        };

        match translated {
            Some(packet) => Translation::Forward(packet),
            None => Translation::Drop,
        }
    }

    fn translate_metadata(
        &self,
        ids: &mut IdentitySpace,
        mut update: EntityMetadataPacket,
        direction: Direction,
    ) -> Option<EntityMetadataPacket> {
        let (translated, tag) = lookup_entry(ids, update.entity_id, direction, None)?;
        update.entity_id = translated;

        let Some(key) = tag
            .entity_type
            .and_then(|t| self.table.metadata_reference_key(t))
        else {
            return Some(update);
        };

        for entry in update.metadata.iter_mut().filter(|e| e.key == key) {
            let Some(value) = as_i32(&entry.value) else {
                continue;
            };
            let translated = lookup_offset(ids, value, direction)
                .or_else(|| miss("entity_metadata", "embedded", value, direction))?;
            entry.value = Value::from(translated);
        }
        Some(update)
    }

    fn translate_spawn(
        &self,
        ids: &mut IdentitySpace,
        mut spawn: SpawnEntityPacket,
        direction: Direction,
    ) -> Option<SpawnEntityPacket> {
        let tag = EntityTag::of_type(spawn.entity_type);
        let (translated, _) = lookup_entry(ids, spawn.entity_id, direction, Some(tag))?;
        if direction == Direction::ToClient {
            // A reused backend id may carry a stale type from an earlier sighting
            ids.associate(spawn.entity_id, translated, Some(tag));
        }
        spawn.entity_id = translated;

        let object_data = spawn.object_data;
        if self.table.is_direct_object_data(spawn.entity_type) {
            spawn.object_data = lookup(ids, object_data, direction)
                .or_else(|| miss("spawn_entity", "objectData", object_data, direction))?;
        } else if self.table.is_offset_object_data(spawn.entity_type) {
            spawn.object_data = lookup_offset(ids, object_data, direction)
                .or_else(|| miss("spawn_entity", "objectData", object_data, direction))?;
        }
        Some(spawn)
    }
}

fn translate_tags(
    ids: &mut IdentitySpace,
    mut tags: TagsPacket,
    direction: Direction,
) -> Option<TagsPacket> {
    match direction {
        Direction::ToBackend => {
            for group in tags.entity_tags.iter_mut() {
                group.entries = group
                    .entries
                    .iter()
                    .filter_map(|&id| ids.from_client(id))
                    .collect();
            }
            tags.entity_tags.retain(|group| {
                if group.entries.is_empty() {
                    debug!(tag = %group.tag_name, "Tag has no translatable entries, removing");
                }
                !group.entries.is_empty()
            });
            if tags.entity_tags.is_empty() {
                debug!("Tags packet has no entity groups left, dropping");
                return None;
            }
        }
        Direction::ToClient => {
            // Untranslatable entries are left in place
            for group in tags.entity_tags.iter_mut() {
                for entry in group.entries.iter_mut() {
                    if let Some(translated) = lookup(ids, *entry, direction) {
                        *entry = translated;
                    }
                }
            }
        }
    }
    Some(tags)
}

fn translate_generic(
    ids: &mut IdentitySpace,
    mut raw: RawPacket,
    direction: Direction,
) -> Option<RawPacket> {
    for &field in REFERENCE_FIELDS {
        let Some(id) = raw.get_i32(field) else {
            continue;
        };
        let translated =
            lookup(ids, id, direction).or_else(|| miss(&raw.kind, field, id, direction))?;
        raw.set(field, translated);
    }

    for &field in REFERENCE_ARRAY_FIELDS {
        let Some(Value::Array(items)) = raw.fields.get(field) else {
            continue;
        };
        let mut translated = Vec::with_capacity(items.len());
        for item in items {
            let Some(id) = as_i32(item) else {
                translated.push(item.clone());
                continue;
            };
            match lookup(ids, id, direction) {
                Some(t) => translated.push(Value::from(t)),
                None if direction == Direction::ToBackend => {
                    debug!(kind = %raw.kind, field, id, "Filtering untranslatable entity id");
                }
                None => return miss(&raw.kind, field, id, direction),
            }
        }
        if direction == Direction::ToBackend && translated.is_empty() {
            debug!(kind = %raw.kind, field, "No entity ids left in array, dropping packet");
            return None;
        }
        raw.set(field, Value::Array(translated));
    }

    Some(raw)
}

fn lookup(ids: &mut IdentitySpace, id: i32, direction: Direction) -> Option<i32> {
    lookup_entry(ids, id, direction, None).map(|(translated, _)| translated)
}

/// Translate an id that is encoded as `id + 1`, where 0 means no entity
fn lookup_offset(ids: &mut IdentitySpace, value: i32, direction: Direction) -> Option<i32> {
    if value == 0 {
        return Some(0);
    }
    // Wrapping matches the wire: i32::MAX + 1 decodes back to i32::MAX on the client
    lookup(ids, value.wrapping_sub(1), direction).map(|t| t.wrapping_add(1))
}

fn lookup_entry(
    ids: &mut IdentitySpace,
    id: i32,
    direction: Direction,
    tag: Option<EntityTag>,
) -> Option<(i32, EntityTag)> {
    match direction {
        Direction::ToBackend => ids
            .from_client_entry(id)
            .map(|entry| (entry.backend_id, entry.tag)),
        Direction::ToClient => match ids.from_backend_entry(id, tag) {
            Ok(entry) => Some((entry.client_id, entry.tag)),
            Err(e) => {
                debug!(id, error = %e, "Cannot materialize client id");
                None
            }
        },
    }
}

fn miss<T>(kind: &str, field: &str, id: i32, direction: Direction) -> Option<T> {
    debug!(kind, field, id, ?direction, "No counterpart for entity reference, dropping packet");
    None
}

fn as_i32(value: &Value) -> Option<i32> {
    value.as_i64().and_then(|v| i32::try_from(v).ok())
}
