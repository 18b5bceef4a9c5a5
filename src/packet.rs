//! Decoded packet model
//!
//! Packets whose entity references need special handling get their own typed
//! struct. Everything else stays a [`RawPacket`]: a kind name plus an open
//! field map, which is how the codec hands packets over in the first place.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind name of the registry tags packet
pub const TAGS: &str = "tags";
/// Kind name of the entity metadata update packet
pub const ENTITY_METADATA: &str = "entity_metadata";
/// Kind name of the object spawn packet
pub const SPAWN_ENTITY: &str = "spawn_entity";

/// A packet as produced by the codec: kind plus named fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPacket {
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RawPacket {
    /// Build a packet from a JSON object literal; non-object values yield no fields
    pub fn with_fields(kind: impl Into<String>, fields: Value) -> Self {
        Self {
            kind: kind.into(),
            fields: into_object(fields),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        self.fields
            .get(name)
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.to_string(), value.into());
    }
}

/// One named group of entity references inside a tags packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceGroup {
    pub tag_name: String,
    #[serde(default)]
    pub entries: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagsPacket {
    #[serde(default)]
    pub entity_tags: Vec<ReferenceGroup>,
    /// Block, item and fluid tags, passed through untouched
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub key: u8,
    #[serde(rename = "type")]
    pub value_type: i32,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMetadataPacket {
    pub entity_id: i32,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnEntityPacket {
    pub entity_id: i32,
    #[serde(rename = "type")]
    pub entity_type: i32,
    #[serde(default)]
    pub object_data: i32,
    /// Uuid, position, rotation and velocity
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// A decoded packet, typed where entity references need special rules
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Tags(TagsPacket),
    EntityMetadata(EntityMetadataPacket),
    SpawnEntity(SpawnEntityPacket),
    Other(RawPacket),
}

impl Packet {
    pub fn kind(&self) -> &str {
        match self {
            Packet::Tags(_) => TAGS,
            Packet::EntityMetadata(_) => ENTITY_METADATA,
            Packet::SpawnEntity(_) => SPAWN_ENTITY,
            Packet::Other(raw) => &raw.kind,
        }
    }

    /// Lift a raw packet into its typed variant when the kind has one
    pub fn from_raw(raw: RawPacket) -> Result<Self, serde_json::Error> {
        let packet = match raw.kind.as_str() {
            TAGS => Packet::Tags(serde_json::from_value(Value::Object(raw.fields))?),
            ENTITY_METADATA => {
                Packet::EntityMetadata(serde_json::from_value(Value::Object(raw.fields))?)
            }
            SPAWN_ENTITY => Packet::SpawnEntity(serde_json::from_value(Value::Object(raw.fields))?),
            _ => Packet::Other(raw),
        };
        Ok(packet)
    }

    pub fn into_raw(self) -> Result<RawPacket, serde_json::Error> {
        let (kind, fields) = match self {
            Packet::Tags(p) => (TAGS, serde_json::to_value(p)?),
            Packet::EntityMetadata(p) => (ENTITY_METADATA, serde_json::to_value(p)?),
            Packet::SpawnEntity(p) => (SPAWN_ENTITY, serde_json::to_value(p)?),
            Packet::Other(raw) => return Ok(raw),
        };
        Ok(RawPacket::with_fields(kind, fields))
    }

    /// Borrow the generic variant, if this is one
    pub fn as_raw(&self) -> Option<&RawPacket> {
        match self {
            Packet::Other(raw) => Some(raw),
            _ => None,
        }
    }
}

impl From<RawPacket> for Packet {
    /// Infallible conversion that keeps malformed typed kinds as raw packets
    fn from(raw: RawPacket) -> Self {
        match Packet::from_raw(raw.clone()) {
            Ok(packet) => packet,
            Err(_) => Packet::Other(raw),
        }
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
