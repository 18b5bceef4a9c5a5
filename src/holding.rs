//! The holding world: a static scene shown while no backend session exists

use crate::packet::{Packet, RawPacket};
use anyhow::Context;
use base64::Engine;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Spawn position inside the holding world
const SPAWN_X: f64 = 15.0;
const SPAWN_Y: f64 = 4.0;
const SPAWN_Z: f64 = 15.0;
const SPAWN_YAW: f32 = 137.0;

/// Adventure mode, so the scene cannot be edited
const HOLDING_GAME_MODE: i32 = 2;

/// Height of the flat floor used for the motion-blocking heightmap
const FLOOR_HEIGHT: u64 = 3;

/// How a client is entering the holding world
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldingEntry {
    /// The client has not received a login yet
    Login { self_ref: i32 },
    /// The client was playing on a backend that went away
    Demotion,
}

pub trait HoldingWorld: Send + Sync {
    /// Packets that put a client into the scene, in send order
    fn entry_packets(&self, entry: HoldingEntry) -> Vec<Packet>;
}

/// Chunks loaded once from `<x>_<z>.bin` files
#[derive(Debug, Clone)]
pub struct StaticHoldingWorld {
    chunks: BTreeMap<(i32, i32), Vec<u8>>,
    max_players: u32,
    view_distance: i32,
}

impl StaticHoldingWorld {
    /// A world without chunk data; clients see the void
    pub fn empty(max_players: u32, view_distance: i32) -> Self {
        Self {
            chunks: BTreeMap::new(),
            max_players,
            view_distance,
        }
    }

    pub fn load(dir: impl AsRef<Path>, max_players: u32, view_distance: i32) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut world = Self::empty(max_players, view_distance);

        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read holding world directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".bin") else {
                continue;
            };
            let position = parse_chunk_name(stem)
                .with_context(|| format!("Invalid chunk filename: {}", name))?;
            let data = std::fs::read(entry.path())
                .with_context(|| format!("Failed to read chunk {}", name))?;
            world.chunks.insert(position, data);
        }

        if world.chunks.is_empty() {
            warn!(dir = %dir.display(), "Holding world directory has no chunk files");
        }
        info!(chunks = world.chunks.len(), "Loaded holding world");
        Ok(world)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn login_packet(&self, self_ref: i32) -> Packet {
        Packet::Other(RawPacket::with_fields(
            "login",
            json!({
                "entityId": self_ref,
                "levelType": "default",
                "gameMode": HOLDING_GAME_MODE,
                "dimension": 0,
                "viewDistance": self.view_distance,
                "maxPlayers": self.max_players,
                "reducedDebugInfo": false,
                "enableRespawnScreen": true,
                "hashedSeed": [0, 0]
            }),
        ))
    }

    fn scene_packets(&self) -> Vec<Packet> {
        let heightmap = motion_blocking_heightmap(FLOOR_HEIGHT);
        let mut packets: Vec<Packet> = self
            .chunks
            .iter()
            .map(|(&(x, z), data)| {
                Packet::Other(RawPacket::with_fields(
                    "map_chunk",
                    json!({
                        "x": x,
                        "z": z,
                        "groundUp": false,
                        "bitMap": 0xffff,
                        "heightmaps": { "MOTION_BLOCKING": heightmap },
                        "chunkData": base64::engine::general_purpose::STANDARD.encode(data),
                        "blockEntities": []
                    }),
                ))
            })
            .collect();

        packets.push(Packet::Other(RawPacket::with_fields(
            "position",
            json!({
                "x": SPAWN_X,
                "y": SPAWN_Y,
                "z": SPAWN_Z,
                "yaw": SPAWN_YAW,
                "pitch": 0.0,
                "onGround": true,
                "flags": 0
            }),
        )));
        packets.push(Packet::Other(RawPacket::with_fields(
            "update_view_position",
            json!({ "chunkX": 0, "chunkZ": 0 }),
        )));
        packets
    }
}

impl HoldingWorld for StaticHoldingWorld {
    fn entry_packets(&self, entry: HoldingEntry) -> Vec<Packet> {
        let mut packets = match entry {
            HoldingEntry::Login { self_ref } => vec![self.login_packet(self_ref)],
            HoldingEntry::Demotion => respawn_pair(0, HOLDING_GAME_MODE, "default", json!([0, 0])),
        };
        packets.extend(self.scene_packets());
        packets
    }
}

/// Two respawns, through the nether and back, which makes the client drop
/// every chunk and entity it currently holds.
pub fn respawn_pair(
    dimension: i32,
    game_mode: i32,
    level_type: &str,
    hashed_seed: serde_json::Value,
) -> Vec<Packet> {
    let flush = if dimension == -1 { 0 } else { -1 };
    [flush, dimension]
        .into_iter()
        .map(|dim| {
            Packet::Other(RawPacket::with_fields(
                "respawn",
                json!({
                    "dimension": dim,
                    "gamemode": game_mode,
                    "levelType": level_type,
                    "hashedSeed": hashed_seed
                }),
            ))
        })
        .collect()
}

fn parse_chunk_name(stem: &str) -> anyhow::Result<(i32, i32)> {
    let (x, z) = stem
        .split_once('_')
        .ok_or_else(|| anyhow::anyhow!("no separator"))?;
    Ok((x.parse()?, z.parse()?))
}

/// 256 columns of 9-bit heights packed into 36 longs, most significant bit first
fn motion_blocking_heightmap(height: u64) -> Vec<i64> {
    const BITS: usize = 9;
    const COLUMNS: usize = 256;
    let mut longs = vec![0u64; COLUMNS * BITS / 64];
    for column in 0..COLUMNS {
        for bit in 0..BITS {
            if height >> (BITS - 1 - bit) & 1 == 1 {
                let index = column * BITS + bit;
                longs[index / 64] |= 1 << (63 - index % 64);
            }
        }
    }
    longs.into_iter().map(|l| l as i64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn kinds(packets: &[Packet]) -> Vec<&str> {
        packets.iter().map(|p| p.kind()).collect()
    }

    #[test]
    fn test_load_chunk_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("0_0.bin"), [1u8, 2, 3]).unwrap();
        std::fs::write(dir.path().join("-1_2.bin"), [4u8]).unwrap();
        std::fs::write(dir.path().join("README.txt"), "ignored").unwrap();

        let world = StaticHoldingWorld::load(dir.path(), 20, 10).unwrap();
        assert_eq!(world.chunk_count(), 2);
    }

    #[test]
    fn test_chunk_name_without_separator_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("00.bin"), [0u8]).unwrap();

        let err = StaticHoldingWorld::load(dir.path(), 20, 10).unwrap_err();
        assert!(err.to_string().contains("00.bin"));
    }

    #[test]
    fn test_login_entry_sequence() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("0_0.bin"), [9u8, 9]).unwrap();
        let world = StaticHoldingWorld::load(dir.path(), 20, 10).unwrap();

        let packets = world.entry_packets(HoldingEntry::Login { self_ref: i32::MAX });
        assert_eq!(
            kinds(&packets),
            vec!["login", "map_chunk", "position", "update_view_position"]
        );

        let login = packets[0].as_raw().unwrap();
        assert_eq!(login.get_i32("entityId"), Some(i32::MAX));
        assert_eq!(login.get_i32("gameMode"), Some(2));

        let chunk = packets[1].as_raw().unwrap();
        assert_eq!(chunk.get_str("chunkData"), Some("CQk="));

        let position = packets[2].as_raw().unwrap();
        assert_eq!(position.get("yaw"), Some(&json!(137.0)));
    }

    #[test]
    fn test_demotion_flushes_with_respawn_pair() {
        let world = StaticHoldingWorld::empty(20, 10);
        let packets = world.entry_packets(HoldingEntry::Demotion);
        assert_eq!(
            kinds(&packets),
            vec!["respawn", "respawn", "position", "update_view_position"]
        );
        assert_eq!(packets[0].as_raw().unwrap().get_i32("dimension"), Some(-1));
        assert_eq!(packets[1].as_raw().unwrap().get_i32("dimension"), Some(0));
    }

    #[test]
    fn test_respawn_pair_from_nether_flushes_through_overworld() {
        let packets = respawn_pair(-1, 0, "default", json!([1, 2]));
        assert_eq!(packets[0].as_raw().unwrap().get_i32("dimension"), Some(0));
        assert_eq!(packets[1].as_raw().unwrap().get_i32("dimension"), Some(-1));
    }

    #[test]
    fn test_heightmap_packing() {
        let longs = motion_blocking_heightmap(3);
        assert_eq!(longs.len(), 36);
        // First column occupies the top nine bits
        assert_eq!((longs[0] as u64) >> 55, 3);
        // Seven full columns fit in the first long, then one bit of the eighth
        assert_eq!((longs[0] as u64) & 1, 0);
    }
}
