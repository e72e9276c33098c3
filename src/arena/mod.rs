//! Arena definitions supplied by the hosting server
//!
//! Arenas are read-only from the engine's point of view. Every location handed
//! out is an owned clone, so nothing here can be mutated through a session.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Stable arena identity (the arena's configured name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArenaId(String);

impl ArenaId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArenaId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A position in a named world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub yaw: f32,
    #[serde(default)]
    pub pitch: f32,
}

impl Location {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
            yaw: 0.0,
            pitch: 0.0,
        }
    }
}

/// Point-in-time view of an arena's layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaSnapshot {
    pub id: ArenaId,
    pub world: String,
    /// Whether the arena world was loaded when the snapshot was taken
    pub world_loaded: bool,
    pub spawn_points: Vec<Location>,
    pub center: Option<Location>,
    pub chest_locations: Vec<Location>,
    pub min_players: usize,
    pub max_players: usize,
}

impl ArenaSnapshot {
    /// Number of players the arena can hold; one per spawn point
    pub fn capacity(&self) -> usize {
        self.spawn_points.len()
    }

    pub fn spawn_point(&self, index: usize) -> Option<Location> {
        self.spawn_points.get(index).cloned()
    }
}

/// Source of arena layouts
pub trait ArenaProvider: Send + Sync {
    /// Snapshot an arena by id, or `None` if it is not configured
    fn snapshot(&self, id: &ArenaId) -> Option<ArenaSnapshot>;

    /// Ids of every configured arena
    fn arena_ids(&self) -> Vec<ArenaId>;
}

/// Arena provider backed by an in-memory table
#[derive(Default, Clone)]
pub struct StaticArenas {
    arenas: Arc<DashMap<ArenaId, ArenaSnapshot>>,
}

impl StaticArenas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table from a JSON array of arena snapshots
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let arenas = Self::new();
        for arena in serde_json::from_str::<Vec<ArenaSnapshot>>(json)? {
            arenas.insert(arena);
        }
        Ok(arenas)
    }

    pub fn insert(&self, arena: ArenaSnapshot) {
        self.arenas.insert(arena.id.clone(), arena);
    }

    /// Flip the loaded flag of an arena's world
    pub fn set_world_loaded(&self, id: &ArenaId, loaded: bool) {
        if let Some(mut arena) = self.arenas.get_mut(id) {
            arena.world_loaded = loaded;
        }
    }
}

impl ArenaProvider for StaticArenas {
    fn snapshot(&self, id: &ArenaId) -> Option<ArenaSnapshot> {
        self.arenas.get(id).map(|a| a.value().clone())
    }

    fn arena_ids(&self) -> Vec<ArenaId> {
        let mut ids: Vec<ArenaId> = self.arenas.iter().map(|a| a.key().clone()).collect();
        ids.sort();
        ids
    }
}
