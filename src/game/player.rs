//! Player identity and the restorable pre-match state

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::arena::Location;

/// Player identity (the platform's persistent player UUID)
pub type PlayerId = Uuid;

/// Number of armor slots (boots, leggings, chestplate, helmet)
pub const ARMOR_SLOTS: usize = 4;

/// Player inventory size (hotbar + main inventory)
pub const INVENTORY_SLOTS: usize = 36;

/// Max hunger level on the hosting platform
pub const MAX_FOOD_LEVEL: u32 = 20;

/// Saturation granted to a fresh player
pub const DEFAULT_SATURATION: f32 = 5.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    pub material: String,
    pub amount: u32,
}

impl ItemStack {
    pub fn new(material: impl Into<String>, amount: u32) -> Self {
        Self {
            material: material.into(),
            amount,
        }
    }
}

/// An active timed potion effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEffect {
    pub kind: String,
    pub amplifier: u8,
    pub duration_ticks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    Survival,
    Creative,
    Adventure,
    Spectator,
}

/// Everything about a player that a match overwrites and must give back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub inventory: Vec<Option<ItemStack>>,
    pub armor: [Option<ItemStack>; ARMOR_SLOTS],
    pub level: u32,
    /// Progress towards the next level, 0.0..1.0
    pub exp_progress: f32,
    pub food_level: u32,
    pub saturation: f32,
    pub effects: Vec<StatusEffect>,
    pub location: Location,
    pub game_mode: GameMode,
}

impl PlayerSnapshot {
    /// The live state a player is given when a match takes them over
    pub fn fresh_at(spawn: Location) -> Self {
        Self {
            inventory: vec![None; INVENTORY_SLOTS],
            armor: Default::default(),
            level: 0,
            exp_progress: 0.0,
            food_level: MAX_FOOD_LEVEL,
            saturation: DEFAULT_SATURATION,
            effects: Vec::new(),
            location: spawn,
            game_mode: GameMode::Survival,
        }
    }

    /// Number of occupied inventory and armor slots
    pub fn item_count(&self) -> usize {
        self.inventory.iter().filter(|s| s.is_some()).count()
            + self.armor.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_empty_and_fed() {
        let spawn = Location::new("arena", 1.0, 64.0, 1.0);
        let fresh = PlayerSnapshot::fresh_at(spawn.clone());

        assert_eq!(fresh.item_count(), 0);
        assert_eq!(fresh.inventory.len(), INVENTORY_SLOTS);
        assert_eq!(fresh.food_level, MAX_FOOD_LEVEL);
        assert_eq!(fresh.game_mode, GameMode::Survival);
        assert_eq!(fresh.location, spawn);
    }
}
