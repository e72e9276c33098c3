//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use survival_games::arena::{ArenaId, ArenaSnapshot, Location, StaticArenas};
use survival_games::collab::memory::{
    MemoryDirectory, MemoryPlayer, NoopChests, RecordingNotifier, RecordingStats, RecordingWorld,
};
use survival_games::collab::Collaborators;
use survival_games::config::{GameConfig, ResilienceConfig};
use survival_games::game::{ItemStack, MembershipIndex, PlayerSnapshot, SessionContext};
use survival_games::registry::SessionRegistry;
use survival_games::runtime::{MainTick, WorkerPool};

pub const TICK: Duration = Duration::from_millis(50);

pub struct Harness {
    pub registry: Arc<SessionRegistry>,
    pub arenas: StaticArenas,
    pub world: Arc<RecordingWorld>,
    pub notifier: Arc<RecordingNotifier>,
    pub stats: Arc<RecordingStats>,
    pub directory: MemoryDirectory,
    /// Main tick runs until this is dropped
    _stop: watch::Sender<bool>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(GameConfig::default())
    }

    pub fn with_config(config: GameConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (main_tick, _task) = MainTick::spawn(TICK, Duration::from_secs(3), stop_rx);

        let arenas = StaticArenas::new();
        let world = RecordingWorld::new();
        let notifier = RecordingNotifier::new();
        let stats = RecordingStats::new();
        let directory = MemoryDirectory::new();

        let ctx = SessionContext {
            config: Arc::new(config),
            collaborators: Collaborators {
                world: world.clone(),
                chests: Arc::new(NoopChests),
                notifier: notifier.clone(),
                stats: stats.clone(),
                players: Arc::new(directory.clone()),
            },
            main_tick,
            workers: WorkerPool::with_size("test-workers", 2),
            index: Arc::new(MembershipIndex::new()),
        };
        let registry = SessionRegistry::new(
            Arc::new(arenas.clone()),
            ctx,
            ResilienceConfig::default(),
        );

        Self {
            registry,
            arenas,
            world,
            notifier,
            stats,
            directory,
            _stop: stop_tx,
        }
    }

    /// Register an arena with `spawns` spawn points
    pub fn add_arena(&self, id: &str, spawns: usize, min_players: usize) -> ArenaId {
        let arena = arena(id, spawns, min_players);
        let arena_id = arena.id.clone();
        self.arenas.insert(arena);
        arena_id
    }

    /// A player standing in the lobby with some gear, known to the directory
    pub fn player(&self, name: &str) -> Arc<MemoryPlayer> {
        let player = MemoryPlayer::new(name, lobby_state());
        self.directory.register(player.clone());
        player
    }
}

pub fn arena(id: &str, spawns: usize, min_players: usize) -> ArenaSnapshot {
    ArenaSnapshot {
        id: ArenaId::new(id),
        world: format!("{id}_world"),
        world_loaded: true,
        spawn_points: (0..spawns)
            .map(|i| Location::new(format!("{id}_world"), i as f64 * 8.0, 64.0, 0.0))
            .collect(),
        center: Some(Location::new(format!("{id}_world"), 0.0, 64.0, 0.0)),
        chest_locations: vec![Location::new(format!("{id}_world"), 4.0, 64.0, 4.0)],
        min_players,
        max_players: spawns,
    }
}

pub fn lobby_state() -> PlayerSnapshot {
    let mut state = PlayerSnapshot::fresh_at(Location::new("lobby", 12.5, 70.0, -3.0));
    state.inventory[0] = Some(ItemStack::new("diamond_sword", 1));
    state.inventory[8] = Some(ItemStack::new("bread", 32));
    state.armor[3] = Some(ItemStack::new("iron_helmet", 1));
    state.level = 27;
    state.exp_progress = 0.4;
    state.food_level = 14;
    state
}
