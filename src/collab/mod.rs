//! Contracts of the external collaborators a session drives
//!
//! Implementations live in the hosting server. The engine only calls these at
//! lifecycle transition points and never lets their failures change the
//! outcome of a transition.

pub mod memory;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use uuid::Uuid;

use crate::arena::{ArenaId, Location};
use crate::game::{EndReason, MatchSummary, PlayerId, PlayerSnapshot, SessionState, TeamMode};

/// Errors reported by collaborators
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("World not loaded: {0}")]
    WorldNotLoaded(String),

    #[error("Player is offline")]
    PlayerOffline,

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Collaborator failed: {0}")]
    Failed(String),
}

impl CollaboratorError {
    /// Transient failures worth retrying after a short delay
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CollaboratorError::WorldNotLoaded(_) | CollaboratorError::Unavailable(_)
        )
    }
}

/// Identity of a session as seen by collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub arena: ArenaId,
    pub team_mode: TeamMode,
}

/// Structured notifications; rendering them is up to the notifier
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    PlayerJoined {
        player_id: PlayerId,
        active_players: usize,
        capacity: usize,
    },
    Spectating {
        player_id: PlayerId,
    },
    CountdownTick {
        seconds_remaining: u64,
        emphasized: bool,
    },
    CountdownCancelled,
    PhaseChanged {
        phase: SessionState,
    },
    DeathmatchReminder {
        seconds_until: u64,
    },
    PlayerEliminated {
        player_id: PlayerId,
        killer_id: Option<PlayerId>,
        teams_remaining: usize,
    },
    MatchEnded {
        winners: Vec<PlayerId>,
        reason: EndReason,
    },
}

/// A live player object on the hosting platform
///
/// Handles can go stale when a player reconnects under a new live object;
/// `is_online` reports that, and callers re-resolve via [`PlayerDirectory`].
pub trait PlayerHandle: Send + Sync {
    fn id(&self) -> PlayerId;

    fn name(&self) -> String;

    fn is_online(&self) -> bool;

    /// Read the player's current inventory, experience, hunger, effects,
    /// location and game mode
    fn capture_state(&self) -> PlayerSnapshot;

    /// Clear live state and move the player onto their spawn point
    fn prepare_for_match(&self, spawn: &Location) -> Result<(), CollaboratorError>;

    /// Switch the player to spectating the match
    fn make_spectator(&self) -> Result<(), CollaboratorError>;

    /// Give back a previously captured state
    fn restore_state(&self, snapshot: &PlayerSnapshot) -> Result<(), CollaboratorError>;
}

/// Live platform lookup of player objects
pub trait PlayerDirectory: Send + Sync {
    fn lookup(&self, id: PlayerId) -> Option<Arc<dyn PlayerHandle>>;
}

/// Barriers, world border and beacons for each phase
pub trait WorldEffects: Send + Sync {
    fn setup_phase_effects(
        &self,
        session: &SessionInfo,
        phase: SessionState,
    ) -> Result<(), CollaboratorError>;
}

/// Loot chest filling; may take several ticks
pub trait ChestFiller: Send + Sync {
    fn fill(
        &self,
        session: &SessionInfo,
        locations: Vec<Location>,
    ) -> BoxFuture<'static, Result<(), CollaboratorError>>;
}

/// Titles, sounds and chat broadcasts
pub trait Notifier: Send + Sync {
    fn broadcast(&self, session: &SessionInfo, recipients: &[PlayerId], notice: &Notice);
}

/// Best-effort persistent statistics
pub trait StatsRecorder: Send + Sync {
    fn record_match(&self, summary: MatchSummary) -> BoxFuture<'static, Result<(), CollaboratorError>>;
}

/// The collaborator set every session of a registry shares
#[derive(Clone)]
pub struct Collaborators {
    pub world: Arc<dyn WorldEffects>,
    pub chests: Arc<dyn ChestFiller>,
    pub notifier: Arc<dyn Notifier>,
    pub stats: Arc<dyn StatsRecorder>,
    pub players: Arc<dyn PlayerDirectory>,
}

impl Collaborators {
    /// Collaborators that accept every call and do nothing
    pub fn noop() -> Self {
        Self {
            world: Arc::new(memory::NoopWorld),
            chests: Arc::new(memory::NoopChests),
            notifier: Arc::new(memory::NoopNotifier),
            stats: Arc::new(memory::NoopStats),
            players: Arc::new(memory::MemoryDirectory::new()),
        }
    }
}
