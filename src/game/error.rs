//! Session engine error taxonomy

use std::time::Duration;

use uuid::Uuid;

use crate::arena::ArenaId;
use crate::collab::CollaboratorError;
use crate::resilience::Classify;
use crate::runtime::HandoffError;

use super::phase::SessionState;
use super::player::PlayerId;
use super::roster::RosterError;

/// Malformed arena preconditions, detected before any creation attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unknown arena {0}")]
    UnknownArena(ArenaId),

    #[error("Arena {0} has no spawn points")]
    NoSpawnPoints(ArenaId),

    #[error("Arena {0} has no center location")]
    MissingCenter(ArenaId),

    #[error("World {world} of arena {arena} is not loaded")]
    WorldNotLoaded { arena: ArenaId, world: String },

    #[error("Arena {arena} has {spawns} spawn points but needs at least {min_players}")]
    NotEnoughSpawns {
        arena: ArenaId,
        spawns: usize,
        min_players: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid arena: {0}")]
    Validation(#[from] ValidationError),

    #[error("Another session for arena {arena} appeared during creation")]
    RaceCondition { arena: ArenaId },

    #[error("Arena {arena} already hosts session {session}")]
    ArenaInUse { arena: ArenaId, session: Uuid },

    #[error("Session creation for arena {arena} failed after {attempts} attempts: {reason}")]
    CreationFailed {
        arena: ArenaId,
        attempts: u32,
        reason: String,
    },

    #[error("Session creation is temporarily disabled, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    #[error("Recoverable I/O failure: {0}")]
    RecoverableIo(String),

    #[error("Player {player} is already in session {session}")]
    AlreadyInSession { player: PlayerId, session: Uuid },

    #[error("Roster rejected the operation: {0}")]
    Roster(#[from] RosterError),

    #[error("Cannot move from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("Operation not allowed while the session is {0}")]
    WrongState(SessionState),

    #[error("Not enough players to start")]
    NotEnoughPlayers,

    #[error("Session {0} has ended")]
    SessionEnded(Uuid),

    #[error("Main tick hand-off failed: {0}")]
    Handoff(#[from] HandoffError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl Classify for SessionError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::RaceCondition { .. }
                | SessionError::RecoverableIo(_)
                | SessionError::Handoff(HandoffError::TimedOut(_))
        )
    }

    /// Lost creation races are counted by the registry as they happen
    fn is_failure(&self) -> bool {
        matches!(
            self,
            SessionError::CreationFailed { .. }
                | SessionError::RecoverableIo(_)
                | SessionError::Handoff(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_neither_retried_nor_counted() {
        let err = SessionError::from(ValidationError::NoSpawnPoints(ArenaId::new("a")));
        assert!(!err.is_retryable());
        assert!(!err.is_failure());
    }

    #[test]
    fn race_conditions_are_retried() {
        let err = SessionError::RaceCondition {
            arena: ArenaId::new("a"),
        };
        assert!(err.is_retryable());
        assert!(!err.is_failure());
    }

    #[test]
    fn arena_conflicts_are_caller_errors() {
        let err = SessionError::ArenaInUse {
            arena: ArenaId::new("a"),
            session: Uuid::new_v4(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_failure());
    }
}
