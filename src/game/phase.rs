//! Session lifecycle states and match descriptors

use std::fmt;

use serde::{Deserialize, Serialize};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting for players
    Waiting,
    /// Countdown before start
    Countdown,
    /// Match started, PvP disabled
    GracePeriod,
    /// Match in progress
    Active,
    /// Shrinking border, forced confrontation
    Deathmatch,
    /// Match ended
    Ended,
}

impl SessionState {
    /// Players may still join as competitors
    pub fn admits_players(self) -> bool {
        matches!(self, SessionState::Waiting | SessionState::Countdown)
    }

    /// Match clock is running and eliminations count
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            SessionState::GracePeriod | SessionState::Active | SessionState::Deathmatch
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Ended
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Waiting, Countdown)
                | (Countdown, Waiting)
                | (Waiting, GracePeriod)
                | (Countdown, GracePeriod)
                | (GracePeriod, Active)
                | (GracePeriod, Deathmatch)
                | (Active, Deathmatch)
                | (Waiting | Countdown | GracePeriod | Active | Deathmatch, Ended)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Waiting => "waiting",
            SessionState::Countdown => "countdown",
            SessionState::GracePeriod => "grace_period",
            SessionState::Active => "active",
            SessionState::Deathmatch => "deathmatch",
            SessionState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Team size of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamMode {
    #[default]
    Solo,
    Duo,
    Trio,
}

impl TeamMode {
    pub fn team_size(self) -> usize {
        match self {
            TeamMode::Solo => 1,
            TeamMode::Duo => 2,
            TeamMode::Trio => 3,
        }
    }
}

/// Why a session reached `Ended`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// One team (or fewer) still has active players
    LastTeamStanding,
    /// Nobody active is left
    NoPlayersLeft,
    /// Deathmatch ran out
    TimeUp,
    /// Stopped by an operator
    Administrative,
    /// Force-terminated as a duplicate session for its arena
    Reconciled,
    /// Host is shutting down
    Shutdown,
}

impl EndReason {
    /// Whether players should get their pre-join state back
    pub fn restores_players(self) -> bool {
        self != EndReason::Shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_lifecycle_is_permitted() {
        use SessionState::*;
        let path = [Waiting, Countdown, GracePeriod, Active, Deathmatch, Ended];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn ended_is_reachable_from_everywhere_but_itself() {
        use SessionState::*;
        for state in [Waiting, Countdown, GracePeriod, Active, Deathmatch] {
            assert!(state.can_transition_to(Ended));
        }
        assert!(!Ended.can_transition_to(Ended));
        assert!(!Ended.can_transition_to(Waiting));
    }

    #[test]
    fn backwards_moves_are_rejected() {
        use SessionState::*;
        assert!(!Active.can_transition_to(GracePeriod));
        assert!(!Deathmatch.can_transition_to(Active));
        assert!(!GracePeriod.can_transition_to(Countdown));
    }

    #[test]
    fn admission_window_closes_after_countdown() {
        assert!(SessionState::Waiting.admits_players());
        assert!(SessionState::Countdown.admits_players());
        assert!(!SessionState::GracePeriod.admits_players());
        assert!(!SessionState::Ended.admits_players());
    }

    #[test]
    fn team_sizes() {
        assert_eq!(TeamMode::Solo.team_size(), 1);
        assert_eq!(TeamMode::Duo.team_size(), 2);
        assert_eq!(TeamMode::Trio.team_size(), 3);
    }
}
