//! Team assignment for solo, duo and trio matches

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use uuid::Uuid;

use super::phase::TeamMode;
use super::player::PlayerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Team {
    pub id: Uuid,
    /// 1-based number shown to players
    pub number: u32,
    pub members: BTreeSet<PlayerId>,
    pub eliminated: bool,
}

impl Team {
    fn is_standing(&self) -> bool {
        !self.eliminated && !self.members.is_empty()
    }
}

/// Teams of one session. Membership is independent of the roster's
/// active/spectator split; elimination is derived from it on refresh.
pub struct TeamBoard {
    team_size: usize,
    teams: Vec<Team>,
    by_player: HashMap<PlayerId, usize>,
}

impl TeamBoard {
    pub fn new(mode: TeamMode) -> Self {
        Self {
            team_size: mode.team_size(),
            teams: Vec::new(),
            by_player: HashMap::new(),
        }
    }

    /// Put `player` on the lowest-numbered team with room, opening a new team
    /// if none has any. Returns the team's display number.
    pub fn assign(&mut self, player: PlayerId) -> u32 {
        if let Some(&slot) = self.by_player.get(&player) {
            return self.teams[slot].number;
        }

        let slot = match self
            .teams
            .iter()
            .position(|t| !t.eliminated && t.members.len() < self.team_size)
        {
            Some(slot) => slot,
            None => {
                self.teams.push(Team {
                    id: Uuid::new_v4(),
                    number: self.teams.len() as u32 + 1,
                    members: BTreeSet::new(),
                    eliminated: false,
                });
                self.teams.len() - 1
            }
        };

        self.teams[slot].members.insert(player);
        self.by_player.insert(player, slot);
        self.teams[slot].number
    }

    /// Drop `player` from their team (used while the admission window is open)
    pub fn remove(&mut self, player: &PlayerId) -> Option<u32> {
        let slot = self.by_player.remove(player)?;
        let team = &mut self.teams[slot];
        team.members.remove(player);
        Some(team.number)
    }

    /// Mark teams without any active member as eliminated, returning the
    /// numbers of teams eliminated by this call
    pub fn refresh(&mut self, is_active: impl Fn(&PlayerId) -> bool) -> Vec<u32> {
        let mut newly_eliminated = Vec::new();
        for team in self.teams.iter_mut().filter(|t| t.is_standing()) {
            if !team.members.iter().any(&is_active) {
                team.eliminated = true;
                newly_eliminated.push(team.number);
            }
        }
        newly_eliminated
    }

    /// Teams that still have players in the running
    pub fn remaining(&self) -> usize {
        self.teams.iter().filter(|t| t.is_standing()).count()
    }

    pub fn team_of(&self, player: &PlayerId) -> Option<u32> {
        self.by_player.get(player).map(|&slot| self.teams[slot].number)
    }

    pub fn teams(&self) -> Vec<Team> {
        self.teams.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn solo_gives_everyone_their_own_team() {
        let mut board = TeamBoard::new(TeamMode::Solo);
        let numbers: Vec<u32> = (0..3).map(|_| board.assign(Uuid::new_v4())).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(board.remaining(), 3);
    }

    #[test]
    fn duo_fills_lowest_team_first() {
        let mut board = TeamBoard::new(TeamMode::Duo);
        let players: Vec<PlayerId> = (0..4).map(|_| Uuid::new_v4()).collect();
        let numbers: Vec<u32> = players.iter().map(|p| board.assign(*p)).collect();
        assert_eq!(numbers, vec![1, 1, 2, 2]);

        // A freed slot is reused before opening a new team
        board.remove(&players[0]);
        assert_eq!(board.assign(Uuid::new_v4()), 1);
        assert_eq!(board.assign(Uuid::new_v4()), 3);
    }

    #[test]
    fn assign_is_idempotent() {
        let mut board = TeamBoard::new(TeamMode::Trio);
        let p = Uuid::new_v4();
        assert_eq!(board.assign(p), 1);
        assert_eq!(board.assign(p), 1);
        assert_eq!(board.teams()[0].members.len(), 1);
    }

    #[test]
    fn team_falls_when_no_member_is_active() {
        let mut board = TeamBoard::new(TeamMode::Duo);
        let players: Vec<PlayerId> = (0..4).map(|_| Uuid::new_v4()).collect();
        for p in &players {
            board.assign(*p);
        }

        let mut active: HashSet<PlayerId> = players.iter().copied().collect();
        active.remove(&players[0]);
        assert!(board.refresh(|p| active.contains(p)).is_empty());
        assert_eq!(board.remaining(), 2);

        active.remove(&players[1]);
        assert_eq!(board.refresh(|p| active.contains(p)), vec![1]);
        assert_eq!(board.remaining(), 1);

        // Already eliminated teams are not reported twice
        assert!(board.refresh(|p| active.contains(p)).is_empty());
    }
}
