//! Player → session membership index shared by every session of a registry

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::player::PlayerId;

/// Result of trying to reserve a player for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Reserved for the requesting session
    Claimed,
    /// Already reserved by the requesting session
    AlreadyMember,
    /// Reserved by another session
    Taken(Uuid),
}

#[derive(Default)]
pub struct MembershipIndex {
    members: DashMap<PlayerId, Uuid>,
}

impl MembershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically reserve `player` for `session`
    pub fn claim(&self, player: PlayerId, session: Uuid) -> Claim {
        match self.members.entry(player) {
            Entry::Occupied(entry) if *entry.get() == session => Claim::AlreadyMember,
            Entry::Occupied(entry) => Claim::Taken(*entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Claim::Claimed
            }
        }
    }

    /// Drop the reservation if it still belongs to `session`
    pub fn release(&self, player: &PlayerId, session: Uuid) -> bool {
        self.members
            .remove_if(player, |_, owner| *owner == session)
            .is_some()
    }

    pub fn session_of(&self, player: &PlayerId) -> Option<Uuid> {
        self.members.get(player).map(|s| *s.value())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn claim_is_exclusive() {
        let index = MembershipIndex::new();
        let player = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(index.claim(player, a), Claim::Claimed);
        assert_eq!(index.claim(player, a), Claim::AlreadyMember);
        assert_eq!(index.claim(player, b), Claim::Taken(a));
    }

    #[test]
    fn release_only_by_owner() {
        let index = MembershipIndex::new();
        let player = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        index.claim(player, a);
        assert!(!index.release(&player, b));
        assert_eq!(index.session_of(&player), Some(a));
        assert!(index.release(&player, a));
        assert!(index.is_empty());
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let index = Arc::new(MembershipIndex::new());
        let player = Uuid::new_v4();
        let sessions = [Uuid::new_v4(), Uuid::new_v4()];

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let index = index.clone();
                let session = sessions[i % 2];
                std::thread::spawn(move || index.claim(player, session))
            })
            .collect();

        let claimed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|c| *c == Claim::Claimed)
            .count();
        assert_eq!(claimed, 1);
    }
}
