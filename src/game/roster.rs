//! Session roster: membership, spawn assignment and restorable snapshots
//!
//! Every compound change (capacity check + spawn assignment + membership move)
//! happens under one write lock on [`RosterInner`]. Kill counters are the only
//! per-player values kept outside it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::arena::{ArenaSnapshot, Location};
use crate::collab::{PlayerDirectory, PlayerHandle};

use super::phase::SessionState;
use super::player::{PlayerId, PlayerSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Active,
    Spectator,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectatorReason {
    /// The admission window has closed
    MatchInProgress,
    /// Every spawn point is taken
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmitOutcome {
    Admitted { spawn: Location, spawn_index: usize },
    Spectator { reason: SpectatorReason },
}

impl AdmitOutcome {
    /// Whether the player joined as a competitor
    pub fn is_player(&self) -> bool {
        matches!(self, AdmitOutcome::Admitted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RosterError {
    #[error("Player {0} is already on the roster")]
    AlreadyMember(PlayerId),

    #[error("Player {0} is not on the roster")]
    NotMember(PlayerId),

    #[error("Player {0} is not an active player")]
    NotActive(PlayerId),

    #[error("No free spawn point left")]
    NoFreeSpawn,
}

#[derive(Debug, Clone)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub name: String,
    pub membership: Membership,
    /// State captured on admission, given back on departure
    pub snapshot: Option<PlayerSnapshot>,
    /// Index into the arena's spawn points; assigned at most once
    pub spawn_index: Option<usize>,
    pub joined_at: DateTime<Utc>,
}

/// What a caller needs to finish a player's departure outside the lock
pub struct Departure {
    pub player_id: PlayerId,
    pub name: String,
    pub previous: Membership,
    pub handle: Option<Arc<dyn PlayerHandle>>,
    /// Snapshot to restore; `None` for a mid-match disconnect or on shutdown
    pub restore: Option<PlayerSnapshot>,
    /// Membership is gone entirely (not parked as disconnected)
    pub released: bool,
}

/// Consistent copy of all membership sets, each sorted by player id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RosterView {
    pub active: Vec<PlayerId>,
    pub spectators: Vec<PlayerId>,
    pub disconnected: Vec<PlayerId>,
}

struct RosterInner {
    records: HashMap<PlayerId, PlayerRecord>,
    active: HashSet<PlayerId>,
    spectators: HashSet<PlayerId>,
    disconnected: HashSet<PlayerId>,
    used_spawns: HashSet<usize>,
    handles: HashMap<PlayerId, Arc<dyn PlayerHandle>>,
    rng: ChaCha8Rng,
}

impl RosterInner {
    fn set_of(&mut self, membership: Membership) -> &mut HashSet<PlayerId> {
        match membership {
            Membership::Active => &mut self.active,
            Membership::Spectator => &mut self.spectators,
            Membership::Disconnected => &mut self.disconnected,
        }
    }

    fn move_to(&mut self, id: PlayerId, to: Membership) {
        let Some(from) = self.records.get(&id).map(|r| r.membership) else {
            return;
        };
        self.set_of(from).remove(&id);
        self.set_of(to).insert(id);
        if let Some(record) = self.records.get_mut(&id) {
            record.membership = to;
        }
    }

    fn free_spawn_of(&mut self, id: &PlayerId) {
        if let Some(index) = self.records.get_mut(id).and_then(|r| r.spawn_index.take()) {
            self.used_spawns.remove(&index);
        }
    }

    fn pick_spawn(&mut self, capacity: usize) -> Option<usize> {
        let free: Vec<usize> = (0..capacity)
            .filter(|i| !self.used_spawns.contains(i))
            .collect();
        let index = *free.choose(&mut self.rng)?;
        self.used_spawns.insert(index);
        Some(index)
    }

    fn insert(&mut self, record: PlayerRecord, handle: Arc<dyn PlayerHandle>) {
        let id = record.id;
        self.set_of(record.membership).insert(id);
        self.handles.insert(id, handle);
        self.records.insert(id, record);
    }
}

fn sorted(set: &HashSet<PlayerId>) -> Vec<PlayerId> {
    let mut ids: Vec<PlayerId> = set.iter().copied().collect();
    ids.sort();
    ids
}

pub struct PlayerRoster {
    arena: Arc<ArenaSnapshot>,
    inner: RwLock<RosterInner>,
    kills: DashMap<PlayerId, AtomicU32>,
}

impl PlayerRoster {
    pub fn new(arena: Arc<ArenaSnapshot>, seed: u64) -> Self {
        Self {
            arena,
            inner: RwLock::new(RosterInner {
                records: HashMap::new(),
                active: HashSet::new(),
                spectators: HashSet::new(),
                disconnected: HashSet::new(),
                used_spawns: HashSet::new(),
                handles: HashMap::new(),
                rng: ChaCha8Rng::seed_from_u64(seed),
            }),
            kills: DashMap::new(),
        }
    }

    /// Active players the arena can hold
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Add a player, as a competitor while the admission window is open and
    /// there is room, otherwise as a spectator
    pub fn admit(
        &self,
        player: Arc<dyn PlayerHandle>,
        phase: SessionState,
    ) -> Result<AdmitOutcome, RosterError> {
        let id = player.id();
        let capacity = self.capacity();
        let mut inner = self.inner.write();

        if inner.records.contains_key(&id) {
            return Err(RosterError::AlreadyMember(id));
        }

        let spectator_reason = if !phase.admits_players() {
            Some(SpectatorReason::MatchInProgress)
        } else if inner.active.len() >= capacity {
            Some(SpectatorReason::Full)
        } else {
            None
        };

        let snapshot = player.capture_state();
        let mut record = PlayerRecord {
            id,
            name: player.name(),
            membership: Membership::Spectator,
            snapshot: Some(snapshot),
            spawn_index: None,
            joined_at: Utc::now(),
        };

        if let Some(reason) = spectator_reason {
            inner.insert(record, player);
            debug!(player_id = %id, ?reason, "Player added as spectator");
            return Ok(AdmitOutcome::Spectator { reason });
        }

        let spawn_index = inner.pick_spawn(capacity).ok_or(RosterError::NoFreeSpawn)?;
        let Some(spawn) = self.arena.spawn_point(spawn_index) else {
            inner.used_spawns.remove(&spawn_index);
            return Err(RosterError::NoFreeSpawn);
        };

        record.membership = Membership::Active;
        record.spawn_index = Some(spawn_index);
        inner.insert(record, player);

        info!(
            player_id = %id,
            spawn_index,
            active = inner.active.len(),
            capacity,
            "Player admitted"
        );
        Ok(AdmitOutcome::Admitted { spawn, spawn_index })
    }

    /// Move an active player to the spectators
    pub fn eliminate(&self, id: &PlayerId) -> Result<(), RosterError> {
        let mut inner = self.inner.write();
        match inner.records.get(id).map(|r| r.membership) {
            None => Err(RosterError::NotMember(*id)),
            Some(Membership::Active) => {
                inner.move_to(*id, Membership::Spectator);
                Ok(())
            }
            Some(_) => Err(RosterError::NotActive(*id)),
        }
    }

    /// Take a player off the roster.
    ///
    /// A disconnect once the match has started parks the player in the
    /// disconnected set, keeping the snapshot for the end of the match.
    /// Otherwise the record is dropped and, unless the host is shutting down,
    /// its snapshot is handed back for restoration. Spawn slots are only
    /// freed while the admission window is open.
    pub fn remove(
        &self,
        id: &PlayerId,
        is_disconnect: bool,
        is_shutting_down: bool,
        phase: SessionState,
    ) -> Result<Departure, RosterError> {
        let mut inner = self.inner.write();
        let Some(previous) = inner.records.get(id).map(|r| r.membership) else {
            return Err(RosterError::NotMember(*id));
        };

        if previous == Membership::Active && phase.admits_players() {
            inner.free_spawn_of(id);
        }

        if is_disconnect && !phase.admits_players() {
            inner.move_to(*id, Membership::Disconnected);
            let record = &inner.records[id];
            return Ok(Departure {
                player_id: *id,
                name: record.name.clone(),
                previous,
                handle: inner.handles.get(id).cloned(),
                restore: None,
                released: false,
            });
        }

        inner.set_of(previous).remove(id);
        let handle = inner.handles.remove(id);
        let Some(mut record) = inner.records.remove(id) else {
            return Err(RosterError::NotMember(*id));
        };
        drop(inner);

        Ok(Departure {
            player_id: *id,
            name: record.name,
            previous,
            handle,
            restore: if is_shutting_down {
                None
            } else {
                record.snapshot.take()
            },
            released: true,
        })
    }

    /// Empty the roster, returning a departure for every member.
    ///
    /// Every member gets their restore snapshot back unless the host is
    /// shutting down.
    pub fn release_all(&self, is_shutting_down: bool) -> Vec<Departure> {
        let mut inner = self.inner.write();
        let records: Vec<PlayerRecord> = inner.records.drain().map(|(_, r)| r).collect();
        let mut handles = std::mem::take(&mut inner.handles);
        inner.active.clear();
        inner.spectators.clear();
        inner.disconnected.clear();
        drop(inner);

        let mut departures: Vec<Departure> = records
            .into_iter()
            .map(|mut record| {
                let restore = if is_shutting_down {
                    None
                } else {
                    record.snapshot.take()
                };
                Departure {
                    player_id: record.id,
                    handle: handles.remove(&record.id),
                    name: record.name,
                    previous: record.membership,
                    restore,
                    released: true,
                }
            })
            .collect();
        departures.sort_by_key(|d| d.player_id);
        departures
    }

    /// Cached live handle for a member, re-resolved through the directory
    /// when the cached one has gone stale
    pub fn resolve(
        &self,
        id: &PlayerId,
        directory: &dyn PlayerDirectory,
    ) -> Option<Arc<dyn PlayerHandle>> {
        {
            let inner = self.inner.read();
            if !inner.records.contains_key(id) {
                return None;
            }
            if let Some(handle) = inner.handles.get(id) {
                if handle.is_online() {
                    return Some(handle.clone());
                }
            }
        }

        let fresh = directory.lookup(*id).filter(|h| h.is_online())?;
        let mut inner = self.inner.write();
        if inner.records.contains_key(id) {
            debug!(player_id = %id, "Refreshed stale player handle");
            inner.handles.insert(*id, fresh.clone());
        }
        Some(fresh)
    }

    /// Bump a player's live kill counter, returning the new total
    pub fn add_kill(&self, id: &PlayerId) -> u32 {
        if let Some(counter) = self.kills.get(id) {
            return counter.fetch_add(1, Ordering::Relaxed) + 1;
        }
        self.kills
            .entry(*id)
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    pub fn kills(&self, id: &PlayerId) -> u32 {
        self.kills
            .get(id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn membership(&self, id: &PlayerId) -> Option<Membership> {
        self.inner.read().records.get(id).map(|r| r.membership)
    }

    pub fn contains(&self, id: &PlayerId) -> bool {
        self.inner.read().records.contains_key(id)
    }

    pub fn is_active(&self, id: &PlayerId) -> bool {
        self.inner.read().active.contains(id)
    }

    pub fn record(&self, id: &PlayerId) -> Option<PlayerRecord> {
        self.inner.read().records.get(id).cloned()
    }

    pub fn spawn_of(&self, id: &PlayerId) -> Option<Location> {
        let index = self.inner.read().records.get(id)?.spawn_index?;
        self.arena.spawn_point(index)
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().active.len()
    }

    pub fn spectator_count(&self) -> usize {
        self.inner.read().spectators.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All members (any membership kind), unordered
    pub fn member_ids(&self) -> Vec<PlayerId> {
        self.inner.read().records.keys().copied().collect()
    }

    pub fn view(&self) -> RosterView {
        let inner = self.inner.read();
        RosterView {
            active: sorted(&inner.active),
            spectators: sorted(&inner.spectators),
            disconnected: sorted(&inner.disconnected),
        }
    }
}
