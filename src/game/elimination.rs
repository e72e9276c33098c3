//! Elimination order, per-player match statistics and final ranking

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::arena::ArenaId;

use super::phase::{EndReason, TeamMode};
use super::player::PlayerId;
use super::roster::RosterView;

#[derive(Default)]
struct EliminationLog {
    order: Vec<PlayerId>,
    seen: HashSet<PlayerId>,
}

/// Accumulators for one player; only ever increase
#[derive(Default)]
struct PlayerStats {
    damage_dealt: AtomicU64,
    damage_taken: AtomicU64,
    chests_opened: AtomicU32,
    kills: AtomicU32,
}

fn add_f64(cell: &AtomicU64, amount: f64) {
    let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
        Some((f64::from_bits(bits) + amount).to_bits())
    });
}

/// Point-in-time copy of a player's statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatLine {
    pub damage_dealt: f64,
    pub damage_taken: f64,
    pub chests_opened: u32,
    pub kills: u32,
}

impl From<&PlayerStats> for StatLine {
    fn from(stats: &PlayerStats) -> Self {
        Self {
            damage_dealt: f64::from_bits(stats.damage_dealt.load(Ordering::Acquire)),
            damage_taken: f64::from_bits(stats.damage_taken.load(Ordering::Acquire)),
            chests_opened: stats.chests_opened.load(Ordering::Relaxed),
            kills: stats.kills.load(Ordering::Relaxed),
        }
    }
}

/// Result of a finished match, stored once per session
#[derive(Debug, Clone, Serialize)]
pub struct MatchSummary {
    pub session_id: Uuid,
    pub arena: ArenaId,
    pub team_mode: TeamMode,
    pub reason: EndReason,
    /// Best placement first
    pub ranking: Vec<PlayerId>,
    pub winners: Vec<PlayerId>,
    pub stats: BTreeMap<PlayerId, StatLine>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct EliminationTracker {
    log: Mutex<EliminationLog>,
    stats: DashMap<PlayerId, PlayerStats>,
}

impl EliminationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `player` to the log. Returns false if already recorded.
    pub fn record_elimination(&self, player: PlayerId) -> bool {
        let mut log = self.log.lock();
        if !log.seen.insert(player) {
            return false;
        }
        log.order.push(player);
        true
    }

    pub fn is_eliminated(&self, player: &PlayerId) -> bool {
        self.log.lock().seen.contains(player)
    }

    /// Eliminated players, first eliminated first
    pub fn eliminated(&self) -> Vec<PlayerId> {
        self.log.lock().order.clone()
    }

    pub fn eliminated_count(&self) -> usize {
        self.log.lock().order.len()
    }

    fn with_stats(&self, player: PlayerId, update: impl FnOnce(&PlayerStats)) {
        if let Some(stats) = self.stats.get(&player) {
            update(stats.value());
            return;
        }
        update(self.stats.entry(player).or_default().value());
    }

    /// Negative and non-finite amounts are ignored
    pub fn add_damage_dealt(&self, player: PlayerId, amount: f64) {
        if amount.is_finite() && amount > 0.0 {
            self.with_stats(player, |s| add_f64(&s.damage_dealt, amount));
        }
    }

    pub fn add_damage_taken(&self, player: PlayerId, amount: f64) {
        if amount.is_finite() && amount > 0.0 {
            self.with_stats(player, |s| add_f64(&s.damage_taken, amount));
        }
    }

    pub fn add_chest_opened(&self, player: PlayerId) {
        self.with_stats(player, |s| {
            s.chests_opened.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn add_kill(&self, player: PlayerId) {
        self.with_stats(player, |s| {
            s.kills.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn stats_for(&self, player: &PlayerId) -> StatLine {
        self.stats
            .get(player)
            .map(|s| StatLine::from(&*s))
            .unwrap_or_default()
    }

    pub fn all_stats(&self) -> BTreeMap<PlayerId, StatLine> {
        self.stats
            .iter()
            .map(|entry| (*entry.key(), StatLine::from(entry.value())))
            .collect()
    }

    /// Active players that were never eliminated, ascending by id
    pub fn winners(&self, roster: &RosterView) -> Vec<PlayerId> {
        let log = self.log.lock();
        roster
            .active
            .iter()
            .filter(|id| !log.seen.contains(*id))
            .copied()
            .collect()
    }

    /// Winners, then eliminated players in reverse elimination order, then
    /// disconnected players that never made it into the log.
    pub fn final_ranking(&self, roster: &RosterView) -> Vec<PlayerId> {
        let log = self.log.lock();
        let mut ranking: Vec<PlayerId> = Vec::with_capacity(
            roster.active.len() + log.order.len() + roster.disconnected.len(),
        );

        ranking.extend(roster.active.iter().filter(|id| !log.seen.contains(*id)));
        ranking.extend(log.order.iter().rev());
        ranking.extend(
            roster
                .disconnected
                .iter()
                .filter(|id| !log.seen.contains(*id)),
        );
        ranking
    }
}
