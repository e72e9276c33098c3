//! In-memory collaborator implementations
//!
//! Used by the standalone host binary and by tests. The recording variants
//! keep every call so assertions can inspect what a session did.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    ChestFiller, CollaboratorError, Notice, Notifier, PlayerDirectory, PlayerHandle, SessionInfo,
    StatsRecorder, WorldEffects,
};
use crate::arena::Location;
use crate::game::{GameMode, MatchSummary, PlayerId, PlayerSnapshot, SessionState};

/// A player whose live state is a plain value
pub struct MemoryPlayer {
    id: PlayerId,
    name: String,
    online: AtomicBool,
    state: Mutex<PlayerSnapshot>,
    /// Remaining restore calls that fail with `WorldNotLoaded`
    failing_restores: AtomicU32,
}

impl MemoryPlayer {
    pub fn new(name: impl Into<String>, state: PlayerSnapshot) -> Arc<Self> {
        Self::with_id(Uuid::new_v4(), name, state)
    }

    pub fn with_id(id: PlayerId, name: impl Into<String>, state: PlayerSnapshot) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            online: AtomicBool::new(true),
            state: Mutex::new(state),
            failing_restores: AtomicU32::new(0),
        })
    }

    pub fn state(&self) -> PlayerSnapshot {
        self.state.lock().clone()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Make the next `count` restores fail as if the target world was unloaded
    pub fn fail_next_restores(&self, count: u32) {
        self.failing_restores.store(count, Ordering::SeqCst);
    }
}

impl PlayerHandle for MemoryPlayer {
    fn id(&self) -> PlayerId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn capture_state(&self) -> PlayerSnapshot {
        self.state.lock().clone()
    }

    fn prepare_for_match(&self, spawn: &Location) -> Result<(), CollaboratorError> {
        if !self.is_online() {
            return Err(CollaboratorError::PlayerOffline);
        }
        *self.state.lock() = PlayerSnapshot::fresh_at(spawn.clone());
        Ok(())
    }

    fn make_spectator(&self) -> Result<(), CollaboratorError> {
        if !self.is_online() {
            return Err(CollaboratorError::PlayerOffline);
        }
        self.state.lock().game_mode = GameMode::Spectator;
        Ok(())
    }

    fn restore_state(&self, snapshot: &PlayerSnapshot) -> Result<(), CollaboratorError> {
        let failing = self
            .failing_restores
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(CollaboratorError::WorldNotLoaded(
                snapshot.location.world.clone(),
            ));
        }
        *self.state.lock() = snapshot.clone();
        Ok(())
    }
}

/// Directory of online players keyed by id
#[derive(Default, Clone)]
pub struct MemoryDirectory {
    players: Arc<DashMap<PlayerId, Arc<dyn PlayerHandle>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, player: Arc<dyn PlayerHandle>) {
        self.players.insert(player.id(), player);
    }

    pub fn unregister(&self, id: &PlayerId) {
        self.players.remove(id);
    }
}

impl PlayerDirectory for MemoryDirectory {
    fn lookup(&self, id: PlayerId) -> Option<Arc<dyn PlayerHandle>> {
        self.players.get(&id).map(|p| p.value().clone())
    }
}

pub struct NoopWorld;

impl WorldEffects for NoopWorld {
    fn setup_phase_effects(&self, _: &SessionInfo, _: SessionState) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

pub struct NoopChests;

impl ChestFiller for NoopChests {
    fn fill(&self, _: &SessionInfo, _: Vec<Location>) -> BoxFuture<'static, Result<(), CollaboratorError>> {
        future::ready(Ok(())).boxed()
    }
}

pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn broadcast(&self, _: &SessionInfo, _: &[PlayerId], _: &Notice) {}
}

pub struct NoopStats;

impl StatsRecorder for NoopStats {
    fn record_match(&self, _: MatchSummary) -> BoxFuture<'static, Result<(), CollaboratorError>> {
        future::ready(Ok(())).boxed()
    }
}

/// World effects that remember every phase they were asked to set up
#[derive(Default)]
pub struct RecordingWorld {
    calls: Mutex<Vec<(Uuid, SessionState)>>,
    failing: AtomicBool,
}

impl RecordingWorld {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<(Uuid, SessionState)> {
        self.calls.lock().clone()
    }

    pub fn phases_for(&self, session: Uuid) -> Vec<SessionState> {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| *id == session)
            .map(|(_, phase)| *phase)
            .collect()
    }

    /// Record calls but report failure for each of them
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl WorldEffects for RecordingWorld {
    fn setup_phase_effects(
        &self,
        session: &SessionInfo,
        phase: SessionState,
    ) -> Result<(), CollaboratorError> {
        self.calls.lock().push((session.id, phase));
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Failed("world effects disabled".to_string()));
        }
        Ok(())
    }
}

/// Notifier that keeps every notice
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn broadcast(&self, _: &SessionInfo, _: &[PlayerId], notice: &Notice) {
        self.notices.lock().push(notice.clone());
    }
}

/// Stats recorder that keeps every summary it receives
#[derive(Default)]
pub struct RecordingStats {
    summaries: Mutex<Vec<MatchSummary>>,
}

impl RecordingStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn summaries(&self) -> Vec<MatchSummary> {
        self.summaries.lock().clone()
    }
}

impl StatsRecorder for RecordingStats {
    fn record_match(&self, summary: MatchSummary) -> BoxFuture<'static, Result<(), CollaboratorError>> {
        self.summaries.lock().push(summary);
        future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::ItemStack;

    fn sample_state() -> PlayerSnapshot {
        let mut state = PlayerSnapshot::fresh_at(Location::new("lobby", 0.0, 70.0, 0.0));
        state.inventory[0] = Some(ItemStack::new("diamond_sword", 1));
        state.level = 12;
        state
    }

    #[test]
    fn restore_failures_are_consumed_then_succeed() {
        let player = MemoryPlayer::new("alex", sample_state());
        let snapshot = player.capture_state();
        player.fail_next_restores(2);

        assert!(player.restore_state(&snapshot).is_err());
        assert!(player.restore_state(&snapshot).is_err());
        assert!(player.restore_state(&snapshot).is_ok());
    }

    #[test]
    fn offline_players_cannot_be_prepared() {
        let player = MemoryPlayer::new("steve", sample_state());
        player.set_online(false);
        let spawn = Location::new("arena", 0.0, 64.0, 0.0);

        assert!(matches!(
            player.prepare_for_match(&spawn),
            Err(CollaboratorError::PlayerOffline)
        ));
        assert_eq!(player.state().level, 12);
    }

    #[test]
    fn directory_resolves_registered_players() {
        let directory = MemoryDirectory::new();
        let player = MemoryPlayer::new("alex", sample_state());
        let id = player.id();
        directory.register(player);

        assert!(directory.lookup(id).is_some());
        directory.unregister(&id);
        assert!(directory.lookup(id).is_none());
    }
}
