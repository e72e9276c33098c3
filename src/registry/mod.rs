//! Session registry: creation, lookup and integrity reconciliation

pub mod keyed_lock;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::arena::{ArenaId, ArenaProvider, ArenaSnapshot};
use crate::config::ResilienceConfig;
use crate::game::{
    EndReason, MembershipIndex, PlayerId, Session, SessionContext, SessionError, TeamMode,
    ValidationError,
};
use crate::resilience::{BreakerError, BreakerStatus, CircuitBreaker, RetryError, RetryPolicy};

use self::keyed_lock::KeyedMutex;

/// Reject arenas a session could never run on
pub fn validate_arena(arena: &ArenaSnapshot) -> Result<(), ValidationError> {
    if arena.spawn_points.is_empty() {
        return Err(ValidationError::NoSpawnPoints(arena.id.clone()));
    }
    if arena.center.is_none() {
        return Err(ValidationError::MissingCenter(arena.id.clone()));
    }
    if !arena.world_loaded {
        return Err(ValidationError::WorldNotLoaded {
            arena: arena.id.clone(),
            world: arena.world.clone(),
        });
    }
    if arena.spawn_points.len() < arena.min_players {
        return Err(ValidationError::NotEnoughSpawns {
            arena: arena.id.clone(),
            spawns: arena.spawn_points.len(),
            min_players: arena.min_players,
        });
    }
    Ok(())
}

pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<Session>>,
    arena_locks: KeyedMutex<ArenaId>,
    arenas: Arc<dyn ArenaProvider>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    sequence: AtomicU64,
    ctx: SessionContext,
}

impl SessionRegistry {
    pub fn new(
        arenas: Arc<dyn ArenaProvider>,
        ctx: SessionContext,
        resilience: ResilienceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            arena_locks: KeyedMutex::new(),
            arenas,
            breaker: CircuitBreaker::new("session_creation", resilience.breaker),
            retry: resilience.retry,
            sequence: AtomicU64::new(0),
            ctx,
        })
    }

    pub fn arenas(&self) -> &Arc<dyn ArenaProvider> {
        &self.arenas
    }

    pub fn index(&self) -> &Arc<MembershipIndex> {
        &self.ctx.index
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.breaker.status()
    }

    /// Create a session on `arena_id`.
    ///
    /// The arena is validated once up front; the creation itself runs under a
    /// per-arena lock with check-lock-check, wrapped in retry with backoff and
    /// an outer circuit breaker.
    pub async fn create_session(
        self: &Arc<Self>,
        arena_id: &ArenaId,
        team_mode: TeamMode,
    ) -> Result<Arc<Session>, SessionError> {
        let arena = self
            .arenas
            .snapshot(arena_id)
            .ok_or_else(|| ValidationError::UnknownArena(arena_id.clone()))?;
        if let Err(err) = validate_arena(&arena) {
            warn!(arena = %arena_id, error = %err, "Rejected session creation");
            return Err(err.into());
        }

        let result = self
            .breaker
            .call(|| {
                self.retry.run("create_session", |attempt| {
                    self.try_create(&arena, team_mode, attempt)
                })
            })
            .await;

        match result {
            Ok(session) => Ok(session),
            Err(BreakerError::Open { retry_in }) => {
                warn!(arena = %arena_id, ?retry_in, "Session creation rejected, circuit open");
                Err(SessionError::CircuitOpen { retry_in })
            }
            Err(BreakerError::Inner(RetryError::Exhausted { attempts, last })) => {
                Err(SessionError::CreationFailed {
                    arena: arena_id.clone(),
                    attempts,
                    reason: last.to_string(),
                })
            }
            Err(BreakerError::Inner(RetryError::Fatal(err))) => Err(err),
        }
    }

    async fn try_create(
        self: &Arc<Self>,
        arena: &ArenaSnapshot,
        team_mode: TeamMode,
        attempt: u32,
    ) -> Result<Arc<Session>, SessionError> {
        if let Some(existing) = self.active_session_for_arena(&arena.id) {
            return Err(SessionError::ArenaInUse {
                arena: arena.id.clone(),
                session: existing.id(),
            });
        }

        let guard = self.arena_locks.lock(arena.id.clone()).await;
        if let Some(existing) = self.active_session_for_arena(&arena.id) {
            // The retry that follows ends in a conflict, which the breaker
            // does not count, so the lost race is counted here
            self.breaker.record_failure();
            debug!(
                arena = %arena.id,
                attempt,
                session_id = %existing.id(),
                "Session appeared while waiting for the arena lock"
            );
            return Err(SessionError::RaceCondition {
                arena: arena.id.clone(),
            });
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Session::new(sequence, arena.clone(), team_mode, self.ctx.clone());
        self.register(session.clone());
        drop(guard);
        self.arena_locks.prune();

        Ok(session)
    }

    /// Track `session` and drop it from the table once it ends
    fn register(self: &Arc<Self>, session: Arc<Session>) {
        let id = session.id();
        let mut ended = session.subscribe_end();
        self.sessions.insert(id, session);

        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let _ = ended.wait_for(|ended| *ended).await;
            if let Some(registry) = registry.upgrade() {
                registry.sessions.remove(&id);
                debug!(session_id = %id, "Ended session removed from registry");
            }
        });
    }

    pub fn get_session(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Newest session holding `player`. Several matches are an integrity
    /// anomaly: logged, and resolved in favour of the newest.
    pub fn find_session_by_player(&self, player: &PlayerId) -> Option<Arc<Session>> {
        let found: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|s| s.value().has_player(player))
            .map(|s| s.value().clone())
            .collect();

        if found.len() > 1 {
            let sessions: Vec<String> = found.iter().map(|s| s.id().to_string()).collect();
            warn!(
                player_id = %player,
                ?sessions,
                "Integrity anomaly: player found in several sessions"
            );
        }
        found.into_iter().max_by_key(|s| s.sequence())
    }

    /// Newest non-terminal session on `arena`
    pub fn active_session_for_arena(&self, arena: &ArenaId) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|s| s.value().arena_id() == arena && !s.value().is_ended())
            .max_by_key(|s| s.value().sequence())
            .map(|s| s.value().clone())
    }

    /// Drop a session from the registry, ending it first if it is still
    /// running. Returns false if it was not registered.
    pub fn remove_session(&self, id: &Uuid) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        session.end(EndReason::Administrative);
        info!(session_id = %id, arena = %session.arena_id(), "Session removed");
        true
    }

    /// Where an arena has several non-terminal sessions, keep the newest and
    /// force-terminate the rest. Returns how many were terminated.
    pub fn reconcile_orphans(&self) -> usize {
        let mut by_arena: HashMap<ArenaId, Vec<Arc<Session>>> = HashMap::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            if !session.is_ended() {
                by_arena
                    .entry(session.arena_id().clone())
                    .or_default()
                    .push(session.clone());
            }
        }

        let mut cleaned = 0;
        for (arena, mut sessions) in by_arena {
            if sessions.len() < 2 {
                continue;
            }
            sessions.sort_by_key(|s| s.sequence());
            let Some(keep) = sessions.pop() else {
                continue;
            };
            warn!(
                arena = %arena,
                kept = %keep.id(),
                duplicates = sessions.len(),
                "Integrity anomaly: several active sessions for one arena"
            );

            for session in sessions {
                if session.end(EndReason::Reconciled) {
                    cleaned += 1;
                }
                self.sessions.remove(&session.id());
            }
        }

        if cleaned > 0 {
            info!(cleaned, "Reconciled orphaned sessions");
        }
        cleaned
    }

    /// All registered sessions, oldest first
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by_key(|s| s.sequence());
        sessions
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| !s.value().is_ended()).count()
    }

    pub fn total_players(&self) -> usize {
        self.sessions
            .iter()
            .map(|s| s.value().player_count())
            .sum()
    }

    /// End every session without restoring players. Returns how many ended.
    pub fn shutdown_all(&self) -> usize {
        let sessions = self.sessions();
        let ended = sessions
            .iter()
            .filter(|s| s.end(EndReason::Shutdown))
            .count();
        self.sessions.clear();
        info!(ended, "All sessions shut down");
        ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Location, StaticArenas};
    use crate::collab::memory::MemoryPlayer;
    use crate::collab::{Collaborators, PlayerHandle};
    use crate::config::GameConfig;
    use crate::game::PlayerSnapshot;
    use crate::resilience::BreakerConfig;
    use crate::runtime::{MainTick, WorkerPool};
    use std::time::Duration;
    use tokio::sync::watch;

    fn arena(id: &str) -> ArenaSnapshot {
        ArenaSnapshot {
            id: ArenaId::new(id),
            world: "sg".to_string(),
            world_loaded: true,
            spawn_points: (0..4)
                .map(|i| Location::new("sg", i as f64, 64.0, 0.0))
                .collect(),
            center: Some(Location::new("sg", 0.0, 64.0, 0.0)),
            chest_locations: Vec::new(),
            min_players: 2,
            max_players: 4,
        }
    }

    fn registry(arenas: StaticArenas) -> (Arc<SessionRegistry>, watch::Sender<bool>) {
        registry_with(arenas, ResilienceConfig::default())
    }

    fn registry_with(
        arenas: StaticArenas,
        resilience: ResilienceConfig,
    ) -> (Arc<SessionRegistry>, watch::Sender<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (main_tick, _task) =
            MainTick::spawn(Duration::from_millis(50), Duration::from_secs(3), stop_rx);
        let ctx = SessionContext {
            config: Arc::new(GameConfig::default()),
            collaborators: Collaborators::noop(),
            main_tick,
            workers: WorkerPool::with_size("test", 2),
            index: Arc::new(MembershipIndex::new()),
        };
        let registry = SessionRegistry::new(Arc::new(arenas), ctx, resilience);
        (registry, stop_tx)
    }

    #[test]
    fn validation_catches_broken_arenas() {
        let mut a = arena("a");
        a.spawn_points.clear();
        assert!(matches!(validate_arena(&a), Err(ValidationError::NoSpawnPoints(_))));

        let mut a = arena("a");
        a.center = None;
        assert!(matches!(validate_arena(&a), Err(ValidationError::MissingCenter(_))));

        let mut a = arena("a");
        a.world_loaded = false;
        assert!(matches!(validate_arena(&a), Err(ValidationError::WorldNotLoaded { .. })));

        let mut a = arena("a");
        a.min_players = 5;
        assert!(matches!(
            validate_arena(&a),
            Err(ValidationError::NotEnoughSpawns { spawns: 4, min_players: 5, .. })
        ));

        assert!(validate_arena(&arena("a")).is_ok());
    }

    #[tokio::test]
    async fn second_session_for_an_arena_is_refused() {
        let arenas = StaticArenas::new();
        arenas.insert(arena("a"));
        let (registry, _stop) = registry(arenas);

        let first = registry.create_session(&ArenaId::new("a"), TeamMode::Solo).await.unwrap();
        let second = registry.create_session(&ArenaId::new("a"), TeamMode::Solo).await;
        assert!(matches!(second, Err(SessionError::ArenaInUse { session, .. }) if session == first.id()));
        assert_eq!(registry.breaker_status(), BreakerStatus::Closed);
    }

    #[tokio::test]
    async fn unknown_arena_fails_validation() {
        let (registry, _stop) = registry(StaticArenas::new());
        let result = registry.create_session(&ArenaId::new("nope"), TeamMode::Solo).await;
        assert!(matches!(
            result,
            Err(SessionError::Validation(ValidationError::UnknownArena(_)))
        ));
    }

    #[tokio::test]
    async fn reconcile_keeps_the_newest_session() {
        let arenas = StaticArenas::new();
        arenas.insert(arena("a"));
        let (registry, _stop) = registry(arenas);

        // Bypass the creation path to fabricate duplicates
        let older: Vec<Arc<Session>> = (1..=3)
            .map(|seq| Session::new(seq, arena("a"), TeamMode::Solo, registry.ctx.clone()))
            .collect();
        for session in &older {
            registry.register(session.clone());
        }

        assert_eq!(registry.reconcile_orphans(), 2);
        assert!(older[0].is_ended());
        assert!(older[1].is_ended());
        assert!(!older[2].is_ended());
        assert_eq!(
            older[0].summary().map(|s| s.reason),
            Some(EndReason::Reconciled)
        );
        assert_eq!(registry.active_sessions(), 1);
        assert_eq!(registry.reconcile_orphans(), 0);
    }

    #[tokio::test]
    async fn remove_session_is_idempotent() {
        let arenas = StaticArenas::new();
        arenas.insert(arena("a"));
        let (registry, _stop) = registry(arenas);

        let session = registry.create_session(&ArenaId::new("a"), TeamMode::Solo).await.unwrap();
        assert!(registry.remove_session(&session.id()));
        assert!(!registry.remove_session(&session.id()));
        assert!(session.is_ended());
        assert!(registry.get_session(&session.id()).is_none());
    }

    #[tokio::test]
    async fn player_in_several_sessions_resolves_to_the_newest() {
        let arenas = StaticArenas::new();
        arenas.insert(arena("a"));
        arenas.insert(arena("b"));
        let (registry, _stop) = registry(arenas);

        // Separate indexes let the same player into both sessions
        let isolated = |seq, id: &str| {
            let ctx = SessionContext {
                index: Arc::new(MembershipIndex::new()),
                ..registry.ctx.clone()
            };
            Session::new(seq, arena(id), TeamMode::Solo, ctx)
        };
        let older = isolated(7, "a");
        let newer = isolated(9, "b");
        registry.register(older.clone());
        registry.register(newer.clone());

        let player = MemoryPlayer::new(
            "alex",
            PlayerSnapshot::fresh_at(Location::new("lobby", 0.0, 70.0, 0.0)),
        );
        older.admit(player.clone()).await.unwrap();
        newer.admit(player.clone()).await.unwrap();

        let found = registry.find_session_by_player(&player.id()).unwrap();
        assert_eq!(found.id(), newer.id());
        assert_eq!(found.sequence(), 9);
        assert!(registry.find_session_by_player(&uuid::Uuid::new_v4()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_creation_races_open_the_breaker() {
        let arenas = StaticArenas::new();
        arenas.insert(arena("a"));
        let resilience = ResilienceConfig {
            breaker: BreakerConfig {
                failure_threshold: 2,
                window: Duration::from_secs(60),
                cooldown: Duration::from_secs(30),
            },
            ..ResilienceConfig::default()
        };
        let (registry, _stop) = registry_with(arenas, resilience);
        let id = ArenaId::new("a");

        for round in 0..2u64 {
            let guard = registry.arena_locks.lock(id.clone()).await;
            let creating = {
                let registry = registry.clone();
                let id = id.clone();
                tokio::spawn(async move { registry.create_session(&id, TeamMode::Solo).await })
            };
            // Creator passes the pre-check and waits on the arena lock
            tokio::task::yield_now().await;

            let rival = Session::new(100 + round, arena("a"), TeamMode::Solo, registry.ctx.clone());
            registry.register(rival.clone());
            drop(guard);

            let result = creating.await.unwrap();
            assert!(
                matches!(result, Err(SessionError::ArenaInUse { session, .. }) if session == rival.id())
            );
            assert!(registry.remove_session(&rival.id()));
        }

        assert_eq!(registry.breaker_status(), BreakerStatus::Open);
        let blocked = registry.create_session(&id, TeamMode::Solo).await;
        assert!(matches!(blocked, Err(SessionError::CircuitOpen { .. })));

        // After the cooldown a trial call goes through and closes the circuit
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(registry.create_session(&id, TeamMode::Solo).await.is_ok());
        assert_eq!(registry.breaker_status(), BreakerStatus::Closed);
    }
}
