//! One running match on one arena
//!
//! A session owns its roster, elimination tracker, team board and phase
//! timer. Timer callbacks hold a `Weak` back-reference, so a dropped session
//! never keeps itself alive through its own schedules.

use std::sync::{Arc, OnceLock, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::arena::{ArenaId, ArenaSnapshot};
use crate::collab::{Collaborators, Notice, PlayerDirectory, PlayerHandle, SessionInfo};
use crate::config::GameConfig;
use crate::resilience::{RetryError, RetryPolicy};
use crate::runtime::{MainTickHandle, WorkerPool};

use super::elimination::{EliminationTracker, MatchSummary, StatLine};
use super::error::SessionError;
use super::index::{Claim, MembershipIndex};
use super::phase::{EndReason, SessionState, TeamMode};
use super::player::{PlayerId, PlayerSnapshot};
use super::roster::{AdmitOutcome, Membership, PlayerRoster, RosterError, RosterView};
use super::team::{Team, TeamBoard};
use super::timer::{PhaseTimer, TimerEvent};

/// Shared resources every session of a registry is built with
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<GameConfig>,
    pub collaborators: Collaborators,
    pub main_tick: MainTickHandle,
    pub workers: Arc<WorkerPool>,
    pub index: Arc<MembershipIndex>,
}

/// Row in the admin session list
#[derive(Debug, Clone, Serialize)]
pub struct SessionOverview {
    pub id: Uuid,
    pub arena: ArenaId,
    pub state: SessionState,
    pub team_mode: TeamMode,
    pub active_players: usize,
    pub spectators: usize,
    pub capacity: usize,
    pub remaining_secs: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub overview: SessionOverview,
    pub roster: RosterView,
    pub eliminated: Vec<PlayerId>,
    pub ranking: Vec<PlayerId>,
    pub teams: Vec<Team>,
    pub summary: Option<MatchSummary>,
}

pub struct Session {
    id: Uuid,
    sequence: u64,
    arena: Arc<ArenaSnapshot>,
    team_mode: TeamMode,
    created_at: DateTime<Utc>,
    info: SessionInfo,
    state: RwLock<SessionState>,
    roster: PlayerRoster,
    eliminations: EliminationTracker,
    teams: Mutex<TeamBoard>,
    timer: PhaseTimer,
    started_at: OnceLock<DateTime<Utc>>,
    summary: OnceLock<MatchSummary>,
    ended: watch::Sender<bool>,
    ctx: SessionContext,
    this: Weak<Session>,
}

impl Session {
    /// Build a session in `Waiting`. `sequence` orders sessions by creation.
    pub(crate) fn new(
        sequence: u64,
        arena: ArenaSnapshot,
        team_mode: TeamMode,
        ctx: SessionContext,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let arena = Arc::new(arena);
        let info = SessionInfo {
            id,
            arena: arena.id.clone(),
            team_mode,
        };
        let (ended, _) = watch::channel(false);

        let session = Arc::new_cyclic(|this| Self {
            id,
            sequence,
            roster: PlayerRoster::new(arena.clone(), rand::random()),
            arena,
            team_mode,
            created_at: Utc::now(),
            info,
            state: RwLock::new(SessionState::Waiting),
            eliminations: EliminationTracker::new(),
            teams: Mutex::new(TeamBoard::new(team_mode)),
            timer: PhaseTimer::new(ctx.config.timers.clone()),
            started_at: OnceLock::new(),
            summary: OnceLock::new(),
            ended,
            ctx,
            this: this.clone(),
        });
        session.spawn_notice_forwarder();

        info!(
            session_id = %id,
            arena = %session.arena.id,
            ?team_mode,
            capacity = session.arena.capacity(),
            "Session created"
        );
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn arena(&self) -> &ArenaSnapshot {
        &self.arena
    }

    pub fn arena_id(&self) -> &ArenaId {
        &self.arena.id
    }

    pub fn team_mode(&self) -> TeamMode {
        self.team_mode
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_ended(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn has_player(&self, player: &PlayerId) -> bool {
        self.roster.contains(player)
    }

    pub fn membership(&self, player: &PlayerId) -> Option<Membership> {
        self.roster.membership(player)
    }

    pub fn active_count(&self) -> usize {
        self.roster.active_count()
    }

    pub fn player_count(&self) -> usize {
        self.roster.len()
    }

    pub fn roster_view(&self) -> RosterView {
        self.roster.view()
    }

    pub fn kills(&self, player: &PlayerId) -> u32 {
        self.roster.kills(player)
    }

    pub fn stats_for(&self, player: &PlayerId) -> StatLine {
        self.eliminations.stats_for(player)
    }

    pub fn team_of(&self, player: &PlayerId) -> Option<u32> {
        self.teams.lock().team_of(player)
    }

    pub fn remaining_time(&self) -> u64 {
        self.timer.remaining_time()
    }

    /// Ranking as it stands now; best placement first
    pub fn final_ranking(&self) -> Vec<PlayerId> {
        if let Some(summary) = self.summary.get() {
            return summary.ranking.clone();
        }
        self.eliminations.final_ranking(&self.roster.view())
    }

    /// Stored once the session has ended
    pub fn summary(&self) -> Option<MatchSummary> {
        self.summary.get().cloned()
    }

    pub fn subscribe_end(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }

    /// Resolve once the session reaches `Ended`
    pub async fn wait_ended(&self) {
        let mut rx = self.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Admit a player, as a competitor while the admission window is open
    /// and the arena has room, otherwise as a spectator
    pub async fn admit(&self, player: Arc<dyn PlayerHandle>) -> Result<AdmitOutcome, SessionError> {
        let player_id = player.id();
        if self.is_ended() {
            return Err(SessionError::SessionEnded(self.id));
        }

        match self.ctx.index.claim(player_id, self.id) {
            Claim::Claimed => {}
            Claim::AlreadyMember => {
                return Err(RosterError::AlreadyMember(player_id).into());
            }
            Claim::Taken(session) => {
                return Err(SessionError::AlreadyInSession {
                    player: player_id,
                    session,
                });
            }
        }

        let admitted = {
            let state = self.state.read();
            if state.is_terminal() {
                Err(SessionError::SessionEnded(self.id))
            } else {
                self.roster
                    .admit(player.clone(), *state)
                    .map_err(SessionError::from)
                    .map(|outcome| {
                        if outcome.is_player() {
                            self.teams.lock().assign(player_id);
                        }
                        (outcome, *state)
                    })
            }
        };
        let (outcome, phase) = match admitted {
            Ok(admitted) => admitted,
            Err(err) => {
                self.ctx.index.release(&player_id, self.id);
                return Err(err);
            }
        };

        self.prepare_player(player, &outcome).await;

        match &outcome {
            AdmitOutcome::Admitted { spawn_index, .. } => {
                let active_players = self.roster.active_count();
                info!(
                    session_id = %self.id,
                    player_id = %player_id,
                    spawn_index,
                    active_players,
                    "Player joined session"
                );
                self.notify(Notice::PlayerJoined {
                    player_id,
                    active_players,
                    capacity: self.arena.capacity(),
                });
                if phase == SessionState::Waiting && active_players >= self.arena.min_players {
                    self.start_countdown();
                }
            }
            AdmitOutcome::Spectator { reason } => {
                info!(session_id = %self.id, player_id = %player_id, ?reason, "Player is spectating");
                self.notify(Notice::Spectating { player_id });
            }
        }

        Ok(outcome)
    }

    async fn prepare_player(&self, player: Arc<dyn PlayerHandle>, outcome: &AdmitOutcome) {
        let player_id = player.id();
        let prepared = match outcome {
            AdmitOutcome::Admitted { spawn, .. } => {
                let spawn = spawn.clone();
                self.ctx
                    .main_tick
                    .call(move || player.prepare_for_match(&spawn))
                    .await
            }
            AdmitOutcome::Spectator { .. } => {
                self.ctx.main_tick.call(move || player.make_spectator()).await
            }
        };

        match prepared {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(session_id = %self.id, player_id = %player_id, error = %err, "Player preparation failed")
            }
            Err(err) => {
                warn!(session_id = %self.id, player_id = %player_id, error = %err, "Player preparation hand-off failed")
            }
        }
    }

    /// Take a player out of the session.
    ///
    /// Leaving restores the pre-join state. A disconnect before the match
    /// starts does the same; once it runs the player is parked so the ranking
    /// can place them last, and restored when the session ends. Shutdown
    /// skips restoration.
    pub async fn remove_player(
        &self,
        player_id: PlayerId,
        is_disconnect: bool,
        is_shutting_down: bool,
    ) -> Result<(), SessionError> {
        let (departure, phase) = {
            let state = self.state.read();
            if state.is_terminal() {
                return Err(SessionError::SessionEnded(self.id));
            }
            let departure =
                self.roster
                    .remove(&player_id, is_disconnect, is_shutting_down, *state)?;

            if departure.previous == Membership::Active {
                if state.admits_players() {
                    self.teams.lock().remove(&player_id);
                } else if state.is_in_progress() && !is_disconnect {
                    self.eliminations.record_elimination(player_id);
                }
            }
            (departure, *state)
        };

        if departure.released {
            self.ctx.index.release(&player_id, self.id);
        }
        info!(
            session_id = %self.id,
            player_id = %player_id,
            name = %departure.name,
            previous = ?departure.previous,
            is_disconnect,
            "Player left session"
        );

        if departure.previous == Membership::Active {
            if phase == SessionState::Countdown
                && self.roster.active_count() < self.arena.min_players
            {
                self.cancel_countdown();
            }
            if phase.is_in_progress() {
                self.check_for_winner();
            }
        }

        if let Some(snapshot) = departure.restore {
            restore_player(
                self.restore_context(),
                player_id,
                departure.handle,
                snapshot,
            )
            .await;
        }
        Ok(())
    }

    /// Player left the session voluntarily
    pub async fn leave(&self, player_id: PlayerId) -> Result<(), SessionError> {
        self.remove_player(player_id, false, false).await
    }

    /// Player's connection dropped
    pub async fn disconnect(&self, player_id: PlayerId) -> Result<(), SessionError> {
        self.remove_player(player_id, true, false).await
    }

    /// Knock `victim` out, crediting `killer` if any
    pub fn eliminate_player(
        &self,
        victim: PlayerId,
        killer: Option<PlayerId>,
    ) -> Result<(), SessionError> {
        {
            // Held so that `end` sees the victim either active or in the log
            let state = self.state.read();
            if !state.is_in_progress() {
                return Err(SessionError::WrongState(*state));
            }

            self.roster.eliminate(&victim)?;
            self.eliminations.record_elimination(victim);
            if let Some(killer) = killer.filter(|k| *k != victim) {
                self.roster.add_kill(&killer);
                self.eliminations.add_kill(killer);
            }
        }

        if let Some(handle) = self.roster.resolve(&victim, self.ctx.collaborators.players.as_ref()) {
            self.ctx.main_tick.submit(move || {
                if let Err(err) = handle.make_spectator() {
                    warn!(player_id = %victim, error = %err, "Could not switch eliminated player to spectator");
                }
            });
        }

        let teams_remaining = self.refresh_teams();
        info!(
            session_id = %self.id,
            player_id = %victim,
            killer_id = ?killer,
            teams_remaining,
            "Player eliminated"
        );
        self.notify(Notice::PlayerEliminated {
            player_id: victim,
            killer_id: killer,
            teams_remaining,
        });

        self.end_if_decided(teams_remaining);
        Ok(())
    }

    /// Count damage while the match is running; returns false if ignored
    pub fn record_damage(&self, attacker: Option<PlayerId>, victim: PlayerId, amount: f64) -> bool {
        if !self.state().is_in_progress() || !self.roster.contains(&victim) {
            return false;
        }
        if let Some(attacker) = attacker.filter(|a| *a != victim) {
            self.eliminations.add_damage_dealt(attacker, amount);
        }
        self.eliminations.add_damage_taken(victim, amount);
        true
    }

    pub fn record_chest_opened(&self, player: PlayerId) -> bool {
        if !self.state().is_in_progress() || !self.roster.is_active(&player) {
            return false;
        }
        self.eliminations.add_chest_opened(player);
        true
    }

    /// Start the match now, skipping the remaining countdown
    pub fn force_start(&self) -> Result<(), SessionError> {
        let state = self.state();
        if !state.admits_players() {
            return Err(SessionError::WrongState(state));
        }
        if self.roster.active_count() == 0 {
            return Err(SessionError::NotEnoughPlayers);
        }
        info!(session_id = %self.id, active_players = self.roster.active_count(), "Force starting match");
        self.begin_match()
    }

    /// End the session. Returns false if it had already ended.
    pub fn end(&self, reason: EndReason) -> bool {
        let from = {
            let mut state = self.state.write();
            if state.is_terminal() {
                return false;
            }
            std::mem::replace(&mut *state, SessionState::Ended)
        };
        self.timer.end_early();

        let view = self.roster.view();
        let winners = if from.is_in_progress() {
            self.eliminations.winners(&view)
        } else {
            Vec::new()
        };
        let summary = MatchSummary {
            session_id: self.id,
            arena: self.arena.id.clone(),
            team_mode: self.team_mode,
            reason,
            ranking: self.eliminations.final_ranking(&view),
            winners: winners.clone(),
            stats: self.eliminations.all_stats(),
            started_at: self.started_at.get().copied(),
            ended_at: Utc::now(),
        };
        let _ = self.summary.set(summary.clone());

        self.notify(Notice::MatchEnded { winners, reason });
        self.phase_effects(SessionState::Ended);

        let shutting_down = !reason.restores_players();
        let mut restores = 0;
        for departure in self.roster.release_all(shutting_down) {
            self.ctx.index.release(&departure.player_id, self.id);
            if let Some(snapshot) = departure.restore {
                let ctx = self.restore_context();
                let (player_id, handle) = (departure.player_id, departure.handle);
                let restore = async move {
                    restore_player(ctx, player_id, handle, snapshot).await;
                };
                if self.ctx.workers.spawn(restore) {
                    restores += 1;
                } else {
                    warn!(session_id = %self.id, player_id = %player_id, "Worker pool closed, skipping restoration");
                }
            }
        }

        if from.is_in_progress() {
            self.record_stats(summary);
        }

        self.ended.send_replace(true);
        info!(
            session_id = %self.id,
            arena = %self.arena.id,
            from = %from,
            ?reason,
            restores,
            "Session ended"
        );
        true
    }

    pub fn overview(&self) -> SessionOverview {
        let view = self.roster.view();
        SessionOverview {
            id: self.id,
            arena: self.arena.id.clone(),
            state: self.state(),
            team_mode: self.team_mode,
            active_players: view.active.len(),
            spectators: view.spectators.len(),
            capacity: self.arena.capacity(),
            remaining_secs: self.remaining_time(),
            created_at: self.created_at,
        }
    }

    pub fn detail(&self) -> SessionDetail {
        SessionDetail {
            overview: self.overview(),
            roster: self.roster.view(),
            eliminated: self.eliminations.eliminated(),
            ranking: self.final_ranking(),
            teams: self.teams.lock().teams(),
            summary: self.summary(),
        }
    }

    fn transition(&self, to: SessionState) -> Result<SessionState, SessionError> {
        let from = {
            let mut state = self.state.write();
            let from = *state;
            if !from.can_transition_to(to) {
                return Err(SessionError::InvalidTransition { from, to });
            }
            *state = to;
            from
        };
        info!(session_id = %self.id, arena = %self.arena.id, %from, %to, "Session state changed");
        Ok(from)
    }

    fn callback(&self, f: impl FnOnce(&Session) + Send + 'static) -> Box<dyn FnOnce() + Send> {
        let this = self.this.clone();
        Box::new(move || {
            if let Some(session) = this.upgrade() {
                f(&session);
            }
        })
    }

    fn start_countdown(&self) {
        if self.transition(SessionState::Countdown).is_err() {
            return;
        }
        let seconds = self.ctx.config.timers.countdown_secs;
        self.timer.start_countdown(
            seconds,
            self.callback(|session| {
                if let Err(err) = session.begin_match() {
                    debug!(session_id = %session.id, error = %err, "Countdown finished but match did not start");
                }
            }),
        );
        self.notify(Notice::PhaseChanged {
            phase: SessionState::Countdown,
        });
    }

    fn cancel_countdown(&self) {
        if self.transition(SessionState::Waiting).is_ok() {
            self.timer.cancel_countdown();
            info!(session_id = %self.id, "Countdown cancelled, not enough players");
        }
    }

    fn begin_match(&self) -> Result<(), SessionError> {
        self.transition(SessionState::GracePeriod)?;
        let _ = self.started_at.set(Utc::now());

        self.timer.start_grace_period(self.callback(|session| session.activate()));
        self.timer.schedule_deathmatch(
            self.callback(|session| session.start_deathmatch()),
            self.callback(|session| {
                session.end(EndReason::TimeUp);
            }),
        );

        self.phase_effects(SessionState::GracePeriod);
        self.fill_chests();
        self.notify(Notice::PhaseChanged {
            phase: SessionState::GracePeriod,
        });
        Ok(())
    }

    fn activate(&self) {
        match self.transition(SessionState::Active) {
            Ok(_) => {
                self.phase_effects(SessionState::Active);
                self.notify(Notice::PhaseChanged {
                    phase: SessionState::Active,
                });
            }
            Err(err) => debug!(session_id = %self.id, error = %err, "Grace period over, not activating"),
        }
    }

    fn start_deathmatch(&self) {
        match self.transition(SessionState::Deathmatch) {
            Ok(_) => {
                self.phase_effects(SessionState::Deathmatch);
                self.notify(Notice::PhaseChanged {
                    phase: SessionState::Deathmatch,
                });
            }
            Err(err) => debug!(session_id = %self.id, error = %err, "Deathmatch not started"),
        }
    }

    /// Recompute fallen teams; returns how many are still standing
    fn refresh_teams(&self) -> usize {
        let active = self.roster.view().active;
        let mut teams = self.teams.lock();
        teams.refresh(|p| active.binary_search(p).is_ok());
        teams.remaining()
    }

    fn check_for_winner(&self) {
        let remaining = self.refresh_teams();
        self.end_if_decided(remaining);
    }

    fn end_if_decided(&self, teams_remaining: usize) {
        if !self.state().is_in_progress() {
            return;
        }
        match teams_remaining {
            0 => {
                self.end(EndReason::NoPlayersLeft);
            }
            1 => {
                self.end(EndReason::LastTeamStanding);
            }
            _ => {}
        }
    }

    /// Barriers, PvP, border: only states past the countdown have effects
    fn phase_effects(&self, phase: SessionState) {
        if matches!(phase, SessionState::Waiting | SessionState::Countdown) {
            return;
        }
        let world = self.ctx.collaborators.world.clone();
        let info = self.info.clone();
        self.ctx.main_tick.submit(move || {
            if let Err(err) = world.setup_phase_effects(&info, phase) {
                warn!(session_id = %info.id, %phase, error = %err, "Phase effects failed");
            }
        });
    }

    fn fill_chests(&self) {
        if self.arena.chest_locations.is_empty() {
            return;
        }
        let chests = self.ctx.collaborators.chests.clone();
        let info = self.info.clone();
        let locations = self.arena.chest_locations.clone();
        self.ctx.workers.spawn(async move {
            let count = locations.len();
            match chests.fill(&info, locations).await {
                Ok(()) => debug!(session_id = %info.id, chests = count, "Chests filled"),
                Err(err) => warn!(session_id = %info.id, error = %err, "Chest filling failed"),
            }
        });
    }

    fn record_stats(&self, summary: MatchSummary) {
        let stats = self.ctx.collaborators.stats.clone();
        let session_id = self.id;
        self.ctx.workers.spawn(async move {
            if let Err(err) = stats.record_match(summary).await {
                warn!(session_id = %session_id, error = %err, "Failed to record match statistics");
            }
        });
    }

    fn notify(&self, notice: Notice) {
        let recipients = self.roster.member_ids();
        let notifier = self.ctx.collaborators.notifier.clone();
        let info = self.info.clone();
        self.ctx
            .main_tick
            .submit(move || notifier.broadcast(&info, &recipients, &notice));
    }

    fn forward_timer_event(&self, event: TimerEvent) {
        let notice = match event {
            TimerEvent::CountdownTick {
                remaining,
                emphasized,
            } => Notice::CountdownTick {
                seconds_remaining: remaining,
                emphasized,
            },
            TimerEvent::CountdownCleared => Notice::CountdownCancelled,
            TimerEvent::DeathmatchReminder { seconds_until } => {
                Notice::DeathmatchReminder { seconds_until }
            }
            // Phase changes are announced by the transitions themselves
            TimerEvent::GraceEnded | TimerEvent::DeathmatchStarted | TimerEvent::GameTimeUp => {
                return
            }
        };
        self.notify(notice);
    }

    fn spawn_notice_forwarder(&self) {
        let mut events = self.timer.subscribe();
        let mut ended = self.ended.subscribe();
        let this = self.this.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => {
                            let Some(session) = this.upgrade() else { break };
                            session.forward_timer_event(event);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Timer notices lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = ended.changed() => break,
                }
            }
        });
    }

    fn restore_context(&self) -> RestoreContext {
        RestoreContext {
            session_id: self.id,
            policy: self.ctx.config.restore_policy(),
            main_tick: self.ctx.main_tick.clone(),
            players: self.ctx.collaborators.players.clone(),
        }
    }
}

struct RestoreContext {
    session_id: Uuid,
    policy: RetryPolicy,
    main_tick: MainTickHandle,
    players: Arc<dyn PlayerDirectory>,
}

/// Give a departing player their pre-join state back on the main tick.
///
/// Transient failures (world not loaded, hand-off timeout) are retried with
/// backoff; after that the player's restoration is skipped with a warning.
async fn restore_player(
    ctx: RestoreContext,
    player_id: PlayerId,
    handle: Option<Arc<dyn PlayerHandle>>,
    snapshot: PlayerSnapshot,
) -> bool {
    let snapshot = Arc::new(snapshot);
    let result = ctx
        .policy
        .run("restore_player", |_attempt| {
            let handle = handle
                .clone()
                .filter(|h| h.is_online())
                .or_else(|| ctx.players.lookup(player_id));
            let main_tick = ctx.main_tick.clone();
            let snapshot = snapshot.clone();
            async move {
                let Some(handle) = handle else {
                    return Err(SessionError::Collaborator(
                        crate::collab::CollaboratorError::PlayerOffline,
                    ));
                };
                match main_tick.call(move || handle.restore_state(&snapshot)).await? {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_recoverable() => Err(SessionError::RecoverableIo(err.to_string())),
                    Err(err) => Err(SessionError::Collaborator(err)),
                }
            }
        })
        .await;

    match result {
        Ok(()) => {
            debug!(session_id = %ctx.session_id, player_id = %player_id, "Player state restored");
            true
        }
        Err(RetryError::Exhausted { attempts, last }) => {
            warn!(
                session_id = %ctx.session_id,
                player_id = %player_id,
                attempts,
                error = %last,
                "Skipping player restoration after repeated failures"
            );
            false
        }
        Err(RetryError::Fatal(err)) => {
            warn!(session_id = %ctx.session_id, player_id = %player_id, error = %err, "Skipping player restoration");
            false
        }
    }
}
