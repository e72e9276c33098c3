//! Countdown, grace period and deathmatch scheduling for one session
//!
//! Each schedule runs as its own tokio task tagged with a generation number.
//! Cancelling or superseding a schedule bumps the generation under the same
//! lock the task takes before it emits an event or fires a callback, so a
//! stale task can neither tick nor call back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::util::time::ceil_secs;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

const EVENT_CAPACITY: usize = 128;

/// Phase lengths, in seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSettings {
    pub countdown_secs: u64,
    pub grace_secs: u64,
    /// Whole match, measured from leaving the countdown
    pub total_game_secs: u64,
    pub deathmatch_secs: u64,
    /// Seconds before the deathmatch at which reminders go out
    pub reminder_offsets: Vec<u64>,
}

impl TimerSettings {
    /// Offset from match start at which the deathmatch begins
    pub fn deathmatch_start_secs(&self) -> u64 {
        self.total_game_secs.saturating_sub(self.deathmatch_secs)
    }
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            countdown_secs: 30,
            grace_secs: 30,
            total_game_secs: 1_200,
            deathmatch_secs: 180,
            reminder_offsets: vec![60, 30, 10],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    CountdownTick { remaining: u64, emphasized: bool },
    CountdownCleared,
    GraceEnded,
    DeathmatchReminder { seconds_until: u64 },
    DeathmatchStarted,
    GameTimeUp,
}

/// Ticks at every 10-second boundary and through the final 10 seconds stand out
pub fn is_emphasized(remaining: u64) -> bool {
    remaining <= 10 || remaining % 10 == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Countdown,
    Running,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Countdown = 0,
    Grace = 1,
    Deathmatch = 2,
}

struct TimerInner {
    stage: Stage,
    generation: [u64; 3],
    tasks: [Option<JoinHandle<()>>; 3],
}

impl TimerInner {
    /// Invalidate whatever runs in `slot`, returning the new generation
    fn supersede(&mut self, slot: Slot) -> u64 {
        let i = slot as usize;
        self.generation[i] += 1;
        if let Some(task) = self.tasks[i].take() {
            task.abort();
        }
        self.generation[i]
    }
}

struct TimerShared {
    settings: TimerSettings,
    inner: Mutex<TimerInner>,
    countdown_remaining: AtomicU64,
    started_at: OnceLock<Instant>,
    ended_early: AtomicBool,
    events: broadcast::Sender<TimerEvent>,
}

impl TimerShared {
    /// Emit `event` if the schedule in `slot` is still current
    fn emit_if_current(&self, slot: Slot, generation: u64, event: TimerEvent) -> bool {
        let inner = self.inner.lock();
        if inner.generation[slot as usize] != generation || self.ended_early.load(Ordering::SeqCst)
        {
            return false;
        }
        if let TimerEvent::CountdownTick { remaining, .. } = event {
            self.countdown_remaining.store(remaining, Ordering::SeqCst);
        }
        let _ = self.events.send(event);
        true
    }

    /// Retire the schedule in `slot` if still current. The caller may then
    /// run its completion callback, which nothing can cancel anymore.
    fn complete_if_current(&self, slot: Slot, generation: u64, event: Option<TimerEvent>) -> bool {
        let mut inner = self.inner.lock();
        let i = slot as usize;
        if inner.generation[i] != generation || self.ended_early.load(Ordering::SeqCst) {
            return false;
        }
        inner.generation[i] += 1;
        // Our own handle; dropping it detaches rather than aborts
        inner.tasks[i] = None;
        if let Slot::Countdown = slot {
            self.countdown_remaining.store(0, Ordering::SeqCst);
        }
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        true
    }
}

pub struct PhaseTimer {
    shared: Arc<TimerShared>,
}

impl PhaseTimer {
    pub fn new(settings: TimerSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(TimerShared {
                settings,
                inner: Mutex::new(TimerInner {
                    stage: Stage::Idle,
                    generation: [0; 3],
                    tasks: [None, None, None],
                }),
                countdown_remaining: AtomicU64::new(0),
                started_at: OnceLock::new(),
                ended_early: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn settings(&self) -> &TimerSettings {
        &self.shared.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimerEvent> {
        self.shared.events.subscribe()
    }

    /// Tick once per second from `seconds` down, then call `on_complete`.
    /// Restarting replaces a running countdown. Returns false once the match
    /// has started or the timer was ended early.
    pub fn start_countdown(&self, seconds: u64, on_complete: TimerCallback) -> bool {
        let shared = self.shared.clone();
        let mut inner = self.shared.inner.lock();
        if self.is_ended_early() || inner.stage == Stage::Running {
            return false;
        }

        let generation = inner.supersede(Slot::Countdown);
        inner.stage = Stage::Countdown;
        self.shared.countdown_remaining.store(seconds, Ordering::SeqCst);

        let start = Instant::now();
        inner.tasks[Slot::Countdown as usize] = Some(tokio::spawn(async move {
            for elapsed in 0..seconds {
                sleep_until(start + Duration::from_secs(elapsed)).await;
                let remaining = seconds - elapsed;
                let tick = TimerEvent::CountdownTick {
                    remaining,
                    emphasized: is_emphasized(remaining),
                };
                if !shared.emit_if_current(Slot::Countdown, generation, tick) {
                    return;
                }
            }
            sleep_until(start + Duration::from_secs(seconds)).await;
            if shared.complete_if_current(Slot::Countdown, generation, None) {
                on_complete();
            }
        }));
        debug!(seconds, "Countdown started");
        true
    }

    /// Stop a running countdown without calling its completion callback
    pub fn cancel_countdown(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.stage != Stage::Countdown {
            return false;
        }
        inner.supersede(Slot::Countdown);
        inner.stage = Stage::Idle;
        self.shared.countdown_remaining.store(0, Ordering::SeqCst);
        let _ = self.shared.events.send(TimerEvent::CountdownCleared);
        debug!("Countdown cancelled");
        true
    }

    /// Leave the countdown: record the match start instant (once) and call
    /// `on_complete` after the grace period
    pub fn start_grace_period(&self, on_complete: TimerCallback) -> bool {
        let shared = self.shared.clone();
        let mut inner = self.shared.inner.lock();
        if self.is_ended_early() || inner.stage == Stage::Running {
            return false;
        }

        inner.supersede(Slot::Countdown);
        self.shared.countdown_remaining.store(0, Ordering::SeqCst);
        inner.stage = Stage::Running;
        let start = *self.shared.started_at.get_or_init(Instant::now);

        let generation = inner.supersede(Slot::Grace);
        let deadline = start + Duration::from_secs(self.shared.settings.grace_secs);
        inner.tasks[Slot::Grace as usize] = Some(tokio::spawn(async move {
            sleep_until(deadline).await;
            if shared.complete_if_current(Slot::Grace, generation, Some(TimerEvent::GraceEnded)) {
                on_complete();
            }
        }));
        true
    }

    /// Schedule reminders, `on_deathmatch` at `total − deathmatch` seconds
    /// into the match and `on_game_end` one deathmatch length later
    pub fn schedule_deathmatch(
        &self,
        on_deathmatch: TimerCallback,
        on_game_end: TimerCallback,
    ) -> bool {
        let shared = self.shared.clone();
        let mut inner = self.shared.inner.lock();
        if self.is_ended_early() || inner.stage != Stage::Running {
            return false;
        }
        let Some(&start) = self.shared.started_at.get() else {
            return false;
        };

        let settings = &self.shared.settings;
        let deathmatch_at = start + Duration::from_secs(settings.deathmatch_start_secs());
        let game_end_at = deathmatch_at + Duration::from_secs(settings.deathmatch_secs);

        let mut reminders: Vec<u64> = settings
            .reminder_offsets
            .iter()
            .copied()
            .filter(|&offset| offset > 0 && offset <= settings.deathmatch_start_secs())
            .collect();
        reminders.sort_unstable_by(|a, b| b.cmp(a));
        reminders.dedup();

        let generation = inner.supersede(Slot::Deathmatch);
        inner.tasks[Slot::Deathmatch as usize] = Some(tokio::spawn(async move {
            for seconds_until in reminders {
                sleep_until(deathmatch_at - Duration::from_secs(seconds_until)).await;
                let reminder = TimerEvent::DeathmatchReminder { seconds_until };
                if !shared.emit_if_current(Slot::Deathmatch, generation, reminder) {
                    return;
                }
            }

            sleep_until(deathmatch_at).await;
            if !shared.emit_if_current(Slot::Deathmatch, generation, TimerEvent::DeathmatchStarted) {
                return;
            }
            on_deathmatch();

            sleep_until(game_end_at).await;
            if shared.complete_if_current(Slot::Deathmatch, generation, Some(TimerEvent::GameTimeUp)) {
                on_game_end();
            }
        }));
        true
    }

    /// When the match left the countdown, if it has
    pub fn match_started_at(&self) -> Option<Instant> {
        self.shared.started_at.get().copied()
    }

    /// Seconds left: live countdown while counting down, game time once
    /// started, 0 before either and after an early end
    pub fn remaining_time(&self) -> u64 {
        if self.is_ended_early() {
            return 0;
        }
        let stage = self.shared.inner.lock().stage;
        match stage {
            Stage::Idle => 0,
            Stage::Countdown => self.shared.countdown_remaining.load(Ordering::SeqCst),
            Stage::Running => {
                let Some(start) = self.match_started_at() else {
                    return 0;
                };
                let total = Duration::from_secs(self.shared.settings.total_game_secs);
                ceil_secs(total.saturating_sub(start.elapsed()))
            }
        }
    }

    /// Cancel everything and pin the remaining time to zero; irreversible
    pub fn end_early(&self) {
        self.shared.ended_early.store(true, Ordering::SeqCst);
        self.cancel_all();
    }

    pub fn is_ended_early(&self) -> bool {
        self.shared.ended_early.load(Ordering::SeqCst)
    }

    /// Invalidate and abort every pending schedule
    pub fn cancel_all(&self) {
        let mut inner = self.shared.inner.lock();
        for slot in [Slot::Countdown, Slot::Grace, Slot::Deathmatch] {
            inner.supersede(slot);
        }
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn settings() -> TimerSettings {
        TimerSettings {
            countdown_secs: 30,
            grace_secs: 20,
            total_game_secs: 100,
            deathmatch_secs: 30,
            reminder_offsets: vec![5, 20],
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> TimerCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        let make = move || -> TimerCallback {
            let count = handle.clone();
            Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        (count, make)
    }

    fn drain(rx: &mut broadcast::Receiver<TimerEvent>) -> Vec<TimerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn emphasis_rule() {
        assert!(is_emphasized(30));
        assert!(is_emphasized(20));
        assert!(!is_emphasized(15));
        assert!(!is_emphasized(11));
        assert!((1..=10).all(is_emphasized));
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_ticks_then_completes() {
        let timer = PhaseTimer::new(settings());
        let mut rx = timer.subscribe();
        let (fired, callback) = counter();

        assert!(timer.start_countdown(12, callback()));
        tokio::time::sleep(Duration::from_secs(13)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let ticks: Vec<(u64, bool)> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                TimerEvent::CountdownTick {
                    remaining,
                    emphasized,
                } => Some((remaining, emphasized)),
                _ => None,
            })
            .collect();
        let expected: Vec<(u64, bool)> = (1..=12).rev().map(|r| (r, r <= 10)).collect();
        assert_eq!(ticks, expected);
        assert_eq!(timer.remaining_time(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_countdown_never_calls_back() {
        let timer = PhaseTimer::new(settings());
        let mut rx = timer.subscribe();
        let (fired, callback) = counter();

        timer.start_countdown(30, callback());
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(timer.remaining_time(), 20);
        assert!(timer.cancel_countdown());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&TimerEvent::CountdownCleared));
        let ticks = events
            .iter()
            .filter(|e| matches!(e, TimerEvent::CountdownTick { .. }))
            .count();
        assert_eq!(ticks, 11);
        assert_eq!(timer.remaining_time(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restarted_countdown_supersedes_the_old_one() {
        let timer = PhaseTimer::new(settings());
        let (first, first_cb) = counter();
        let (second, second_cb) = counter();

        timer.start_countdown(5, first_cb());
        tokio::time::sleep(Duration::from_secs(2)).await;
        timer.start_countdown(5, second_cb());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_time_tracks_the_match_clock() {
        let timer = PhaseTimer::new(settings());
        assert_eq!(timer.remaining_time(), 0);

        let (grace_done, grace_cb) = counter();
        assert!(timer.start_grace_period(grace_cb()));
        assert_eq!(timer.remaining_time(), 100);

        tokio::time::sleep(Duration::from_millis(25_500)).await;
        assert_eq!(grace_done.load(Ordering::SeqCst), 1);
        assert_eq!(timer.remaining_time(), 75);

        // Match start is recorded once
        let started = timer.match_started_at();
        assert!(!timer.start_grace_period(Box::new(|| {})));
        assert_eq!(timer.match_started_at(), started);

        timer.end_early();
        assert_eq!(timer.remaining_time(), 0);
        assert!(!timer.start_countdown(10, Box::new(|| {})));
    }

    #[tokio::test(start_paused = true)]
    async fn deathmatch_schedule_runs_in_order() {
        let timer = PhaseTimer::new(settings());
        let mut rx = timer.subscribe();
        let (deathmatch, dm_cb) = counter();
        let (ended, end_cb) = counter();

        assert!(!timer.schedule_deathmatch(dm_cb(), end_cb()));
        timer.start_grace_period(Box::new(|| {}));
        assert!(timer.schedule_deathmatch(dm_cb(), end_cb()));

        tokio::time::sleep(Duration::from_secs(69)).await;
        assert_eq!(deathmatch.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(deathmatch.load(Ordering::SeqCst), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ended.load(Ordering::SeqCst), 1);

        assert_eq!(
            drain(&mut rx),
            vec![
                TimerEvent::GraceEnded,
                TimerEvent::DeathmatchReminder { seconds_until: 20 },
                TimerEvent::DeathmatchReminder { seconds_until: 5 },
                TimerEvent::DeathmatchStarted,
                TimerEvent::GameTimeUp,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ending_early_silences_pending_callbacks() {
        let timer = PhaseTimer::new(settings());
        let (grace_done, grace_cb) = counter();
        let (deathmatch, dm_cb) = counter();
        let (ended, end_cb) = counter();

        timer.start_grace_period(grace_cb());
        timer.schedule_deathmatch(dm_cb(), end_cb());
        tokio::time::sleep(Duration::from_secs(5)).await;
        timer.end_early();
        tokio::time::sleep(Duration::from_secs(200)).await;

        assert_eq!(grace_done.load(Ordering::SeqCst), 0);
        assert_eq!(deathmatch.load(Ordering::SeqCst), 0);
        assert_eq!(ended.load(Ordering::SeqCst), 0);
    }
}
