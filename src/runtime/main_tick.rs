//! Main tick hand-off
//!
//! World-visible mutations must run on the host's single cooperative tick.
//! Code running elsewhere queues a closure through [`MainTickHandle`]; the
//! [`MainTick`] loop drains the queue once per tick.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

type MainTask = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandoffError {
    #[error("main tick did not run the task within {0:?}")]
    TimedOut(Duration),

    #[error("main tick is not running")]
    Closed,
}

#[derive(Debug, Default)]
struct HandoffStats {
    executed: AtomicU64,
    failed: AtomicU64,
}

/// The loop side, owned by the host
pub struct MainTick {
    rx: mpsc::UnboundedReceiver<MainTask>,
    tick: Duration,
    stats: Arc<HandoffStats>,
}

/// Cloneable sender side, handed to sessions and workers
#[derive(Clone)]
pub struct MainTickHandle {
    tx: mpsc::UnboundedSender<MainTask>,
    timeout: Duration,
    stats: Arc<HandoffStats>,
}

impl MainTick {
    pub fn new(tick: Duration, handoff_timeout: Duration) -> (Self, MainTickHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(HandoffStats::default());

        let handle = MainTickHandle {
            tx,
            timeout: handoff_timeout,
            stats: stats.clone(),
        };

        (Self { rx, tick, stats }, handle)
    }

    /// Spawn the loop on the current runtime; it stops when `shutdown` flips to true
    pub fn spawn(
        tick: Duration,
        handoff_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (MainTickHandle, tokio::task::JoinHandle<()>) {
        let (main_tick, handle) = Self::new(tick, handoff_timeout);
        let task = tokio::spawn(main_tick.run(shutdown));
        (handle, task)
    }

    /// Run the tick loop
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(tick = ?self.tick, "Main tick started");

        let mut tick_interval = interval(self.tick);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    let ran = self.drain();
                    if ran > 0 {
                        debug!(tasks = ran, "Main tick drained queue");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Whatever is still queued gets one last chance
        let ran = self.drain();
        info!(flushed = ran, "Main tick stopped");
    }

    /// Run every queued task, returning how many ran
    fn drain(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("Main tick task panicked");
            }
            self.stats.executed.fetch_add(1, Ordering::Relaxed);
            ran += 1;
        }
        ran
    }
}

impl MainTickHandle {
    /// Queue a task without waiting for it. Returns false if the loop is gone.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(task)).is_err() {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Main tick closed, dropping task");
            return false;
        }
        true
    }

    /// Queue a task and wait for its result, up to the hand-off timeout
    pub async fn call<T, F>(&self, task: F) -> Result<T, HandoffError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = self.tx.send(Box::new(move || {
            let _ = reply_tx.send(task());
        }));
        if queued.is_err() {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return Err(HandoffError::Closed);
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                // Sender dropped without replying: the task panicked
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(HandoffError::Closed)
            }
            Err(_) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(timeout = ?self.timeout, "Main tick hand-off timed out");
                Err(HandoffError::TimedOut(self.timeout))
            }
        }
    }

    pub fn failed_handoffs(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    pub fn executed_tasks(&self) -> u64 {
        self.stats.executed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test(start_paused = true)]
    async fn call_returns_the_task_result() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (handle, _task) =
            MainTick::spawn(Duration::from_millis(50), Duration::from_secs(3), stop_rx);

        let value = assert_ok!(handle.call(|| 21 * 2).await);
        assert_eq!(value, 42);
        assert_eq!(handle.failed_handoffs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out_when_nothing_drains() {
        // Loop constructed but never run
        let (_main_tick, handle) = MainTick::new(Duration::from_millis(50), Duration::from_secs(3));

        let result = handle.call(|| ()).await;
        assert_eq!(result, Err(HandoffError::TimedOut(Duration::from_secs(3))));
        assert_eq!(handle.failed_handoffs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_does_not_stop_the_loop() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (handle, _task) =
            MainTick::spawn(Duration::from_millis(50), Duration::from_secs(3), stop_rx);

        assert_err!(handle.call(|| panic!("boom")).await);
        let flag = Arc::new(AtomicBool::new(false));
        let seen = flag.clone();
        assert_ok!(handle.call(move || seen.store(true, Ordering::SeqCst)).await);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn submit_after_shutdown_is_rejected() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (handle, task) =
            MainTick::spawn(Duration::from_millis(50), Duration::from_secs(3), stop_rx);

        stop_tx.send(true).unwrap();
        task.await.unwrap();

        assert!(!handle.submit(|| {}));
        assert_eq!(handle.call(|| ()).await, Err(HandoffError::Closed));
    }
}
