//! Owned pool for background work (chest filling, statistics, restoration)

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How many tasks may run concurrently, derived from available parallelism
#[derive(Debug, Clone)]
pub struct PoolSizing {
    /// Fraction of the available cores the pool may occupy
    pub target_utilization: f64,
    pub min_workers: usize,
    pub max_workers: usize,
}

impl PoolSizing {
    pub fn worker_count(&self, available_parallelism: usize) -> usize {
        let utilization = if self.target_utilization.is_finite() {
            self.target_utilization.max(0.0)
        } else {
            1.0
        };
        let wanted = (available_parallelism as f64 * utilization).ceil() as usize;
        let min = self.min_workers.max(1);
        wanted.clamp(min, self.max_workers.max(min))
    }

    /// Worker count for this machine
    pub fn resolve(&self) -> usize {
        self.worker_count(num_cpus::get())
    }
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            target_utilization: 0.75,
            min_workers: 2,
            max_workers: 16,
        }
    }
}

/// Outcome of [`WorkerPool::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drained: usize,
    pub cancelled: usize,
}

pub struct WorkerPool {
    name: &'static str,
    size: usize,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    accepting: AtomicBool,
}

impl WorkerPool {
    pub fn new(name: &'static str, sizing: &PoolSizing) -> Arc<Self> {
        Self::with_size(name, sizing.resolve())
    }

    pub fn with_size(name: &'static str, size: usize) -> Arc<Self> {
        let size = size.max(1);
        info!(pool = name, workers = size, "Worker pool created");
        Arc::new(Self {
            name,
            size,
            permits: Arc::new(Semaphore::new(size)),
            tasks: Mutex::new(JoinSet::new()),
            accepting: AtomicBool::new(true),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks spawned and not yet reaped
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Run `work` once a worker slot is free. Returns false after shutdown.
    pub fn spawn<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        // Checked under the lock so nothing lands in the set shutdown takes
        let mut tasks = self.tasks.lock();
        if !self.is_accepting() {
            warn!(pool = self.name, "Worker pool is shut down, rejecting task");
            return false;
        }
        // Reap finished tasks so the set only holds live work
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            work.await;
        });
        true
    }

    /// Stop accepting work, wait up to `drain_timeout` for in-flight tasks,
    /// then abort the rest
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        let mut tasks = {
            let mut tasks = self.tasks.lock();
            self.accepting.store(false, Ordering::SeqCst);
            std::mem::take(&mut *tasks)
        };
        let outstanding = tasks.len();

        let mut drained = 0;
        let drain = async {
            while tasks.join_next().await.is_some() {
                drained += 1;
            }
        };
        let timed_out = tokio::time::timeout(drain_timeout, drain).await.is_err();

        let mut cancelled = 0;
        if timed_out {
            cancelled = tasks.len();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            warn!(pool = self.name, cancelled, "Drain timeout reached, cancelled outstanding tasks");
        }

        debug!(pool = self.name, outstanding, drained, "Worker pool drained");
        info!(pool = self.name, drained, cancelled, "Worker pool shut down");
        ShutdownReport { drained, cancelled }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn sizing_scales_with_parallelism_and_clamps() {
        let sizing = PoolSizing {
            target_utilization: 0.5,
            min_workers: 2,
            max_workers: 8,
        };
        assert_eq!(sizing.worker_count(1), 2);
        assert_eq!(sizing.worker_count(8), 4);
        assert_eq!(sizing.worker_count(9), 5);
        assert_eq!(sizing.worker_count(64), 8);
    }

    #[test]
    fn nonsense_utilization_falls_back_to_one() {
        let sizing = PoolSizing {
            target_utilization: f64::NAN,
            min_workers: 1,
            max_workers: 32,
        };
        assert_eq!(sizing.worker_count(4), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded_by_pool_size() {
        let pool = WorkerPool::with_size("test", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        let report = pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report, ShutdownReport { drained: 6, cancelled: 0 });
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_tasks_past_the_drain_timeout() {
        let pool = WorkerPool::with_size("test", 4);
        let finished = Arc::new(AtomicUsize::new(0));

        for secs in [1, 60] {
            let finished = finished.clone();
            pool.spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        let report = pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report, ShutdownReport { drained: 1, cancelled: 1 });
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!pool.spawn(async {}));
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_during_drain_is_rejected() {
        let pool = WorkerPool::with_size("test", 2);
        pool.spawn(async {
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let draining = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        assert!(!pool.spawn(async {}));
        let report = draining.await.unwrap();
        assert_eq!(report, ShutdownReport { drained: 1, cancelled: 0 });
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn work_accepted_while_shutting_down_is_drained() {
        let pool = WorkerPool::with_size("test", 4);
        let accepted = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let spawners: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let accepted = accepted.clone();
                let finished = finished.clone();
                tokio::spawn(async move {
                    loop {
                        let finished = finished.clone();
                        let queued = pool.spawn(async move {
                            finished.fetch_add(1, Ordering::SeqCst);
                        });
                        if !queued {
                            break;
                        }
                        accepted.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = pool.shutdown(Duration::from_secs(5)).await;
        for spawner in spawners {
            spawner.await.unwrap();
        }

        assert_eq!(report.cancelled, 0);
        assert_eq!(pool.pending(), 0);
        assert_eq!(
            finished.load(Ordering::SeqCst),
            accepted.load(Ordering::SeqCst)
        );
    }
}
