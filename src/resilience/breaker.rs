//! Circuit breaker with a sliding failure window and single-probe recovery

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use super::Classify;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Failures older than this no longer count
    pub window: Duration,
    /// How long the breaker stays open before allowing a probe
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit open, retry in {retry_in:?}")]
    Open { retry_in: Duration },

    #[error("{0}")]
    Inner(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum BreakerState {
    Closed { failures: VecDeque<Instant> },
    Open { until: Instant },
    HalfOpen { probing: bool },
}

/// Admission granted for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Probe,
}

pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(BreakerState::Closed {
                failures: VecDeque::new(),
            }),
        }
    }

    pub fn status(&self) -> BreakerStatus {
        match &*self.state.lock() {
            BreakerState::Closed { .. } => BreakerStatus::Closed,
            BreakerState::Open { until } if Instant::now() >= *until => BreakerStatus::HalfOpen,
            BreakerState::Open { .. } => BreakerStatus::Open,
            BreakerState::HalfOpen { .. } => BreakerStatus::HalfOpen,
        }
    }

    /// Run `op` if the breaker admits it, recording the outcome
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let permit = self.acquire::<E>()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: permit == Permit::Probe,
        };

        let result = op().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.on_success(permit),
            Err(err) if err.is_failure() => self.on_failure(permit),
            // Caller errors say nothing about health; only free the probe slot
            Err(_) if permit == Permit::Probe => self.abandon_probe(),
            Err(_) => {}
        }
        result.map_err(BreakerError::Inner)
    }

    /// Count a failure seen inside an operation that still finished with a
    /// non-failure outcome, e.g. a lost race followed by a conflict
    pub fn record_failure(&self) {
        self.on_failure(Permit::Normal);
    }

    fn acquire<E>(&self) -> Result<Permit, BreakerError<E>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        match *state {
            BreakerState::Closed { .. } => Ok(Permit::Normal),
            BreakerState::Open { until } if now < until => Err(BreakerError::Open {
                retry_in: until - now,
            }),
            BreakerState::Open { .. } => {
                info!(breaker = self.name, "Cooldown elapsed, allowing probe");
                *state = BreakerState::HalfOpen { probing: true };
                Ok(Permit::Probe)
            }
            BreakerState::HalfOpen { probing: true } => Err(BreakerError::Open {
                retry_in: Duration::ZERO,
            }),
            BreakerState::HalfOpen { probing: false } => {
                *state = BreakerState::HalfOpen { probing: true };
                Ok(Permit::Probe)
            }
        }
    }

    fn on_success(&self, permit: Permit) {
        let mut state = self.state.lock();
        if let BreakerState::Closed { failures } = &mut *state {
            failures.clear();
        } else if permit == Permit::Probe {
            info!(breaker = self.name, "Probe succeeded, closing circuit");
            *state = BreakerState::Closed {
                failures: VecDeque::new(),
            };
        }
        // A normal call admitted before the breaker opened may finish late; ignore it
    }

    fn on_failure(&self, permit: Permit) {
        let mut state = self.state.lock();
        let now = Instant::now();

        let trip = match &mut *state {
            BreakerState::Closed { failures } => {
                failures.push_back(now);
                while let Some(oldest) = failures.front() {
                    if now.duration_since(*oldest) > self.config.window {
                        failures.pop_front();
                    } else {
                        break;
                    }
                }
                if failures.len() as u32 >= self.config.failure_threshold {
                    warn!(
                        breaker = self.name,
                        failures = failures.len(),
                        cooldown = ?self.config.cooldown,
                        "Failure threshold reached, opening circuit"
                    );
                    true
                } else {
                    false
                }
            }
            _ if permit == Permit::Probe => {
                warn!(breaker = self.name, "Probe failed, reopening circuit");
                true
            }
            _ => false,
        };

        if trip {
            *state = BreakerState::Open {
                until: now + self.config.cooldown,
            };
        }
    }

    /// A probe whose future was dropped before finishing frees the slot
    fn abandon_probe(&self) {
        let mut state = self.state.lock();
        if let BreakerState::HalfOpen { probing } = &mut *state {
            *probing = false;
        }
    }
}

struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_probe();
        }
    }
}
