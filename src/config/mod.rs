//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::game::TimerSettings;
use crate::resilience::{BreakerConfig, RetryPolicy};
use crate::runtime::PoolSizing;
use crate::util::time::MAIN_TICK_MILLIS;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Admin server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text
    pub log_json: bool,
    /// Bearer token for admin actions; admin actions are refused without one
    pub admin_token: Option<String>,

    /// Main tick period
    pub main_tick: Duration,
    /// How often duplicate sessions are reconciled
    pub reconcile_interval: Duration,
    /// How long a worker waits for the main tick to run a task
    pub handoff_timeout: Duration,
    /// JSON file with the arenas the standalone host serves
    pub arenas_file: Option<PathBuf>,

    pub game: GameConfig,
    pub resilience: ResilienceConfig,
    pub workers: WorkerConfig,
}

/// Per-session match settings
#[derive(Clone, Debug)]
pub struct GameConfig {
    pub timers: TimerSettings,
    /// Attempts at restoring a departing player's state
    pub restore_attempts: u32,
    pub restore_backoff: Duration,
    pub restore_max_backoff: Duration,
}

impl GameConfig {
    pub fn restore_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.restore_attempts,
            self.restore_backoff,
            self.restore_max_backoff,
        )
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            timers: TimerSettings::default(),
            restore_attempts: 3,
            restore_backoff: Duration::from_millis(250),
            restore_max_backoff: Duration::from_secs(2),
        }
    }
}

/// Policies wrapped around session creation
#[derive(Clone, Debug, Default)]
pub struct ResilienceConfig {
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub sizing: PoolSizing,
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sizing: PoolSizing::default(),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value if set
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = match lookup("PORT") {
            Some(port) => format!("0.0.0.0:{}", port),
            None => lookup("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        };

        let game_defaults = GameConfig::default();
        let timer_defaults = game_defaults.timers.clone();
        let breaker_defaults = BreakerConfig::default();
        let retry_defaults = RetryPolicy::default();
        let worker_defaults = WorkerConfig::default();

        let timers = TimerSettings {
            countdown_secs: parse_or(&lookup, "SG_COUNTDOWN_SECS", timer_defaults.countdown_secs)?,
            grace_secs: parse_or(&lookup, "SG_GRACE_SECS", timer_defaults.grace_secs)?,
            total_game_secs: parse_or(&lookup, "SG_GAME_TIME_SECS", timer_defaults.total_game_secs)?,
            deathmatch_secs: parse_or(&lookup, "SG_DEATHMATCH_SECS", timer_defaults.deathmatch_secs)?,
            reminder_offsets: match lookup("SG_DEATHMATCH_REMINDERS") {
                Some(raw) => parse_list(&raw, "SG_DEATHMATCH_REMINDERS")?,
                None => timer_defaults.reminder_offsets,
            },
        };
        if timers.deathmatch_secs > timers.total_game_secs {
            return Err(ConfigError::Invalid("SG_DEATHMATCH_SECS"));
        }

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_json: lookup("LOG_FORMAT")
                .map(|format| format.trim().eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            admin_token: lookup("ADMIN_TOKEN").filter(|token| !token.trim().is_empty()),

            main_tick: Duration::from_millis(parse_or(&lookup, "MAIN_TICK_MS", MAIN_TICK_MILLIS)?),
            reconcile_interval: Duration::from_secs(parse_or(
                &lookup,
                "RECONCILE_INTERVAL_SECS",
                30,
            )?),
            handoff_timeout: Duration::from_millis(parse_or(&lookup, "SG_HANDOFF_TIMEOUT_MS", 3_000)?),
            arenas_file: lookup("SG_ARENAS_FILE").map(PathBuf::from),

            game: GameConfig {
                timers,
                restore_attempts: parse_or(&lookup, "SG_RESTORE_ATTEMPTS", game_defaults.restore_attempts)?,
                ..game_defaults
            },

            resilience: ResilienceConfig {
                breaker: BreakerConfig {
                    failure_threshold: parse_or(
                        &lookup,
                        "SG_BREAKER_THRESHOLD",
                        breaker_defaults.failure_threshold,
                    )?,
                    window: Duration::from_secs(parse_or(
                        &lookup,
                        "SG_BREAKER_WINDOW_SECS",
                        breaker_defaults.window.as_secs(),
                    )?),
                    cooldown: Duration::from_secs(parse_or(
                        &lookup,
                        "SG_BREAKER_COOLDOWN_SECS",
                        breaker_defaults.cooldown.as_secs(),
                    )?),
                },
                retry: RetryPolicy::new(
                    parse_or(&lookup, "SG_RETRY_ATTEMPTS", retry_defaults.max_attempts)?,
                    Duration::from_millis(parse_or(
                        &lookup,
                        "SG_RETRY_BASE_MS",
                        retry_defaults.initial_backoff.as_millis() as u64,
                    )?),
                    Duration::from_millis(parse_or(
                        &lookup,
                        "SG_RETRY_MAX_MS",
                        retry_defaults.max_backoff.as_millis() as u64,
                    )?),
                ),
            },

            workers: WorkerConfig {
                sizing: PoolSizing {
                    target_utilization: parse_or(
                        &lookup,
                        "SG_WORKER_UTILIZATION",
                        worker_defaults.sizing.target_utilization,
                    )?,
                    min_workers: parse_or(&lookup, "SG_WORKER_MIN", worker_defaults.sizing.min_workers)?,
                    max_workers: parse_or(&lookup, "SG_WORKER_MAX", worker_defaults.sizing.max_workers)?,
                },
                drain_timeout: Duration::from_secs(parse_or(
                    &lookup,
                    "SG_WORKER_DRAIN_SECS",
                    worker_defaults.drain_timeout.as_secs(),
                )?),
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        None => Ok(default),
    }
}

fn parse_list(raw: &str, name: &'static str) -> Result<Vec<u64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse().map_err(|_| ConfigError::Invalid(name)))
        .collect()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.server_addr.port(), 8080);
        assert_eq!(config.log_level, "info");
        assert!(!config.log_json);
        assert!(config.admin_token.is_none());
        assert_eq!(config.main_tick, Duration::from_millis(50));
        assert_eq!(config.game.timers, TimerSettings::default());
        assert_eq!(config.resilience.breaker.failure_threshold, 5);
    }

    #[test]
    fn port_overrides_server_addr() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "9000"),
            ("SERVER_ADDR", "127.0.0.1:7000"),
        ]))
        .unwrap();
        assert_eq!(config.server_addr.port(), 9000);
    }

    #[test]
    fn game_settings_are_read() {
        let config = Config::from_lookup(lookup(&[
            ("SG_COUNTDOWN_SECS", "15"),
            ("SG_GAME_TIME_SECS", "600"),
            ("SG_DEATHMATCH_SECS", "120"),
            ("SG_DEATHMATCH_REMINDERS", "30, 10,5"),
            ("SG_WORKER_UTILIZATION", "0.5"),
            ("ADMIN_TOKEN", "s3cret"),
        ]))
        .unwrap();

        assert_eq!(config.game.timers.countdown_secs, 15);
        assert_eq!(config.game.timers.deathmatch_start_secs(), 480);
        assert_eq!(config.game.timers.reminder_offsets, vec![30, 10, 5]);
        assert_eq!(config.workers.sizing.target_utilization, 0.5);
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = Config::from_lookup(lookup(&[("SG_GRACE_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("SG_GRACE_SECS")));

        let err = Config::from_lookup(lookup(&[
            ("SG_GAME_TIME_SECS", "60"),
            ("SG_DEATHMATCH_SECS", "120"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("SG_DEATHMATCH_SECS")));

        let err = Config::from_lookup(lookup(&[("SERVER_ADDR", "nowhere")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress));
    }
}
