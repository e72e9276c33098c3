//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::registry::SessionRegistry;
use crate::runtime::MainTickHandle;
use crate::util::rate_limit::AdminRateLimiter;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub main_tick: MainTickHandle,
    pub admin_limiter: AdminRateLimiter,
}

impl AppState {
    pub fn new(config: Arc<Config>, registry: Arc<SessionRegistry>) -> Self {
        let main_tick = registry.context().main_tick.clone();

        Self {
            config,
            registry,
            main_tick,
            admin_limiter: AdminRateLimiter::new(),
        }
    }
}
