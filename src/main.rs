//! Survival Games host - standalone session engine with an admin API
//!
//! This is the entry point for running the engine outside a game server. It:
//! - Owns the main tick and the background worker pool
//! - Opens a waiting session for every configured arena
//! - Periodically reconciles duplicate sessions
//! - Serves the admin HTTP surface until Ctrl+C / SIGTERM

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use survival_games::app::AppState;
use survival_games::arena::{ArenaProvider, StaticArenas};
use survival_games::collab::Collaborators;
use survival_games::config::Config;
use survival_games::game::{MembershipIndex, SessionContext, TeamMode};
use survival_games::http::build_router;
use survival_games::registry::SessionRegistry;
use survival_games::runtime::{MainTick, WorkerPool};
use survival_games::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Arc::new(Config::from_env()?);

    // Initialize tracing
    init_tracing(&config.log_level, config.log_json);

    // Initialize server time tracking
    init_server_time();

    info!("Starting Survival Games host");
    info!("Admin address: {}", config.server_addr);

    // Execution resources
    let (stop_tx, stop_rx) = watch::channel(false);
    let (main_tick, main_tick_task) =
        MainTick::spawn(config.main_tick, config.handoff_timeout, stop_rx);
    let workers = WorkerPool::new("session-workers", &config.workers.sizing);

    // Arenas
    let arenas = match &config.arenas_file {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading arenas from {}", path.display()))?;
            StaticArenas::from_json(&json)
                .with_context(|| format!("parsing arenas from {}", path.display()))?
        }
        None => {
            warn!("SG_ARENAS_FILE not set, starting without arenas");
            StaticArenas::new()
        }
    };

    // Registry
    let ctx = SessionContext {
        config: Arc::new(config.game.clone()),
        collaborators: Collaborators::noop(),
        main_tick,
        workers: workers.clone(),
        index: Arc::new(MembershipIndex::new()),
    };
    let registry = SessionRegistry::new(Arc::new(arenas.clone()), ctx, config.resilience.clone());

    for arena_id in arenas.arena_ids() {
        match registry.create_session(&arena_id, TeamMode::Solo).await {
            Ok(session) => info!(arena = %arena_id, session_id = %session.id(), "Arena open"),
            Err(err) => warn!(arena = %arena_id, error = %err, "Could not open arena"),
        }
    }

    // Spawn reconciliation
    let reconcile_task = tokio::spawn(reconcile_loop(
        registry.clone(),
        config.reconcile_interval,
        stop_tx.subscribe(),
    ));

    // Build router
    let state = AppState::new(config.clone(), registry.clone());
    let router = build_router(state);

    // Start server
    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Admin API listening on {}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Sessions first, while the main tick still runs their last hand-offs
    registry.shutdown_all();
    let report = workers.shutdown(config.workers.drain_timeout).await;

    let _ = stop_tx.send(true);
    for result in futures::future::join_all([main_tick_task, reconcile_task]).await {
        if let Err(err) = result {
            error!(error = %err, "Background task failed during shutdown");
        }
    }

    info!(
        drained = report.drained,
        cancelled = report.cancelled,
        "Server shutdown complete"
    );
    Ok(())
}

/// Periodically end duplicate sessions until `stop` flips
async fn reconcile_loop(
    registry: Arc<SessionRegistry>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                registry.reconcile_orphans();
            }
            _ = stop.changed() => break,
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
