//! Survival Games session engine
//!
//! Runs concurrent match sessions on shared arenas: admission and capacity,
//! the phase timeline from countdown to deathmatch, elimination order and
//! ranking, and restoration of players' pre-join state. Everything
//! world-visible is delegated to collaborators supplied by the hosting server.

pub mod app;
pub mod arena;
pub mod collab;
pub mod config;
pub mod game;
pub mod http;
pub mod registry;
pub mod resilience;
pub mod runtime;
pub mod util;

pub use arena::{ArenaId, ArenaProvider, ArenaSnapshot, Location, StaticArenas};
pub use config::Config;
pub use game::{Session, SessionError, SessionState};
pub use registry::SessionRegistry;
