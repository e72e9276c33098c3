//! Application wiring shared by the host binary and the admin routes

pub mod state;

pub use state::AppState;
