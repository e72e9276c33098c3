//! Execution resources owned by the host: the main tick and the worker pool

pub mod main_tick;
pub mod worker_pool;

pub use main_tick::{HandoffError, MainTick, MainTickHandle};
pub use worker_pool::{PoolSizing, ShutdownReport, WorkerPool};
