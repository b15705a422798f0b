//! Coordination Layer for the Supervisor Process
//!
//! This module provides the process-wide coordination primitives:
//! - Directory lock and PID file for single-instance enforcement
//! - Idempotent shutdown with signal and panic routing
//! - Periodic task loops with per-tick error containment

pub mod lock;
pub mod shutdown;
pub mod ticker;

pub use lock::{read_pid, LockManager};
pub use shutdown::{
    install_panic_hook, install_signal_handlers, ShutdownCoordinator, ShutdownSignal,
    ShutdownToken,
};
pub use ticker::{in_contained_tick, PeriodicTask};
