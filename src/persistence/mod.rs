//! Persistence Layer for Supervisor State
//!
//! Everything the supervisor persists is small JSON on local disk:
//! - State files (heartbeat, health snapshot, dirty-tree marker) written atomically
//! - An append-only JSONL audit trail for notifications and auto-refresh attempts

pub mod audit;
pub mod state_file;

pub use audit::{AuditEntry, AuditLog};
pub use state_file::{read_json, read_json_value, write_json_atomic};
