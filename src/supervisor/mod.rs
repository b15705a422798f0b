//! Supervisor Layer for Worker Supervision and Recovery
//!
//! This module provides the long-running supervision infrastructure:
//! - Heartbeat writer and staleness monitor
//! - Throttled notification center with pluggable delivery channels
//! - Auto-recovery engine with per-key cooldowns
//! - The supervisor itself, wiring everything together

pub mod channels;
pub mod daemon;
pub mod heartbeat;
pub mod notification;
pub mod recovery;

pub use channels::{DesktopChannel, LogChannel, NotificationChannel, WebhookChannel};
pub use daemon::{RestartHandle, Supervisor, SupervisorEvent, SupervisorState};
pub use heartbeat::{
    evaluate_heartbeat, HeartbeatCheck, HeartbeatMonitor, HeartbeatRecord, HeartbeatStatus,
    HeartbeatVerdict, HeartbeatWriter,
};
pub use notification::{Delivery, NotificationCenter, NotificationEvent, NotificationLevel, NotificationStats};
pub use recovery::{
    AutoRecoveryManager, CommandStrategy, RecoveryOutcome, RecoveryRequest, RecoveryStrategy,
    RestartTrigger, SupervisorRestartStrategy,
};
