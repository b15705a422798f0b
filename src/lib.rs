pub mod cli;
pub mod config;
pub mod coordination;
pub mod error;
pub mod logging;
pub mod monitoring;
pub mod persistence;
pub mod process;
pub mod supervisor;

pub use config::AppConfig;
pub use coordination::{LockManager, PeriodicTask, ShutdownCoordinator, ShutdownSignal};
pub use error::{GuardError, Result};
pub use monitoring::{
    EvidenceManager, GitTreeMonitor, GitTreeState, HealthCheckProvider, HealthCheckService,
    HealthSnapshot, HealthStatus,
};
pub use persistence::AuditLog;
pub use process::{ChildDescriptor, ChildProcessManager, CommandRunner, TokioCommandRunner};
pub use supervisor::{
    AutoRecoveryManager, HeartbeatMonitor, HeartbeatWriter, NotificationCenter, NotificationEvent,
    NotificationLevel, Supervisor, SupervisorEvent, SupervisorState,
};
