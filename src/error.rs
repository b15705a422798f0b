use thiserror::Error;

/// Main error type for the guard supervisor
#[derive(Error, Debug)]
pub enum GuardError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O and serialization errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // File watching errors
    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    // Process errors
    #[cfg(unix)]
    #[error("Signal delivery failed: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("Unknown child process: {0}")]
    UnknownChild(String),

    #[error("Failed to spawn {name}: {reason}")]
    Spawn { name: String, reason: String },

    #[error("Command timed out after {timeout_ms}ms: {command}")]
    CommandTimeout { command: String, timeout_ms: u64 },

    #[error("Command failed: {0}")]
    CommandFailed(String),

    // Coordination errors
    #[error("Another supervisor instance holds the lock at {0}")]
    AlreadyRunning(String),

    #[error("Shutdown in progress")]
    ShuttingDown,

    // Monitoring errors
    #[error("Health check {provider} failed: {reason}")]
    HealthCheck { provider: String, reason: String },

    #[error("Notification delivery failed on {channel}: {reason}")]
    Delivery { channel: String, reason: String },

    #[error("Recovery action {strategy} failed: {reason}")]
    Recovery { strategy: String, reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GuardError>;
