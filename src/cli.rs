use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::coordination::read_pid;
use crate::error::{GuardError, Result};
use crate::monitoring::git_tree::{GitCli, GitTreeMonitor};
use crate::monitoring::health::{HealthCheckService, HealthSnapshot};
use crate::monitoring::providers::{default_providers, PidSource};
use crate::persistence::read_json_value;
use crate::process::{is_alive, CommandRunner, TokioCommandRunner};
use crate::supervisor::heartbeat::{evaluate_heartbeat, HeartbeatVerdict};

#[derive(Parser, Debug)]
#[command(name = "hookguard")]
#[command(version)]
#[command(about = "Single-instance supervisor and health monitor for repository hook workers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Repository root to guard
    #[arg(short, long, env = "HOOKGUARD_REPO", default_value = ".")]
    pub repo: PathBuf,

    /// Config file path (defaults to <repo>/.hookguard.toml)
    #[arg(short, long, env = "HOOKGUARD_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the supervisor (default)
    Run,
    /// Show heartbeat, last health snapshot and dirty-tree marker
    Status,
    /// Evaluate the heartbeat once; exits non-zero when unhealthy
    CheckHeartbeat,
    /// Collect a health snapshot now and print it as JSON
    Health,
    /// Signal the running supervisor to stop
    Stop {
        /// Send SIGKILL instead of SIGTERM
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run)
    }

    /// Repository root, canonicalized when possible
    pub fn repo_root(&self) -> PathBuf {
        std::fs::canonicalize(&self.repo).unwrap_or_else(|_| self.repo.clone())
    }

    pub fn load_config(&self) -> Result<AppConfig> {
        Ok(AppConfig::load_from(&self.repo_root(), self.config.as_deref())?)
    }
}

/// Heartbeat verdict against the configured max age and workers
pub fn check_heartbeat(config: &AppConfig) -> HeartbeatVerdict {
    let expected: Vec<String> = config.children.iter().map(|c| c.name.clone()).collect();
    evaluate_heartbeat(
        &config.heartbeat_file(),
        Duration::from_millis(config.heartbeat.max_age_ms),
        &expected,
        chrono::Utc::now(),
    )
}

/// Everything the supervisor has persisted, in one JSON document
pub fn status_report(config: &AppConfig) -> Value {
    let supervisor_pid = read_pid(&config.pid_file());
    let running = supervisor_pid
        .and_then(|pid| u32::try_from(pid).ok())
        .map(is_alive)
        .unwrap_or(false);
    let verdict = check_heartbeat(config);

    json!({
        "supervisor": {
            "pid": supervisor_pid,
            "running": running,
            "lockHeld": config.lock_dir().exists(),
        },
        "heartbeat": {
            "verdict": verdict.reason(),
            "healthy": verdict.is_healthy(),
            "record": read_json_value(&config.heartbeat_file()),
        },
        "health": read_json_value(&config.health_file()),
        "dirtyTree": read_json_value(&config.dirty_tree_file()),
    })
}

pub fn show_status(config: &AppConfig) -> Result<()> {
    let report = status_report(config);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// One-shot collection outside the daemon; worker pids come from the heartbeat file
pub async fn collect_health(config: &AppConfig) -> HealthSnapshot {
    let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
    let git = Arc::new(GitCli::new(
        config.repo_root.clone(),
        Duration::from_millis(config.git_tree.command_timeout_ms),
        runner,
    ));
    let git_tree = Arc::new(GitTreeMonitor::new(git, &config.git_tree, config.dirty_tree_file()));
    let providers = default_providers(config, git_tree, PidSource::HeartbeatFile(config.heartbeat_file()));
    let service = HealthCheckService::new(&config.health, providers, config.health_file());
    service.collect("cli").await
}

/// Signal the pid recorded in the PID file. Returns false when no live supervisor was found.
pub fn stop_supervisor(config: &AppConfig, force: bool) -> Result<bool> {
    let pid_file = config.pid_file();
    let Some(pid) = read_pid(&pid_file) else {
        println!("No PID file at {}", pid_file.display());
        return Ok(false);
    };
    if pid <= 0 || !is_alive(pid as u32) {
        println!("Supervisor (pid {}) is not running", pid);
        return Ok(false);
    }
    send_stop_signal(pid, force)?;
    println!("Sent {} to supervisor (pid {})", if force { "SIGKILL" } else { "SIGTERM" }, pid);
    Ok(true)
}

#[cfg(unix)]
fn send_stop_signal(pid: i32, force: bool) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    kill(Pid::from_raw(pid), signal)?;
    Ok(())
}

#[cfg(not(unix))]
fn send_stop_signal(_pid: i32, _force: bool) -> Result<()> {
    Err(GuardError::Internal("stop is only supported on unix".to_string()))
}

/// Map a config validation failure into an error
pub fn validate(config: &AppConfig) -> Result<()> {
    config
        .validate()
        .map_err(|errors| GuardError::InvalidConfig(errors.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::try_parse_from(["hookguard"]).unwrap();
        assert_eq!(cli.command(), Commands::Run);
        assert_eq!(cli.repo, PathBuf::from("."));
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["hookguard", "--repo", "/tmp/x", "stop", "--force"]).unwrap();
        assert_eq!(cli.command(), Commands::Stop { force: true });
        assert_eq!(cli.repo, PathBuf::from("/tmp/x"));

        let cli = Cli::try_parse_from(["hookguard", "check-heartbeat"]).unwrap();
        assert_eq!(cli.command(), Commands::CheckHeartbeat);
    }

    #[test]
    fn test_status_report_without_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            repo_root: dir.path().to_path_buf(),
            ..AppConfig::default()
        };

        let report = status_report(&config);
        assert_eq!(report["supervisor"]["running"], false);
        assert_eq!(report["supervisor"]["lockHeld"], false);
        assert_eq!(report["heartbeat"]["verdict"], "missing");
        assert!(report["health"].is_null());
    }

    #[test]
    fn test_stop_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            repo_root: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        assert!(!stop_supervisor(&config, false).unwrap());
    }

    #[tokio::test]
    async fn test_one_shot_health_outside_git_repo() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            repo_root: dir.path().to_path_buf(),
            ..AppConfig::default()
        };

        let snapshot = collect_health(&config).await;
        assert_eq!(snapshot.reason, "cli");
        // no evidence file, no heartbeat, no workers
        assert_eq!(snapshot.status, crate::monitoring::HealthStatus::Error);
        assert!(config.health_file().exists());
    }
}
