use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Repository checkout the supervisor guards; relative paths resolve against it
    pub repo_root: PathBuf,
    pub paths: PathsConfig,
    pub children: Vec<ChildConfig>,
    pub restart: RestartConfig,
    pub heartbeat: HeartbeatConfig,
    pub git_tree: GitTreeConfig,
    pub evidence: EvidenceConfig,
    pub health: HealthConfig,
    pub recovery: RecoveryConfig,
    pub notifications: NotificationConfig,
    pub logging: LoggingConfig,
}

/// Well-known file locations, relative to `repo_root` unless absolute
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub tmp_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub pid_file: PathBuf,
    pub heartbeat_file: PathBuf,
    pub health_file: PathBuf,
    pub dirty_tree_file: PathBuf,
    pub evidence_file: PathBuf,
    pub usage_log: PathBuf,
    pub audit_log: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            tmp_dir: PathBuf::from(".audit_tmp"),
            reports_dir: PathBuf::from(".audit-reports"),
            lock_dir: PathBuf::from(".audit_tmp/guard-supervisor.lock"),
            pid_file: PathBuf::from(".guard-supervisor.pid"),
            heartbeat_file: PathBuf::from(".audit_tmp/guard-heartbeat.json"),
            health_file: PathBuf::from(".audit_tmp/health-status.json"),
            dirty_tree_file: PathBuf::from(".audit_tmp/dirty-tree-state.json"),
            evidence_file: PathBuf::from(".AI_EVIDENCE.json"),
            usage_log: PathBuf::from(".audit_tmp/token-usage.jsonl"),
            audit_log: PathBuf::from(".audit-reports/guard-audit.jsonl"),
        }
    }
}

/// One supervised worker
#[derive(Debug, Clone, Deserialize)]
pub struct ChildConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; defaults to the repository root
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Environment overrides as `KEY=VALUE` (kept as strings since config keys are case-folded)
    #[serde(default)]
    pub env: Vec<String>,
}

impl ChildConfig {
    /// Parsed `KEY=VALUE` overrides; malformed entries are skipped
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| {
                let (key, value) = entry.split_once('=')?;
                if key.is_empty() {
                    return None;
                }
                Some((key.to_string(), value.to_string()))
            })
            .collect()
    }
}

fn default_children() -> Vec<ChildConfig> {
    vec![
        ChildConfig {
            name: "guard".to_string(),
            command: "node".to_string(),
            args: vec!["scripts/hooks-system/bin/watch-hooks.js".to_string()],
            cwd: None,
            env: vec!["HOOK_GUARD_DIRTY_TREE_DISABLED=true".to_string()],
        },
        ChildConfig {
            name: "tokenMonitor".to_string(),
            command: "bash".to_string(),
            args: vec![
                "scripts/hooks-system/infrastructure/watchdog/token-monitor-loop.sh".to_string(),
            ],
            cwd: None,
            env: Vec::new(),
        },
    ]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Quiet period after the last trigger before children restart
    pub debounce_ms: u64,
    /// Grace period between SIGTERM and SIGKILL
    pub force_kill_ms: u64,
    /// Files whose modification restarts the children
    pub watch_targets: Vec<PathBuf>,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1500,
            force_kill_ms: 3000,
            watch_targets: [
                "scripts/hooks-system/bin/watch-hooks.js",
                "scripts/hooks-system/bin/guard-supervisor.js",
                "scripts/hooks-system/bin/start-guards.sh",
                "scripts/hooks-system/infrastructure/watchdog/token-monitor-loop.sh",
                "scripts/hooks-system/infrastructure/watchdog/token-monitor.js",
                "scripts/hooks-system/infrastructure/watchdog/token-tracker.sh",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// How often the supervisor writes the heartbeat file
    pub interval_ms: u64,
    /// Age beyond which a heartbeat is stale; 0 disables the staleness check
    pub max_age_ms: u64,
    /// How often the staleness checker reads the file
    pub check_interval_ms: u64,
    pub restart_cooldown_ms: u64,
    /// Verdicts that trigger a restart (`*` matches all)
    pub restart_reasons: Vec<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            max_age_ms: 60_000,
            check_interval_ms: 5_000,
            restart_cooldown_ms: 60_000,
            restart_reasons: ["missing", "stale", "invalid", "degraded"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitTreeConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub staged_limit: usize,
    pub unstaged_limit: usize,
    pub total_limit: usize,
    pub warning_threshold: usize,
    pub reminder_ms: u64,
    pub warning_reminder_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for GitTreeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
            staged_limit: 10,
            unstaged_limit: 15,
            total_limit: 20,
            warning_threshold: 12,
            reminder_ms: 300_000,
            warning_reminder_ms: 600_000,
            command_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    pub poll_interval_ms: u64,
    pub stale_threshold_ms: u64,
    pub reminder_interval_ms: u64,
    /// Recent user activity inside this window suppresses stale alerts
    pub inactivity_grace_ms: u64,
    /// Repository-relative directories whose changes are not user activity
    pub activity_ignore: Vec<PathBuf>,
    pub auto_refresh: bool,
    pub auto_refresh_cooldown_ms: u64,
    /// Candidate refresh scripts; the first one that exists is used
    pub refresh_commands: Vec<PathBuf>,
    pub refresh_args: Vec<String>,
    pub refresh_timeout_ms: u64,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            stale_threshold_ms: 60_000,
            reminder_interval_ms: 60_000,
            inactivity_grace_ms: 120_000,
            activity_ignore: vec![PathBuf::from(".git"), PathBuf::from("node_modules")],
            auto_refresh: false,
            auto_refresh_cooldown_ms: 180_000,
            refresh_commands: vec![
                PathBuf::from("scripts/hooks-system/bin/update-evidence.sh"),
                PathBuf::from("bin/update-evidence.sh"),
            ],
            refresh_args: ["--auto", "--platforms", "1,2,3,4"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            refresh_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub history_limit: usize,
    pub provider_timeout_ms: u64,
    pub evidence_warn_age_ms: u64,
    pub evidence_error_age_ms: u64,
    pub git_warn_unique: usize,
    pub git_error_unique: usize,
    pub usage_warn_percent: f64,
    pub usage_error_percent: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            history_limit: 20,
            provider_timeout_ms: 10_000,
            evidence_warn_age_ms: 5 * 60_000,
            evidence_error_age_ms: 15 * 60_000,
            git_warn_unique: 12,
            git_error_unique: 24,
            usage_warn_percent: 85.0,
            usage_error_percent: 95.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Cooldown after the first attempt; doubles with each further attempt
    pub cooldown_ms: u64,
    pub max_backoff_ms: u64,
    /// Random spread applied to each cooldown, as a fraction (0.25 = +/-25%)
    pub backoff_jitter: f64,
    /// Attempts per key before recovery gives up until the key is cleared
    pub max_attempts: u32,
    /// Optional external command run when a worker exits unexpectedly
    pub restart_command: Option<String>,
    pub restart_command_timeout_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 30_000,
            max_backoff_ms: 480_000,
            backoff_jitter: 0.25,
            max_attempts: 5,
            restart_command: None,
            restart_command_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub default_cooldown_ms: u64,
    /// Per-type cooldown overrides, merged over the built-in table
    pub cooldowns: HashMap<String, u64>,
    pub dedupe_window_ms: u64,
    pub max_queue: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub desktop: bool,
    pub webhook_url: Option<String>,
    pub delivery_timeout_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_cooldown_ms: 60_000,
            cooldowns: HashMap::new(),
            dedupe_window_ms: 5_000,
            max_queue: 100,
            max_retries: 2,
            retry_delay_ms: 1_000,
            desktop: false,
            webhook_url: None,
            delivery_timeout_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    /// Also write a daily-rolling log file into the reports directory
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: true,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            paths: PathsConfig::default(),
            children: default_children(),
            restart: RestartConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            git_tree: GitTreeConfig::default(),
            evidence: EvidenceConfig::default(),
            health: HealthConfig::default(),
            recovery: RecoveryConfig::default(),
            notifications: NotificationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration for the repository at `repo_root`
    pub fn load(repo_root: &Path) -> Result<Self, ConfigError> {
        Self::load_from(repo_root, None)
    }

    /// Load configuration from defaults, an optional TOML file and `HOOKGUARD__*` variables
    pub fn load_from(repo_root: &Path, config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let file = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_root.join(".hookguard.toml"));

        let builder = Config::builder()
            .set_default("repo_root", repo_root.to_string_lossy().to_string())?
            .set_default("logging.level", "info")?
            // Optional file; missing is fine
            .add_source(File::from(file).required(false))
            // Override with environment variables (HOOKGUARD__HEARTBEAT__MAX_AGE_MS, etc.)
            .add_source(
                Environment::with_prefix("HOOKGUARD")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("heartbeat.restart_reasons")
                    .with_list_parse_key("restart.watch_targets")
                    .with_list_parse_key("evidence.refresh_commands")
                    .with_list_parse_key("evidence.activity_ignore"),
            );

        builder.build()?.try_deserialize()
    }

    /// Resolve a configured path against the repository root
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo_root.join(path)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let mut seen = std::collections::HashSet::new();
        for child in &self.children {
            if child.name.trim().is_empty() {
                errors.push("children[].name must not be empty".to_string());
            }
            if child.command.trim().is_empty() {
                errors.push(format!("children.{}.command must not be empty", child.name));
            }
            if !seen.insert(child.name.as_str()) {
                errors.push(format!("duplicate child name: {}", child.name));
            }
        }

        if self.restart.force_kill_ms == 0 {
            errors.push("restart.force_kill_ms must be > 0".to_string());
        }

        let git = &self.git_tree;
        if git.warning_threshold > git.total_limit {
            errors.push(format!(
                "git_tree.warning_threshold ({}) must not exceed git_tree.total_limit ({})",
                git.warning_threshold, git.total_limit
            ));
        }

        let health = &self.health;
        if health.history_limit == 0 {
            errors.push("health.history_limit must be > 0".to_string());
        }
        if health.evidence_warn_age_ms > health.evidence_error_age_ms {
            errors.push("health.evidence_warn_age_ms must not exceed evidence_error_age_ms".to_string());
        }
        if health.usage_warn_percent > health.usage_error_percent {
            errors.push("health.usage_warn_percent must not exceed usage_error_percent".to_string());
        }

        if !(0.0..=1.0).contains(&self.recovery.backoff_jitter) {
            errors.push("recovery.backoff_jitter must be between 0 and 1".to_string());
        }

        if self.notifications.max_queue == 0 {
            errors.push("notifications.max_queue must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Child cwd, defaulting to the repository root
    pub fn child_cwd(&self, child: &ChildConfig) -> PathBuf {
        match &child.cwd {
            Some(cwd) => self.resolve(cwd),
            None => self.repo_root.clone(),
        }
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.resolve(&self.paths.lock_dir)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.resolve(&self.paths.pid_file)
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.resolve(&self.paths.heartbeat_file)
    }

    pub fn health_file(&self) -> PathBuf {
        self.resolve(&self.paths.health_file)
    }

    pub fn dirty_tree_file(&self) -> PathBuf {
        self.resolve(&self.paths.dirty_tree_file)
    }

    pub fn evidence_file(&self) -> PathBuf {
        self.resolve(&self.paths.evidence_file)
    }

    pub fn usage_log(&self) -> PathBuf {
        self.resolve(&self.paths.usage_log)
    }

    pub fn audit_log(&self) -> PathBuf {
        self.resolve(&self.paths.audit_log)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.resolve(&self.paths.reports_dir)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.resolve(&self.paths.tmp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.children.len(), 2);
        assert_eq!(cfg.heartbeat.max_age_ms, 60_000);
        assert_eq!(cfg.git_tree.staged_limit, 10);
        assert_eq!(cfg.restart.debounce_ms, 1500);
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("guard.toml");
        std::fs::write(
            &file,
            r#"
[heartbeat]
max_age_ms = 5000
restart_reasons = ["stale"]

[[children]]
name = "worker"
command = "sleep"
args = ["30"]
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(dir.path(), Some(&file)).unwrap();
        assert_eq!(cfg.heartbeat.max_age_ms, 5000);
        assert_eq!(cfg.heartbeat.restart_reasons, vec!["stale".to_string()]);
        // untouched sections keep their defaults
        assert_eq!(cfg.heartbeat.interval_ms, 15_000);
        assert_eq!(cfg.children.len(), 1);
        assert_eq!(cfg.children[0].name, "worker");
        assert_eq!(cfg.repo_root, dir.path());
    }

    #[test]
    fn test_child_env_pairs() {
        let child = ChildConfig {
            name: "w".to_string(),
            command: "true".to_string(),
            args: vec![],
            cwd: None,
            env: vec!["A=1".to_string(), "broken".to_string(), "B=x=y".to_string()],
        };
        assert_eq!(
            child.env_pairs(),
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
    }

    #[test]
    fn test_validate_rejects_duplicate_children() {
        let mut cfg = AppConfig::default();
        cfg.children.push(cfg.children[0].clone());
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("duplicate child name")));
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let cfg = AppConfig {
            repo_root: PathBuf::from("/repo"),
            ..AppConfig::default()
        };
        assert_eq!(cfg.heartbeat_file(), PathBuf::from("/repo/.audit_tmp/guard-heartbeat.json"));
        assert_eq!(cfg.resolve(Path::new("/abs/file")), PathBuf::from("/abs/file"));
    }
}
