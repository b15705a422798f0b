//! Git Working-Tree Monitor
//!
//! Counts staged, unstaged and untracked paths and compares them with two tiers of
//! thresholds. Critical and warning reminders keep separate cooldowns; dropping under
//! every threshold resets both and sends a single "clean" notice.

use crate::config::GitTreeConfig;
use crate::coordination::PeriodicTask;
use crate::error::{GuardError, Result};
use crate::persistence::write_json_atomic;
use crate::process::{CommandRunner, CommandSpec};
use crate::supervisor::notification::{NotificationCenter, NotificationEvent, NotificationLevel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The three name listings the tree state is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitQuery {
    Staged,
    Unstaged,
    Untracked,
}

impl GitQuery {
    pub fn args(&self) -> &'static [&'static str] {
        match self {
            GitQuery::Staged => &["diff", "--cached", "--name-only"],
            GitQuery::Unstaged => &["diff", "--name-only"],
            GitQuery::Untracked => &["ls-files", "--others", "--exclude-standard"],
        }
    }
}

/// Source of path listings; the real one shells out to git
#[async_trait]
pub trait GitStatusSource: Send + Sync {
    async fn list(&self, query: GitQuery) -> Result<Vec<String>>;
}

/// `git` CLI in the repository root
pub struct GitCli {
    repo_root: PathBuf,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl GitCli {
    pub fn new(repo_root: impl Into<PathBuf>, timeout: Duration, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            repo_root: repo_root.into(),
            timeout,
            runner,
        }
    }
}

#[async_trait]
impl GitStatusSource for GitCli {
    async fn list(&self, query: GitQuery) -> Result<Vec<String>> {
        let spec = CommandSpec::new("git", self.timeout)
            .args(query.args().iter().copied())
            .cwd(&self.repo_root);
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(GuardError::CommandFailed(format!(
                "{} exited with {:?}: {}",
                spec.display(),
                output.code,
                output.stderr.trim()
            )));
        }
        Ok(output.lines().map(str::to_string).collect())
    }
}

/// Dirtiness counts at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitTreeState {
    pub staged: usize,
    pub unstaged: usize,
    pub untracked: usize,
    /// Distinct paths across all three listings
    pub unique: usize,
    pub timestamp: DateTime<Utc>,
}

impl GitTreeState {
    pub fn from_listings(staged: &[String], unstaged: &[String], untracked: &[String]) -> Self {
        let unique: HashSet<&str> = staged
            .iter()
            .chain(unstaged)
            .chain(untracked)
            .map(String::as_str)
            .collect();
        Self {
            staged: staged.len(),
            unstaged: unstaged.len(),
            untracked: untracked.len(),
            unique: unique.len(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitTreeLimits {
    pub staged_limit: usize,
    pub unstaged_limit: usize,
    pub total_limit: usize,
    pub warning_threshold: usize,
}

impl GitTreeLimits {
    pub fn from_config(config: &GitTreeConfig) -> Self {
        Self {
            staged_limit: config.staged_limit,
            unstaged_limit: config.unstaged_limit,
            total_limit: config.total_limit,
            warning_threshold: config.warning_threshold,
        }
    }

    pub fn is_beyond_limit(&self, state: &GitTreeState) -> bool {
        state.unique > self.total_limit
            || state.staged > self.staged_limit
            || state.unstaged > self.unstaged_limit
    }

    pub fn is_warning(&self, state: &GitTreeState) -> bool {
        state.unique > self.warning_threshold
    }

    pub fn classify(&self, state: &GitTreeState) -> DirtyLevel {
        if self.is_beyond_limit(state) {
            DirtyLevel::Critical
        } else if self.is_warning(state) {
            DirtyLevel::Warning
        } else {
            DirtyLevel::Clean
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirtyLevel {
    Clean,
    Warning,
    Critical,
}

/// Marker file other tools read instead of recomputing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtyTreeMarker {
    pub timestamp: DateTime<Utc>,
    pub last_notification: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub thresholds: MarkerThresholds,
    pub level: DirtyLevel,
    pub state: GitTreeState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerThresholds {
    pub staged: usize,
    pub unstaged: usize,
    pub total: usize,
}

#[derive(Default)]
struct MonitorState {
    cached: Option<(Instant, GitTreeState)>,
    last_critical: Option<Instant>,
    last_warning: Option<Instant>,
    last_notification: Option<DateTime<Utc>>,
    active: bool,
}

pub struct GitTreeMonitor {
    source: Arc<dyn GitStatusSource>,
    limits: GitTreeLimits,
    interval: Duration,
    reminder: Duration,
    warning_reminder: Duration,
    marker_path: PathBuf,
    notifier: Option<Arc<NotificationCenter>>,
    state: Mutex<MonitorState>,
    task: Mutex<Option<PeriodicTask>>,
}

impl GitTreeMonitor {
    pub fn new(source: Arc<dyn GitStatusSource>, config: &GitTreeConfig, marker_path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            limits: GitTreeLimits::from_config(config),
            interval: if config.enabled {
                Duration::from_millis(config.interval_ms)
            } else {
                Duration::ZERO
            },
            reminder: Duration::from_millis(config.reminder_ms),
            warning_reminder: Duration::from_millis(config.warning_reminder_ms),
            marker_path: marker_path.into(),
            notifier: None,
            state: Mutex::new(MonitorState::default()),
            task: Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<NotificationCenter>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn limits(&self) -> GitTreeLimits {
        self.limits
    }

    /// Whether the last check saw a tree at or above the warning tier
    pub fn is_active(&self) -> bool {
        lock(&self.state).active
    }

    /// Current tree state, reusing the last computation inside the check interval
    pub async fn current_state(&self) -> Result<GitTreeState> {
        let cached = lock(&self.state).cached.clone();
        if let Some((at, state)) = cached {
            if !self.interval.is_zero() && at.elapsed() < self.interval {
                return Ok(state);
            }
        }
        self.refresh().await
    }

    /// Query git now and replace the cached state
    pub async fn refresh(&self) -> Result<GitTreeState> {
        let staged = self.source.list(GitQuery::Staged).await?;
        let unstaged = self.source.list(GitQuery::Unstaged).await?;
        let untracked = self.source.list(GitQuery::Untracked).await?;
        let state = GitTreeState::from_listings(&staged, &unstaged, &untracked);
        lock(&self.state).cached = Some((Instant::now(), state.clone()));
        Ok(state)
    }

    /// Evaluate the tree, notify on threshold tiers, persist the marker
    pub async fn check(&self) -> Result<DirtyLevel> {
        let tree = self.current_state().await?;
        let level = self.limits.classify(&tree);
        let now = Instant::now();

        let event = {
            let mut state = lock(&self.state);
            match level {
                DirtyLevel::Critical => {
                    state.active = true;
                    if due(state.last_critical, now, self.reminder) {
                        state.last_critical = Some(now);
                        Some(NotificationEvent::new(
                            "dirty_tree_critical",
                            NotificationLevel::Error,
                            format!(
                                "Working tree beyond limits: {} staged, {} unstaged, {} untracked ({} files). Commit or stash.",
                                tree.staged, tree.unstaged, tree.untracked, tree.unique
                            ),
                        ))
                    } else {
                        None
                    }
                }
                DirtyLevel::Warning => {
                    state.active = true;
                    if due(state.last_warning, now, self.warning_reminder) {
                        state.last_warning = Some(now);
                        Some(NotificationEvent::new(
                            "dirty_tree_warning",
                            NotificationLevel::Warn,
                            format!(
                                "Working tree getting dirty: {} files changed (limit {}).",
                                tree.unique, self.limits.total_limit
                            ),
                        ))
                    } else {
                        None
                    }
                }
                DirtyLevel::Clean => {
                    let was_active = std::mem::replace(&mut state.active, false);
                    state.last_critical = None;
                    state.last_warning = None;
                    if was_active {
                        Some(NotificationEvent::new(
                            "dirty_tree_clean",
                            NotificationLevel::Success,
                            "Working tree back under limits.",
                        ))
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(event) = event {
            info!(level = ?level, unique = tree.unique, "dirty tree notification");
            let event = event.with_metadata(json!({
                "staged": tree.staged,
                "unstaged": tree.unstaged,
                "untracked": tree.untracked,
                "unique": tree.unique,
            }));
            lock(&self.state).last_notification = Some(Utc::now());
            if let Some(notifier) = &self.notifier {
                notifier.enqueue(event);
            }
        } else {
            debug!(level = ?level, unique = tree.unique, "dirty tree checked");
        }

        self.persist(&tree, level);
        Ok(level)
    }

    fn persist(&self, tree: &GitTreeState, level: DirtyLevel) {
        let marker = {
            let state = lock(&self.state);
            DirtyTreeMarker {
                timestamp: Utc::now(),
                last_notification: state.last_notification,
                is_active: state.active,
                thresholds: MarkerThresholds {
                    staged: self.limits.staged_limit,
                    unstaged: self.limits.unstaged_limit,
                    total: self.limits.total_limit,
                },
                level,
                state: tree.clone(),
            }
        };
        if let Err(e) = write_json_atomic(&self.marker_path, &marker) {
            warn!(path = %self.marker_path.display(), error = %e, "failed to persist dirty-tree marker");
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.interval.is_zero() {
            info!("git tree monitor disabled");
            return;
        }
        let monitor = self.clone();
        let task = PeriodicTask::start("git-tree-monitor", self.interval, true, move || {
            let monitor = monitor.clone();
            async move { monitor.check().await.map(|_| ()) }
        });
        lock(&self.task).replace(task);
    }

    pub async fn stop(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

fn due(last: Option<Instant>, now: Instant, every: Duration) -> bool {
    match last {
        Some(last) => now.duration_since(last) >= every,
        None => true,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
