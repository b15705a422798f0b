//! Built-in health providers
//!
//! Evidence freshness, git tree dirtiness, heartbeat file, usage log and per-worker
//! liveness.

use crate::config::AppConfig;
use crate::error::Result;
use crate::monitoring::evidence::{age_of, read_evidence_timestamp};
use crate::monitoring::git_tree::GitTreeMonitor;
use crate::monitoring::health::{HealthCheckProvider, HealthCheckResult, HealthStatus};
use crate::persistence::read_json_value;
use crate::process::{is_alive, ChildProcessManager};
use crate::supervisor::heartbeat::{evaluate_heartbeat, HeartbeatVerdict};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub struct EvidenceFreshnessProvider {
    path: PathBuf,
    warn_age: Duration,
    error_age: Duration,
}

impl EvidenceFreshnessProvider {
    pub fn new(path: impl Into<PathBuf>, warn_age: Duration, error_age: Duration) -> Self {
        Self {
            path: path.into(),
            warn_age,
            error_age,
        }
    }
}

#[async_trait]
impl HealthCheckProvider for EvidenceFreshnessProvider {
    fn name(&self) -> &str {
        "evidence"
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        if !self.path.exists() {
            return Ok(HealthCheckResult::error(
                "evidence",
                format!("missing {}", self.path.display()),
            ));
        }
        let Some(timestamp) = read_evidence_timestamp(&self.path) else {
            return Ok(HealthCheckResult::error("evidence", "invalid timestamp"));
        };
        let age = age_of(timestamp, Utc::now());
        let status = if age > self.error_age {
            HealthStatus::Error
        } else if age > self.warn_age {
            HealthStatus::Warn
        } else {
            HealthStatus::Ok
        };
        Ok(HealthCheckResult::new(
            "evidence",
            status,
            json!({ "ageMs": age.as_millis() as u64, "timestamp": timestamp }),
        ))
    }
}

pub struct GitTreeProvider {
    monitor: Arc<GitTreeMonitor>,
    warn_unique: usize,
    error_unique: usize,
}

impl GitTreeProvider {
    pub fn new(monitor: Arc<GitTreeMonitor>, warn_unique: usize, error_unique: usize) -> Self {
        Self {
            monitor,
            warn_unique,
            error_unique,
        }
    }
}

#[async_trait]
impl HealthCheckProvider for GitTreeProvider {
    fn name(&self) -> &str {
        "gitTree"
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let state = self.monitor.current_state().await?;
        let status = if state.unique > self.error_unique {
            HealthStatus::Error
        } else if state.unique > self.warn_unique {
            HealthStatus::Warn
        } else {
            HealthStatus::Ok
        };
        Ok(HealthCheckResult::new("gitTree", status, serde_json::to_value(&state)?))
    }
}

pub struct HeartbeatFileProvider {
    path: PathBuf,
    max_age: Duration,
}

impl HeartbeatFileProvider {
    pub fn new(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            path: path.into(),
            max_age,
        }
    }
}

#[async_trait]
impl HealthCheckProvider for HeartbeatFileProvider {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let verdict = evaluate_heartbeat(&self.path, self.max_age, &[], Utc::now());
        let status = match &verdict {
            HeartbeatVerdict::Healthy | HeartbeatVerdict::Disabled => HealthStatus::Ok,
            HeartbeatVerdict::Stale { .. }
            | HeartbeatVerdict::Status(_)
            | HeartbeatVerdict::Degraded { .. } => HealthStatus::Warn,
            HeartbeatVerdict::Missing | HeartbeatVerdict::Invalid | HeartbeatVerdict::Error(_) => {
                HealthStatus::Error
            }
        };
        let mut details = read_json_value(&self.path).unwrap_or_else(|| json!({}));
        if let Value::Object(map) = &mut details {
            map.insert("verdict".to_string(), Value::String(verdict.reason().to_string()));
        }
        Ok(HealthCheckResult::new("heartbeat", status, details))
    }
}

/// Last line of the token usage log
pub struct UsageLogProvider {
    path: PathBuf,
    warn_percent: f64,
    error_percent: f64,
}

impl UsageLogProvider {
    pub fn new(path: impl Into<PathBuf>, warn_percent: f64, error_percent: f64) -> Self {
        Self {
            path: path.into(),
            warn_percent,
            error_percent,
        }
    }
}

/// `percentUsed`, or `tokensUsed / maxTokens` as a percentage
pub fn usage_percent(entry: &Value) -> Option<f64> {
    if let Some(percent) = entry.get("percentUsed").and_then(Value::as_f64) {
        return Some(percent).filter(|p| p.is_finite());
    }
    let used = entry.get("tokensUsed").and_then(Value::as_f64)?;
    let max = entry.get("maxTokens").and_then(Value::as_f64)?;
    Some(used / max * 100.0).filter(|p| p.is_finite())
}

#[async_trait]
impl HealthCheckProvider for UsageLogProvider {
    fn name(&self) -> &str {
        "tokens"
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HealthCheckResult::warn("tokens", "no usage log found"));
            }
            Err(e) => return Err(e.into()),
        };
        let Some(last) = raw.lines().rev().find(|line| !line.trim().is_empty()) else {
            return Ok(HealthCheckResult::warn("tokens", "empty token usage log"));
        };
        let entry: Value = serde_json::from_str(last)?;
        let Some(percent) = usage_percent(&entry) else {
            return Ok(HealthCheckResult::warn("tokens", "token usage percent unavailable"));
        };
        let status = if percent >= self.error_percent {
            HealthStatus::Error
        } else if percent >= self.warn_percent {
            HealthStatus::Warn
        } else {
            HealthStatus::Ok
        };
        Ok(HealthCheckResult::new("tokens", status, json!({ "percent": percent })))
    }
}

/// Where a worker's pid comes from
#[derive(Clone)]
pub enum PidSource {
    /// The in-process manager
    Manager(ChildProcessManager),
    /// The supervisor's heartbeat file, for one-shot checks from outside the daemon
    HeartbeatFile(PathBuf),
}

impl PidSource {
    fn resolve(&self, name: &str) -> Option<u32> {
        match self {
            PidSource::Manager(children) => children.describe(name).pid,
            PidSource::HeartbeatFile(path) => read_json_value(path)?
                .get(name)?
                .get("pid")?
                .as_u64()
                .and_then(|pid| u32::try_from(pid).ok()),
        }
    }
}

pub struct ProcessProvider {
    name: String,
    source: PidSource,
}

impl ProcessProvider {
    pub fn new(name: impl Into<String>, source: PidSource) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }
}

#[async_trait]
impl HealthCheckProvider for ProcessProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let Some(pid) = self.source.resolve(&self.name) else {
            return Ok(HealthCheckResult::error(&self.name, "process not running"));
        };
        if is_alive(pid) {
            Ok(HealthCheckResult::ok(&self.name, json!({ "pid": pid })))
        } else {
            Ok(HealthCheckResult::new(
                &self.name,
                HealthStatus::Error,
                json!({ "message": "process unreachable", "pid": pid }),
            ))
        }
    }
}

/// The standard provider set, one process provider per configured worker
pub fn default_providers(
    config: &AppConfig,
    git_tree: Arc<GitTreeMonitor>,
    pids: PidSource,
) -> Vec<Arc<dyn HealthCheckProvider>> {
    let health = &config.health;
    let mut providers: Vec<Arc<dyn HealthCheckProvider>> = vec![
        Arc::new(EvidenceFreshnessProvider::new(
            config.evidence_file(),
            Duration::from_millis(health.evidence_warn_age_ms),
            Duration::from_millis(health.evidence_error_age_ms),
        )),
        Arc::new(GitTreeProvider::new(git_tree, health.git_warn_unique, health.git_error_unique)),
        Arc::new(HeartbeatFileProvider::new(
            config.heartbeat_file(),
            Duration::from_millis(config.heartbeat.max_age_ms),
        )),
        Arc::new(UsageLogProvider::new(
            config.usage_log(),
            health.usage_warn_percent,
            health.usage_error_percent,
        )),
    ];
    for child in &config.children {
        providers.push(Arc::new(ProcessProvider::new(child.name.clone(), pids.clone())));
    }
    providers
}
