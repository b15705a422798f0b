//! Heartbeat production and staleness detection
//!
//! The supervisor writes a heartbeat file on a fixed interval. The monitor reads it back
//! (possibly from another process), classifies it, and decides whether the condition is
//! worth a restart. Notifications are transition based: a throttled reminder while the
//! heartbeat is unhealthy and one "recovered" message when it comes back.

use crate::config::HeartbeatConfig;
use crate::coordination::PeriodicTask;
use crate::error::Result;
use crate::persistence::write_json_atomic;
use crate::process::{ChildProcessManager, ChildStatus};
use crate::supervisor::notification::{NotificationCenter, NotificationEvent, NotificationLevel};
use crate::supervisor::recovery::{AutoRecoveryManager, RecoveryOutcome, RecoveryRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Overall status written by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Healthy,
    Degraded,
}

/// On-disk heartbeat document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    pub timestamp: DateTime<Utc>,
    pub supervisor_pid: u32,
    pub status: HeartbeatStatus,
    /// One `{running, pid}` entry per child, keyed by child name
    #[serde(flatten)]
    pub children: BTreeMap<String, ChildStatus>,
}

impl HeartbeatRecord {
    pub fn from_children(children: Vec<(String, ChildStatus)>) -> Self {
        let status = if children.iter().all(|(_, s)| s.running) {
            HeartbeatStatus::Healthy
        } else {
            HeartbeatStatus::Degraded
        };
        Self {
            timestamp: Utc::now(),
            supervisor_pid: std::process::id(),
            status,
            children: children.into_iter().collect(),
        }
    }
}

/// Periodically persists the current child table as a heartbeat
pub struct HeartbeatWriter {
    path: PathBuf,
    children: ChildProcessManager,
    task: Mutex<Option<PeriodicTask>>,
}

impl HeartbeatWriter {
    pub fn new(path: impl Into<PathBuf>, children: ChildProcessManager) -> Self {
        Self {
            path: path.into(),
            children,
            task: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build and persist a heartbeat now
    pub fn emit(&self) -> Result<HeartbeatRecord> {
        let record = HeartbeatRecord::from_children(self.children.describe_all());
        write_json_atomic(&self.path, &record)?;
        debug!(status = ?record.status, "heartbeat written");
        Ok(record)
    }

    pub fn start(self: &Arc<Self>, interval: Duration) {
        let writer = self.clone();
        let task = PeriodicTask::start("heartbeat-writer", interval, true, move || {
            let writer = writer.clone();
            async move { writer.emit().map(|_| ()) }
        });
        if let Some(previous) = lock(&self.task).replace(task) {
            drop(previous);
        }
    }

    pub async fn stop(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

/// Classification of the latest heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    Healthy,
    /// Staleness checking is switched off
    Disabled,
    Missing,
    /// The timestamp is absent or unparseable
    Invalid,
    Stale { age: Duration },
    /// Non-healthy value of the record's own `status` field
    Status(String),
    /// Listed children are not running
    Degraded { children: Vec<String> },
    /// Unreadable or unparseable file
    Error(String),
}

impl HeartbeatVerdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HeartbeatVerdict::Healthy | HeartbeatVerdict::Disabled)
    }

    /// Short reason used in restart allow-lists and recovery reasons
    pub fn reason(&self) -> &str {
        match self {
            HeartbeatVerdict::Healthy => "healthy",
            HeartbeatVerdict::Disabled => "disabled",
            HeartbeatVerdict::Missing => "missing",
            HeartbeatVerdict::Invalid => "invalid",
            HeartbeatVerdict::Stale { .. } => "stale",
            HeartbeatVerdict::Status(status) => status,
            HeartbeatVerdict::Degraded { .. } => "degraded",
            HeartbeatVerdict::Error(_) => "error",
        }
    }
}

/// Classify the heartbeat at `path` as of `now`
pub fn evaluate_heartbeat(
    path: &Path,
    max_age: Duration,
    expected_children: &[String],
    now: DateTime<Utc>,
) -> HeartbeatVerdict {
    if max_age.is_zero() {
        return HeartbeatVerdict::Disabled;
    }

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return HeartbeatVerdict::Missing,
        Err(e) => return HeartbeatVerdict::Error(e.to_string()),
    };
    if raw.trim().is_empty() {
        return HeartbeatVerdict::Missing;
    }
    let data: Value = match serde_json::from_str(&raw) {
        Ok(data) => data,
        Err(e) => return HeartbeatVerdict::Error(e.to_string()),
    };

    let Some(timestamp) = data
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
    else {
        return HeartbeatVerdict::Invalid;
    };

    let age = now
        .signed_duration_since(timestamp.with_timezone(&Utc))
        .to_std()
        .unwrap_or(Duration::ZERO);
    if age > max_age {
        return HeartbeatVerdict::Stale { age };
    }

    let status = data
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase();
    if !status.is_empty() && status != "healthy" {
        return HeartbeatVerdict::Status(status);
    }

    let down: Vec<String> = expected_children
        .iter()
        .filter(|name| {
            !data
                .get(name.as_str())
                .and_then(|child| child.get("running"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if !down.is_empty() {
        return HeartbeatVerdict::Degraded { children: down };
    }

    HeartbeatVerdict::Healthy
}

/// Result of one monitor tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatCheck {
    pub verdict: HeartbeatVerdict,
    pub restart_requested: bool,
}

#[derive(Debug, Default)]
struct MonitorState {
    last_healthy: Option<bool>,
    last_restart: Option<Instant>,
}

/// Staleness checker with restart gating
pub struct HeartbeatMonitor {
    path: PathBuf,
    max_age: Duration,
    expected_children: Vec<String>,
    restart_reasons: HashSet<String>,
    restart_cooldown: Duration,
    state: Mutex<MonitorState>,
    notifier: Option<Arc<NotificationCenter>>,
    recovery: Option<Arc<AutoRecoveryManager>>,
    task: Mutex<Option<PeriodicTask>>,
}

impl HeartbeatMonitor {
    pub fn new(path: impl Into<PathBuf>, config: &HeartbeatConfig, expected_children: Vec<String>) -> Self {
        Self {
            path: path.into(),
            max_age: Duration::from_millis(config.max_age_ms),
            expected_children,
            restart_reasons: config
                .restart_reasons
                .iter()
                .map(|r| r.trim().to_lowercase())
                .filter(|r| !r.is_empty())
                .collect(),
            restart_cooldown: Duration::from_millis(config.restart_cooldown_ms),
            state: Mutex::new(MonitorState::default()),
            notifier: None,
            recovery: None,
            task: Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<NotificationCenter>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_recovery(mut self, recovery: Arc<AutoRecoveryManager>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Whether `reason` is on the restart allow-list
    pub fn should_restart_for(&self, reason: &str) -> bool {
        self.restart_reasons.contains("*") || self.restart_reasons.contains(reason)
    }

    pub fn evaluate(&self) -> HeartbeatVerdict {
        evaluate_heartbeat(&self.path, self.max_age, &self.expected_children, Utc::now())
    }

    /// Evaluate once, notify on transitions, and request a restart when allowed
    pub async fn check(&self) -> HeartbeatCheck {
        let verdict = self.evaluate();

        if verdict.is_healthy() {
            let recovered = lock(&self.state).last_healthy.replace(true) == Some(false);
            if recovered {
                info!("heartbeat recovered");
                self.notify(
                    NotificationEvent::new("heartbeat_ok", NotificationLevel::Success, "Guard heartbeat recovered"),
                );
                if let Some(recovery) = &self.recovery {
                    recovery.clear("heartbeat");
                }
            }
            return HeartbeatCheck {
                verdict,
                restart_requested: false,
            };
        }

        let reason = verdict.reason().to_string();
        lock(&self.state).last_healthy = Some(false);
        warn!(reason = %reason, verdict = ?verdict, "heartbeat unhealthy");
        self.notify(
            NotificationEvent::new(
                "heartbeat_degraded",
                NotificationLevel::Warn,
                format!("Guard heartbeat {}", reason),
            )
            .with_reason(format!("heartbeat_degraded:{}", reason))
            .with_metadata(json!({ "reason": reason, "path": self.path.display().to_string() })),
        );

        if !self.should_restart_for(&reason) {
            debug!(reason = %reason, "heartbeat reason not in restart list");
            return HeartbeatCheck {
                verdict,
                restart_requested: false,
            };
        }

        let now = Instant::now();
        {
            let mut state = lock(&self.state);
            if let Some(last) = state.last_restart {
                if now.duration_since(last) < self.restart_cooldown {
                    info!(reason = %reason, "heartbeat restart suppressed (cooldown)");
                    return HeartbeatCheck {
                        verdict,
                        restart_requested: false,
                    };
                }
            }
            state.last_restart = Some(now);
        }

        let restart_requested = match &self.recovery {
            Some(recovery) => {
                let request = RecoveryRequest::new("heartbeat", format!("heartbeat-{}", reason))
                    .with_context(json!({ "verdict": format!("{:?}", verdict) }));
                matches!(recovery.recover(request).await, RecoveryOutcome::Executed { .. })
            }
            None => false,
        };
        HeartbeatCheck {
            verdict,
            restart_requested,
        }
    }

    pub fn start(self: &Arc<Self>, interval: Duration) {
        if self.max_age.is_zero() {
            info!("heartbeat staleness check disabled");
            return;
        }
        let monitor = self.clone();
        let task = PeriodicTask::start("heartbeat-monitor", interval, false, move || {
            let monitor = monitor.clone();
            async move {
                monitor.check().await;
                Ok(())
            }
        });
        if let Some(previous) = lock(&self.task).replace(task) {
            drop(previous);
        }
    }

    pub async fn stop(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    fn notify(&self, event: NotificationEvent) {
        if let Some(notifier) = &self.notifier {
            notifier.enqueue(event);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::persistence::read_json;
    use crate::process::ChildDescriptor;
    use crate::supervisor::recovery::{RestartTrigger, SupervisorRestartStrategy};
    use async_trait::async_trait;

    fn children() -> Vec<String> {
        vec!["guard".to_string(), "tokenMonitor".to_string()]
    }

    fn write_heartbeat(path: &Path, age_secs: i64, status: &str, guard_running: bool) {
        let ts = Utc::now() - chrono::Duration::seconds(age_secs);
        let doc = json!({
            "timestamp": ts.to_rfc3339(),
            "supervisorPid": 1,
            "status": status,
            "guard": { "running": guard_running, "pid": 10 },
            "tokenMonitor": { "running": true, "pid": 11 },
        });
        std::fs::write(path, doc.to_string()).unwrap();
    }

    #[test]
    fn test_staleness_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.json");
        let max_age = Duration::from_secs(60);

        write_heartbeat(&path, 61, "healthy", true);
        assert!(matches!(
            evaluate_heartbeat(&path, max_age, &children(), Utc::now()),
            HeartbeatVerdict::Stale { .. }
        ));

        write_heartbeat(&path, 59, "healthy", true);
        assert_eq!(
            evaluate_heartbeat(&path, max_age, &children(), Utc::now()),
            HeartbeatVerdict::Healthy
        );
    }

    #[test]
    fn test_verdicts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.json");
        let max_age = Duration::from_secs(60);
        let now = Utc::now();

        assert_eq!(evaluate_heartbeat(&path, Duration::ZERO, &children(), now), HeartbeatVerdict::Disabled);
        assert_eq!(evaluate_heartbeat(&path, max_age, &children(), now), HeartbeatVerdict::Missing);

        std::fs::write(&path, "").unwrap();
        assert_eq!(evaluate_heartbeat(&path, max_age, &children(), now), HeartbeatVerdict::Missing);

        std::fs::write(&path, "{broken").unwrap();
        assert!(matches!(
            evaluate_heartbeat(&path, max_age, &children(), now),
            HeartbeatVerdict::Error(_)
        ));

        std::fs::write(&path, r#"{"timestamp":"yesterday"}"#).unwrap();
        assert_eq!(evaluate_heartbeat(&path, max_age, &children(), now), HeartbeatVerdict::Invalid);

        write_heartbeat(&path, 1, "Degraded", true);
        let verdict = evaluate_heartbeat(&path, max_age, &children(), Utc::now());
        assert_eq!(verdict, HeartbeatVerdict::Status("degraded".to_string()));
        assert_eq!(verdict.reason(), "degraded");

        write_heartbeat(&path, 1, "healthy", false);
        assert_eq!(
            evaluate_heartbeat(&path, max_age, &children(), Utc::now()),
            HeartbeatVerdict::Degraded {
                children: vec!["guard".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_writer_persists_child_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tmp/hb.json");
        let manager = ChildProcessManager::new(
            vec![
                ChildDescriptor::new("guard", "sleep", dir.path()).with_args(["30"]),
                ChildDescriptor::new("tokenMonitor", "sleep", dir.path()).with_args(["30"]),
            ],
            Duration::from_secs(1),
        );
        let writer = HeartbeatWriter::new(&path, manager.clone());

        let record = writer.emit().unwrap();
        assert_eq!(record.status, HeartbeatStatus::Degraded);

        manager.start_all().await.unwrap();
        let record = writer.emit().unwrap();
        assert_eq!(record.status, HeartbeatStatus::Healthy);

        let raw: Value = read_json(&path).unwrap();
        assert_eq!(raw["status"], "healthy");
        assert_eq!(raw["supervisorPid"], std::process::id());
        assert_eq!(raw["guard"]["running"], true);
        assert!(raw["tokenMonitor"]["pid"].is_u64());
        assert_eq!(
            evaluate_heartbeat(&path, Duration::from_secs(60), &children(), Utc::now()),
            HeartbeatVerdict::Healthy
        );

        manager.stop_all().await;
    }

    struct CountingTrigger(Mutex<Vec<String>>);

    #[async_trait]
    impl RestartTrigger for CountingTrigger {
        async fn request_restart(&self, reason: &str) -> Result<()> {
            self.0.lock().unwrap().push(reason.to_string());
            Ok(())
        }
    }

    fn monitor_with_trigger(path: &Path, config: HeartbeatConfig) -> (HeartbeatMonitor, Arc<CountingTrigger>) {
        let trigger = Arc::new(CountingTrigger(Mutex::new(Vec::new())));
        let recovery = Arc::new(
            AutoRecoveryManager::new(Duration::from_secs(1), 100, None)
                .with_strategy(Arc::new(SupervisorRestartStrategy::new(trigger.clone()))),
        );
        let monitor = HeartbeatMonitor::new(path, &config, children()).with_recovery(recovery);
        (monitor, trigger)
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_gated_by_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.json");
        let (monitor, trigger) = monitor_with_trigger(&path, HeartbeatConfig::default());

        // missing file
        let first = monitor.check().await;
        assert_eq!(first.verdict, HeartbeatVerdict::Missing);
        assert!(first.restart_requested);

        let second = monitor.check().await;
        assert!(!second.restart_requested);

        tokio::time::advance(Duration::from_secs(61)).await;
        let third = monitor.check().await;
        assert!(third.restart_requested);

        assert_eq!(
            *trigger.0.lock().unwrap(),
            vec!["heartbeat-missing".to_string(), "heartbeat-missing".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reason_outside_allow_list_is_logged_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.json");
        let config = HeartbeatConfig {
            restart_reasons: vec!["stale".to_string()],
            ..HeartbeatConfig::default()
        };
        let (monitor, trigger) = monitor_with_trigger(&path, config);

        let check = monitor.check().await;
        assert_eq!(check.verdict, HeartbeatVerdict::Missing);
        assert!(!check.restart_requested);
        assert!(trigger.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_wildcard_allow_list() {
        let config = HeartbeatConfig {
            restart_reasons: vec!["*".to_string()],
            ..HeartbeatConfig::default()
        };
        let monitor = HeartbeatMonitor::new("/tmp/none.json", &config, children());
        assert!(monitor.should_restart_for("error"));
        assert!(monitor.should_restart_for("anything"));

        let none = HeartbeatConfig {
            restart_reasons: vec![],
            ..HeartbeatConfig::default()
        };
        let monitor = HeartbeatMonitor::new("/tmp/none.json", &none, children());
        assert!(!monitor.should_restart_for("stale"));
    }

    #[tokio::test]
    async fn test_recovered_notification_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.json");
        let audit = Arc::new(crate::persistence::AuditLog::new(dir.path().join("audit.jsonl")));
        let notifier = Arc::new(NotificationCenter::new(
            &crate::config::NotificationConfig::default(),
            vec![],
            audit,
        ));
        let mut events = notifier.subscribe();
        let config = HeartbeatConfig {
            restart_reasons: vec![],
            ..HeartbeatConfig::default()
        };
        let monitor = HeartbeatMonitor::new(&path, &config, children()).with_notifier(notifier.clone());

        monitor.check().await;
        write_heartbeat(&path, 1, "healthy", true);
        monitor.check().await;
        monitor.check().await;

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(kinds, vec!["heartbeat_degraded".to_string(), "heartbeat_ok".to_string()]);
        notifier.shutdown().await;
    }
}
