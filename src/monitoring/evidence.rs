//! Evidence artifact freshness
//!
//! The evidence file is produced by external tooling; we only read its `timestamp` and,
//! when allowed, run the refresh script. A stale artifact is not reported while the user
//! was active inside the grace window.

use crate::config::EvidenceConfig;
use crate::coordination::PeriodicTask;
use crate::error::Result;
use crate::persistence::{read_json_value, AuditLog};
use crate::process::{CommandRunner, CommandSpec};
use crate::supervisor::notification::{NotificationCenter, NotificationEvent, NotificationLevel};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of one freshness evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvidenceVerdict {
    /// No file, or no parseable timestamp
    Absent,
    Fresh { age: Duration },
    /// Stale, but the user was recently active
    Suppressed { age: Duration },
    /// Stale and alerted
    Stale { age: Duration },
    /// Stale, already alerted inside the reminder interval
    ReminderCooling { age: Duration },
}

impl EvidenceVerdict {
    pub fn age(&self) -> Option<Duration> {
        match self {
            EvidenceVerdict::Absent => None,
            EvidenceVerdict::Fresh { age }
            | EvidenceVerdict::Suppressed { age }
            | EvidenceVerdict::Stale { age }
            | EvidenceVerdict::ReminderCooling { age } => Some(*age),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Disabled,
    NoCommand,
    InFlight,
    CoolingDown { remaining: Duration },
    /// Evidence already fresh, nothing to do
    Fresh,
    Succeeded,
    Failed(String),
}

#[derive(Default)]
struct EvidenceState {
    last_stale_alert: Option<Instant>,
    last_activity: Option<Instant>,
    last_refresh: Option<Instant>,
}

pub struct EvidenceManager {
    evidence_path: PathBuf,
    repo_root: PathBuf,
    poll_interval: Duration,
    stale_threshold: Duration,
    reminder_interval: Duration,
    inactivity_grace: Duration,
    auto_refresh: bool,
    auto_refresh_cooldown: Duration,
    refresh_commands: Vec<PathBuf>,
    refresh_args: Vec<String>,
    refresh_timeout: Duration,
    runner: Arc<dyn CommandRunner>,
    audit: Arc<AuditLog>,
    notifier: Option<Arc<NotificationCenter>>,
    refresh_in_flight: AtomicBool,
    state: Mutex<EvidenceState>,
    task: Mutex<Option<PeriodicTask>>,
}

impl EvidenceManager {
    pub fn new(
        config: &EvidenceConfig,
        evidence_path: impl Into<PathBuf>,
        repo_root: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            evidence_path: evidence_path.into(),
            repo_root: repo_root.into(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stale_threshold: Duration::from_millis(config.stale_threshold_ms),
            reminder_interval: Duration::from_millis(config.reminder_interval_ms),
            inactivity_grace: Duration::from_millis(config.inactivity_grace_ms),
            auto_refresh: config.auto_refresh,
            auto_refresh_cooldown: Duration::from_millis(config.auto_refresh_cooldown_ms),
            refresh_commands: config.refresh_commands.clone(),
            refresh_args: config.refresh_args.clone(),
            refresh_timeout: Duration::from_millis(config.refresh_timeout_ms),
            runner,
            audit,
            notifier: None,
            refresh_in_flight: AtomicBool::new(false),
            state: Mutex::new(EvidenceState::default()),
            task: Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<NotificationCenter>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn path(&self) -> &Path {
        &self.evidence_path
    }

    /// Note that the user did something; stale alerts pause for the grace window
    pub fn record_activity(&self) {
        lock(&self.state).last_activity = Some(Instant::now());
    }

    pub fn read_timestamp(&self) -> Option<DateTime<Utc>> {
        read_evidence_timestamp(&self.evidence_path)
    }

    /// Age of the artifact, `None` when absent
    pub fn age(&self) -> Option<Duration> {
        self.read_timestamp().map(|ts| age_of(ts, Utc::now()))
    }

    fn is_stale(&self, age: Duration) -> bool {
        age > self.stale_threshold
    }

    fn recently_active(&self, now: Instant) -> bool {
        match lock(&self.state).last_activity {
            Some(at) => now.duration_since(at) < self.inactivity_grace,
            None => false,
        }
    }

    /// Evaluate freshness, alert on staleness and kick off an auto-refresh.
    /// `notify_fresh` sends the "back within SLA" message after an earlier alert.
    pub async fn evaluate(&self, source: &str, notify_fresh: bool) -> EvidenceVerdict {
        let Some(age) = self.age() else {
            debug!(path = %self.evidence_path.display(), "evidence absent or unparseable");
            return EvidenceVerdict::Absent;
        };
        let now = Instant::now();

        if !self.is_stale(age) {
            if notify_fresh && lock(&self.state).last_stale_alert.take().is_some() {
                info!(age_secs = age.as_secs(), "evidence back within SLA");
                self.notify(NotificationEvent::new(
                    "evidence_ok",
                    NotificationLevel::Info,
                    "Evidence updated; back within SLA.",
                ));
            }
            return EvidenceVerdict::Fresh { age };
        }

        if self.recently_active(now) {
            debug!(age_secs = age.as_secs(), "evidence stale but user recently active");
            return EvidenceVerdict::Suppressed { age };
        }

        {
            let mut state = lock(&self.state);
            if let Some(last) = state.last_stale_alert {
                if now.duration_since(last) < self.reminder_interval {
                    return EvidenceVerdict::ReminderCooling { age };
                }
            }
            state.last_stale_alert = Some(now);
        }

        let age_secs = age.as_secs();
        warn!(age_secs, source, "evidence stale");
        self.notify(
            NotificationEvent::new(
                "evidence_stale",
                NotificationLevel::Warn,
                format!("Evidence has been stale for {}s (source: {}).", age_secs, source),
            )
            .with_metadata(json!({ "ageSec": age_secs, "source": source })),
        );
        self.audit.record("evidence_stale", json!({ "ageSec": age_secs, "source": source }));

        let outcome = self.attempt_auto_refresh("stale").await;
        debug!(outcome = ?outcome, "auto-refresh after stale alert");
        EvidenceVerdict::Stale { age }
    }

    /// Polling tick
    pub async fn check(&self) -> Result<()> {
        self.evaluate("polling", true).await;
        Ok(())
    }

    /// Refresh absent or stale evidence regardless of recent activity. Used after restarts.
    pub async fn ensure_fresh(&self, reason: &str) -> RefreshOutcome {
        match self.age() {
            Some(age) if !self.is_stale(age) => RefreshOutcome::Fresh,
            _ => self.attempt_auto_refresh(reason).await,
        }
    }

    /// First refresh script candidate that exists
    pub fn locate_refresh_command(&self) -> Option<PathBuf> {
        self.refresh_commands
            .iter()
            .map(|candidate| {
                if candidate.is_absolute() {
                    candidate.clone()
                } else {
                    self.repo_root.join(candidate)
                }
            })
            .find(|candidate| candidate.is_file())
    }

    /// Run the refresh script once, guarded by single-flight and a cooldown
    pub async fn attempt_auto_refresh(&self, reason: &str) -> RefreshOutcome {
        if !self.auto_refresh {
            return RefreshOutcome::Disabled;
        }
        let Some(script) = self.locate_refresh_command() else {
            debug!("no evidence refresh script found");
            return RefreshOutcome::NoCommand;
        };
        if let Some(age) = self.age() {
            if !self.is_stale(age) {
                return RefreshOutcome::Fresh;
            }
        }
        if self.refresh_in_flight.load(Ordering::SeqCst) {
            return RefreshOutcome::InFlight;
        }

        let now = Instant::now();
        {
            let mut state = lock(&self.state);
            if let Some(last) = state.last_refresh {
                let elapsed = now.duration_since(last);
                if elapsed < self.auto_refresh_cooldown {
                    return RefreshOutcome::CoolingDown {
                        remaining: self.auto_refresh_cooldown - elapsed,
                    };
                }
            }
            if self.refresh_in_flight.swap(true, Ordering::SeqCst) {
                return RefreshOutcome::InFlight;
            }
            state.last_refresh = Some(now);
        }

        let spec = CommandSpec::new("bash", self.refresh_timeout)
            .args(std::iter::once(script.display().to_string()).chain(self.refresh_args.iter().cloned()))
            .cwd(&self.repo_root)
            .env("HOOKGUARD_REFRESH_REASON", reason);
        info!(command = %spec.display(), reason, "running evidence auto-refresh");

        let outcome = match self.runner.run(&spec).await {
            Ok(output) if output.success() => RefreshOutcome::Succeeded,
            Ok(output) => RefreshOutcome::Failed(format!(
                "exit {:?}: {}",
                output.code,
                output.stderr.trim()
            )),
            Err(e) => RefreshOutcome::Failed(e.to_string()),
        };
        self.refresh_in_flight.store(false, Ordering::SeqCst);

        let (status, error) = match &outcome {
            RefreshOutcome::Succeeded => ("success", Value::Null),
            RefreshOutcome::Failed(reason) => {
                warn!(error = %reason, "evidence auto-refresh failed");
                ("failure", Value::String(reason.clone()))
            }
            _ => ("skipped", Value::Null),
        };
        self.audit.record(
            "evidence_refresh",
            json!({
                "reason": reason,
                "command": spec.display(),
                "status": status,
                "error": error,
            }),
        );
        outcome
    }

    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let task = PeriodicTask::start("evidence-monitor", self.poll_interval, false, move || {
            let manager = manager.clone();
            async move { manager.check().await }
        });
        lock(&self.task).replace(task);
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

/// `timestamp` of the evidence file: RFC 3339 string or epoch milliseconds
pub fn read_evidence_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    let value = read_json_value(path)?;
    match value.get("timestamp")? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Age relative to `now`; timestamps in the future count as zero
pub fn age_of(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - timestamp).to_std().unwrap_or(Duration::ZERO)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;
    use crate::error::GuardError;
    use crate::process::CommandOutput;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FakeRunner {
        calls: AtomicUsize,
        delay: Duration,
        exit_code: i32,
    }

    impl FakeRunner {
        fn new(exit_code: i32, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                exit_code,
            })
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(spec.program, "bash");
            tokio::time::sleep(self.delay).await;
            if self.exit_code < 0 {
                return Err(GuardError::CommandTimeout {
                    command: spec.display(),
                    timeout_ms: spec.timeout.as_millis() as u64,
                });
            }
            Ok(CommandOutput {
                code: Some(self.exit_code),
                ..CommandOutput::default()
            })
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        audit: Arc<AuditLog>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")));
            Self { dir, audit }
        }

        fn evidence_path(&self) -> PathBuf {
            self.dir.path().join(".AI_EVIDENCE.json")
        }

        fn write_evidence(&self, age: chrono::Duration) {
            let ts = Utc::now() - age;
            std::fs::write(self.evidence_path(), json!({ "timestamp": ts.to_rfc3339() }).to_string()).unwrap();
        }

        fn install_script(&self) {
            let script = self.dir.path().join("bin/update-evidence.sh");
            std::fs::create_dir_all(script.parent().unwrap()).unwrap();
            std::fs::write(script, "#!/bin/sh\n").unwrap();
        }

        fn manager(&self, config: &EvidenceConfig, runner: Arc<dyn CommandRunner>) -> EvidenceManager {
            EvidenceManager::new(config, self.evidence_path(), self.dir.path(), runner, self.audit.clone())
        }
    }

    fn auto_refresh_config() -> EvidenceConfig {
        EvidenceConfig {
            auto_refresh: true,
            ..EvidenceConfig::default()
        }
    }

    #[test]
    fn test_timestamp_formats() {
        let fx = Fixture::new();
        let path = fx.evidence_path();
        assert!(read_evidence_timestamp(&path).is_none());

        std::fs::write(&path, r#"{"timestamp":"2025-01-01T00:00:00Z"}"#).unwrap();
        assert_eq!(read_evidence_timestamp(&path).unwrap().to_rfc3339(), "2025-01-01T00:00:00+00:00");

        std::fs::write(&path, r#"{"timestamp":1735689600000}"#).unwrap();
        assert!(read_evidence_timestamp(&path).is_some());

        std::fs::write(&path, r#"{"timestamp":"yesterday"}"#).unwrap();
        assert!(read_evidence_timestamp(&path).is_none());

        std::fs::write(&path, "not json").unwrap();
        assert!(read_evidence_timestamp(&path).is_none());
    }

    #[tokio::test]
    async fn test_verdicts() {
        let fx = Fixture::new();
        let manager = fx.manager(&EvidenceConfig::default(), FakeRunner::new(0, Duration::ZERO));

        assert_eq!(manager.evaluate("test", false).await, EvidenceVerdict::Absent);

        fx.write_evidence(chrono::Duration::seconds(10));
        assert!(matches!(manager.evaluate("test", false).await, EvidenceVerdict::Fresh { .. }));

        fx.write_evidence(chrono::Duration::seconds(90));
        assert!(matches!(manager.evaluate("test", false).await, EvidenceVerdict::Stale { .. }));
        assert!(matches!(
            manager.evaluate("test", false).await,
            EvidenceVerdict::ReminderCooling { .. }
        ));

        let entries = fx.audit.read_all();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "evidence_stale");
    }

    #[tokio::test]
    async fn test_recent_activity_suppresses_alert() {
        let fx = Fixture::new();
        let manager = fx.manager(&EvidenceConfig::default(), FakeRunner::new(0, Duration::ZERO));
        fx.write_evidence(chrono::Duration::seconds(300));

        manager.record_activity();
        assert!(matches!(manager.evaluate("test", false).await, EvidenceVerdict::Suppressed { .. }));
        assert!(fx.audit.read_all().is_empty());
    }

    #[tokio::test]
    async fn test_back_within_sla_notified_once() {
        let fx = Fixture::new();
        let notifier = Arc::new(NotificationCenter::new(
            &NotificationConfig::default(),
            vec![],
            fx.audit.clone(),
        ));
        let mut events = notifier.subscribe();
        let manager = fx
            .manager(&EvidenceConfig::default(), FakeRunner::new(0, Duration::ZERO))
            .with_notifier(notifier.clone());

        fx.write_evidence(chrono::Duration::seconds(120));
        manager.check().await.unwrap();
        fx.write_evidence(chrono::Duration::seconds(1));
        manager.check().await.unwrap();
        manager.check().await.unwrap();

        assert_eq!(events.try_recv().unwrap().kind, "evidence_stale");
        assert_eq!(events.try_recv().unwrap().kind, "evidence_ok");
        assert!(events.try_recv().is_err());
        notifier.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_refresh_gating() {
        let fx = Fixture::new();
        let runner = FakeRunner::new(0, Duration::ZERO);

        let disabled = fx.manager(&EvidenceConfig::default(), runner.clone());
        assert_eq!(disabled.attempt_auto_refresh("manual").await, RefreshOutcome::Disabled);

        let manager = fx.manager(&auto_refresh_config(), runner.clone());
        assert_eq!(manager.attempt_auto_refresh("manual").await, RefreshOutcome::NoCommand);

        fx.install_script();
        fx.write_evidence(chrono::Duration::seconds(5));
        assert_eq!(manager.attempt_auto_refresh("manual").await, RefreshOutcome::Fresh);

        fx.write_evidence(chrono::Duration::seconds(600));
        assert_eq!(manager.attempt_auto_refresh("manual").await, RefreshOutcome::Succeeded);
        assert!(matches!(
            manager.attempt_auto_refresh("manual").await,
            RefreshOutcome::CoolingDown { .. }
        ));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

        let entries = fx.audit.read_all();
        assert_eq!(entries.last().unwrap().event, "evidence_refresh");
        assert_eq!(entries.last().unwrap().data["status"], "success");
    }

    #[tokio::test]
    async fn test_failed_refresh_still_records_cooldown() {
        let fx = Fixture::new();
        fx.install_script();
        let runner = FakeRunner::new(-1, Duration::ZERO);
        let manager = fx.manager(&auto_refresh_config(), runner.clone());

        assert!(matches!(
            manager.ensure_fresh("restart").await,
            RefreshOutcome::Failed(_)
        ));
        assert!(matches!(
            manager.ensure_fresh("restart").await,
            RefreshOutcome::CoolingDown { .. }
        ));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.audit.read_all()[0].data["status"], "failure");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        let fx = Fixture::new();
        fx.install_script();
        let runner = FakeRunner::new(0, Duration::from_secs(10));
        let manager = Arc::new(fx.manager(&auto_refresh_config(), runner.clone()));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.attempt_auto_refresh("first").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.attempt_auto_refresh("second").await, RefreshOutcome::InFlight);
        assert_eq!(first.await.unwrap(), RefreshOutcome::Succeeded);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_fresh_ignores_activity_grace() {
        let fx = Fixture::new();
        fx.install_script();
        fx.write_evidence(chrono::Duration::seconds(600));
        let runner = FakeRunner::new(0, Duration::ZERO);
        let manager = fx.manager(&auto_refresh_config(), runner.clone());

        manager.record_activity();
        assert_eq!(manager.ensure_fresh("restart").await, RefreshOutcome::Succeeded);
    }
}
