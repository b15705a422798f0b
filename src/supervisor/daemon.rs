//! Supervisor composition root
//!
//! Owns the lock, the worker processes and every monitor. Restart triggers from file
//! changes, worker crashes and recovery strategies all funnel into one queue that is
//! debounced and drained by a single task, so two restarts never overlap. A second,
//! recursive watch on the repository feeds user activity to the evidence manager.

use crate::config::AppConfig;
use crate::coordination::{LockManager, ShutdownCoordinator, ShutdownSignal};
use crate::error::{GuardError, Result};
use crate::monitoring::activity::ActivityFilter;
use crate::monitoring::evidence::EvidenceManager;
use crate::monitoring::git_tree::{GitCli, GitStatusSource, GitTreeMonitor};
use crate::monitoring::health::HealthCheckService;
use crate::monitoring::providers::{default_providers, PidSource};
use crate::persistence::AuditLog;
use crate::process::{ChildEvent, ChildProcessManager, CommandRunner, TokioCommandRunner};
use crate::supervisor::channels::{DesktopChannel, LogChannel, NotificationChannel, WebhookChannel};
use crate::supervisor::heartbeat::{HeartbeatMonitor, HeartbeatWriter};
use crate::supervisor::notification::NotificationCenter;
use crate::supervisor::recovery::{
    AutoRecoveryManager, CommandStrategy, RecoveryRequest, RestartTrigger, SupervisorRestartStrategy,
};
use async_trait::async_trait;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupervisorState {
    Starting,
    Running,
    Restarting,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    StateChanged(SupervisorState),
    ChildStarted { name: String, pid: u32 },
    ChildExited { name: String, code: Option<i32>, signal: Option<i32> },
    RestartScheduled { reason: String },
    RestartCompleted { reason: String },
    LockReleased,
    ShutdownCompleted { reason: String },
}

/// Cloneable entry point into the restart queue
#[derive(Clone)]
pub struct RestartHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl RestartHandle {
    /// Queue a restart. Returns false once the supervisor is gone.
    pub fn schedule(&self, reason: impl Into<String>) -> bool {
        self.tx.send(reason.into()).is_ok()
    }
}

#[async_trait]
impl RestartTrigger for RestartHandle {
    async fn request_restart(&self, reason: &str) -> Result<()> {
        if self.schedule(reason) {
            Ok(())
        } else {
            Err(GuardError::ShuttingDown)
        }
    }
}

pub struct Supervisor {
    config: AppConfig,
    lock: LockManager,
    children: ChildProcessManager,
    audit: Arc<AuditLog>,
    notifier: Arc<NotificationCenter>,
    recovery: Arc<AutoRecoveryManager>,
    heartbeat_writer: Arc<HeartbeatWriter>,
    heartbeat_monitor: Arc<HeartbeatMonitor>,
    git_tree: Arc<GitTreeMonitor>,
    evidence: Arc<EvidenceManager>,
    health: Arc<HealthCheckService>,
    shutdown: Arc<ShutdownCoordinator>,
    restart: RestartHandle,
    restart_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    state_tx: watch::Sender<SupervisorState>,
    events: broadcast::Sender<SupervisorEvent>,
    shutting_down: AtomicBool,
    stopped_tx: watch::Sender<bool>,
    watchers: Mutex<Vec<RecommendedWatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Wire every component from configuration. Must be called inside a tokio runtime.
    pub fn new(config: AppConfig, shutdown: Arc<ShutdownCoordinator>) -> Result<Arc<Self>> {
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
        let git: Arc<dyn GitStatusSource> = Arc::new(GitCli::new(
            config.repo_root.clone(),
            Duration::from_millis(config.git_tree.command_timeout_ms),
            runner.clone(),
        ));
        Self::with_parts(config, shutdown, runner, git)
    }

    /// Like [`Supervisor::new`] with injected command runner and git source
    pub fn with_parts(
        config: AppConfig,
        shutdown: Arc<ShutdownCoordinator>,
        runner: Arc<dyn CommandRunner>,
        git: Arc<dyn GitStatusSource>,
    ) -> Result<Arc<Self>> {
        if let Err(errors) = config.validate() {
            return Err(GuardError::InvalidConfig(errors.join("; ")));
        }

        let audit = Arc::new(AuditLog::new(config.audit_log()));
        let notifier = Arc::new(NotificationCenter::new(
            &config.notifications,
            build_channels(&config, runner.clone()),
            audit.clone(),
        ));

        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let restart = RestartHandle { tx: restart_tx };

        let mut recovery = AutoRecoveryManager::from_config(&config.recovery, Some(notifier.clone()))
            .with_strategy(Arc::new(SupervisorRestartStrategy::new(Arc::new(restart.clone()))));
        if let Some(strategy) = CommandStrategy::from_config(&config.recovery, &config.repo_root, runner.clone()) {
            recovery.register(Arc::new(strategy));
        }
        let recovery = Arc::new(recovery);

        let children = ChildProcessManager::from_config(&config);
        let heartbeat_writer = Arc::new(HeartbeatWriter::new(config.heartbeat_file(), children.clone()));
        let heartbeat_monitor = Arc::new(
            HeartbeatMonitor::new(config.heartbeat_file(), &config.heartbeat, children.names())
                .with_notifier(notifier.clone())
                .with_recovery(recovery.clone()),
        );
        let git_tree = Arc::new(
            GitTreeMonitor::new(git, &config.git_tree, config.dirty_tree_file()).with_notifier(notifier.clone()),
        );
        let evidence = Arc::new(
            EvidenceManager::new(
                &config.evidence,
                config.evidence_file(),
                config.repo_root.clone(),
                runner,
                audit.clone(),
            )
            .with_notifier(notifier.clone()),
        );
        let health = Arc::new(
            HealthCheckService::new(
                &config.health,
                default_providers(&config, git_tree.clone(), PidSource::Manager(children.clone())),
                config.health_file(),
            )
            .with_notifier(notifier.clone()),
        );

        let (state_tx, _) = watch::channel(SupervisorState::Starting);
        let (events, _) = broadcast::channel(128);
        let (stopped_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            lock: LockManager::new(config.lock_dir(), config.pid_file()),
            config,
            children,
            audit,
            notifier,
            recovery,
            heartbeat_writer,
            heartbeat_monitor,
            git_tree,
            evidence,
            health,
            shutdown,
            restart,
            restart_rx: Mutex::new(Some(restart_rx)),
            state_tx,
            events,
            shutting_down: AtomicBool::new(false),
            stopped_tx,
            watchers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn children(&self) -> &ChildProcessManager {
        &self.children
    }

    pub fn notifier(&self) -> &Arc<NotificationCenter> {
        &self.notifier
    }

    pub fn recovery(&self) -> &Arc<AutoRecoveryManager> {
        &self.recovery
    }

    pub fn evidence(&self) -> &Arc<EvidenceManager> {
        &self.evidence
    }

    pub fn health(&self) -> &Arc<HealthCheckService> {
        &self.health
    }

    pub fn restart_handle(&self) -> RestartHandle {
        self.restart.clone()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Take the lock, start workers and monitors, then serve until shutdown is requested.
    /// Returns [`GuardError::AlreadyRunning`] when another instance owns the lock.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.start().await?;

        let mut token = self.shutdown.token();
        token.cancelled().await;
        let reason = self
            .shutdown
            .signal()
            .map(|signal| signal.to_string())
            .unwrap_or_else(|| "requested".to_string());

        if !self.shutdown(&reason).await {
            self.wait_stopped().await;
        }
        Ok(())
    }

    /// Everything `run` does before it starts waiting
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.lock.acquire() {
            info!(lock = %self.lock.lock_dir().display(), "another guard supervisor instance is already running");
            return Err(GuardError::AlreadyRunning(self.lock.lock_dir().display().to_string()));
        }
        self.lock.write_pid_file();
        self.set_state(SupervisorState::Starting);

        self.spawn_child_listener();
        self.spawn_recovery_bridge();
        self.spawn_restart_loop();

        if let Err(e) = self.children.start_all().await {
            error!(error = %e, "failed to start workers");
            self.shutdown("startup-failure").await;
            return Err(e);
        }

        if let Err(e) = self.watch_targets() {
            warn!(error = %e, "file watching unavailable; change-triggered restarts disabled");
        }
        if let Err(e) = self.watch_activity() {
            warn!(error = %e, "activity watching unavailable; stale evidence alerts are never held back");
        }

        let heartbeat = &self.config.heartbeat;
        self.heartbeat_writer.start(Duration::from_millis(heartbeat.interval_ms));
        self.heartbeat_monitor.start(Duration::from_millis(heartbeat.check_interval_ms));
        self.git_tree.start();
        self.health.start("startup");
        self.evidence.start();

        self.set_state(SupervisorState::Running);
        self.audit.record("supervisor_started", json!({ "pid": std::process::id() }));
        info!(children = ?self.children.names(), "guard supervisor started");
        Ok(())
    }

    /// Stop everything exactly once. Returns false if shutdown was already under way.
    pub async fn shutdown(&self, reason: &str) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.request(ShutdownSignal::Requested(reason.to_string()));
        self.set_state(SupervisorState::ShuttingDown);
        info!(reason, "shutting down guard supervisor");

        let watchers: Vec<_> = lock(&self.watchers).drain(..).collect();
        if !watchers.is_empty() {
            debug!(count = watchers.len(), "file watchers closed");
        }
        drop(watchers);

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        self.git_tree.stop().await;
        self.heartbeat_writer.stop().await;
        self.heartbeat_monitor.stop().await;
        self.health.stop().await;
        self.evidence.stop().await;

        for name in self.children.names() {
            self.recovery.clear(&name);
        }
        self.recovery.clear("health");
        self.recovery.clear("heartbeat");

        self.audit.record("supervisor_shutdown", json!({ "reason": reason }));
        self.notifier.shutdown().await;
        self.children.stop_all().await;

        if self.lock.release() {
            self.emit(SupervisorEvent::LockReleased);
        }
        self.lock.remove_pid_file();

        info!(reason, "guard supervisor stopped");
        self.emit(SupervisorEvent::ShutdownCompleted {
            reason: reason.to_string(),
        });
        self.stopped_tx.send_replace(true);
        true
    }

    /// Resolve once a shutdown started elsewhere has finished
    pub async fn wait_stopped(&self) {
        let mut rx = self.stopped_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Stop all workers, start them again, then refresh heartbeat, evidence and health
    pub async fn restart_all(&self, reason: &str) {
        if self.is_shutting_down() {
            return;
        }
        self.set_state(SupervisorState::Restarting);
        info!(reason, "restarting guards");

        self.children.stop_all().await;
        if let Err(e) = self.children.start_all().await {
            error!(reason, error = %e, "restart failed to start workers");
        }
        if let Err(e) = self.heartbeat_writer.emit() {
            warn!(error = %e, "heartbeat write after restart failed");
        }

        let evidence = self.evidence.clone();
        let refresh = tokio::spawn(async move {
            let outcome = evidence.ensure_fresh("restart").await;
            debug!(outcome = ?outcome, "evidence refresh after restart");
        });
        let health = self.health.clone();
        let collect = tokio::spawn(async move {
            health.collect("restart").await;
        });
        self.track(refresh);
        self.track(collect);

        self.audit.record("supervisor_restart", json!({ "reason": reason }));
        if !self.is_shutting_down() {
            self.set_state(SupervisorState::Running);
        }
        self.emit(SupervisorEvent::RestartCompleted {
            reason: reason.to_string(),
        });
    }

    fn spawn_restart_loop(self: &Arc<Self>) {
        let Some(mut rx) = lock(&self.restart_rx).take() else {
            return;
        };
        let supervisor = self.clone();
        let debounce = Duration::from_millis(self.config.restart.debounce_ms);
        let handle = tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                info!(reason = %first, "scheduling restart");
                supervisor.emit(SupervisorEvent::RestartScheduled { reason: first.clone() });

                let mut reasons = vec![first];
                // quiet period after the last trigger
                loop {
                    match tokio::time::timeout(debounce, rx.recv()).await {
                        Ok(Some(reason)) => {
                            debug!(reason = %reason, "restart trigger coalesced");
                            if !reasons.contains(&reason) {
                                reasons.push(reason);
                            }
                        }
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }

                if supervisor.is_shutting_down() {
                    return;
                }
                supervisor.restart_all(&reasons.join(", ")).await;
            }
        });
        self.track(handle);
    }

    fn spawn_child_listener(self: &Arc<Self>) {
        let mut rx = self.children.subscribe();
        let supervisor = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "child event listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match event {
                    ChildEvent::Started { name, pid } => {
                        supervisor.recovery.clear(&name);
                        supervisor.emit(SupervisorEvent::ChildStarted { name, pid });
                    }
                    ChildEvent::Exited(exit) => {
                        supervisor.emit(SupervisorEvent::ChildExited {
                            name: exit.name.clone(),
                            code: exit.code,
                            signal: exit.signal,
                        });
                        if exit.requested || supervisor.is_shutting_down() {
                            continue;
                        }
                        warn!(name = %exit.name, code = ?exit.code, signal = ?exit.signal, "worker exited unexpectedly");
                        supervisor.restart.schedule(exit.restart_reason());

                        let recovery = supervisor.recovery.clone();
                        let request = RecoveryRequest::new(exit.name.clone(), format!("child-exit:{}", exit.name))
                            .with_context(json!({ "code": exit.code, "signal": exit.signal }));
                        supervisor.track(tokio::spawn(async move {
                            recovery.recover(request).await;
                        }));
                    }
                }
            }
        });
        self.track(handle);
    }

    /// Health errors are offered to recovery; a clean collection clears it
    fn spawn_recovery_bridge(self: &Arc<Self>) {
        let mut rx = self.notifier.subscribe();
        let supervisor = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "recovery bridge lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match event.kind.as_str() {
                    "health_check_error" => {
                        let reason = event
                            .metadata
                            .get("reason")
                            .and_then(|r| r.as_str())
                            .unwrap_or("unknown")
                            .to_string();
                        let request = RecoveryRequest::new("health", format!("health-error:{}", reason))
                            .with_context(event.metadata.clone());
                        let recovery = supervisor.recovery.clone();
                        supervisor.track(tokio::spawn(async move {
                            recovery.recover(request).await;
                        }));
                    }
                    "health_check_info" => supervisor.recovery.clear("health"),
                    _ => {}
                }
            }
        });
        self.track(handle);
    }

    /// Watch each target's parent directory and schedule a restart when a target changes
    fn watch_targets(self: &Arc<Self>) -> Result<()> {
        let mut directories: HashMap<PathBuf, Vec<PathBuf>> = HashMap::new();
        for target in &self.config.restart.watch_targets {
            let absolute = self.config.resolve(target);
            if !absolute.exists() {
                warn!(target = %target.display(), "watch target missing; auto-restart will ignore it");
                continue;
            }
            if let Some(dir) = absolute.parent() {
                directories.entry(dir.to_path_buf()).or_default().push(absolute.clone());
            }
        }
        if directories.is_empty() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => warn!(error = %e, "file watch error"),
        })?;
        for dir in directories.keys() {
            if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                warn!(dir = %dir.display(), error = %e, "cannot watch directory");
            }
        }
        lock(&self.watchers).push(watcher);

        let targets: Vec<PathBuf> = directories.into_values().flatten().collect();
        let repo_root = self.config.repo_root.clone();
        let restart = self.restart.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(kind) = change_kind(&event.kind) else {
                    continue;
                };
                for path in &event.paths {
                    if targets.iter().any(|t| same_file(t, path)) {
                        let rel = path.strip_prefix(&repo_root).unwrap_or(path);
                        restart.schedule(format!("{}:{}", rel.display(), kind));
                    }
                }
            }
        });
        self.track(handle);
        Ok(())
    }

    /// Recursive watch on the repository; edits outside guard-owned paths count as activity
    fn watch_activity(self: &Arc<Self>) -> Result<()> {
        if self.config.evidence.inactivity_grace_ms == 0 {
            return Ok(());
        }
        let filter = ActivityFilter::from_config(&self.config);

        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => debug!(error = %e, "activity watch error"),
        })?;
        watcher.watch(filter.root(), RecursiveMode::Recursive)?;
        lock(&self.watchers).push(watcher);

        let evidence = self.evidence.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if change_kind(&event.kind).is_none() {
                    continue;
                }
                if let Some(path) = event.paths.iter().find(|p| filter.is_user_activity(p)) {
                    debug!(path = %path.display(), "user activity");
                    evidence.record_activity();
                }
            }
        });
        self.track(handle);
        Ok(())
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn set_state(&self, state: SupervisorState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(state = ?state, "supervisor state changed");
            self.emit(SupervisorEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }
}

fn build_channels(config: &AppConfig, runner: Arc<dyn CommandRunner>) -> Vec<Arc<dyn NotificationChannel>> {
    let notifications = &config.notifications;
    let timeout = Duration::from_millis(notifications.delivery_timeout_ms);
    let mut channels: Vec<Arc<dyn NotificationChannel>> = vec![Arc::new(LogChannel)];
    if notifications.desktop {
        channels.push(Arc::new(DesktopChannel::new(runner, timeout)));
    }
    if let Some(url) = notifications.webhook_url.as_ref().filter(|u| !u.trim().is_empty()) {
        match WebhookChannel::new(url.clone(), timeout) {
            Ok(channel) => channels.push(Arc::new(channel)),
            Err(e) => warn!(error = %e, "webhook channel disabled"),
        }
    }
    channels
}

fn change_kind(kind: &EventKind) -> Option<&'static str> {
    use notify::event::ModifyKind;
    match kind {
        EventKind::Create(_) => Some("create"),
        EventKind::Modify(ModifyKind::Name(_)) => Some("rename"),
        EventKind::Modify(_) => Some("change"),
        EventKind::Remove(_) => Some("remove"),
        _ => None,
    }
}

fn same_file(target: &Path, path: &Path) -> bool {
    if target == path {
        return true;
    }
    // watchers may report canonical paths (e.g. /private/var on macOS)
    match (target.file_name(), path.file_name()) {
        (Some(a), Some(b)) if a == b => {
            let canonical = |p: &Path| p.parent().and_then(|d| d.canonicalize().ok());
            canonical(target) == canonical(path)
        }
        _ => false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_kind_ignores_access() {
        use notify::event::{AccessKind, CreateKind, ModifyKind, RenameMode};
        assert_eq!(change_kind(&EventKind::Create(CreateKind::File)), Some("create"));
        assert_eq!(
            change_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            Some("rename")
        );
        assert_eq!(change_kind(&EventKind::Modify(ModifyKind::Any)), Some("change"));
        assert_eq!(change_kind(&EventKind::Access(AccessKind::Any)), None);
    }

    #[test]
    fn test_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("worker.js");
        std::fs::write(&file, "").unwrap();
        assert!(same_file(&file, &file));
        let canonical = dir.path().canonicalize().unwrap().join("worker.js");
        assert!(same_file(&file, &canonical));
        assert!(!same_file(&file, &dir.path().join("other.js")));
    }

    #[tokio::test]
    async fn test_restart_handle_reports_closed_queue() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RestartHandle { tx };
        assert!(handle.request_restart("heartbeat-stale").await.is_ok());
        drop(rx);
        assert!(matches!(
            handle.request_restart("heartbeat-stale").await,
            Err(GuardError::ShuttingDown)
        ));
    }
}
