//! Child Process Manager
//!
//! Spawns and stops the named workers. The manager only reports exits; deciding
//! whether to restart is the supervisor's job.
//!
//! Every spawned child gets a waiter task that owns the `tokio::process::Child`. The
//! waiter clears the handle, publishes a [`ChildExit`], and only then flips the exit
//! watch that `stop` waits on, so a completed `stop` has always been announced.

use crate::config::{AppConfig, ChildConfig};
use crate::error::{GuardError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Immutable launch description for one worker
#[derive(Debug, Clone)]
pub struct ChildDescriptor {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl ChildDescriptor {
    pub fn new(name: impl Into<String>, command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn from_config(app: &AppConfig, child: &ChildConfig) -> Self {
        Self {
            name: child.name.clone(),
            command: child.command.clone(),
            args: child.args.clone(),
            cwd: app.child_cwd(child),
            env: child.env_pairs(),
        }
    }
}

/// Point-in-time view of one worker, as written into the heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildStatus {
    pub running: bool,
    pub pid: Option<u32>,
}

/// A worker process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildExit {
    pub name: String,
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The exit was caused by `stop()`
    pub requested: bool,
}

impl ChildExit {
    /// Restart reason in the `<name>-exit:<code>:<signal>` form
    pub fn restart_reason(&self) -> String {
        fn or_null(value: Option<i32>) -> String {
            value.map(|v| v.to_string()).unwrap_or_else(|| "null".to_string())
        }
        format!("{}-exit:{}:{}", self.name, or_null(self.code), or_null(self.signal))
    }
}

/// Lifecycle events published by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    Started { name: String, pid: u32 },
    Exited(ChildExit),
}

struct ChildHandle {
    pid: u32,
    generation: u64,
    stop_requested: Arc<AtomicBool>,
    kill_tx: mpsc::UnboundedSender<()>,
    exited: watch::Receiver<bool>,
}

struct Inner {
    descriptors: Vec<ChildDescriptor>,
    handles: Mutex<HashMap<String, ChildHandle>>,
    // serializes start/stop per name so two starts cannot leave two processes
    op_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    generation: AtomicU64,
    force_kill_timeout: Duration,
    events: broadcast::Sender<ChildEvent>,
}

/// Cheaply cloneable handle to the process table
#[derive(Clone)]
pub struct ChildProcessManager {
    inner: Arc<Inner>,
}

impl ChildProcessManager {
    pub fn new(descriptors: Vec<ChildDescriptor>, force_kill_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        let op_locks = descriptors
            .iter()
            .map(|d| (d.name.clone(), Arc::new(tokio::sync::Mutex::new(()))))
            .collect();
        Self {
            inner: Arc::new(Inner {
                descriptors,
                handles: Mutex::new(HashMap::new()),
                op_locks,
                generation: AtomicU64::new(0),
                force_kill_timeout,
                events,
            }),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let descriptors = config
            .children
            .iter()
            .map(|child| ChildDescriptor::from_config(config, child))
            .collect();
        Self::new(descriptors, Duration::from_millis(config.restart.force_kill_ms))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChildEvent> {
        self.inner.events.subscribe()
    }

    /// Descriptor names in configuration order
    pub fn names(&self) -> Vec<String> {
        self.inner.descriptors.iter().map(|d| d.name.clone()).collect()
    }

    fn descriptor(&self, name: &str) -> Result<&ChildDescriptor> {
        self.inner
            .descriptors
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| GuardError::UnknownChild(name.to_string()))
    }

    fn op_lock(&self, name: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        self.inner
            .op_locks
            .get(name)
            .cloned()
            .ok_or_else(|| GuardError::UnknownChild(name.to_string()))
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChildHandle>> {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.handles().contains_key(name)
    }

    pub fn describe(&self, name: &str) -> ChildStatus {
        match self.handles().get(name) {
            Some(handle) => ChildStatus {
                running: true,
                pid: Some(handle.pid),
            },
            None => ChildStatus {
                running: false,
                pid: None,
            },
        }
    }

    /// Status of every configured worker, in configuration order
    pub fn describe_all(&self) -> Vec<(String, ChildStatus)> {
        let handles = self.handles();
        self.inner
            .descriptors
            .iter()
            .map(|d| {
                let status = match handles.get(&d.name) {
                    Some(h) => ChildStatus {
                        running: true,
                        pid: Some(h.pid),
                    },
                    None => ChildStatus {
                        running: false,
                        pid: None,
                    },
                };
                (d.name.clone(), status)
            })
            .collect()
    }

    /// Start `name`, stopping any existing process for it first. Returns the new pid.
    pub async fn start(&self, name: &str) -> Result<u32> {
        let descriptor = self.descriptor(name)?.clone();
        let op_lock = self.op_lock(name)?;
        let _guard = op_lock.lock().await;

        self.stop_locked(name).await?;
        self.spawn_locked(&descriptor)
    }

    /// Stop `name` gracefully, escalating to SIGKILL after the force-kill timeout.
    /// Resolves once the process has exited. Returns false if it was not running.
    pub async fn stop(&self, name: &str) -> Result<bool> {
        let op_lock = self.op_lock(name)?;
        let _guard = op_lock.lock().await;
        self.stop_locked(name).await
    }

    pub async fn start_all(&self) -> Result<()> {
        let mut first_error = None;
        for name in self.names() {
            if let Err(e) = self.start(&name).await {
                error!(child = %name, error = %e, "failed to start child");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every running worker concurrently
    pub async fn stop_all(&self) {
        let mut tasks = tokio::task::JoinSet::new();
        for name in self.names() {
            if !self.is_running(&name) {
                continue;
            }
            let manager = self.clone();
            tasks.spawn(async move {
                if let Err(e) = manager.stop(&name).await {
                    warn!(child = %name, error = %e, "failed to stop child");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    fn spawn_locked(&self, descriptor: &ChildDescriptor) -> Result<u32> {
        let mut cmd = Command::new(&descriptor.command);
        cmd.args(&descriptor.args)
            .current_dir(&descriptor.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in &descriptor.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| GuardError::Spawn {
            name: descriptor.name.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| GuardError::Spawn {
            name: descriptor.name.clone(),
            reason: "process exited before its pid was read".to_string(),
        })?;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let stop_requested = Arc::new(AtomicBool::new(false));
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
        let (exited_tx, exited_rx) = watch::channel(false);

        self.handles().insert(
            descriptor.name.clone(),
            ChildHandle {
                pid,
                generation,
                stop_requested: stop_requested.clone(),
                kill_tx,
                exited: exited_rx,
            },
        );

        info!(child = %descriptor.name, pid, "child started");
        let _ = self.inner.events.send(ChildEvent::Started {
            name: descriptor.name.clone(),
            pid,
        });

        let manager = self.clone();
        let name = descriptor.name.clone();
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(()) = kill_rx.recv() => {
                        if let Err(e) = child.start_kill() {
                            debug!(child = %name, error = %e, "kill after exit");
                        }
                    }
                }
            };

            let (code, signal) = match &status {
                Ok(status) => (status.code(), exit_signal(status)),
                Err(e) => {
                    error!(child = %name, error = %e, "failed waiting on child");
                    (None, None)
                }
            };

            {
                let mut handles = manager.handles();
                if handles.get(&name).map(|h| h.generation) == Some(generation) {
                    handles.remove(&name);
                }
            }

            let exit = ChildExit {
                name: name.clone(),
                pid,
                code,
                signal,
                requested: stop_requested.load(Ordering::SeqCst),
            };
            if exit.requested {
                info!(child = %name, pid, ?code, ?signal, "child stopped");
            } else {
                warn!(child = %name, pid, ?code, ?signal, "child exited unexpectedly");
            }
            let _ = manager.inner.events.send(ChildEvent::Exited(exit));
            let _ = exited_tx.send(true);
        });

        Ok(pid)
    }

    async fn stop_locked(&self, name: &str) -> Result<bool> {
        let (pid, kill_tx, mut exited) = {
            let handles = self.handles();
            let Some(handle) = handles.get(name) else {
                return Ok(false);
            };
            handle.stop_requested.store(true, Ordering::SeqCst);
            (handle.pid, handle.kill_tx.clone(), handle.exited.clone())
        };

        debug!(child = %name, pid, "stopping child");
        terminate(pid);

        let graceful = tokio::time::timeout(self.inner.force_kill_timeout, wait_exited(&mut exited)).await;
        if graceful.is_err() {
            warn!(
                child = %name,
                pid,
                timeout_ms = self.inner.force_kill_timeout.as_millis() as u64,
                "child ignored SIGTERM, sending SIGKILL"
            );
            let _ = kill_tx.send(());
            wait_exited(&mut exited).await;
        }
        Ok(true)
    }
}

async fn wait_exited(exited: &mut watch::Receiver<bool>) {
    while !*exited.borrow_and_update() {
        if exited.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(pid) {
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM delivery failed");
        }
    }
}

// No graceful signal off unix; the force-kill timeout escalates
#[cfg(not(unix))]
fn terminate(_pid: u32) {}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
