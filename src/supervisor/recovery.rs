//! Auto Recovery
//!
//! Condition/action strategies evaluated against failure events from the monitors.
//! Per key, at most one recovery runs at a time and attempts are spaced by a cooldown
//! that doubles with every attempt (with jitter, up to a ceiling). The cooldown is
//! recorded when the actions settle, whether they succeeded or not.

use crate::config::RecoveryConfig;
use crate::error::{GuardError, Result};
use crate::process::{CommandRunner, CommandSpec};
use crate::supervisor::notification::{NotificationCenter, NotificationEvent, NotificationLevel};
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A failure reported by a monitor
#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    /// Cooldown bucket, e.g. `heartbeat`, `health`, or a child name
    pub key: String,
    pub reason: String,
    pub context: Value,
}

impl RecoveryRequest {
    pub fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
            context: Value::Object(Default::default()),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// One condition/action pair
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn id(&self) -> &str;

    fn matches(&self, request: &RecoveryRequest) -> bool;

    async fn execute(&self, request: &RecoveryRequest) -> Result<()>;
}

/// Result of a `recover` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No strategy matched
    Ignored,
    CoolingDown { remaining: Duration },
    InFlight,
    MaxAttempts,
    Executed {
        succeeded: Vec<String>,
        failed: Vec<String>,
    },
}

/// Anything that can restart the supervised children
#[async_trait]
pub trait RestartTrigger: Send + Sync {
    async fn request_restart(&self, reason: &str) -> Result<()>;
}

/// Restarts the supervisor's children when the heartbeat goes bad.
/// Health errors are not restart-worthy: a stale evidence file or a dirty tree
/// is not fixed by bouncing the workers.
pub struct SupervisorRestartStrategy {
    trigger: Arc<dyn RestartTrigger>,
}

impl SupervisorRestartStrategy {
    pub const ID: &'static str = "guard-supervisor-restart";

    pub fn new(trigger: Arc<dyn RestartTrigger>) -> Self {
        Self { trigger }
    }
}

#[async_trait]
impl RecoveryStrategy for SupervisorRestartStrategy {
    fn id(&self) -> &str {
        Self::ID
    }

    fn matches(&self, request: &RecoveryRequest) -> bool {
        request.reason.starts_with("heartbeat-")
    }

    async fn execute(&self, request: &RecoveryRequest) -> Result<()> {
        info!(key = %request.key, reason = %request.reason, "requesting supervisor restart");
        self.trigger.request_restart(&request.reason).await
    }
}

/// Runs an operator-supplied command for matching reasons
pub struct CommandStrategy {
    id: String,
    reason_prefixes: Vec<String>,
    spec: CommandSpec,
    runner: Arc<dyn CommandRunner>,
}

impl CommandStrategy {
    pub fn new(
        id: impl Into<String>,
        reason_prefixes: Vec<String>,
        spec: CommandSpec,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            id: id.into(),
            reason_prefixes,
            spec,
            runner,
        }
    }

    /// Shell command from `recovery.restart_command`, run for child exits
    pub fn from_config(config: &RecoveryConfig, cwd: &std::path::Path, runner: Arc<dyn CommandRunner>) -> Option<Self> {
        let command = config.restart_command.as_ref()?.trim();
        if command.is_empty() {
            return None;
        }
        let spec = CommandSpec::new("sh", Duration::from_millis(config.restart_command_timeout_ms))
            .args(["-c", command])
            .cwd(cwd);
        Some(Self::new("external-restart-command", vec!["child-exit:".to_string()], spec, runner))
    }
}

#[async_trait]
impl RecoveryStrategy for CommandStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, request: &RecoveryRequest) -> bool {
        self.reason_prefixes
            .iter()
            .any(|prefix| request.reason.starts_with(prefix.as_str()))
    }

    async fn execute(&self, request: &RecoveryRequest) -> Result<()> {
        let spec = self
            .spec
            .clone()
            .env("HOOKGUARD_RECOVERY_KEY", request.key.clone())
            .env("HOOKGUARD_RECOVERY_REASON", request.reason.clone());
        let output = self.runner.run(&spec).await?;
        if output.success() {
            Ok(())
        } else {
            Err(GuardError::Recovery {
                strategy: self.id.clone(),
                reason: format!("exit {:?}: {}", output.code, output.stderr.trim()),
            })
        }
    }
}

#[derive(Debug, Default)]
struct RecoveryState {
    last_attempt: Option<Instant>,
    /// Gap required after `last_attempt`, fixed when the attempt settles
    backoff: Duration,
    in_flight: bool,
    attempts: u32,
}

/// `base * 2^(attempts - 1)`, capped at `max`
pub fn backoff_for(base: Duration, attempts: u32, max: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max.max(base))
}

pub struct AutoRecoveryManager {
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    cooldown: Duration,
    max_backoff: Duration,
    jitter: f64,
    max_attempts: u32,
    states: Mutex<HashMap<String, RecoveryState>>,
    notifier: Option<Arc<NotificationCenter>>,
}

impl AutoRecoveryManager {
    pub fn new(cooldown: Duration, max_attempts: u32, notifier: Option<Arc<NotificationCenter>>) -> Self {
        Self {
            strategies: Vec::new(),
            cooldown,
            max_backoff: cooldown.saturating_mul(16),
            jitter: 0.0,
            max_attempts,
            states: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    pub fn from_config(config: &RecoveryConfig, notifier: Option<Arc<NotificationCenter>>) -> Self {
        Self::new(Duration::from_millis(config.cooldown_ms), config.max_attempts, notifier)
            .with_backoff(Duration::from_millis(config.max_backoff_ms), config.backoff_jitter)
    }

    /// Ceiling for the doubled cooldown and the +/- jitter fraction applied to it
    pub fn with_backoff(mut self, max_backoff: Duration, jitter: f64) -> Self {
        self.max_backoff = max_backoff;
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn next_backoff(&self, attempts: u32) -> Duration {
        let backoff = backoff_for(self.cooldown, attempts, self.max_backoff);
        if self.jitter <= 0.0 {
            return backoff;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        backoff.mul_f64(factor)
    }

    /// Register a strategy; evaluation follows registration order
    pub fn register(&mut self, strategy: Arc<dyn RecoveryStrategy>) {
        debug!(strategy = strategy.id(), "recovery strategy registered");
        self.strategies.push(strategy);
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.register(strategy);
        self
    }

    fn states(&self) -> std::sync::MutexGuard<'_, HashMap<String, RecoveryState>> {
        self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Attempts made for `key` since it was last cleared
    pub fn attempts(&self, key: &str) -> u32 {
        self.states().get(key).map(|s| s.attempts).unwrap_or(0)
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.states().get(key).map(|s| s.in_flight).unwrap_or(false)
    }

    /// Run every matching strategy unless `key` is in flight, cooling down, or exhausted
    pub async fn recover(&self, request: RecoveryRequest) -> RecoveryOutcome {
        let matching: Vec<_> = self
            .strategies
            .iter()
            .filter(|s| s.matches(&request))
            .cloned()
            .collect();
        if matching.is_empty() {
            debug!(key = %request.key, reason = %request.reason, "no recovery strategy matched");
            return RecoveryOutcome::Ignored;
        }

        let now = Instant::now();
        {
            let mut states = self.states();
            let state = states.entry(request.key.clone()).or_default();
            if state.in_flight {
                debug!(key = %request.key, "recovery already in flight");
                return RecoveryOutcome::InFlight;
            }
            if let Some(last) = state.last_attempt {
                let elapsed = now.duration_since(last);
                if elapsed < state.backoff {
                    let remaining = state.backoff - elapsed;
                    debug!(key = %request.key, remaining_ms = remaining.as_millis() as u64, "recovery cooling down");
                    return RecoveryOutcome::CoolingDown { remaining };
                }
            }
            if state.attempts >= self.max_attempts {
                drop(states);
                warn!(key = %request.key, reason = %request.reason, max_attempts = self.max_attempts, "recovery max attempts reached");
                self.notify(
                    NotificationLevel::Warn,
                    format!("Recovery skipped for {} (max attempts reached)", request.key),
                    &request,
                );
                return RecoveryOutcome::MaxAttempts;
            }
            state.in_flight = true;
            state.attempts += 1;
        }

        info!(
            key = %request.key,
            reason = %request.reason,
            strategies = matching.len(),
            "running recovery"
        );

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for strategy in &matching {
            match strategy.execute(&request).await {
                Ok(()) => {
                    info!(key = %request.key, strategy = strategy.id(), "recovery action succeeded");
                    succeeded.push(strategy.id().to_string());
                }
                Err(e) => {
                    error!(key = %request.key, strategy = strategy.id(), error = %e, "recovery action failed");
                    failed.push(format!("{}: {}", strategy.id(), e));
                }
            }
        }

        {
            let mut states = self.states();
            // a clear() during the action wins
            if let Some(state) = states.get_mut(&request.key) {
                state.in_flight = false;
                state.backoff = self.next_backoff(state.attempts);
                let settled = Instant::now();
                state.last_attempt = Some(match state.last_attempt {
                    Some(prev) if prev > settled => prev,
                    _ => settled,
                });
            }
        }

        if failed.is_empty() {
            self.notify(
                NotificationLevel::Info,
                format!("Recovery succeeded for {}", request.key),
                &request,
            );
        } else {
            self.notify(
                NotificationLevel::Error,
                format!("Recovery failed for {}: {}", request.key, failed.join("; ")),
                &request,
            );
        }

        RecoveryOutcome::Executed { succeeded, failed }
    }

    /// Forget cooldown, attempts and in-flight state for `key`
    pub fn clear(&self, key: &str) {
        if self.states().remove(key).is_some() {
            debug!(key, "recovery state cleared");
        }
    }

    fn notify(&self, level: NotificationLevel, message: String, request: &RecoveryRequest) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let kind = format!("auto_recovery_{}", level.as_str());
        notifier.enqueue(
            NotificationEvent::new(&kind, level, message).with_metadata(json!({
                "key": request.key,
                "reason": request.reason,
            })),
        );
    }
}
