//! Aggregated health checks.
//!
//! Every provider answers for one concern. A collection runs them all, each under its own
//! timeout, folds the results into a worst-of status, persists the snapshot and publishes
//! one notification whose level follows the aggregate.

use crate::config::HealthConfig;
use crate::coordination::PeriodicTask;
use crate::error::Result;
use crate::persistence::write_json_atomic;
use crate::supervisor::notification::{NotificationCenter, NotificationEvent, NotificationLevel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ordered so that `max` gives the worst status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Warn,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Warn => "warn",
            HealthStatus::Error => "error",
        }
    }

    /// Worst-of; an empty set is ok
    pub fn aggregate<I: IntoIterator<Item = HealthStatus>>(statuses: I) -> HealthStatus {
        statuses.into_iter().max().unwrap_or(HealthStatus::Ok)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub details: Value,
}

impl HealthCheckResult {
    pub fn new(name: impl Into<String>, status: HealthStatus, details: Value) -> Self {
        Self {
            name: name.into(),
            status,
            details,
        }
    }

    pub fn ok(name: impl Into<String>, details: Value) -> Self {
        Self::new(name, HealthStatus::Ok, details)
    }

    pub fn warn(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Warn, json!({ "message": message.into() }))
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Error, json!({ "message": message.into() }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub status: HealthStatus,
    pub results: Vec<HealthCheckResult>,
}

/// One independently failing health concern
#[async_trait]
pub trait HealthCheckProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<HealthCheckResult>;
}

pub struct HealthCheckService {
    providers: Vec<Arc<dyn HealthCheckProvider>>,
    output_path: PathBuf,
    interval: Duration,
    provider_timeout: Duration,
    history_limit: usize,
    history: Mutex<VecDeque<HealthSnapshot>>,
    notifier: Option<Arc<NotificationCenter>>,
    task: Mutex<Option<PeriodicTask>>,
}

impl HealthCheckService {
    pub fn new(
        config: &HealthConfig,
        providers: Vec<Arc<dyn HealthCheckProvider>>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            providers,
            output_path: output_path.into(),
            interval: Duration::from_millis(config.interval_ms),
            provider_timeout: Duration::from_millis(config.provider_timeout_ms),
            history_limit: config.history_limit.max(1),
            history: Mutex::new(VecDeque::new()),
            notifier: None,
            task: Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<NotificationCenter>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Run every provider and publish the aggregate
    pub async fn collect(&self, reason: &str) -> HealthSnapshot {
        let handles: Vec<_> = self
            .providers
            .iter()
            .map(|provider| {
                let provider = provider.clone();
                let timeout = self.provider_timeout;
                let name = provider.name().to_string();
                let handle = tokio::spawn(async move {
                    match tokio::time::timeout(timeout, provider.check()).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(e)) => HealthCheckResult::error(provider.name(), e.to_string()),
                        Err(_) => HealthCheckResult::error(
                            provider.name(),
                            format!("timed out after {}ms", timeout.as_millis()),
                        ),
                    }
                });
                (name, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => HealthCheckResult::error(name, format!("provider panicked: {}", e)),
            };
            results.push(result);
        }

        let status = HealthStatus::aggregate(results.iter().map(|r| r.status));
        let snapshot = HealthSnapshot {
            timestamp: Utc::now(),
            reason: reason.to_string(),
            status,
            results,
        };

        if let Err(e) = write_json_atomic(&self.output_path, &snapshot) {
            warn!(path = %self.output_path.display(), error = %e, "failed to persist health snapshot");
        }

        {
            let mut history = lock(&self.history);
            history.push_front(snapshot.clone());
            history.truncate(self.history_limit);
        }

        self.publish(&snapshot);
        snapshot
    }

    fn publish(&self, snapshot: &HealthSnapshot) {
        let failing: Vec<&str> = snapshot
            .results
            .iter()
            .filter(|r| r.status != HealthStatus::Ok)
            .map(|r| r.name.as_str())
            .collect();

        match snapshot.status {
            HealthStatus::Ok => debug!(reason = %snapshot.reason, "health check ok"),
            HealthStatus::Warn => warn!(reason = %snapshot.reason, failing = ?failing, "health check warn"),
            HealthStatus::Error => warn!(reason = %snapshot.reason, failing = ?failing, "health check error"),
        }

        let Some(notifier) = &self.notifier else {
            return;
        };
        let (kind, level) = match snapshot.status {
            HealthStatus::Ok => ("health_check_info", NotificationLevel::Info),
            HealthStatus::Warn => ("health_check_warn", NotificationLevel::Warn),
            HealthStatus::Error => ("health_check_error", NotificationLevel::Error),
        };
        let message = if failing.is_empty() {
            format!("Health check ok ({})", snapshot.reason)
        } else {
            format!(
                "Health check {} ({}): {}",
                snapshot.status,
                snapshot.reason,
                failing.join(", ")
            )
        };
        notifier.enqueue(
            NotificationEvent::new(kind, level, message).with_metadata(json!({
                "reason": snapshot.reason,
                "status": snapshot.status,
                "failing": failing,
            })),
        );
    }

    /// Newest first
    pub fn history(&self) -> Vec<HealthSnapshot> {
        lock(&self.history).iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<HealthSnapshot> {
        lock(&self.history).front().cloned()
    }

    /// Collect once now, then on every interval
    pub fn start(self: &Arc<Self>, reason: &str) {
        if self.interval.is_zero() {
            info!("health checks disabled");
            return;
        }
        let service = self.clone();
        let reason = reason.to_string();
        let mut first = true;
        let task = PeriodicTask::start("health-check", self.interval, true, move || {
            let service = service.clone();
            let tick_reason = if std::mem::replace(&mut first, false) {
                reason.clone()
            } else {
                "interval".to_string()
            };
            async move {
                service.collect(&tick_reason).await;
                Ok(())
            }
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

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
