//! Notification Center
//!
//! The single chokepoint every monitor publishes through. Each event passes three gates
//! before delivery:
//! 1. dedupe: an identical `(type, message)` inside the dedupe window is dropped
//! 2. cooldown: keyed by `reason` when present, otherwise by `type`
//! 3. bounded queue: overflow is dropped with a warning
//!
//! `enqueue` never blocks. A single dispatcher task drains the queue and delivers to
//! every channel with retry.

use crate::config::NotificationConfig;
use crate::persistence::AuditLog;
use crate::supervisor::channels::NotificationChannel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notification severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warn,
    Error,
    Success,
}

impl NotificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationLevel::Info => "info",
            NotificationLevel::Warn => "warn",
            NotificationLevel::Error => "error",
            NotificationLevel::Success => "success",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            NotificationLevel::Info => "\u{2139}\u{fe0f}",
            NotificationLevel::Warn => "\u{26a0}\u{fe0f}",
            NotificationLevel::Error => "\u{274c}",
            NotificationLevel::Success => "\u{2705}",
        }
    }
}

impl std::fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A message published by a monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: NotificationLevel,
    #[serde(rename = "type")]
    pub kind: String,
    /// Explicit throttle key; falls back to `kind`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl NotificationEvent {
    pub fn new(kind: &str, level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            message: message.into(),
            level,
            kind: kind.to_string(),
            reason: None,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Key the cooldown is tracked under
    pub fn throttle_key(&self) -> &str {
        self.reason.as_deref().unwrap_or(&self.kind)
    }
}

/// What `enqueue` did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted and queued for the channels
    Queued,
    /// Same type and message seen inside the dedupe window
    Deduplicated,
    /// Throttle key still cooling down
    Suppressed,
    /// Queue full or dispatcher gone
    Dropped,
    /// Notifications are switched off
    Disabled,
}

/// Running counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotificationStats {
    pub enqueued: u64,
    pub sent: u64,
    pub deduplicated: u64,
    pub suppressed: u64,
    pub dropped: u64,
    pub failed: u64,
    pub retries: u64,
}

/// Cooldown defaults per notification type
pub fn default_cooldowns() -> HashMap<String, Duration> {
    [
        ("evidence_stale", 120_000),
        ("evidence_ok", 300_000),
        ("dirty_tree_warning", 600_000),
        ("dirty_tree_critical", 300_000),
        // the monitor already sends this once per transition
        ("dirty_tree_clean", 0),
        ("heartbeat_degraded", 180_000),
        ("heartbeat_ok", 600_000),
        ("health_check_error", 300_000),
        ("health_check_warn", 120_000),
        ("auto_recovery_error", 300_000),
        ("auto_recovery_warn", 180_000),
    ]
    .into_iter()
    .map(|(kind, ms)| (kind.to_string(), Duration::from_millis(ms)))
    .collect()
}

/// Throttle bookkeeping for a key
#[derive(Debug)]
struct RateLimitState {
    last_sent: Instant,
    suppressed_count: u32,
}

#[derive(Default)]
struct ThrottleState {
    rate_limits: HashMap<String, RateLimitState>,
    recent: HashMap<(String, String), Instant>,
}

struct RetryPolicy {
    max_retries: u32,
    retry_delay: Duration,
}

pub struct NotificationCenter {
    enabled: bool,
    default_cooldown: Duration,
    cooldowns: HashMap<String, Duration>,
    dedupe_window: Duration,
    throttle: Mutex<ThrottleState>,
    stats: Arc<Mutex<NotificationStats>>,
    queue_tx: Mutex<Option<mpsc::Sender<NotificationEvent>>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    event_tx: broadcast::Sender<NotificationEvent>,
    audit: Arc<AuditLog>,
}

impl NotificationCenter {
    /// Build the center and spawn its dispatcher task
    pub fn new(
        config: &NotificationConfig,
        channels: Vec<Arc<dyn NotificationChannel>>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let mut cooldowns = default_cooldowns();
        for (kind, ms) in &config.cooldowns {
            cooldowns.insert(kind.clone(), Duration::from_millis(*ms));
        }

        let (event_tx, _) = broadcast::channel(64);
        let (queue_tx, queue_rx) = mpsc::channel(config.max_queue.max(1));
        let stats = Arc::new(Mutex::new(NotificationStats::default()));
        let retry = RetryPolicy {
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        };
        let dispatcher = tokio::spawn(dispatch_loop(queue_rx, channels, retry, stats.clone()));

        Self {
            enabled: config.enabled,
            default_cooldown: Duration::from_millis(config.default_cooldown_ms),
            cooldowns,
            dedupe_window: Duration::from_millis(config.dedupe_window_ms),
            throttle: Mutex::new(ThrottleState::default()),
            stats,
            queue_tx: Mutex::new(Some(queue_tx)),
            dispatcher: tokio::sync::Mutex::new(Some(dispatcher)),
            event_tx,
            audit,
        }
    }

    /// Observe every enqueued event, throttled or not
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.event_tx.subscribe()
    }

    pub fn cooldown_for(&self, kind: &str) -> Duration {
        self.cooldowns
            .get(kind)
            .copied()
            .unwrap_or(self.default_cooldown)
    }

    pub fn stats(&self) -> NotificationStats {
        lock(&self.stats).clone()
    }

    /// Per-key counts of events suppressed since the last delivery
    pub fn suppressed_counts(&self) -> HashMap<String, u32> {
        lock(&self.throttle)
            .rate_limits
            .iter()
            .filter(|(_, state)| state.suppressed_count > 0)
            .map(|(key, state)| (key.clone(), state.suppressed_count))
            .collect()
    }

    /// Publish an event. Never blocks.
    pub fn enqueue(&self, event: NotificationEvent) -> Delivery {
        let _ = self.event_tx.send(event.clone());

        if !self.enabled {
            return Delivery::Disabled;
        }

        let now = Instant::now();
        let key = event.throttle_key().to_string();
        {
            let mut throttle = lock(&self.throttle);

            let dedupe_key = (event.kind.clone(), event.message.clone());
            let window = self.dedupe_window;
            throttle.recent.retain(|_, seen| now.duration_since(*seen) < window);
            if throttle.recent.contains_key(&dedupe_key) {
                lock(&self.stats).deduplicated += 1;
                debug!(kind = %event.kind, "notification deduplicated");
                return Delivery::Deduplicated;
            }
            throttle.recent.insert(dedupe_key, now);

            let cooldown = self.cooldown_for(&event.kind);
            if let Some(state) = throttle.rate_limits.get_mut(&key) {
                if now.duration_since(state.last_sent) < cooldown {
                    state.suppressed_count += 1;
                    let suppressed_count = state.suppressed_count;
                    drop(throttle);
                    lock(&self.stats).suppressed += 1;
                    debug!(kind = %event.kind, key = %key, suppressed_count, "notification suppressed (cooldown)");
                    self.audit.record(
                        "notification_suppressed",
                        json!({
                            "id": event.id,
                            "type": event.kind,
                            "key": key,
                            "level": event.level,
                            "message": event.message,
                            "cooldownMs": cooldown.as_millis() as u64,
                            "suppressedCount": suppressed_count,
                        }),
                    );
                    return Delivery::Suppressed;
                }
            }

            throttle.rate_limits.insert(
                key.clone(),
                RateLimitState {
                    last_sent: now,
                    suppressed_count: 0,
                },
            );
        }

        let sender = lock(&self.queue_tx).clone();
        let Some(sender) = sender else {
            lock(&self.stats).dropped += 1;
            return Delivery::Dropped;
        };

        let audit_data = json!({
            "id": event.id,
            "type": event.kind,
            "key": key,
            "level": event.level,
            "message": event.message,
            "metadata": event.metadata,
        });
        match sender.try_send(event) {
            Ok(()) => {
                lock(&self.stats).enqueued += 1;
                self.audit.record("notification_sent", audit_data);
                Delivery::Queued
            }
            Err(e) => {
                lock(&self.stats).dropped += 1;
                warn!(error = %e, "notification queue full, dropping");
                Delivery::Dropped
            }
        }
    }

    /// Stop accepting events, drain the queue, log final stats. Idempotent.
    pub async fn shutdown(&self) {
        let sender = lock(&self.queue_tx).take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        if let Some(handle) = self.dispatcher.lock().await.take() {
            let _ = handle.await;
        }
        let stats = self.stats();
        info!(
            enqueued = stats.enqueued,
            sent = stats.sent,
            deduplicated = stats.deduplicated,
            suppressed = stats.suppressed,
            dropped = stats.dropped,
            failed = stats.failed,
            retries = stats.retries,
            "notification center shut down"
        );
    }
}

async fn dispatch_loop(
    mut queue_rx: mpsc::Receiver<NotificationEvent>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    retry: RetryPolicy,
    stats: Arc<Mutex<NotificationStats>>,
) {
    while let Some(event) = queue_rx.recv().await {
        let mut delivered = true;
        for channel in &channels {
            if !deliver_with_retry(channel.as_ref(), &event, &retry, &stats).await {
                delivered = false;
            }
        }
        let mut stats = lock(&stats);
        if delivered {
            stats.sent += 1;
        } else {
            stats.failed += 1;
        }
    }
}

async fn deliver_with_retry(
    channel: &dyn NotificationChannel,
    event: &NotificationEvent,
    retry: &RetryPolicy,
    stats: &Mutex<NotificationStats>,
) -> bool {
    let mut attempt = 0;
    loop {
        match channel.deliver(event).await {
            Ok(()) => return true,
            Err(e) if attempt < retry.max_retries => {
                attempt += 1;
                lock(stats).retries += 1;
                debug!(channel = channel.name(), attempt, error = %e, "notification delivery failed, retrying");
                tokio::time::sleep(retry.retry_delay).await;
            }
            Err(e) => {
                warn!(channel = channel.name(), kind = %event.kind, error = %e, "notification delivery failed");
                return false;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GuardError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingChannel {
        delivered: Mutex<Vec<NotificationEvent>>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(GuardError::Internal("flaky".into()));
            }
            self.delivered.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn center(
        config: NotificationConfig,
        channel: Arc<RecordingChannel>,
    ) -> (NotificationCenter, Arc<AuditLog>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")));
        let center = NotificationCenter::new(&config, vec![channel as Arc<dyn NotificationChannel>], audit.clone());
        (center, audit, dir)
    }

    fn audit_events(audit: &AuditLog, event: &str) -> usize {
        audit.read_all().iter().filter(|e| e.event == event).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_type_inside_cooldown_is_suppressed_once() {
        let channel = Arc::new(RecordingChannel::default());
        let (center, audit, _dir) = center(NotificationConfig::default(), channel.clone());

        let first = center.enqueue(NotificationEvent::new("evidence_stale", NotificationLevel::Warn, "stale 1"));
        let second = center.enqueue(NotificationEvent::new("evidence_stale", NotificationLevel::Warn, "stale 2"));
        assert_eq!(first, Delivery::Queued);
        assert_eq!(second, Delivery::Suppressed);

        center.shutdown().await;
        assert_eq!(channel.delivered.lock().unwrap().len(), 1);
        assert_eq!(audit_events(&audit, "notification_sent"), 1);
        assert_eq!(audit_events(&audit, "notification_suppressed"), 1);
        assert_eq!(center.suppressed_counts().get("evidence_stale"), Some(&1));

        let stats = center.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.suppressed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_expires() {
        let channel = Arc::new(RecordingChannel::default());
        let (center, _audit, _dir) = center(NotificationConfig::default(), channel.clone());

        assert_eq!(
            center.enqueue(NotificationEvent::new("evidence_stale", NotificationLevel::Warn, "a")),
            Delivery::Queued
        );
        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(
            center.enqueue(NotificationEvent::new("evidence_stale", NotificationLevel::Warn, "b")),
            Delivery::Queued
        );
        center.shutdown().await;
        assert_eq!(channel.delivered.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reason_overrides_type_as_throttle_key() {
        let channel = Arc::new(RecordingChannel::default());
        let (center, _audit, _dir) = center(NotificationConfig::default(), channel.clone());

        let a = NotificationEvent::new("heartbeat_degraded", NotificationLevel::Warn, "a").with_reason("stale");
        let b = NotificationEvent::new("heartbeat_degraded", NotificationLevel::Warn, "b").with_reason("missing");
        assert_eq!(center.enqueue(a), Delivery::Queued);
        assert_eq!(center.enqueue(b), Delivery::Queued);
        center.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_message_is_deduplicated() {
        let channel = Arc::new(RecordingChannel::default());
        let config = NotificationConfig {
            default_cooldown_ms: 0,
            ..NotificationConfig::default()
        };
        let (center, _audit, _dir) = center(config, channel.clone());

        let event = || NotificationEvent::new("custom", NotificationLevel::Info, "same");
        assert_eq!(center.enqueue(event()), Delivery::Queued);
        assert_eq!(center.enqueue(event()), Delivery::Deduplicated);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(center.enqueue(event()), Delivery::Queued);
        center.shutdown().await;
        assert_eq!(center.stats().deduplicated, 1);
    }

    #[tokio::test]
    async fn test_retries_then_delivers() {
        let channel = Arc::new(RecordingChannel {
            failures_left: AtomicU32::new(2),
            ..RecordingChannel::default()
        });
        let config = NotificationConfig {
            retry_delay_ms: 1,
            ..NotificationConfig::default()
        };
        let (center, _audit, _dir) = center(config, channel.clone());

        center.enqueue(NotificationEvent::new("x", NotificationLevel::Error, "boom"));
        center.shutdown().await;

        let stats = center.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(channel.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_count_as_failed() {
        let channel = Arc::new(RecordingChannel {
            failures_left: AtomicU32::new(10),
            ..RecordingChannel::default()
        });
        let config = NotificationConfig {
            retry_delay_ms: 1,
            max_retries: 1,
            ..NotificationConfig::default()
        };
        let (center, _audit, _dir) = center(config, channel.clone());

        center.enqueue(NotificationEvent::new("x", NotificationLevel::Error, "boom"));
        center.shutdown().await;
        assert_eq!(center.stats().failed, 1);
        assert!(channel.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_center_still_broadcasts() {
        let channel = Arc::new(RecordingChannel::default());
        let config = NotificationConfig {
            enabled: false,
            ..NotificationConfig::default()
        };
        let (center, _audit, _dir) = center(config, channel.clone());
        let mut rx = center.subscribe();

        let result = center.enqueue(NotificationEvent::new("health_check_error", NotificationLevel::Error, "x"));
        assert_eq!(result, Delivery::Disabled);
        assert_eq!(rx.recv().await.unwrap().kind, "health_check_error");
        center.shutdown().await;
        assert!(channel.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_dropped() {
        let channel = Arc::new(RecordingChannel::default());
        let (center, _audit, _dir) = center(NotificationConfig::default(), channel);
        center.shutdown().await;
        center.shutdown().await;
        assert_eq!(
            center.enqueue(NotificationEvent::new("late", NotificationLevel::Info, "late")),
            Delivery::Dropped
        );
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = NotificationEvent::new("evidence_ok", NotificationLevel::Success, "fresh");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "evidence_ok");
        assert_eq!(value["level"], "success");
        assert!(value.get("reason").is_none());
    }
}
