//! Notification delivery channels
//!
//! The log channel is always on. Desktop banners and the webhook are opt-in.

use crate::error::{GuardError, Result};
use crate::process::{CommandRunner, CommandSpec};
use crate::supervisor::notification::{NotificationEvent, NotificationLevel};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One way of surfacing a notification to the user
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &NotificationEvent) -> Result<()>;
}

/// Structured log output at the event's level
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        let kind = event.kind.as_str();
        match event.level {
            NotificationLevel::Error => error!(kind, metadata = %event.metadata, "{}", event.message),
            NotificationLevel::Warn => warn!(kind, metadata = %event.metadata, "{}", event.message),
            NotificationLevel::Info | NotificationLevel::Success => {
                info!(kind, metadata = %event.metadata, "{}", event.message)
            }
        }
        Ok(())
    }
}

/// Desktop banner through `osascript` (macOS) or `notify-send`
pub struct DesktopChannel {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl DesktopChannel {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    fn title(event: &NotificationEvent) -> String {
        format!("Hook Guard: {}", event.level.as_str().to_uppercase())
    }

    fn command(&self, event: &NotificationEvent) -> CommandSpec {
        let title = Self::title(event);
        if cfg!(target_os = "macos") {
            let script = format!(
                "display notification \"{}\" with title \"{}\"",
                escape_applescript(&event.message),
                escape_applescript(&title)
            );
            CommandSpec::new("osascript", self.timeout).args(["-e".to_string(), script])
        } else {
            let urgency = match event.level {
                NotificationLevel::Error => "critical",
                NotificationLevel::Warn => "normal",
                NotificationLevel::Info | NotificationLevel::Success => "low",
            };
            CommandSpec::new("notify-send", self.timeout).args([
                "-u".to_string(),
                urgency.to_string(),
                title,
                event.message.clone(),
            ])
        }
    }
}

fn escape_applescript(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[async_trait]
impl NotificationChannel for DesktopChannel {
    fn name(&self) -> &str {
        "desktop"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        let spec = self.command(event);
        let output = self.runner.run(&spec).await?;
        if output.success() {
            Ok(())
        } else {
            Err(GuardError::Delivery {
                channel: "desktop".to_string(),
                reason: format!("{} exited with {:?}: {}", spec.program, output.code, output.stderr.trim()),
            })
        }
    }
}

/// Feishu-style text webhook
pub struct WebhookChannel {
    client: Client,
    webhook_url: String,
}

#[derive(Serialize)]
struct WebhookMessage {
    msg_type: String,
    content: WebhookContent,
}

#[derive(Serialize)]
struct WebhookContent {
    text: String,
}

impl WebhookChannel {
    pub fn new(webhook_url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, webhook_url })
    }

    fn format(event: &NotificationEvent) -> String {
        format!(
            "{} [{}] {}\n{}",
            event.level.emoji(),
            event.kind,
            event.message,
            event.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        let message = WebhookMessage {
            msg_type: "text".to_string(),
            content: WebhookContent {
                text: Self::format(event),
            },
        };

        let resp = self.client.post(&self.webhook_url).json(&message).send().await?;
        if resp.status().is_success() {
            debug!("webhook notification sent");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(GuardError::Delivery {
                channel: "webhook".to_string(),
                reason: format!("HTTP {}: {}", status, body),
            })
        }
    }
}
