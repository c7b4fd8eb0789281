mod email;
mod slack;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::NotificationConfig;
use crate::error::DrResult;

pub use email::EmailNotifier;
pub use slack::SlackNotifier;

/// Operation outcomes worth telling a human about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrEvent {
    BackupFinished {
        environment: String,
        manifest_id: String,
        mode: String,
        succeeded: bool,
        components: usize,
        total_bytes: u64,
        error: Option<String>,
    },
    RestoreFinished {
        session_id: String,
        manifest_id: String,
        target_environment: String,
        succeeded: bool,
        failed_component: Option<String>,
        error: Option<String>,
    },
    FailoverFinished {
        event_id: String,
        source_site: String,
        target_site: String,
        reason: String,
        outcome: String,
        dns_updated: bool,
        detail: Option<String>,
    },
}

impl DrEvent {
    pub fn title(&self) -> String {
        match self {
            DrEvent::BackupFinished {
                environment,
                succeeded,
                ..
            } => {
                let verb = if *succeeded { "complete" } else { "FAILED" };
                format!("Backup {verb}: {environment}")
            }
            DrEvent::RestoreFinished {
                target_environment,
                succeeded,
                ..
            } => {
                let verb = if *succeeded { "complete" } else { "FAILED" };
                format!("Restore {verb}: {target_environment}")
            }
            DrEvent::FailoverFinished {
                target_site,
                outcome,
                ..
            } => format!("Failover to {target_site}: {outcome}"),
        }
    }

    /// Label/value pairs describing the event, in display order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            DrEvent::BackupFinished {
                manifest_id,
                mode,
                components,
                total_bytes,
                ..
            } => vec![
                ("Manifest", manifest_id.clone()),
                ("Mode", mode.clone()),
                ("Components", components.to_string()),
                (
                    "Size",
                    format!("{:.1} MB", *total_bytes as f64 / (1024.0 * 1024.0)),
                ),
            ],
            DrEvent::RestoreFinished {
                session_id,
                manifest_id,
                failed_component,
                ..
            } => {
                let mut fields = vec![
                    ("Session", short_id(session_id).to_string()),
                    ("Manifest", manifest_id.clone()),
                ];
                if let Some(component) = failed_component {
                    fields.push(("Failed component", component.clone()));
                }
                fields
            }
            DrEvent::FailoverFinished {
                event_id,
                source_site,
                reason,
                dns_updated,
                ..
            } => vec![
                ("Event", short_id(event_id).to_string()),
                ("From", source_site.clone()),
                ("Reason", reason.clone()),
                ("DNS updated", dns_updated.to_string()),
            ],
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            DrEvent::BackupFinished { error, .. } | DrEvent::RestoreFinished { error, .. } => {
                error.as_deref()
            }
            DrEvent::FailoverFinished { detail, .. } => detail.as_deref(),
        }
    }
}

fn short_id(id: &str) -> &str {
    &id[..8.min(id.len())]
}

/// A delivery channel (chat webhook, email relay, ...)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, event: &DrEvent) -> DrResult<()>;
}

/// Build every channel the config enables
pub fn create_channels(config: &NotificationConfig) -> Vec<Arc<dyn NotificationChannel>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    if let Some(webhook) = config.slack_webhook.as_ref().filter(|w| !w.is_empty()) {
        channels.push(Arc::new(SlackNotifier::new(webhook.clone())));
    }
    if let Some(email) = &config.email {
        if !email.relay_url.is_empty() && !email.to.is_empty() {
            channels.push(Arc::new(EmailNotifier::new(email.clone())));
        }
    }
    channels
}

/// Best-effort fan-out. Failures are logged and never returned.
#[derive(Clone)]
pub struct NotificationDispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>, timeout: Duration) -> Self {
        Self { channels, timeout }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(
            create_channels(config),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Deliver `event` to every channel concurrently, each bounded by the
    /// dispatcher timeout.
    pub async fn notify(&self, event: DrEvent) {
        if self.channels.is_empty() {
            return;
        }

        let mut tasks = JoinSet::new();
        for channel in &self.channels {
            let channel = channel.clone();
            let event = event.clone();
            let timeout = self.timeout;
            tasks.spawn(async move {
                let name = channel.name();
                let result = tokio::time::timeout(timeout, channel.notify(&event)).await;
                (name, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(Ok(())))) => debug!(channel = name, "Notification delivered"),
                Ok((name, Ok(Err(e)))) => warn!(channel = name, error = %e, "Notification failed"),
                Ok((name, Err(_))) => {
                    warn!(channel = name, timeout_secs = self.timeout.as_secs(), "Notification timed out")
                }
                Err(e) => warn!(error = %e, "Notification task panicked"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmailConfig;
    use crate::error::DrError;
    use std::sync::Mutex;

    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationChannel for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn notify(&self, event: &DrEvent) -> DrResult<()> {
            self.seen.lock().unwrap().push(event.title());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl NotificationChannel for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn notify(&self, _event: &DrEvent) -> DrResult<()> {
            Err(DrError::Notification {
                channel: "broken".into(),
                message: "connection refused".into(),
            })
        }
    }

    fn event() -> DrEvent {
        DrEvent::BackupFinished {
            environment: "prod".into(),
            manifest_id: "prod-20260101T000000Z".into(),
            mode: "full".into(),
            succeeded: true,
            components: 5,
            total_bytes: 3 * 1024 * 1024,
            error: None,
        }
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_others() {
        let recording = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let dispatcher = NotificationDispatcher::new(
            vec![Arc::new(Broken), recording.clone()],
            Duration::from_secs(1),
        );

        dispatcher.notify(event()).await;

        assert_eq!(
            *recording.seen.lock().unwrap(),
            vec!["Backup complete: prod".to_string()]
        );
    }

    #[test]
    fn channels_follow_config() {
        let mut config = NotificationConfig::default();
        assert!(create_channels(&config).is_empty());

        config.slack_webhook = Some("https://hooks.slack.test/T000".into());
        config.email = Some(EmailConfig {
            relay_url: "http://relay.test/send".into(),
            from: "dr@example.test".into(),
            to: vec!["oncall@example.test".into()],
        });
        let names: Vec<_> = create_channels(&config).iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["slack", "email"]);
    }

    #[test]
    fn event_fields_render() {
        let fields = event().fields();
        assert_eq!(fields[0], ("Manifest", "prod-20260101T000000Z".to_string()));
        assert_eq!(fields[3].1, "3.0 MB");
    }
}
