use super::{DrEvent, NotificationChannel};
use crate::config::EmailConfig;
use crate::error::{DrError, DrResult};
use async_trait::async_trait;
use serde::Serialize;

/// Sends plain-text mail through an HTTP relay.
pub struct EmailNotifier {
    config: EmailConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a [String],
    subject: String,
    text: String,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn render(&self, event: &DrEvent) -> RelayMessage<'_> {
        let mut text = String::new();
        for (label, value) in event.fields() {
            text.push_str(&format!("{label}: {value}\n"));
        }
        if let Some(error) = event.error() {
            text.push_str(&format!("\nError:\n{error}\n"));
        }

        RelayMessage {
            from: &self.config.from,
            to: &self.config.to,
            subject: format!("[drsentinel] {}", event.title()),
            text,
        }
    }
}

#[async_trait]
impl NotificationChannel for EmailNotifier {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn notify(&self, event: &DrEvent) -> DrResult<()> {
        let message = self.render(event);
        let failure = |e: reqwest::Error| DrError::Notification {
            channel: "email".into(),
            message: e.to_string(),
        };

        self.client
            .post(&self.config.relay_url)
            .json(&message)
            .send()
            .await
            .map_err(failure)?
            .error_for_status()
            .map_err(failure)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_subject_and_body() {
        let notifier = EmailNotifier::new(EmailConfig {
            relay_url: "http://relay.test/send".into(),
            from: "dr@example.test".into(),
            to: vec!["oncall@example.test".into()],
        });
        let event = DrEvent::FailoverFinished {
            event_id: "0190aaaa-bbbb-7ccc-8ddd-eeeeffff0000".into(),
            source_site: "primary".into(),
            target_site: "standby".into(),
            reason: "region outage".into(),
            outcome: "refused".into(),
            dns_updated: false,
            detail: Some("target unhealthy".into()),
        };

        let message = notifier.render(&event);
        assert_eq!(message.subject, "[drsentinel] Failover to standby: refused");
        assert!(message.text.contains("Reason: region outage"));
        assert!(message.text.contains("target unhealthy"));
    }
}
