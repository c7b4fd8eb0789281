use super::{DrEvent, NotificationChannel};
use crate::error::{DrError, DrResult};
use async_trait::async_trait;
use serde_json::json;

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, event: &DrEvent) -> serde_json::Value {
        let fields: Vec<serde_json::Value> = event
            .fields()
            .into_iter()
            .map(|(label, value)| {
                json!({
                    "type": "mrkdwn",
                    "text": format!("*{}:*\n`{}`", label, value)
                })
            })
            .collect();

        let mut blocks = vec![
            json!({
                "type": "header",
                "text": {
                    "type": "plain_text",
                    "text": event.title(),
                    "emoji": true
                }
            }),
            json!({
                "type": "section",
                "fields": fields
            }),
        ];

        if let Some(error) = event.error() {
            blocks.push(json!({
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!("*Error:*\n```{}```", error)
                }
            }));
        }

        json!({ "text": event.title(), "blocks": blocks })
    }

    fn failure(&self, message: impl Into<String>) -> DrError {
        DrError::Notification {
            channel: self.name().to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn notify(&self, event: &DrEvent) -> DrResult<()> {
        let payload = self.format_message(event);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.failure(e.to_string()))?
            .error_for_status()
            .map_err(|e| self.failure(e.to_string()))?;
        Ok(())
    }
}
