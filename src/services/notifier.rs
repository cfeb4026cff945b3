// Notifier
// Delivers per-channel playback messages to webhooks and WebSocket subscribers

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

use crate::models::ChannelId;
use crate::services::{emit_event, EventSink, EVENT_NOTIFICATION};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Rate limited by webhook. Try again in {0:.1} seconds")]
    RateLimited(f64),

    #[error("Invalid webhook URL or webhook has been deleted")]
    Unauthorized,

    #[error("Webhook error ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Sink for user-facing playback messages
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: &ChannelId, message: &str, thumbnail_url: Option<&str>) -> Result<(), NotifyError>;
}

/// Pushes notifications to WebSocket subscribers through the event bus
pub struct EventNotifier {
    events: Arc<dyn EventSink>,
}

impl EventNotifier {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl Notifier for EventNotifier {
    async fn notify(&self, channel: &ChannelId, message: &str, thumbnail_url: Option<&str>) -> Result<(), NotifyError> {
        emit_event(
            self.events.as_ref(),
            EVENT_NOTIFICATION,
            &json!({
                "channelId": channel,
                "message": message,
                "thumbnailUrl": thumbnail_url,
            }),
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload {
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    embeds: Vec<WebhookEmbed>,
}

#[derive(Debug, Serialize)]
struct WebhookEmbed {
    image: WebhookImage,
}

#[derive(Debug, Serialize)]
struct WebhookImage {
    url: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    retry_after: f64,
}

/// Posts notifications to a Discord-compatible JSON webhook
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    username: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            username: username.into(),
        }
    }

    fn payload(&self, channel: &ChannelId, message: &str, thumbnail_url: Option<&str>) -> WebhookPayload {
        WebhookPayload {
            content: format!("**[{channel}]** {message}"),
            username: (!self.username.is_empty()).then(|| self.username.clone()),
            embeds: thumbnail_url
                .filter(|url| !url.is_empty())
                .map(|url| WebhookEmbed {
                    image: WebhookImage { url: url.to_string() },
                })
                .into_iter()
                .collect(),
        }
    }

    async fn handle_response(response: reqwest::Response) -> Result<(), NotifyError> {
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        match status.as_u16() {
            429 => {
                let rate_limit: RateLimitResponse = response.json().await?;
                log::warn!("Webhook rate limit hit, retry after {} seconds", rate_limit.retry_after);
                Err(NotifyError::RateLimited(rate_limit.retry_after))
            }
            401 | 403 | 404 => Err(NotifyError::Unauthorized),
            code => {
                let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
                Err(NotifyError::Rejected { status: code, body })
            }
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, channel: &ChannelId, message: &str, thumbnail_url: Option<&str>) -> Result<(), NotifyError> {
        let payload = self.payload(channel, message, thumbnail_url);
        let response = self.client.post(&self.url).json(&payload).send().await?;
        Self::handle_response(response).await
    }
}

/// Delivers to every inner notifier; the first failure is returned after all have run
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, channel: &ChannelId, message: &str, thumbnail_url: Option<&str>) -> Result<(), NotifyError> {
        let mut first_error = None;
        for target in &self.targets {
            if let Err(e) = target.notify(channel, message, thumbnail_url).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
