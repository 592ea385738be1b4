//! Telegram Bot API transport

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{ChatTransport, Controls, TransportError};
use crate::config::TelegramConfig;
use crate::model::MessageId;

/// Chat transport posting to a single Telegram chat
#[derive(Debug, Clone)]
pub struct TelegramTransport {
    client: reqwest::Client,
    base_url: String,
    chat_id: i64,
    parse_mode: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: MessageId,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    #[serde(default)]
    username: Option<String>,
}

/// Map a Bot API error description onto the transport taxonomy
fn classify_error(code: i64, description: &str) -> TransportError {
    let lower = description.to_ascii_lowercase();
    if lower.contains("message is not modified") {
        TransportError::NotModified
    } else if lower.contains("message to delete not found") {
        TransportError::NotFound
    } else {
        TransportError::Api {
            code,
            description: description.to_string(),
        }
    }
}

impl TelegramTransport {
    pub fn new(config: &TelegramConfig, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: format!(
                "{}/bot{}",
                config.api_url.trim_end_matches('/'),
                config.bot_token
            ),
            chat_id: config.chat_id,
            parse_mode: config.parse_mode.clone(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, TransportError> {
        let url = format!("{}/{}", self.base_url, method);

        // The Bot API reports failures as JSON bodies on non-2xx statuses.
        let response: ApiResponse<T> = self.client.post(&url).json(&body).send().await?.json().await?;

        if response.ok {
            if let Some(result) = response.result {
                return Ok(result);
            }
        }

        Err(classify_error(
            response.error_code.unwrap_or_default(),
            response.description.as_deref().unwrap_or("unknown error"),
        ))
    }

    fn message_body(&self, text: &str, controls: Option<&Controls>) -> serde_json::Value {
        let mut body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": self.parse_mode,
            "disable_web_page_preview": true,
        });
        if let Some(controls) = controls {
            body["reply_markup"] = serde_json::json!(controls);
        }
        body
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send_message(
        &self,
        text: &str,
        controls: Option<&Controls>,
    ) -> Result<MessageId, TransportError> {
        let sent: SentMessage = self
            .call("sendMessage", self.message_body(text, controls))
            .await?;
        tracing::debug!(chat_id = self.chat_id, message_id = sent.message_id, "Message sent");
        Ok(sent.message_id)
    }

    async fn edit_message(
        &self,
        message_id: MessageId,
        text: &str,
        controls: Option<&Controls>,
    ) -> Result<(), TransportError> {
        let mut body = self.message_body(text, controls);
        body["message_id"] = serde_json::json!(message_id);

        // editMessageText answers with the edited message (or `true` for
        // inline messages); only success matters here.
        let _: serde_json::Value = self.call("editMessageText", body).await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<(), TransportError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "message_id": message_id,
        });
        let _: bool = self.call("deleteMessage", body).await?;
        Ok(())
    }

    async fn check_connection(&self) -> bool {
        match self.call::<BotUser>("getMe", serde_json::json!({})).await {
            Ok(me) => {
                tracing::debug!(username = ?me.username, "Connected to Telegram");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Telegram connection check failed");
                false
            }
        }
    }
}
