//! Delivery channel contract over an external chat transport
//!
//! [`DeliveryChannel`] adds bounded retries with exponential backoff, message
//! chunking, and idempotent edit/delete on top of a raw [`ChatTransport`].

pub mod chunk;
pub mod format;
pub mod telegram;

pub use chunk::{chunk_for_delivery, split_message, MAX_MESSAGE_LENGTH};
pub use format::render_alert;
pub use telegram::TelegramTransport;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::MessageId;

/// Inline link button attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub text: String,
    pub url: String,
}

/// Interactive controls attached to a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controls {
    #[serde(rename = "inline_keyboard")]
    pub rows: Vec<Vec<Button>>,
}

impl Controls {
    pub fn link(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            rows: vec![vec![Button {
                text: text.into(),
                url: url.into(),
            }]],
        }
    }
}

/// Raw chat client
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    async fn send_message(
        &self,
        text: &str,
        controls: Option<&Controls>,
    ) -> Result<MessageId, TransportError>;

    async fn edit_message(
        &self,
        message_id: MessageId,
        text: &str,
        controls: Option<&Controls>,
    ) -> Result<(), TransportError>;

    async fn delete_message(&self, message_id: MessageId) -> Result<(), TransportError>;

    async fn check_connection(&self) -> bool;
}

/// Failures reported by a chat transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Chat API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("Message content is unchanged")]
    NotModified,

    #[error("Message not found")]
    NotFound,

    #[error("Request timed out")]
    Timeout,
}

/// Delivery failed after exhausting all attempts
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: TransportError,
    },
}

/// Retry settings applied to every transport call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, at least one
    pub attempts: u32,
    /// Wait before retry `n` is `base_delay * 2^n`
    pub base_delay: Duration,
    /// Upper bound for a single transport call
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

/// Chat messages making up one delivered text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posted {
    pub message_id: MessageId,
    /// Parts after the first, in order
    pub follow_ups: Vec<MessageId>,
}

/// Retrying, chunking, idempotent wrapper over a chat transport
#[derive(Clone)]
pub struct DeliveryChannel {
    transport: Arc<dyn ChatTransport>,
    policy: RetryPolicy,
}

impl DeliveryChannel {
    pub fn new(transport: Arc<dyn ChatTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }

    /// Send `text`, split into parts when it exceeds the channel limit.
    ///
    /// Controls are attached to the final part only. When a later part
    /// fails, the parts already posted are deleted before the error is
    /// returned, so a failed send leaves nothing behind in the chat.
    pub async fn send(
        &self,
        text: &str,
        controls: Option<&Controls>,
    ) -> Result<Posted, DeliveryError> {
        let parts = chunk_for_delivery(text);
        let total = parts.len();
        let mut sent = Vec::with_capacity(total);

        for (i, part) in parts.iter().enumerate() {
            let part_controls = if i + 1 == total { controls } else { None };
            match self.send_part(part, part_controls).await {
                Ok(id) => {
                    tracing::debug!(
                        transport = self.transport.name(),
                        message_id = id,
                        part = i + 1,
                        total,
                        "Message part sent"
                    );
                    sent.push(id);
                }
                Err(e) => {
                    self.discard(&sent).await;
                    return Err(e);
                }
            }
        }

        let mut ids = sent.into_iter();
        // chunk_for_delivery never returns an empty list
        let message_id = ids.next().unwrap_or_default();
        Ok(Posted {
            message_id,
            follow_ups: ids.collect(),
        })
    }

    /// Replace the text of `message_id` and its `follow_ups`.
    ///
    /// "Unchanged content" counts as success. Existing follow-up messages are
    /// edited in place, missing ones are sent and surplus ones deleted.
    /// Returns the follow-up ids now belonging to the message. On failure the
    /// follow-ups sent by this call are deleted again and `follow_ups` stays
    /// valid.
    pub async fn edit(
        &self,
        message_id: MessageId,
        follow_ups: &[MessageId],
        text: &str,
        controls: Option<&Controls>,
    ) -> Result<Vec<MessageId>, DeliveryError> {
        let parts = chunk_for_delivery(text);
        let total = parts.len();
        let controls_for = |i: usize| if i + 1 == total { controls } else { None };

        self.edit_part(message_id, &parts[0], controls_for(0)).await?;

        let mut updated = Vec::with_capacity(total - 1);
        let mut fresh = Vec::new();
        for (i, part) in parts.iter().enumerate().skip(1) {
            let outcome = match follow_ups.get(i - 1) {
                Some(&id) => self.edit_part(id, part, controls_for(i)).await.map(|()| id),
                None => {
                    let sent = self.send_part(part, controls_for(i)).await;
                    if let Ok(id) = &sent {
                        fresh.push(*id);
                    }
                    sent
                }
            };

            match outcome {
                Ok(id) => updated.push(id),
                Err(e) => {
                    self.discard(&fresh).await;
                    return Err(e);
                }
            }
        }

        let surplus = follow_ups.get(updated.len()..).unwrap_or_default();
        self.discard(surplus).await;

        Ok(updated)
    }

    /// Delete `message_id`; a message that is already gone counts as deleted
    pub async fn delete(&self, message_id: MessageId) -> Result<(), DeliveryError> {
        let transport = &self.transport;
        self.with_retry(
            "delete",
            move || transport.delete_message(message_id),
            |e| match e {
                TransportError::NotFound => {
                    tracing::debug!(message_id, "Message already deleted");
                    Some(())
                }
                _ => None,
            },
        )
        .await
    }

    async fn send_part(&self, body: &str, controls: Option<&Controls>) -> Result<MessageId, DeliveryError> {
        let transport = &self.transport;
        self.with_retry("send", move || transport.send_message(body, controls), |_| None)
            .await
    }

    async fn edit_part(
        &self,
        message_id: MessageId,
        body: &str,
        controls: Option<&Controls>,
    ) -> Result<(), DeliveryError> {
        let transport = &self.transport;
        self.with_retry(
            "edit",
            move || transport.edit_message(message_id, body, controls),
            |e| match e {
                TransportError::NotModified => {
                    tracing::debug!(message_id, "Message unchanged, skipping edit");
                    Some(())
                }
                _ => None,
            },
        )
        .await
    }

    /// Best-effort removal of messages that no longer belong to an alert
    async fn discard(&self, ids: &[MessageId]) {
        for &id in ids {
            if let Err(e) = self.delete(id).await {
                tracing::warn!(message_id = id, error = %e, "Could not remove stray message part");
            }
        }
    }

    pub async fn check_connection(&self) -> bool {
        matches!(
            tokio::time::timeout(self.policy.timeout, self.transport.check_connection()).await,
            Ok(true)
        )
    }

    /// Run `call` up to `policy.attempts` times, sleeping `backoff(n)` between
    /// attempts. `absorb` maps transport errors that should count as success.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
        absorb: impl Fn(&TransportError) -> Option<T>,
    ) -> Result<T, DeliveryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 0;

        loop {
            let outcome = match tokio::time::timeout(self.policy.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => match absorb(&e) {
                    Some(value) => return Ok(value),
                    None => e,
                },
            };

            if attempt + 1 >= attempts {
                tracing::error!(
                    transport = self.transport.name(),
                    operation,
                    attempts,
                    error = %error,
                    "Delivery failed after all attempts"
                );
                return Err(DeliveryError::Exhausted {
                    operation,
                    attempts,
                    last: error,
                });
            }

            let wait = self.policy.backoff(attempt);
            tracing::warn!(
                transport = self.transport.name(),
                operation,
                attempt = attempt + 1,
                attempts,
                error = %error,
                "Delivery attempt failed, retrying in {:?}",
                wait
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{instant_channel, Call, Fail, FakeTransport};
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_send_retries_then_succeeds() {
        let transport = FakeTransport::new();
        transport.fail_sends(2, Fail::Api);
        let channel = instant_channel(transport.clone(), 3);

        let posted = channel.send("hello", None).await.unwrap();
        assert_eq!(posted.message_id, 101);
        assert!(posted.follow_ups.is_empty());
        assert_eq!(transport.sends().len(), 3);
    }

    #[tokio::test]
    async fn test_send_exhausts_attempts() {
        let transport = FakeTransport::new();
        transport.fail_sends(3, Fail::Api);
        let channel = instant_channel(transport.clone(), 3);

        let err = channel.send("hello", None).await.unwrap_err();
        let DeliveryError::Exhausted { attempts, .. } = err;
        assert_eq!(attempts, 3);
        assert_eq!(transport.sends().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let transport = FakeTransport::new();
        transport.fail_sends(2, Fail::Api);
        let channel = DeliveryChannel::new(transport.clone(), RetryPolicy::default());

        let started = tokio::time::Instant::now();
        channel.send("hello", None).await.unwrap();
        // 1s after the first failure, 2s after the second
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_long_send_puts_controls_on_final_part() {
        let transport = FakeTransport::new();
        let channel = instant_channel(transport.clone(), 1);
        let controls = Controls::link("Open", "https://example.com");

        let text = "z".repeat(5000);
        let posted = channel.send(&text, Some(&controls)).await.unwrap();
        assert_eq!(posted.message_id, 101);
        assert_eq!(posted.follow_ups, vec![102]);

        let sends = transport.sends();
        assert!(sends.len() >= 2);
        for (i, call) in sends.iter().enumerate() {
            let Call::Send { text, controls: c } = call else {
                unreachable!()
            };
            if i + 1 == sends.len() {
                assert_eq!(c.as_ref(), Some(&controls));
            } else {
                assert!(c.is_none());
            }
            if i > 0 {
                assert!(text.starts_with(&format!("📄 Part {}/{}", i + 1, sends.len())));
            }
        }
    }

    #[tokio::test]
    async fn test_edit_not_modified_is_success() {
        let transport = FakeTransport::new();
        transport.fail_edits(1, Fail::NotModified);
        let channel = instant_channel(transport.clone(), 3);

        assert_ok!(channel.edit(5, &[], "same", None).await);
        assert_eq!(transport.edits().len(), 1);
    }

    #[tokio::test]
    async fn test_edit_failure_propagates() {
        let transport = FakeTransport::new();
        transport.fail_edits(2, Fail::Api);
        let channel = instant_channel(transport.clone(), 2);

        assert_err!(channel.edit(5, &[], "new", None).await);
    }

    #[tokio::test]
    async fn test_delete_not_found_is_success() {
        let transport = FakeTransport::new();
        transport.fail_deletes(1, Fail::NotFound);
        let channel = instant_channel(transport.clone(), 3);

        assert_ok!(channel.delete(9).await);
        assert_eq!(transport.deletes(), vec![Call::Delete { message_id: 9 }]);
    }

    #[tokio::test]
    async fn test_long_edit_sends_follow_up_parts() {
        let transport = FakeTransport::new();
        let channel = instant_channel(transport.clone(), 1);

        let follow_ups = channel.edit(5, &[], &"q".repeat(5000), None).await.unwrap();
        assert_eq!(follow_ups, vec![101]);
        assert_eq!(transport.edits().len(), 1);
        assert_eq!(transport.sends().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_part_removes_parts_already_sent() {
        let transport = FakeTransport::new();
        transport.fail_send_after(1, Fail::Api);
        let channel = instant_channel(transport.clone(), 1);

        assert_err!(channel.send(&"w".repeat(9000), None).await);
        assert_eq!(transport.deletes(), vec![Call::Delete { message_id: 101 }]);

        // A second send posts a complete, fresh set of parts
        let posted = channel.send(&"w".repeat(9000), None).await.unwrap();
        assert_eq!(posted.message_id, 102);
        assert_eq!(posted.follow_ups, vec![103, 104]);
        assert_eq!(transport.deletes().len(), 1);
    }

    #[tokio::test]
    async fn test_edit_reuses_existing_follow_ups() {
        let transport = FakeTransport::new();
        let channel = instant_channel(transport.clone(), 1);

        let follow_ups = channel.edit(5, &[6, 7], &"e".repeat(9000), None).await.unwrap();
        assert_eq!(follow_ups, vec![6, 7]);
        assert_eq!(transport.edits().len(), 3);
        assert!(transport.sends().is_empty());
        assert!(transport.deletes().is_empty());
    }

    #[tokio::test]
    async fn test_shorter_edit_deletes_surplus_follow_ups() {
        let transport = FakeTransport::new();
        let channel = instant_channel(transport.clone(), 1);

        let follow_ups = channel.edit(5, &[6, 7], "short now", None).await.unwrap();
        assert!(follow_ups.is_empty());
        assert_eq!(
            transport.deletes(),
            vec![Call::Delete { message_id: 6 }, Call::Delete { message_id: 7 }]
        );
    }

    #[tokio::test]
    async fn test_failed_edit_removes_new_follow_ups() {
        let transport = FakeTransport::new();
        transport.fail_send_after(1, Fail::Api);
        let channel = instant_channel(transport.clone(), 1);

        assert_err!(channel.edit(5, &[], &"r".repeat(9000), None).await);
        assert_eq!(transport.deletes(), vec![Call::Delete { message_id: 101 }]);
    }
}
