//! Broker transport layer for cluster communication.
//!
//! Provides subject helpers, a broker-agnostic [`Transport`] trait, and the
//! NATS implementation used in production. Routing topology is dynamic:
//! task subjects are derived from caller-supplied model names at runtime,
//! never from a static enumeration of models.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

// ---------------------------------------------------------------------------
// Subject helpers
// ---------------------------------------------------------------------------

const PREFIX: &str = "capfleet";

/// Queue group shared by all workers consuming a model's task subject.
/// Tasks distribute competitively among the group's members.
pub const TASK_QUEUE_GROUP: &str = "workers";

/// Wildcard subject matching every worker heartbeat.
pub const SUBJECT_HEARTBEAT_WILDCARD: &str = "capfleet.heartbeat.>";

/// Encode a free-form model name into a single subject token.
///
/// Model names are caller-supplied strings (`Salesforce/blip-base`) that may
/// contain characters illegal in subject tokens. The token keeps a sanitized
/// prefix for readability and appends an FNV-1a hash of the raw name so that
/// distinct names never collide.
pub fn encode_model_token(model_id: &str) -> String {
    let sanitized: String = model_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{:08x}", sanitized, fnv1a(model_id.as_bytes()))
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Subject carrying tasks for one model (queue-subscribed by workers).
pub fn subject_task(model_id: &str) -> String {
    format!("{PREFIX}.task.{}", encode_model_token(model_id))
}

/// Subject for a control operation on a specific worker (request/reply).
pub fn subject_control(worker_id: &str, op: &str) -> String {
    format!("{PREFIX}.ctrl.{worker_id}.{op}")
}

/// Wildcard subject for all control operations on a specific worker.
pub fn subject_control_wildcard(worker_id: &str) -> String {
    format!("{PREFIX}.ctrl.{worker_id}.>")
}

/// Subject for one worker's heartbeats (pub).
pub fn subject_heartbeat(worker_id: &str) -> String {
    format!("{PREFIX}.heartbeat.{worker_id}")
}

/// Result inbox subject for one coordinator instance. Tasks carry this as
/// their reply address; workers publish results here.
pub fn subject_results(inbox: &str) -> String {
    format!("{PREFIX}.result.{inbox}")
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// A message delivered by a [`Transport`] subscription.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Reply address for request/reply correlation, when the publisher set one.
    pub reply: Option<String>,
}

/// A stream of messages for one subscription. Dropping the subscription
/// cancels it.
pub struct Subscription {
    rx: mpsc::Receiver<TransportMessage>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<TransportMessage>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<TransportMessage> {
        self.rx.recv().await
    }
}

/// Broker abstraction: durable-enough named subjects, dynamic subject
/// creation, request/reply correlation via reply addresses, and competing
/// consumers via queue groups.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Publish with an explicit reply address (used for task fan-out, where
    /// the response is correlated later by an id inside the payload).
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    /// Send a request and await the correlated response.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, TransportError>;

    /// Subscribe to a subject (supports `*` and trailing `>` wildcards).
    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError>;

    /// Subscribe as a member of a queue group: each message on the subject
    /// goes to exactly one member of the group.
    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<Subscription, TransportError>;
}

/// Shared transport handle.
pub type SharedTransport = Arc<dyn Transport>;

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("serialization failed: {0}")]
    Serialize(serde_json::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(serde_json::Error),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("no responders on subject")]
    NoResponders,
    #[error("request timed out")]
    Timeout,
}

// ---------------------------------------------------------------------------
// JSON convenience wrappers
// ---------------------------------------------------------------------------

/// Publish a JSON payload (fire-and-forget).
pub async fn publish_json<T: Serialize>(
    transport: &dyn Transport,
    subject: &str,
    payload: &T,
) -> Result<(), TransportError> {
    let bytes = serde_json::to_vec(payload).map_err(TransportError::Serialize)?;
    transport.publish(subject, bytes.into()).await
}

/// Send a JSON request and await a JSON response (request/reply pattern).
pub async fn request_json<Req: Serialize, Resp: DeserializeOwned>(
    transport: &dyn Transport,
    subject: &str,
    payload: &Req,
    timeout: Duration,
) -> Result<Resp, TransportError> {
    let bytes = serde_json::to_vec(payload).map_err(TransportError::Serialize)?;
    let resp = transport.request(subject, bytes.into(), timeout).await?;
    serde_json::from_slice(&resp).map_err(TransportError::Deserialize)
}

// ---------------------------------------------------------------------------
// NATS implementation
// ---------------------------------------------------------------------------

/// Internal channel buffer between the broker client and a [`Subscription`].
const CHANNEL_CAPACITY: usize = 256;

/// Production transport over a NATS server.
pub struct NatsTransport {
    client: async_nats::Client,
}

impl NatsTransport {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    fn forward(mut sub: async_nats::Subscriber) -> Subscription {
        use futures_util::StreamExt;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let out = TransportMessage {
                    subject: msg.subject.to_string(),
                    payload: msg.payload,
                    reply: msg.reply.map(|r| r.to_string()),
                };
                if tx.send(out).await.is_err() {
                    // Receiver dropped; unsubscribe and stop forwarding.
                    if let Err(e) = sub.unsubscribe().await {
                        warn!("Unsubscribe failed: {}", e);
                    }
                    break;
                }
            }
        });
        Subscription::new(rx)
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.client
            .publish_with_reply(subject.to_string(), reply.to_string(), payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        let resp = tokio::time::timeout(timeout, self.client.request(subject.to_string(), payload))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| match e.kind() {
                async_nats::RequestErrorKind::NoResponders => TransportError::NoResponders,
                async_nats::RequestErrorKind::TimedOut => TransportError::Timeout,
                _ => TransportError::Request(e.to_string()),
            })?;
        Ok(resp.payload)
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError> {
        let sub = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        Ok(Self::forward(sub))
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<Subscription, TransportError> {
        let sub = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        Ok(Self::forward(sub))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_task_encodes_model_name() {
        let subject = subject_task("Salesforce/blip-image-captioning-base");
        assert!(subject.starts_with("capfleet.task.Salesforce_blip-image-captioning-base-"));
        // No illegal token characters survive.
        let token = subject.strip_prefix("capfleet.task.").unwrap();
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_encode_model_token_deterministic() {
        assert_eq!(
            encode_model_token("microsoft/git-base"),
            encode_model_token("microsoft/git-base")
        );
    }

    #[test]
    fn test_encode_model_token_distinguishes_collapsed_names() {
        // Both sanitize to the same prefix; the hash suffix must differ.
        let a = encode_model_token("org/model");
        let b = encode_model_token("org.model");
        assert_ne!(a, b);
    }

    #[test]
    fn test_subject_control() {
        assert_eq!(
            subject_control("w1", "download"),
            "capfleet.ctrl.w1.download"
        );
        assert_eq!(subject_control("w1", "delete"), "capfleet.ctrl.w1.delete");
    }

    #[test]
    fn test_subject_control_wildcard() {
        assert_eq!(subject_control_wildcard("w1"), "capfleet.ctrl.w1.>");
    }

    #[test]
    fn test_subject_heartbeat() {
        assert_eq!(subject_heartbeat("w0"), "capfleet.heartbeat.w0");
    }

    #[test]
    fn test_subject_results() {
        assert_eq!(subject_results("abc123"), "capfleet.result.abc123");
    }

    #[test]
    fn test_fnv1a_known_vector() {
        // FNV-1a 32-bit of empty input is the offset basis.
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
    }
}
