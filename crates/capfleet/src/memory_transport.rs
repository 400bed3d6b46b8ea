//! In-process broker implementing the [`Transport`] trait.
//!
//! Keeps the broker semantics the cluster relies on (subject wildcards,
//! queue-group competing consumers, request/reply via reply inboxes)
//! runnable without an external server. Used by tests and local development.

use crate::transport::{Subscription, Transport, TransportError, TransportMessage};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 256;

/// In-memory broker. Cloning shares the same broker state.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    plain: Vec<PlainSub>,
    groups: Vec<GroupSub>,
    inbox_seq: u64,
}

struct PlainSub {
    pattern: String,
    tx: mpsc::Sender<TransportMessage>,
}

struct GroupSub {
    pattern: String,
    group: String,
    members: Vec<mpsc::Sender<TransportMessage>>,
    next: usize,
}

/// Match a subject against a subscription pattern.
///
/// `*` matches exactly one token, a trailing `>` matches one or more
/// remaining tokens.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subj = subject.split('.');
    let mut pat = pattern.split('.').peekable();

    loop {
        match (pat.next(), subj.next()) {
            (Some(">"), Some(_)) => return true,
            (Some(p), Some(s)) => {
                if p != "*" && p != s {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to every matching plain subscriber and one member of every
    /// matching queue group. Returns the number of deliveries.
    fn deliver(&self, subject: &str, payload: &Bytes, reply: Option<&str>) -> usize {
        let mut state = self.state.lock().expect("broker lock poisoned");
        let mut delivered = 0;

        state.plain.retain(|sub| !sub.tx.is_closed());
        for sub in &state.plain {
            if subject_matches(&sub.pattern, subject) {
                let msg = TransportMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    reply: reply.map(String::from),
                };
                match sub.tx.try_send(msg) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Subscriber buffer full on {}, message dropped", subject);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }

        for group in &mut state.groups {
            if !subject_matches(&group.pattern, subject) {
                continue;
            }
            // Round-robin within the group, skipping members that went away.
            while !group.members.is_empty() {
                let idx = group.next % group.members.len();
                let msg = TransportMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    reply: reply.map(String::from),
                };
                match group.members[idx].try_send(msg) {
                    Ok(()) => {
                        group.next = idx + 1;
                        delivered += 1;
                        break;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Queue member buffer full on {}, message dropped", subject);
                        group.next = idx + 1;
                        delivered += 1;
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        group.members.remove(idx);
                    }
                }
            }
        }
        state.groups.retain(|g| !g.members.is_empty());

        delivered
    }

    fn add_plain(&self, pattern: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut state = self.state.lock().expect("broker lock poisoned");
        state.plain.push(PlainSub {
            pattern: pattern.to_string(),
            tx,
        });
        Subscription::new(rx)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.deliver(subject, &payload, None);
        Ok(())
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.deliver(subject, &payload, Some(reply));
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        let inbox = {
            let mut state = self.state.lock().expect("broker lock poisoned");
            state.inbox_seq += 1;
            format!("capfleet._inbox.{}", state.inbox_seq)
        };
        let mut sub = self.add_plain(&inbox);

        if self.deliver(subject, &payload, Some(&inbox)) == 0 {
            return Err(TransportError::NoResponders);
        }

        let msg = tokio::time::timeout(timeout, sub.next())
            .await
            .map_err(|_| TransportError::Timeout)?
            .ok_or(TransportError::Timeout)?;
        Ok(msg.payload)
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError> {
        Ok(self.add_plain(subject))
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut state = self.state.lock().expect("broker lock poisoned");
        if let Some(existing) = state
            .groups
            .iter_mut()
            .find(|g| g.pattern == subject && g.group == group)
        {
            existing.members.push(tx);
        } else {
            state.groups.push(GroupSub {
                pattern: subject.to_string(),
                group: group.to_string(),
                members: vec![tx],
                next: 0,
            });
        }
        Ok(Subscription::new(rx))
    }
}
