//! Push-based pub/sub transport with queue-group subscriptions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::{EventSequence, EventStore, SchedulerError};

const SUBSCRIPTION_BUFFER: usize = 1024;

/// A live subscription. Dropping or closing it stops delivery.
pub struct Subscription {
    subject: String,
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl Subscription {
    /// Build a subscription around a delivery channel.
    pub fn new(subject: impl Into<String>, receiver: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            receiver,
        }
    }

    /// Next message, or `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }

    /// A message that is already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.try_recv().ok()
    }

    /// Stop accepting new messages. Buffered ones can still be drained.
    pub fn close(&mut self) {
        self.receiver.close();
        tracing::debug!(subject = %self.subject, "subscription closed");
    }

    /// Subject this subscription listens on.
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Subject-based publish/subscribe. Each message goes to one member of every
/// queue group subscribed to its subject.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish; returns once the server accepted the message.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), SchedulerError>;
    /// Join `queue_group` on `subject`.
    async fn subscribe(&self, subject: &str, queue_group: &str) -> Result<Subscription, SchedulerError>;
}

type Groups = HashMap<String, HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>;

/// In-process pub/sub for development and tests.
pub struct InMemoryPubSub {
    groups: Mutex<Groups>,
    cursor: Mutex<usize>,
}

impl InMemoryPubSub {
    /// "Connect" to `servers`. An empty server list is a startup error.
    pub fn connect(servers: &[String]) -> Result<Self, SchedulerError> {
        if servers.iter().all(|s| s.trim().is_empty()) {
            return Err(SchedulerError::Startup("no pub/sub servers configured".into()));
        }
        tracing::info!(?servers, "connected to pub/sub");
        Ok(Self {
            groups: Mutex::new(HashMap::new()),
            cursor: Mutex::new(0),
        })
    }

    /// Open subscriptions on `subject`, across all groups.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.groups.lock().get(subject).map_or(0, |groups| {
            groups
                .values()
                .flatten()
                .filter(|tx| !tx.is_closed())
                .count()
        })
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), SchedulerError> {
        let targets: Vec<mpsc::Sender<Vec<u8>>> = {
            let mut groups = self.groups.lock();
            let mut cursor = self.cursor.lock();
            *cursor = cursor.wrapping_add(1);
            groups
                .get_mut(subject)
                .map(|groups| {
                    groups
                        .values_mut()
                        .filter_map(|members| {
                            members.retain(|tx| !tx.is_closed());
                            if members.is_empty() {
                                None
                            } else {
                                Some(members[*cursor % members.len()].clone())
                            }
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        for target in targets {
            if target.send(payload.clone()).await.is_err() {
                tracing::debug!(subject, "subscriber went away during publish");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str, queue_group: &str) -> Result<Subscription, SchedulerError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.groups
            .lock()
            .entry(subject.to_string())
            .or_default()
            .entry(queue_group.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(subject, rx))
    }
}

/// Appends by publishing to a pub/sub subject; a
/// [`crate::infra::StreamReplicator`] applies them to the read store.
pub struct StreamEventStore {
    pubsub: Arc<dyn PubSub>,
    subject: String,
}

impl StreamEventStore {
    /// Publish on `subject` through `pubsub`.
    pub fn new(pubsub: Arc<dyn PubSub>, subject: impl Into<String>) -> Self {
        Self {
            pubsub,
            subject: subject.into(),
        }
    }
}

#[async_trait]
impl EventStore for StreamEventStore {
    async fn append(&self, sequence: &EventSequence) -> Result<(), SchedulerError> {
        let payload = serde_json::to_vec(sequence)?;
        self.pubsub.publish(&self.subject, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_requires_servers() {
        assert!(matches!(
            InMemoryPubSub::connect(&[" ".into()]),
            Err(SchedulerError::Startup(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_group_gets_one_copy() {
        let pubsub = InMemoryPubSub::connect(&["nats://localhost:4222".into()]).unwrap();
        let mut first = pubsub.subscribe("events", "replicator").await.unwrap();
        let mut second = pubsub.subscribe("events", "replicator").await.unwrap();
        let mut audit = pubsub.subscribe("events", "audit").await.unwrap();

        pubsub.publish("events", b"one".to_vec()).await.unwrap();

        let delivered = usize::from(first.try_recv().is_some()) + usize::from(second.try_recv().is_some());
        assert_eq!(delivered, 1);
        assert_eq!(audit.try_recv().as_deref(), Some(&b"one"[..]));
    }

    #[tokio::test]
    async fn test_closed_subscription_stops_delivery() {
        let pubsub = InMemoryPubSub::connect(&["s1".into()]).unwrap();
        let mut sub = pubsub.subscribe("events", "g").await.unwrap();
        assert_eq!(pubsub.subscriber_count("events"), 1);
        sub.close();
        assert_eq!(pubsub.subscriber_count("events"), 0);
        pubsub.publish("events", vec![1]).await.unwrap();
        assert!(sub.recv().await.is_none());
    }
}
