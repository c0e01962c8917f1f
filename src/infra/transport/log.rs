//! Partitioned log topic with consumer-group offsets.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::{EventSequence, EventStore, SchedulerError};

/// One record read back from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Partition the record lives in.
    pub partition: usize,
    /// Offset within the partition.
    pub offset: u64,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// A partitioned, append-only topic. Records with the same key land in the
/// same partition and keep their publish order.
#[async_trait]
pub trait LogTopic: Send + Sync {
    /// Append a record; returns once the broker acknowledged it.
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), SchedulerError>;
    /// Up to `max_records` records past the group's committed offsets.
    async fn fetch(&self, group: &str, max_records: usize) -> Result<Vec<LogRecord>, SchedulerError>;
    /// Mark `records` consumed for `group`.
    async fn commit(&self, group: &str, records: &[LogRecord]) -> Result<(), SchedulerError>;
}

/// In-process topic for development and tests.
pub struct InMemoryLogTopic {
    name: String,
    partitions: Vec<Mutex<Vec<Vec<u8>>>>,
    committed: Mutex<HashMap<(String, usize), u64>>,
}

impl InMemoryLogTopic {
    /// "Connect" to `topic` on `brokers`. An empty broker list is a startup error.
    pub fn connect(brokers: &[String], topic: &str, partitions: usize) -> Result<Self, SchedulerError> {
        if brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(SchedulerError::Startup(format!(
                "no brokers configured for topic {topic}"
            )));
        }
        tracing::info!(topic, ?brokers, partitions, "connected to log topic");
        Ok(Self {
            name: topic.to_string(),
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            committed: Mutex::new(HashMap::new()),
        })
    }

    /// Topic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        usize::try_from(hasher.finish() % self.partitions.len() as u64).unwrap_or_default()
    }

    /// Records not yet committed by `group`, across all partitions.
    pub fn lag(&self, group: &str) -> u64 {
        let committed = self.committed.lock();
        self.partitions
            .iter()
            .enumerate()
            .map(|(p, records)| {
                let end = records.lock().len() as u64;
                end - committed.get(&(group.to_string(), p)).copied().unwrap_or(0)
            })
            .sum()
    }
}

#[async_trait]
impl LogTopic for InMemoryLogTopic {
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), SchedulerError> {
        let partition = self.partition_for(key);
        self.partitions[partition].lock().push(payload);
        Ok(())
    }

    async fn fetch(&self, group: &str, max_records: usize) -> Result<Vec<LogRecord>, SchedulerError> {
        let committed = self.committed.lock().clone();
        let mut out = Vec::new();
        for (partition, records) in self.partitions.iter().enumerate() {
            let start = committed
                .get(&(group.to_string(), partition))
                .copied()
                .unwrap_or(0);
            let records = records.lock();
            for (offset, payload) in records
                .iter()
                .enumerate()
                .skip(usize::try_from(start).unwrap_or(usize::MAX))
                .take(max_records - out.len())
            {
                out.push(LogRecord {
                    partition,
                    offset: offset as u64,
                    payload: payload.clone(),
                });
            }
            if out.len() >= max_records {
                break;
            }
        }
        Ok(out)
    }

    async fn commit(&self, group: &str, records: &[LogRecord]) -> Result<(), SchedulerError> {
        let mut committed = self.committed.lock();
        for record in records {
            let next = committed.entry((group.to_string(), record.partition)).or_insert(0);
            *next = (*next).max(record.offset + 1);
        }
        Ok(())
    }
}

/// Appends by publishing to a log topic; a [`crate::infra::LogReplicator`]
/// applies the records to the read store.
pub struct LogEventStore {
    topic: Arc<dyn LogTopic>,
}

impl LogEventStore {
    /// Publish through `topic`.
    pub fn new(topic: Arc<dyn LogTopic>) -> Self {
        Self { topic }
    }
}

#[async_trait]
impl EventStore for LogEventStore {
    async fn append(&self, sequence: &EventSequence) -> Result<(), SchedulerError> {
        let key = format!("{}/{}", sequence.queue, sequence.job_set_id);
        let payload = serde_json::to_vec(sequence)?;
        self.topic.publish(&key, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_requires_brokers() {
        assert!(matches!(
            InMemoryLogTopic::connect(&[], "events", 2),
            Err(SchedulerError::Startup(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_advances_group_only() {
        let topic = InMemoryLogTopic::connect(&["localhost:9092".into()], "events", 3).unwrap();
        for i in 0..5 {
            topic.publish(&format!("k{i}"), vec![i]).await.unwrap();
        }
        let batch = topic.fetch("a", 10).await.unwrap();
        assert_eq!(batch.len(), 5);
        topic.commit("a", &batch).await.unwrap();

        assert!(topic.fetch("a", 10).await.unwrap().is_empty());
        assert_eq!(topic.fetch("b", 10).await.unwrap().len(), 5);
        assert_eq!(topic.lag("a"), 0);
        assert_eq!(topic.lag("b"), 5);
    }

    #[tokio::test]
    async fn test_same_key_keeps_order() {
        let topic = InMemoryLogTopic::connect(&["b1".into()], "events", 4).unwrap();
        for i in 0..4u8 {
            topic.publish("q/set", vec![i]).await.unwrap();
        }
        let payloads: Vec<u8> = topic
            .fetch("g", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.payload[0])
            .collect();
        assert_eq!(payloads, vec![0, 1, 2, 3]);
    }
}
