//! Event store backends and the broker transports behind them.

pub mod log;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{EventRepository, EventSequence, EventStore, SchedulerError};

pub use log::{InMemoryLogTopic, LogEventStore, LogRecord, LogTopic};
pub use stream::{InMemoryPubSub, PubSub, StreamEventStore, Subscription};

/// Appends straight into the read store; reads see writes immediately.
pub struct DirectEventStore {
    repository: Arc<dyn EventRepository>,
}

impl DirectEventStore {
    /// Write through to `repository`.
    pub fn new(repository: Arc<dyn EventRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl EventStore for DirectEventStore {
    async fn append(&self, sequence: &EventSequence) -> Result<(), SchedulerError> {
        self.repository.apply(sequence).await.map(|_| ())
    }
}
