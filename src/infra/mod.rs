//! Infrastructure adapters: durable stores, broker transports and replication.

pub mod replication;
pub mod store;
pub mod transport;

pub use replication::{apply_idempotently, LogReplicator, ReplicationOutcome, StreamReplicator};
pub use store::{
    FileEventRepository, FileUsageRepository, InMemoryEventRepository, InMemoryJobRepository,
    InMemoryUsageRepository,
};
pub use transport::{
    DirectEventStore, InMemoryLogTopic, InMemoryPubSub, LogEventStore, LogRecord, LogTopic, PubSub,
    StreamEventStore, Subscription,
};
