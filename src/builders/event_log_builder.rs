//! Builds the configured event log backend and its replication pipeline.

use std::sync::Arc;

use crate::config::{EventBackendConfig, LogBackendConfig, StreamBackendConfig};
use crate::core::{EventLog, EventRepository, SchedulerError};
use crate::infra::{
    DirectEventStore, LogEventStore, LogReplicator, LogTopic, PubSub, StreamEventStore,
    StreamReplicator,
};

/// Replication work the chosen backend needs running in the background.
pub enum Replication {
    /// Direct backend: nothing to replicate.
    None,
    /// Poll a log topic on a fixed interval.
    Polled {
        /// The replicator to tick.
        replicator: LogReplicator,
        /// Poll interval.
        interval: std::time::Duration,
    },
    /// Consume a push subscription until shutdown.
    Streamed(StreamReplicator),
}

/// An assembled event backend.
pub struct EventBackend {
    /// Append/read facade.
    pub log: EventLog,
    /// Background replication to start.
    pub replication: Replication,
}

/// Build the event backend selected by `cfg`, connecting through the given
/// factories. Connection failures surface as [`SchedulerError::Startup`].
pub async fn build_event_backend<FL, FS>(
    cfg: &EventBackendConfig,
    repository: Arc<dyn EventRepository>,
    replication_batch: usize,
    log_factory: FL,
    stream_factory: FS,
) -> Result<EventBackend, SchedulerError>
where
    FL: FnOnce(&LogBackendConfig) -> Result<Arc<dyn LogTopic>, SchedulerError>,
    FS: FnOnce(&StreamBackendConfig) -> Result<Arc<dyn PubSub>, SchedulerError>,
{
    cfg.validate()
        .map_err(|e| SchedulerError::Startup(format!("event backend invalid: {e}")))?;

    match cfg {
        EventBackendConfig::Direct => {
            tracing::info!("using direct event store");
            Ok(EventBackend {
                log: EventLog::new(Arc::new(DirectEventStore::new(repository.clone())), repository),
                replication: Replication::None,
            })
        }
        EventBackendConfig::Log(log_cfg) => {
            let topic = log_factory(log_cfg)?;
            tracing::info!(topic = %log_cfg.topic, group = %log_cfg.consumer_group, "using log event store");
            let replicator = LogReplicator::new(
                Arc::clone(&topic),
                log_cfg.consumer_group.clone(),
                Arc::clone(&repository),
                replication_batch,
            );
            Ok(EventBackend {
                log: EventLog::new(Arc::new(LogEventStore::new(topic)), repository),
                replication: Replication::Polled {
                    replicator,
                    interval: std::time::Duration::from_millis(log_cfg.poll_interval_ms),
                },
            })
        }
        EventBackendConfig::Stream(stream_cfg) => {
            let pubsub = stream_factory(stream_cfg)?;
            let subscription = pubsub
                .subscribe(&stream_cfg.subject, &stream_cfg.queue_group)
                .await
                .map_err(|e| SchedulerError::Startup(format!("subscribe failed: {e}")))?;
            tracing::info!(subject = %stream_cfg.subject, group = %stream_cfg.queue_group, "using stream event store");
            Ok(EventBackend {
                log: EventLog::new(
                    Arc::new(StreamEventStore::new(pubsub, stream_cfg.subject.clone())),
                    Arc::clone(&repository),
                ),
                replication: Replication::Streamed(StreamReplicator::new(
                    subscription,
                    repository,
                    replication_batch,
                )),
            })
        }
    }
}

/// Connect the in-process log topic described by `cfg`.
pub fn in_memory_log(cfg: &LogBackendConfig) -> Result<Arc<dyn LogTopic>, SchedulerError> {
    Ok(Arc::new(crate::infra::InMemoryLogTopic::connect(
        &cfg.brokers,
        &cfg.topic,
        cfg.partitions,
    )?))
}

/// Connect the in-process pub/sub described by `cfg`.
pub fn in_memory_stream(cfg: &StreamBackendConfig) -> Result<Arc<dyn PubSub>, SchedulerError> {
    Ok(Arc::new(crate::infra::InMemoryPubSub::connect(&cfg.servers)?))
}
