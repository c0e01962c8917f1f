//! Tests for builder modules

use std::sync::Arc;

use batchlease::builders::{build_event_backend, in_memory_log, in_memory_stream, Replication};
use batchlease::config::{EventBackendConfig, StreamBackendConfig};
use batchlease::core::{EventRepository, SchedulerError};
use batchlease::infra::InMemoryEventRepository;

fn repository() -> Arc<dyn EventRepository> {
    Arc::new(InMemoryEventRepository::new())
}

#[tokio::test]
async fn test_direct_backend_needs_no_replication() {
    let backend = build_event_backend(
        &EventBackendConfig::Direct,
        repository(),
        10,
        in_memory_log,
        in_memory_stream,
    )
    .await
    .unwrap();
    assert!(matches!(backend.replication, Replication::None));
}

#[tokio::test]
async fn test_stream_backend_subscribes_at_build_time() {
    let cfg = EventBackendConfig::Stream(StreamBackendConfig {
        servers: vec!["nats://localhost:4222".into()],
        subject: "events".into(),
        queue_group: "replicator".into(),
    });
    let backend = build_event_backend(&cfg, repository(), 10, in_memory_log, in_memory_stream)
        .await
        .unwrap();
    assert!(matches!(backend.replication, Replication::Streamed(_)));
}

#[tokio::test]
async fn test_invalid_backend_is_startup_error() {
    let cfg = EventBackendConfig::Stream(StreamBackendConfig {
        servers: vec![],
        subject: "events".into(),
        queue_group: "replicator".into(),
    });
    let result = build_event_backend(&cfg, repository(), 10, in_memory_log, in_memory_stream).await;
    assert!(matches!(result, Err(SchedulerError::Startup(_))));
}
