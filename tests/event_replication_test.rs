//! Integration tests for the three event log backends and replication.
//!
//! Covers read-after-write on the direct backend, eventual visibility on the
//! log backend, exactly-once effect of redelivered stream messages, and
//! start-up failures when no broker is configured.

use std::sync::Arc;
use std::time::Duration;

use batchlease::config::{
    EventBackendConfig, LogBackendConfig, SchedulerConfig, StreamBackendConfig,
};
use batchlease::core::{
    ComputeResources, EventPosition, EventScope, EventSequence, Queue, QueueRepository,
    SchedulerError,
};
use batchlease::infra::{
    InMemoryEventRepository, InMemoryJobRepository, InMemoryLogTopic, InMemoryPubSub,
    InMemoryUsageRepository, LogTopic, PubSub,
};
use batchlease::runtime::{start, start_with, JobSubmission, Repositories, ServerHandle};
use batchlease::util::JobId;

// ============================================================================
// HELPERS
// ============================================================================

async fn repositories() -> Repositories {
    let jobs = Arc::new(InMemoryJobRepository::new());
    jobs.create_queue(Queue::new("a")).await.unwrap();
    Repositories {
        jobs: jobs.clone(),
        queues: jobs,
        usage: Arc::new(InMemoryUsageRepository::new()),
        events: Arc::new(InMemoryEventRepository::new()),
    }
}

fn one_cpu() -> JobSubmission {
    JobSubmission {
        priority: 0,
        requests: ComputeResources::from_units([("cpu", 1)]),
    }
}

async fn job_event_count(server: &ServerHandle, job_id: JobId) -> usize {
    server
        .jobs
        .read_events(&EventScope::Job(job_id), EventPosition::START, 100)
        .await
        .unwrap()
        .events
        .len()
}

async fn wait_for_events(server: &ServerHandle, job_id: JobId, expected: usize) {
    for _ in 0..200 {
        if job_event_count(server, job_id).await >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached {expected} events");
}

fn log_config() -> LogBackendConfig {
    LogBackendConfig {
        brokers: vec!["localhost:9092".into()],
        topic: "job-events".into(),
        consumer_group: "replicator".into(),
        partitions: 3,
        poll_interval_ms: 10,
    }
}

fn stream_config() -> StreamBackendConfig {
    StreamBackendConfig {
        servers: vec!["nats://localhost:4222".into()],
        subject: "job-events".into(),
        queue_group: "replicator".into(),
    }
}

// ============================================================================
// DIRECT
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_direct_backend_reads_its_writes() {
    let server = start(&SchedulerConfig::default(), repositories().await).await.unwrap();
    let ids = server
        .jobs
        .submit_jobs("amy", "a", "set", vec![one_cpu(), one_cpu(), one_cpu()])
        .await
        .unwrap();
    for id in &ids {
        assert_eq!(job_event_count(&server, *id).await, 1);
    }

    let first = server
        .events
        .read_from(&EventScope::Queue("a".into()), EventPosition::START, 2)
        .await
        .unwrap();
    assert_eq!(first.events.len(), 2);
    let rest = server
        .events
        .read_to_end(&EventScope::Queue("a".into()), first.next, 2)
        .await
        .unwrap();
    assert_eq!(rest.events.len(), 1);
    assert!(server.shutdown().await);
}

// ============================================================================
// LOG
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_log_backend_replicates_and_ignores_replays() {
    let topic = Arc::new(InMemoryLogTopic::connect(&["localhost:9092".into()], "job-events", 3).unwrap());
    let handle: Arc<dyn LogTopic> = topic.clone();
    let config = SchedulerConfig {
        events: EventBackendConfig::Log(log_config()),
        ..SchedulerConfig::default()
    };
    let server = start_with(
        &config,
        repositories().await,
        move |_| Ok(handle),
        batchlease::builders::in_memory_stream,
    )
    .await
    .unwrap();

    let ids = server.jobs.submit_jobs("amy", "a", "set", vec![one_cpu()]).await.unwrap();
    wait_for_events(&server, ids[0], 1).await;

    let stored = server
        .jobs
        .read_events(&EventScope::Job(ids[0]), EventPosition::START, 10)
        .await
        .unwrap();
    let mut replay = EventSequence::new("a", "set", "amy");
    replay.events = stored.events.into_iter().map(|e| e.event).collect();
    topic
        .publish("a/set", serde_json::to_vec(&replay).unwrap())
        .await
        .unwrap();
    for _ in 0..200 {
        if topic.lag("replicator") == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(topic.lag("replicator"), 0);
    assert_eq!(job_event_count(&server, ids[0]).await, 1);
    assert!(server.shutdown().await);
}

// ============================================================================
// STREAM
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_redelivery_is_applied_once() {
    let pubsub = Arc::new(InMemoryPubSub::connect(&["nats://localhost:4222".into()]).unwrap());
    let handle: Arc<dyn PubSub> = pubsub.clone();
    let config = SchedulerConfig {
        events: EventBackendConfig::Stream(stream_config()),
        ..SchedulerConfig::default()
    };
    let server = start_with(
        &config,
        repositories().await,
        batchlease::builders::in_memory_log,
        move |_| Ok(handle),
    )
    .await
    .unwrap();

    let ids = server.jobs.submit_jobs("amy", "a", "set", vec![one_cpu()]).await.unwrap();
    let job = ids[0];
    wait_for_events(&server, job, 1).await;
    assert!(server.jobs.cancel_job("amy", job).await.unwrap());
    wait_for_events(&server, job, 2).await;

    let stored = server
        .jobs
        .read_events(&EventScope::Job(job), EventPosition::START, 10)
        .await
        .unwrap();
    let mut redelivery = EventSequence::new("a", "set", "amy");
    redelivery.events = stored.events.into_iter().map(|e| e.event).collect();
    let payload = serde_json::to_vec(&redelivery).unwrap();
    pubsub.publish("job-events", payload.clone()).await.unwrap();
    pubsub.publish("job-events", payload).await.unwrap();

    // Messages are applied in order, so once the marker job is visible the
    // redeliveries before it have been processed.
    let marker = server.jobs.submit_jobs("amy", "a", "marker", vec![one_cpu()]).await.unwrap();
    wait_for_events(&server, marker[0], 1).await;

    assert_eq!(job_event_count(&server, job).await, 2);
    assert!(server.shutdown().await);
    assert_eq!(pubsub.subscriber_count("job-events"), 0);
}

// ============================================================================
// STARTUP
// ============================================================================

#[tokio::test]
async fn test_empty_broker_list_fails_startup() {
    let config = SchedulerConfig {
        events: EventBackendConfig::Log(LogBackendConfig {
            brokers: Vec::new(),
            ..log_config()
        }),
        ..SchedulerConfig::default()
    };
    let err = start(&config, repositories().await).await.err().unwrap();
    assert!(matches!(
        err.downcast_ref::<SchedulerError>(),
        Some(SchedulerError::Startup(_))
    ));
}

#[tokio::test]
async fn test_unreachable_stream_fails_startup() {
    let config = SchedulerConfig {
        events: EventBackendConfig::Stream(stream_config()),
        ..SchedulerConfig::default()
    };
    let result = start_with(
        &config,
        repositories().await,
        batchlease::builders::in_memory_log,
        |_| Err(SchedulerError::Startup("connection refused".into())),
    )
    .await;
    let err = result.err().unwrap();
    assert!(err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<SchedulerError>(), Some(SchedulerError::Startup(_)))));
}
