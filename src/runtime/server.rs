//! Server assembly: wires stores, event backend, lease manager and background
//! tasks from a [`SchedulerConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::builders::{build_event_backend, EventBackend, Replication};
use crate::config::{LogBackendConfig, SchedulerConfig, StreamBackendConfig};
use crate::core::{
    AppResult, ClusterSnapshotProvider, ClusterUtilisationService, EventLog, EventRepository,
    FairShareEngine, JobRepository, LeaseManager, QueueRepository, SchedulerError, UsageClient,
    UsageRepository, UsageService,
};
use crate::infra::{LogTopic, PubSub};
use crate::runtime::{BackgroundTaskManager, JobService};

/// Durable stores the server runs against.
#[derive(Clone)]
pub struct Repositories {
    /// Job records.
    pub jobs: Arc<dyn JobRepository>,
    /// Queue definitions.
    pub queues: Arc<dyn QueueRepository>,
    /// Usage history and priority snapshot.
    pub usage: Arc<dyn UsageRepository>,
    /// Materialised events.
    pub events: Arc<dyn EventRepository>,
}

/// A running scheduler server.
pub struct ServerHandle {
    /// Job submission and read API.
    pub jobs: JobService,
    /// Lease grant and progress API.
    pub leases: LeaseManager,
    /// Usage report sink.
    pub usage: UsageService,
    /// Event log facade.
    pub events: EventLog,
    tasks: Arc<BackgroundTaskManager>,
    shutdown_timeout: Duration,
}

/// Start a scheduler server using in-process brokers for the log and stream
/// backends.
pub async fn start(config: &SchedulerConfig, repositories: Repositories) -> AppResult<ServerHandle> {
    start_with(
        config,
        repositories,
        crate::builders::in_memory_log,
        crate::builders::in_memory_stream,
    )
    .await
}

/// Start a scheduler server, connecting brokers through the given factories.
///
/// Priorities are rebuilt from persisted usage history before any lease is
/// granted. A broker that cannot be reached fails start-up.
pub async fn start_with<FL, FS>(
    config: &SchedulerConfig,
    repositories: Repositories,
    log_factory: FL,
    stream_factory: FS,
) -> AppResult<ServerHandle>
where
    FL: FnOnce(&LogBackendConfig) -> Result<Arc<dyn LogTopic>, SchedulerError>,
    FS: FnOnce(&StreamBackendConfig) -> Result<Arc<dyn PubSub>, SchedulerError>,
{
    config
        .validate()
        .map_err(|e| SchedulerError::Startup(format!("config invalid: {e}")))?;

    let EventBackend { log, replication } = build_event_backend(
        &config.events,
        Arc::clone(&repositories.events),
        config.scheduling.queue_lease_batch_size,
        log_factory,
        stream_factory,
    )
    .await
    .context("event backend failed to start")?;

    let engine = FairShareEngine::new(
        config.priority_half_time(),
        config.scheduling.resource_scarcity.clone(),
    );
    let usage = UsageService::new(Arc::clone(&repositories.usage), engine);
    usage
        .rebuild_from_history()
        .await
        .context("rebuilding priorities from usage history")?;

    let leases = LeaseManager::new(
        Arc::clone(&repositories.jobs),
        Arc::clone(&repositories.queues),
        usage.clone(),
        log.clone(),
        config.lease_expiry(),
        config.scheduling.queue_lease_batch_size,
    );
    let jobs = JobService::new(
        Arc::clone(&repositories.jobs),
        Arc::clone(&repositories.queues),
        log.clone(),
    );

    let tasks = Arc::new(BackgroundTaskManager::new());
    let expiry = leases.clone();
    tasks.register("lease_expiry", config.expiry_interval(), move || {
        let expiry = expiry.clone();
        async move { expiry.expire_leases().await }
    });
    match replication {
        Replication::None => {}
        Replication::Polled {
            replicator,
            interval,
        } => tasks.register("log_replication", interval, move || {
            let replicator = replicator.clone();
            async move { replicator.process_events().await }
        }),
        Replication::Streamed(replicator) => {
            tasks.spawn_service("stream_replication", move |stop| replicator.run(stop));
        }
    }
    tracing::info!(tasks = ?tasks.names(), "scheduler server started");

    Ok(ServerHandle {
        jobs,
        leases,
        usage,
        events: log,
        tasks,
        shutdown_timeout: config.shutdown_timeout(),
    })
}

impl ServerHandle {
    /// Task manager, for registering cluster-side work in the same process.
    pub fn tasks(&self) -> &Arc<BackgroundTaskManager> {
        &self.tasks
    }

    /// Stop every background task, waiting up to the configured timeout.
    /// Stream subscriptions are closed by their replicator before it exits.
    pub async fn shutdown(self) -> bool {
        tracing::info!("scheduler server shutting down");
        self.tasks.stop_all(self.shutdown_timeout).await
    }
}

/// Register periodic usage reporting for one cluster.
pub fn register_cluster_reporting<P, U>(
    tasks: &BackgroundTaskManager,
    service: ClusterUtilisationService<P, U>,
    interval: Duration,
) where
    P: ClusterSnapshotProvider + 'static,
    U: UsageClient + 'static,
{
    let service = Arc::new(service);
    tasks.register("cluster_utilisation_report", interval, move || {
        let service = Arc::clone(&service);
        async move { service.report_cluster_utilisation().await }
    });
}
