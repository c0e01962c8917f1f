//! Core scheduling model: resources, accounting, fair share, leases and events.

pub mod accounting;
pub mod cluster;
pub mod error;
pub mod events;
pub mod job;
pub mod lease;
pub mod priority;
pub mod resources;
pub mod usage;

pub use accounting::{
    available_capacity, filter_available_processing_nodes, pods_requiring_resource_on_processing_nodes,
    queue_reports, total_allocatable, total_requests, usage_by_queue, ClusterUtilisationService,
};
pub use cluster::{
    ClusterSnapshotProvider, Node, Pod, PodPhase, StaticSnapshot, Taint, TaintEffect, JOB_ID_LABEL,
    QUEUE_LABEL,
};
pub use error::{AppResult, SchedulerError};
pub use events::{
    job_id_from_event, Event, EventKind, EventLog, EventPage, EventPosition, EventRepository,
    EventScope, EventSequence, EventStore, StoredEvent,
};
pub use job::{Job, JobRepository, JobState, Lease, Queue, QueueRepository};
pub use lease::{LeaseManager, Progress, ProgressOutcome, LEASE_MANAGER_ACTOR};
pub use priority::{
    decay_factor, FairShareEngine, PrioritySnapshot, QueuePriority, QueueUsageState, UsageService,
};
pub use resources::{ComputeResources, Quantity};
pub use usage::{ClusterUsageReport, QueueReport, UsageClient, UsageRepository, Versioned};
