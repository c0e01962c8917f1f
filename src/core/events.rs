//! Job lifecycle events and the append/read contract of the event log.
//!
//! Appends go through an [`EventStore`] (direct, log broker or pub/sub);
//! reads are always served by the [`EventRepository`] the store ultimately
//! materialises into.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{ComputeResources, SchedulerError};
use crate::util::{JobId, RunId};

/// Payload of a lifecycle event. Every variant names its job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Job accepted into a queue.
    SubmitJob {
        /// Job.
        job_id: JobId,
        /// Base priority.
        priority: u32,
        /// Requested resources.
        requests: ComputeResources,
    },
    /// Job priority changed.
    ReprioritiseJob {
        /// Job.
        job_id: JobId,
        /// New priority.
        priority: u32,
    },
    /// Job cancelled by its submitter.
    CancelJob {
        /// Job.
        job_id: JobId,
    },
    /// Job finished successfully.
    JobSucceeded {
        /// Job.
        job_id: JobId,
    },
    /// Lease granted to a cluster.
    JobRunLeased {
        /// Job.
        job_id: JobId,
        /// Attempt.
        run_id: RunId,
        /// Cluster holding the lease.
        cluster_id: String,
    },
    /// Cluster created the job's pod.
    JobRunAssigned {
        /// Job.
        job_id: JobId,
        /// Attempt.
        run_id: RunId,
    },
    /// Job's pod started running.
    JobRunRunning {
        /// Job.
        job_id: JobId,
        /// Attempt.
        run_id: RunId,
    },
    /// Attempt finished successfully.
    JobRunSucceeded {
        /// Job.
        job_id: JobId,
        /// Attempt.
        run_id: RunId,
    },
    /// Attempt failed.
    JobRunErrors {
        /// Job.
        job_id: JobId,
        /// Attempt.
        run_id: RunId,
        /// Failure description.
        message: String,
    },
    /// Lease deadline passed without progress; job went back to its queue.
    JobRunLeaseExpired {
        /// Job.
        job_id: JobId,
        /// Attempt.
        run_id: RunId,
    },
}

impl EventKind {
    /// Owning job.
    pub const fn job_id(&self) -> JobId {
        match self {
            Self::SubmitJob { job_id, .. }
            | Self::ReprioritiseJob { job_id, .. }
            | Self::CancelJob { job_id }
            | Self::JobSucceeded { job_id }
            | Self::JobRunLeased { job_id, .. }
            | Self::JobRunAssigned { job_id, .. }
            | Self::JobRunRunning { job_id, .. }
            | Self::JobRunSucceeded { job_id, .. }
            | Self::JobRunErrors { job_id, .. }
            | Self::JobRunLeaseExpired { job_id, .. } => *job_id,
        }
    }
}

/// One event as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Intra-job sequence number, starting at 1.
    pub sequence: u64,
    /// Creation time (ms since epoch).
    pub created_ms: u128,
    /// Payload. `None` when the sender left `kind` out; a `type` tag this
    /// build does not know fails decoding of the whole sequence instead.
    #[serde(default)]
    pub kind: Option<EventKind>,
}

impl Event {
    /// Event with a known payload.
    pub const fn new(sequence: u64, created_ms: u128, kind: EventKind) -> Self {
        Self {
            sequence,
            created_ms,
            kind: Some(kind),
        }
    }
}

/// Extract the owning job id from a received event.
pub fn job_id_from_event(event: &Event) -> Result<JobId, SchedulerError> {
    event
        .kind
        .as_ref()
        .map(EventKind::job_id)
        .ok_or_else(|| SchedulerError::invalid("event.kind", "event doesn't contain a job id"))
}

/// Events appended atomically on behalf of one actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSequence {
    /// Queue the events belong to.
    pub queue: String,
    /// Job set the events belong to.
    pub job_set_id: String,
    /// Actor that produced the events.
    pub user_id: String,
    /// Ordered events.
    pub events: Vec<Event>,
}

impl EventSequence {
    /// Start an empty sequence.
    pub fn new(
        queue: impl Into<String>,
        job_set_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            job_set_id: job_set_id.into(),
            user_id: user_id.into(),
            events: Vec::new(),
        }
    }

    /// Builder-style push.
    #[must_use]
    pub fn with_event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    /// Reject sequences that cannot be stored.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.queue.is_empty() {
            return Err(SchedulerError::invalid("queue", "must not be empty"));
        }
        if self.job_set_id.is_empty() {
            return Err(SchedulerError::invalid("job_set_id", "must not be empty"));
        }
        for event in &self.events {
            job_id_from_event(event)?;
            if event.sequence == 0 {
                return Err(SchedulerError::invalid("event.sequence", "must start at 1"));
            }
        }
        Ok(())
    }
}

/// What a read is restricted to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventScope {
    /// One job, in intra-job sequence order.
    Job(JobId),
    /// Everything in a queue, in application order.
    Queue(String),
    /// One job set of a queue, in application order.
    JobSet {
        /// Queue.
        queue: String,
        /// Job set.
        job_set_id: String,
    },
}

/// Opaque restart cursor returned by every read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventPosition(pub u64);

impl EventPosition {
    /// Beginning of any stream.
    pub const START: Self = Self(0);
}

/// An event as materialised in the read store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Queue.
    pub queue: String,
    /// Job set.
    pub job_set_id: String,
    /// Owning job.
    pub job_id: JobId,
    /// The event itself.
    pub event: Event,
}

/// Result of one bounded read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPage {
    /// Events in scope order.
    pub events: Vec<StoredEvent>,
    /// Position to continue from.
    pub next: EventPosition,
}

/// Append side of the event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durably append a sequence. Returns only once the backend accepted it.
    async fn append(&self, sequence: &EventSequence) -> Result<(), SchedulerError>;
}

/// Queryable store events are materialised into.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Apply a sequence idempotently, keyed by `(job id, sequence)`. Returns
    /// how many events were new.
    async fn apply(&self, sequence: &EventSequence) -> Result<usize, SchedulerError>;
    /// Read at most `limit` events of `scope` starting at `from`.
    async fn read(
        &self,
        scope: &EventScope,
        from: EventPosition,
        limit: usize,
    ) -> Result<EventPage, SchedulerError>;
}

/// Uniform append/read facade over whichever backend was configured.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
    repository: Arc<dyn EventRepository>,
}

impl EventLog {
    /// Combine an append path with its read store.
    pub fn new(store: Arc<dyn EventStore>, repository: Arc<dyn EventRepository>) -> Self {
        Self { store, repository }
    }

    /// Validate and append.
    pub async fn append(&self, sequence: &EventSequence) -> Result<(), SchedulerError> {
        sequence.validate()?;
        if sequence.events.is_empty() {
            return Ok(());
        }
        self.store.append(sequence).await
    }

    /// One bounded read; continue from the returned `next`.
    pub async fn read_from(
        &self,
        scope: &EventScope,
        from: EventPosition,
        limit: usize,
    ) -> Result<EventPage, SchedulerError> {
        self.repository.read(scope, from, limit).await
    }

    /// Page through `scope` until no more events are available.
    pub async fn read_to_end(
        &self,
        scope: &EventScope,
        from: EventPosition,
        page_size: usize,
    ) -> Result<EventPage, SchedulerError> {
        let mut out = EventPage {
            events: Vec::new(),
            next: from,
        };
        loop {
            let page = self.read_from(scope, out.next, page_size.max(1)).await?;
            let done = page.events.is_empty();
            out.events.extend(page.events);
            out.next = page.next;
            if done {
                return Ok(out);
            }
        }
    }

    /// Read store behind this log.
    pub fn repository(&self) -> &Arc<dyn EventRepository> {
        &self.repository
    }
}
