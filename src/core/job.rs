//! Jobs, queues, leases and the repositories that hold them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{ComputeResources, SchedulerError};
use crate::util::{JobId, RunId};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a lease.
    Queued,
    /// Leased to a cluster, no progress reported yet.
    Leased,
    /// The cluster reported the job assigned or running.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancelled by the submitter.
    Cancelled,
}

impl JobState {
    /// Terminal states never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// A lease is outstanding in these states.
    pub const fn holds_lease(self) -> bool {
        matches!(self, Self::Leased | Self::Running)
    }
}

/// Temporary assignment of a job to a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Identity of this attempt.
    pub run_id: RunId,
    /// Cluster holding the lease.
    pub cluster_id: String,
    /// Grant time (ms since epoch).
    pub granted_at_ms: u128,
    /// Deadline after which the lease is reclaimed (ms since epoch).
    pub expires_at_ms: u128,
}

/// A submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job id.
    pub id: JobId,
    /// Owning queue.
    pub queue: String,
    /// Job set the submitter grouped this job into.
    pub job_set_id: String,
    /// Base priority; lower leases first within a queue.
    pub priority: u32,
    /// Resources the job needs to run.
    pub requests: ComputeResources,
    /// Current state.
    pub state: JobState,
    /// Submission time (ms since epoch).
    pub submitted_at_ms: u128,
    /// Time the job reached a terminal state.
    pub finished_at_ms: Option<u128>,
    /// Outstanding lease, if any.
    pub lease: Option<Lease>,
    /// Last intra-job event sequence number handed out.
    pub event_seq: u64,
    /// Optimistic-concurrency version, bumped by every successful update.
    pub version: u64,
}

impl Job {
    /// A freshly submitted, queued job.
    pub fn new(
        queue: impl Into<String>,
        job_set_id: impl Into<String>,
        priority: u32,
        requests: ComputeResources,
        submitted_at_ms: u128,
    ) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            job_set_id: job_set_id.into(),
            priority,
            requests,
            state: JobState::Queued,
            submitted_at_ms,
            finished_at_ms: None,
            lease: None,
            event_seq: 0,
            version: 0,
        }
    }

    /// Reserve the next intra-job event sequence number.
    pub fn next_event_seq(&mut self) -> u64 {
        self.event_seq += 1;
        self.event_seq
    }

    /// Move to a terminal state and drop any lease.
    pub fn finish(&mut self, state: JobState, at_ms: u128) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.lease = None;
        self.finished_at_ms = Some(at_ms);
    }
}

/// A named queue jobs are submitted into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    /// Queue name.
    pub name: String,
    /// Multiplies the queue's usage when ranking; above 1.0 makes it yield to others.
    pub priority_factor: f64,
}

impl Queue {
    /// Queue with the neutral priority factor.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority_factor: 1.0,
        }
    }

    /// Override the priority factor.
    #[must_use]
    pub fn with_priority_factor(mut self, factor: f64) -> Self {
        self.priority_factor = factor;
        self
    }
}

/// Durable job records, updated with optimistic concurrency.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert new jobs. Fails if any id already exists.
    async fn add_jobs(&self, jobs: &[Job]) -> Result<(), SchedulerError>;
    /// Fetch one job.
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, SchedulerError>;
    /// Queued jobs of a queue, ordered by `(priority, submitted_at_ms, id)`.
    async fn queued_jobs(&self, queue: &str, limit: usize) -> Result<Vec<Job>, SchedulerError>;
    /// Store `job` if the stored version still equals `job.version`; the
    /// stored copy gets `version + 1` and is returned. `None` means conflict.
    async fn update_job(&self, job: &Job) -> Result<Option<Job>, SchedulerError>;
    /// Jobs whose lease deadline is at or before `now_ms`.
    async fn expired_leases(&self, now_ms: u128) -> Result<Vec<Job>, SchedulerError>;
    /// Jobs currently leased to a cluster.
    async fn leased_jobs(&self, cluster_id: &str) -> Result<Vec<Job>, SchedulerError>;
    /// Drop terminal jobs finished before `before_ms`; returns how many.
    async fn purge_finished(&self, before_ms: u128) -> Result<usize, SchedulerError>;
}

/// Durable queue definitions.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Create or replace a queue.
    async fn create_queue(&self, queue: Queue) -> Result<(), SchedulerError>;
    /// Fetch a queue by name.
    async fn get_queue(&self, name: &str) -> Result<Option<Queue>, SchedulerError>;
    /// All queues, ordered by name.
    async fn list_queues(&self) -> Result<Vec<Queue>, SchedulerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_seq_is_monotonic() {
        let mut job = Job::new("q", "set", 0, ComputeResources::new(), 1);
        assert_eq!(job.next_event_seq(), 1);
        assert_eq!(job.next_event_seq(), 2);
        assert_eq!(job.event_seq, 2);
    }

    #[test]
    fn test_finish_clears_lease() {
        let mut job = Job::new("q", "set", 0, ComputeResources::new(), 1);
        job.state = JobState::Running;
        job.lease = Some(Lease {
            run_id: RunId::new(),
            cluster_id: "c".into(),
            granted_at_ms: 1,
            expires_at_ms: 2,
        });
        job.finish(JobState::Succeeded, 10);
        assert!(job.lease.is_none());
        assert_eq!(job.finished_at_ms, Some(10));
        assert!(job.state.is_terminal());
        assert!(!job.state.holds_lease());
    }
}
