//! API-facing job operations and request/response models.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::lease::{commit, transition};
use crate::core::{
    ComputeResources, Event, EventKind, EventLog, EventPage, EventPosition, EventScope,
    EventSequence, Job, JobRepository, JobState, QueueRepository, SchedulerError,
};
use crate::util::clock::now_ms;
use crate::util::JobId;

/// One job in a submission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    /// Base priority; lower leases first within the queue.
    #[serde(default)]
    pub priority: u32,
    /// Resources the job needs.
    pub requests: ComputeResources,
}

/// Job status response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusResponse {
    /// Job identifier.
    pub job_id: JobId,
    /// Current state.
    pub state: JobState,
    /// Cluster holding the lease, if any.
    pub cluster_id: Option<String>,
}

impl From<&Job> for JobStatusResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            state: job.state,
            cluster_id: job.lease.as_ref().map(|l| l.cluster_id.clone()),
        }
    }
}

/// Submission, cancellation and read operations over jobs and their events.
#[derive(Clone)]
pub struct JobService {
    jobs: Arc<dyn JobRepository>,
    queues: Arc<dyn QueueRepository>,
    events: EventLog,
}

impl JobService {
    /// Create the service.
    pub fn new(jobs: Arc<dyn JobRepository>, queues: Arc<dyn QueueRepository>, events: EventLog) -> Self {
        Self { jobs, queues, events }
    }

    /// Submit jobs into an existing queue. The submit events are appended
    /// before the jobs become leasable. If the jobs then cannot be stored,
    /// they are withdrawn from the log with a cancel event each, so no
    /// submitted-but-missing job is left behind.
    pub async fn submit_jobs(
        &self,
        user_id: &str,
        queue: &str,
        job_set_id: &str,
        submissions: Vec<JobSubmission>,
    ) -> Result<Vec<JobId>, SchedulerError> {
        if job_set_id.is_empty() {
            return Err(SchedulerError::invalid("job_set_id", "must not be empty"));
        }
        if self.queues.get_queue(queue).await?.is_none() {
            return Err(SchedulerError::QueueNotFound(queue.to_string()));
        }
        if submissions.iter().any(|s| s.requests.is_negative_anywhere()) {
            return Err(SchedulerError::invalid("requests", "must not be negative"));
        }
        if submissions.is_empty() {
            return Ok(Vec::new());
        }

        let now = now_ms();
        let mut sequence = EventSequence::new(queue, job_set_id, user_id);
        let mut jobs = Vec::with_capacity(submissions.len());
        for submission in submissions {
            let mut job = Job::new(queue, job_set_id, submission.priority, submission.requests, now);
            let seq = job.next_event_seq();
            sequence.events.push(Event::new(
                seq,
                now,
                EventKind::SubmitJob {
                    job_id: job.id,
                    priority: job.priority,
                    requests: job.requests.clone(),
                },
            ));
            jobs.push(job);
        }

        self.events.append(&sequence).await?;
        if let Err(e) = self.jobs.add_jobs(&jobs).await {
            tracing::error!(queue, job_set = job_set_id, error = %e, "storing submitted jobs failed, withdrawing them");
            self.withdraw(user_id, queue, job_set_id, &mut jobs).await;
            return Err(e);
        }
        tracing::info!(queue, job_set = job_set_id, count = jobs.len(), "submitted jobs");
        Ok(jobs.into_iter().map(|j| j.id).collect())
    }

    async fn withdraw(&self, user_id: &str, queue: &str, job_set_id: &str, jobs: &mut [Job]) {
        let now = now_ms();
        let mut sequence = EventSequence::new(queue, job_set_id, user_id);
        for job in jobs.iter_mut() {
            let seq = job.next_event_seq();
            sequence
                .events
                .push(Event::new(seq, now, EventKind::CancelJob { job_id: job.id }));
        }
        if let Err(e) = self.events.append(&sequence).await {
            let ids: Vec<String> = jobs.iter().map(|j| j.id.to_string()).collect();
            tracing::error!(queue, job_set = job_set_id, job_ids = ?ids, error = %e, "could not withdraw unstored jobs from the event log");
        }
    }

    /// Cancel a job, releasing any lease. Returns `false` if it had already finished.
    pub async fn cancel_job(&self, user_id: &str, job_id: JobId) -> Result<bool, SchedulerError> {
        let now = now_ms();
        let change = transition(self.jobs.as_ref(), job_id, now, |job| {
            if job.state.is_terminal() {
                return None;
            }
            job.finish(JobState::Cancelled, now);
            Some(vec![EventKind::CancelJob { job_id }])
        })
        .await?;
        let Some(change) = change else {
            return Ok(false);
        };
        let (_, error) = commit(self.jobs.as_ref(), &self.events, user_id, vec![change]).await;
        error.map_or(Ok(true), Err)
    }

    /// Change a job's base priority. Returns `false` if it had already finished.
    pub async fn reprioritise_job(
        &self,
        user_id: &str,
        job_id: JobId,
        priority: u32,
    ) -> Result<bool, SchedulerError> {
        let change = transition(self.jobs.as_ref(), job_id, now_ms(), |job| {
            if job.state.is_terminal() {
                return None;
            }
            job.priority = priority;
            Some(vec![EventKind::ReprioritiseJob { job_id, priority }])
        })
        .await?;
        let Some(change) = change else {
            return Ok(false);
        };
        let (_, error) = commit(self.jobs.as_ref(), &self.events, user_id, vec![change]).await;
        error.map_or(Ok(true), Err)
    }

    /// Fetch a job.
    pub async fn get_job(&self, job_id: JobId) -> Result<Job, SchedulerError> {
        self.jobs
            .get_job(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound(job_id))
    }

    /// Status view of a job.
    pub async fn job_status(&self, job_id: JobId) -> Result<JobStatusResponse, SchedulerError> {
        self.get_job(job_id).await.map(|job| JobStatusResponse::from(&job))
    }

    /// One bounded page of events; continue from the returned `next`.
    pub async fn read_events(
        &self,
        scope: &EventScope,
        from: EventPosition,
        limit: usize,
    ) -> Result<EventPage, SchedulerError> {
        self.events.read_from(scope, from, limit).await
    }

    /// Which jobs are currently leased to `cluster_id`.
    pub async fn leases_for_cluster(&self, cluster_id: &str) -> Result<Vec<JobStatusResponse>, SchedulerError> {
        Ok(self
            .jobs
            .leased_jobs(cluster_id)
            .await?
            .iter()
            .map(JobStatusResponse::from)
            .collect())
    }

    /// Drop finished jobs older than `before_ms`. Their events stay readable.
    pub async fn purge_finished(&self, before_ms: u128) -> Result<usize, SchedulerError> {
        let purged = self.jobs.purge_finished(before_ms).await?;
        if purged > 0 {
            tracing::debug!(purged, "purged finished jobs");
        }
        Ok(purged)
    }
}
