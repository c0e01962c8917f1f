//! Lease manager: grants, renews and expires job leases.
//!
//! Every state change is a compare-and-swap on the job record followed by an
//! append of the matching events. A change whose events fail to append is
//! reverted, so callers never see a lease that is not in the event log.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{
    ComputeResources, Event, EventKind, EventLog, EventSequence, Job, JobRepository, JobState,
    Lease, QueueRepository, SchedulerError, UsageService,
};
use crate::util::clock::{add_ms, now_ms};
use crate::util::{JobId, RunId};

/// Compare-and-swap attempts per job before reporting a conflict.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Appends tried for a change that can no longer be reverted.
const LATE_APPEND_ATTEMPTS: u32 = 3;

/// Actor recorded on events produced by the lease manager itself.
pub const LEASE_MANAGER_ACTOR: &str = "lease-manager";

/// A committed-in-store, not-yet-logged job change.
#[derive(Debug, Clone)]
pub(crate) struct Change {
    pub before: Job,
    pub after: Job,
    pub events: Vec<Event>,
}

/// Apply `decide` to the current job record with optimistic retries.
///
/// `decide` returns the event payloads for the change, or `None` to leave the
/// job untouched. Sequence numbers are assigned here, inside the swap.
pub(crate) async fn transition<F>(
    jobs: &dyn JobRepository,
    id: JobId,
    now_ms: u128,
    mut decide: F,
) -> Result<Option<Change>, SchedulerError>
where
    F: FnMut(&mut Job) -> Option<Vec<EventKind>> + Send,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let before = jobs
            .get_job(id)
            .await?
            .ok_or(SchedulerError::JobNotFound(id))?;
        let mut candidate = before.clone();
        let Some(kinds) = decide(&mut candidate) else {
            return Ok(None);
        };
        let events: Vec<Event> = kinds
            .into_iter()
            .map(|kind| Event::new(candidate.next_event_seq(), now_ms, kind))
            .collect();
        if let Some(after) = jobs.update_job(&candidate).await? {
            return Ok(Some(Change {
                before,
                after,
                events,
            }));
        }
        tracing::debug!(job_id = %id, "job changed underneath, retrying");
    }
    Err(SchedulerError::Conflict(format!("job {id} kept changing")))
}

/// Append the events of `changes`, one sequence per job set. Changes whose
/// sequence fails to append are reverted. Returns the committed jobs and the
/// first append error, if any.
pub(crate) async fn commit(
    jobs: &dyn JobRepository,
    log: &EventLog,
    user_id: &str,
    changes: Vec<Change>,
) -> (Vec<Job>, Option<SchedulerError>) {
    let mut groups: BTreeMap<(String, String), Vec<Change>> = BTreeMap::new();
    for change in changes {
        groups
            .entry((change.after.queue.clone(), change.after.job_set_id.clone()))
            .or_default()
            .push(change);
    }

    let mut committed = Vec::new();
    let mut first_error = None;
    for ((queue, job_set_id), group) in groups {
        let mut sequence = EventSequence::new(queue, job_set_id, user_id);
        sequence.events = group.iter().flat_map(|c| c.events.clone()).collect();
        match log.append(&sequence).await {
            Ok(()) => committed.extend(group.into_iter().map(|c| c.after)),
            Err(e) => {
                tracing::error!(queue = %sequence.queue, job_set = %sequence.job_set_id, error = %e, "failed to append events, reverting job changes");
                for change in &group {
                    revert(jobs, log, user_id, change).await;
                }
                first_error.get_or_insert(e);
            }
        }
    }
    (committed, first_error)
}

/// Undo a change whose events never made it into the log.
///
/// While nothing else touched the job, its state and sequence counter are
/// rolled back, so the numbers are handed out again and the job's event
/// stream stays gap-free. If the job already moved on, later events build on
/// this change: its events are appended late instead.
async fn revert(jobs: &dyn JobRepository, log: &EventLog, user_id: &str, change: &Change) {
    let id = change.after.id;
    let result = transition(jobs, id, now_ms(), |job| {
        if job.version != change.after.version {
            return None;
        }
        job.state = change.before.state;
        job.lease = change.before.lease.clone();
        job.priority = change.before.priority;
        job.finished_at_ms = change.before.finished_at_ms;
        job.event_seq = change.before.event_seq;
        Some(Vec::new())
    })
    .await;
    match result {
        Ok(Some(_)) => tracing::warn!(job_id = %id, "reverted unlogged job change"),
        Ok(None) => {
            let mut sequence =
                EventSequence::new(change.after.queue.clone(), change.after.job_set_id.clone(), user_id);
            sequence.events.clone_from(&change.events);
            for attempt in 1..=LATE_APPEND_ATTEMPTS {
                match log.append(&sequence).await {
                    Ok(()) => {
                        tracing::warn!(job_id = %id, attempt, "job moved on, appended its unlogged events late");
                        return;
                    }
                    Err(e) => tracing::warn!(job_id = %id, attempt, error = %e, "late append failed"),
                }
            }
            tracing::error!(job_id = %id, "job moved on and its unlogged events could not be appended");
        }
        Err(e) => tracing::error!(job_id = %id, error = %e, "could not revert unlogged job change"),
    }
}

/// Progress reported by a cluster for a leased run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Pod created.
    Assigned,
    /// Pod running; also used as a heartbeat.
    Running,
    /// Run finished successfully.
    Succeeded,
    /// Run failed.
    Errored(String),
}

/// What happened to a progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    /// Recorded; lease renewed or released.
    Applied,
    /// The run is no longer the job's current lease; nothing changed.
    Stale,
}

/// Grants leases by fair-share order and reclaims the ones that go quiet.
#[derive(Clone)]
pub struct LeaseManager {
    jobs: Arc<dyn JobRepository>,
    queues: Arc<dyn QueueRepository>,
    usage: UsageService,
    events: EventLog,
    expire_after: Duration,
    batch_size: usize,
}

impl LeaseManager {
    /// Create a lease manager.
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        queues: Arc<dyn QueueRepository>,
        usage: UsageService,
        events: EventLog,
        expire_after: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            jobs,
            queues,
            usage,
            events,
            expire_after,
            batch_size: batch_size.max(1),
        }
    }

    /// Lease queued jobs to `cluster_id` within `available` capacity.
    ///
    /// Queues are visited in fair-share order and jobs within a queue by
    /// priority then age. Each job that fits the remaining capacity is leased
    /// and its request subtracted (first fit, no backtracking). Only leases
    /// whose events were appended are returned.
    pub async fn lease_jobs(
        &self,
        cluster_id: &str,
        available: &ComputeResources,
        now_ms: u128,
    ) -> Result<Vec<Job>, SchedulerError> {
        if cluster_id.is_empty() {
            return Err(SchedulerError::invalid("cluster_id", "must not be empty"));
        }
        let queues = self.queues.list_queues().await?;
        let ranking = self.usage.queue_priorities(&queues).await?;

        let mut residual = available.clone();
        let mut changes = Vec::new();
        let mut failure = None;
        'queues: for entry in ranking {
            let candidates = match self.jobs.queued_jobs(&entry.queue, self.batch_size).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    failure = Some(e);
                    break 'queues;
                }
            };
            for candidate in candidates {
                if !candidate.requests.fits_within(&residual) {
                    continue;
                }
                let lease = Lease {
                    run_id: RunId::new(),
                    cluster_id: cluster_id.to_string(),
                    granted_at_ms: now_ms,
                    expires_at_ms: add_ms(now_ms, self.expire_after),
                };
                let change = transition(self.jobs.as_ref(), candidate.id, now_ms, |job| {
                    if job.state != JobState::Queued || !job.requests.fits_within(&residual) {
                        return None;
                    }
                    job.state = JobState::Leased;
                    job.lease = Some(lease.clone());
                    Some(vec![EventKind::JobRunLeased {
                        job_id: job.id,
                        run_id: lease.run_id,
                        cluster_id: lease.cluster_id.clone(),
                    }])
                })
                .await;
                match change {
                    Ok(Some(change)) => {
                        residual.sub(&change.after.requests);
                        changes.push(change);
                    }
                    Ok(None) | Err(SchedulerError::JobNotFound(_)) => {}
                    Err(e) => {
                        failure = Some(e);
                        break 'queues;
                    }
                }
            }
        }

        if changes.is_empty() {
            if let Some(e) = failure {
                return Err(e);
            }
            tracing::debug!(cluster_id, "nothing fits the available capacity");
            return Ok(Vec::new());
        }
        let (committed, error) = commit(self.jobs.as_ref(), &self.events, cluster_id, changes).await;
        match error.or(failure) {
            Some(e) if committed.is_empty() => Err(e),
            Some(e) => {
                tracing::warn!(cluster_id, leased = committed.len(), error = %e, "lease cycle partially failed");
                Ok(committed)
            }
            None => {
                tracing::info!(cluster_id, leased = committed.len(), "leased jobs");
                Ok(committed)
            }
        }
    }

    /// Record progress for a run, renewing or releasing its lease.
    pub async fn report_progress(
        &self,
        job_id: JobId,
        run_id: RunId,
        progress: Progress,
        now_ms: u128,
    ) -> Result<ProgressOutcome, SchedulerError> {
        let expire_after = self.expire_after;
        let change = transition(self.jobs.as_ref(), job_id, now_ms, |job| {
            let current = job.lease.clone().filter(|l| l.run_id == run_id)?;
            if !job.state.holds_lease() {
                return None;
            }
            let cluster_id = current.cluster_id.clone();
            let kinds = match &progress {
                Progress::Assigned | Progress::Running => {
                    job.state = JobState::Running;
                    job.lease = Some(Lease {
                        expires_at_ms: add_ms(now_ms, expire_after),
                        ..current
                    });
                    if progress == Progress::Assigned {
                        vec![EventKind::JobRunAssigned { job_id, run_id }]
                    } else {
                        vec![EventKind::JobRunRunning { job_id, run_id }]
                    }
                }
                Progress::Succeeded => {
                    job.finish(JobState::Succeeded, now_ms);
                    vec![
                        EventKind::JobRunSucceeded { job_id, run_id },
                        EventKind::JobSucceeded { job_id },
                    ]
                }
                Progress::Errored(message) => {
                    job.finish(JobState::Failed, now_ms);
                    vec![EventKind::JobRunErrors {
                        job_id,
                        run_id,
                        message: message.clone(),
                    }]
                }
            };
            tracing::trace!(%job_id, cluster_id = %cluster_id, "progress accepted");
            Some(kinds)
        })
        .await?;

        let Some(change) = change else {
            tracing::debug!(%job_id, %run_id, "ignoring progress for stale run");
            return Ok(ProgressOutcome::Stale);
        };
        let actor = change
            .before
            .lease
            .as_ref()
            .map_or_else(String::new, |l| l.cluster_id.clone());
        let (_, error) = commit(self.jobs.as_ref(), &self.events, &actor, vec![change]).await;
        error.map_or(Ok(ProgressOutcome::Applied), Err)
    }

    /// Return every job whose lease deadline has passed to its queue.
    /// Running it again immediately finds nothing to do.
    pub async fn try_expire_leases(&self, now_ms: u128) -> Result<Vec<JobId>, SchedulerError> {
        let mut changes = Vec::new();
        let mut failure = None;
        for stale in self.jobs.expired_leases(now_ms).await? {
            let change = transition(self.jobs.as_ref(), stale.id, now_ms, |job| {
                let lease = job.lease.as_ref()?;
                if !job.state.holds_lease() || lease.expires_at_ms > now_ms {
                    return None;
                }
                let run_id = lease.run_id;
                job.state = JobState::Queued;
                job.lease = None;
                Some(vec![EventKind::JobRunLeaseExpired {
                    job_id: job.id,
                    run_id,
                }])
            })
            .await;
            match change {
                Ok(Some(change)) => changes.push(change),
                Ok(None) | Err(SchedulerError::JobNotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(job_id = %stale.id, error = %e, "could not expire lease this cycle");
                    failure.get_or_insert(e);
                }
            }
        }
        let (committed, error) =
            commit(self.jobs.as_ref(), &self.events, LEASE_MANAGER_ACTOR, changes).await;
        for job in &committed {
            tracing::info!(job_id = %job.id, queue = %job.queue, "lease expired, job returned to queue");
        }
        match error.or(failure) {
            Some(e) => Err(e),
            None => Ok(committed.into_iter().map(|j| j.id).collect()),
        }
    }

    /// Periodic entry point for lease expiry.
    pub async fn expire_leases(&self) {
        if let Err(e) = self.try_expire_leases(now_ms()).await {
            tracing::error!(error = %e, "lease expiry cycle failed");
        }
    }

    /// Jobs currently leased to a cluster.
    pub async fn leases_for_cluster(&self, cluster_id: &str) -> Result<Vec<Job>, SchedulerError> {
        self.jobs.leased_jobs(cluster_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::core::{EventPosition, EventRepository, EventScope, EventStore};
    use crate::infra::{DirectEventStore, InMemoryEventRepository, InMemoryJobRepository};

    /// Rejects the next `failures` appends, then writes through.
    struct FlakyStore {
        inner: DirectEventStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl EventStore for FlakyStore {
        async fn append(&self, sequence: &EventSequence) -> Result<(), SchedulerError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SchedulerError::Backend("broker unavailable".into()));
            }
            self.inner.append(sequence).await
        }
    }

    fn log_failing(repository: &Arc<InMemoryEventRepository>, failures: usize) -> EventLog {
        let repo: Arc<dyn EventRepository> = repository.clone();
        let store = FlakyStore {
            inner: DirectEventStore::new(repo.clone()),
            failures: AtomicUsize::new(failures),
        };
        EventLog::new(Arc::new(store), repo)
    }

    fn mark_leased(job: &mut Job) -> Option<Vec<EventKind>> {
        job.state = JobState::Leased;
        let run_id = RunId::new();
        job.lease = Some(Lease {
            run_id,
            cluster_id: "c1".into(),
            granted_at_ms: 0,
            expires_at_ms: 1,
        });
        Some(vec![EventKind::JobRunLeased {
            job_id: job.id,
            run_id,
            cluster_id: "c1".into(),
        }])
    }

    async fn sequences(repository: &InMemoryEventRepository, id: JobId) -> Vec<u64> {
        repository
            .read(&EventScope::Job(id), EventPosition::START, 10)
            .await
            .unwrap()
            .events
            .iter()
            .map(|e| e.event.sequence)
            .collect()
    }

    #[tokio::test]
    async fn test_failed_append_rolls_back_state_and_sequence() {
        let jobs = InMemoryJobRepository::new();
        let job = Job::new("q", "set", 0, ComputeResources::new(), 1);
        jobs.add_jobs(&[job.clone()]).await.unwrap();
        let repository = Arc::new(InMemoryEventRepository::new());
        let log = log_failing(&repository, 1);

        let change = transition(&jobs, job.id, 5, mark_leased).await.unwrap().unwrap();
        assert_eq!(change.events[0].sequence, 1);
        let (committed, error) = commit(&jobs, &log, "c1", vec![change]).await;
        assert!(committed.is_empty());
        assert!(matches!(error, Some(SchedulerError::Backend(_))));

        let reverted = jobs.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(reverted.state, JobState::Queued);
        assert!(reverted.lease.is_none());
        assert_eq!(reverted.event_seq, 0);

        let retry = transition(&jobs, job.id, 6, mark_leased).await.unwrap().unwrap();
        assert_eq!(retry.events[0].sequence, 1);
        let (committed, error) = commit(&jobs, &log, "c1", vec![retry]).await;
        assert_eq!(committed.len(), 1);
        assert!(error.is_none());
        assert_eq!(sequences(&repository, job.id).await, vec![1]);
    }

    #[tokio::test]
    async fn test_change_overtaken_before_append_is_logged_late() {
        let jobs = InMemoryJobRepository::new();
        let job = Job::new("q", "set", 0, ComputeResources::new(), 1);
        jobs.add_jobs(&[job.clone()]).await.unwrap();
        let repository = Arc::new(InMemoryEventRepository::new());

        let leased = transition(&jobs, job.id, 5, mark_leased).await.unwrap().unwrap();
        let cancelled = transition(&jobs, job.id, 6, |j| {
            j.finish(JobState::Cancelled, 6);
            Some(vec![EventKind::CancelJob { job_id: j.id }])
        })
        .await
        .unwrap()
        .unwrap();

        let healthy = log_failing(&repository, 0);
        let (committed, _) = commit(&jobs, &healthy, "amy", vec![cancelled]).await;
        assert_eq!(committed.len(), 1);
        // Sequence 2 waits behind the missing lease event.
        assert!(sequences(&repository, job.id).await.is_empty());

        let flaky = log_failing(&repository, 1);
        let (committed, error) = commit(&jobs, &flaky, "c1", vec![leased]).await;
        assert!(committed.is_empty());
        assert!(error.is_some());
        assert_eq!(sequences(&repository, job.id).await, vec![1, 2]);
        assert_eq!(
            jobs.get_job(job.id).await.unwrap().unwrap().state,
            JobState::Cancelled
        );
    }
}
