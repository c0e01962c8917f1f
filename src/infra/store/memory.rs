//! In-memory repositories for development and tests.
//!
//! Each repository guards its state with one `parking_lot::Mutex`; every trait
//! call is a single critical section, so the version checks behave like the
//! atomic per-key operations of a real store.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::{
    ClusterUsageReport, EventPage, EventPosition, EventRepository, EventScope, EventSequence, Job,
    JobRepository, JobState, PrioritySnapshot, Queue, QueueRepository, SchedulerError, UsageRepository,
    Versioned,
};
use crate::infra::store::materialized::MaterializedEvents;
use crate::util::JobId;

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, Job>,
    by_expiry: BTreeSet<(u128, JobId)>,
}

impl JobTable {
    fn index(&mut self, job: &Job) {
        if let Some(lease) = &job.lease {
            self.by_expiry.insert((lease.expires_at_ms, job.id));
        }
    }

    fn unindex(&mut self, job: &Job) {
        if let Some(lease) = &job.lease {
            self.by_expiry.remove(&(lease.expires_at_ms, job.id));
        }
    }
}

/// Jobs and queues held in memory, with a lease-expiry index.
#[derive(Default)]
pub struct InMemoryJobRepository {
    table: Mutex<JobTable>,
    queues: Mutex<BTreeMap<String, Queue>>,
}

impl InMemoryJobRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    pub fn len(&self) -> usize {
        self.table.lock().jobs.len()
    }

    /// Whether no jobs are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn add_jobs(&self, jobs: &[Job]) -> Result<(), SchedulerError> {
        let mut table = self.table.lock();
        if let Some(dup) = jobs.iter().find(|j| table.jobs.contains_key(&j.id)) {
            return Err(SchedulerError::Conflict(format!("job {} already exists", dup.id)));
        }
        for job in jobs {
            table.index(job);
            table.jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, SchedulerError> {
        Ok(self.table.lock().jobs.get(&id).cloned())
    }

    async fn queued_jobs(&self, queue: &str, limit: usize) -> Result<Vec<Job>, SchedulerError> {
        let table = self.table.lock();
        let mut queued: Vec<&Job> = table
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.state == JobState::Queued)
            .collect();
        queued.sort_by(|a, b| {
            (a.priority, a.submitted_at_ms, a.id).cmp(&(b.priority, b.submitted_at_ms, b.id))
        });
        Ok(queued.into_iter().take(limit).cloned().collect())
    }

    async fn update_job(&self, job: &Job) -> Result<Option<Job>, SchedulerError> {
        let mut table = self.table.lock();
        let Some(current) = table.jobs.get(&job.id).cloned() else {
            return Err(SchedulerError::JobNotFound(job.id));
        };
        if current.version != job.version {
            return Ok(None);
        }
        let mut stored = job.clone();
        stored.version += 1;
        table.unindex(&current);
        table.index(&stored);
        table.jobs.insert(stored.id, stored.clone());
        Ok(Some(stored))
    }

    async fn expired_leases(&self, now_ms: u128) -> Result<Vec<Job>, SchedulerError> {
        let table = self.table.lock();
        Ok(table
            .by_expiry
            .range(..=(now_ms, JobId::max()))
            .filter_map(|(_, id)| table.jobs.get(id).cloned())
            .collect())
    }

    async fn leased_jobs(&self, cluster_id: &str) -> Result<Vec<Job>, SchedulerError> {
        let table = self.table.lock();
        let mut leased: Vec<Job> = table
            .jobs
            .values()
            .filter(|j| j.state.holds_lease())
            .filter(|j| j.lease.as_ref().is_some_and(|l| l.cluster_id == cluster_id))
            .cloned()
            .collect();
        leased.sort_by_key(|j| j.id);
        Ok(leased)
    }

    async fn purge_finished(&self, before_ms: u128) -> Result<usize, SchedulerError> {
        let mut table = self.table.lock();
        let before = table.jobs.len();
        table
            .jobs
            .retain(|_, j| !(j.state.is_terminal() && j.finished_at_ms.is_some_and(|t| t < before_ms)));
        Ok(before - table.jobs.len())
    }
}

#[async_trait]
impl QueueRepository for InMemoryJobRepository {
    async fn create_queue(&self, queue: Queue) -> Result<(), SchedulerError> {
        if queue.name.is_empty() {
            return Err(SchedulerError::invalid("queue.name", "must not be empty"));
        }
        if !queue.priority_factor.is_finite() || queue.priority_factor <= 0.0 {
            return Err(SchedulerError::invalid("queue.priority_factor", "must be positive"));
        }
        self.queues.lock().insert(queue.name.clone(), queue);
        Ok(())
    }

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>, SchedulerError> {
        Ok(self.queues.lock().get(name).cloned())
    }

    async fn list_queues(&self) -> Result<Vec<Queue>, SchedulerError> {
        Ok(self.queues.lock().values().cloned().collect())
    }
}

#[derive(Default)]
struct UsageState {
    history: BTreeMap<(u128, String), ClusterUsageReport>,
    priorities: Versioned<PrioritySnapshot>,
}

/// Usage history and priority snapshot held in memory.
#[derive(Default)]
pub struct InMemoryUsageRepository {
    state: Mutex<UsageState>,
}

impl InMemoryUsageRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageRepository for InMemoryUsageRepository {
    async fn append_report(&self, report: &ClusterUsageReport) -> Result<(), SchedulerError> {
        self.state.lock().history.insert(
            (report.report_time_ms, report.cluster_id.clone()),
            report.clone(),
        );
        Ok(())
    }

    async fn history(&self) -> Result<Vec<ClusterUsageReport>, SchedulerError> {
        Ok(self.state.lock().history.values().cloned().collect())
    }

    async fn load_priorities(&self) -> Result<Versioned<PrioritySnapshot>, SchedulerError> {
        Ok(self.state.lock().priorities.clone())
    }

    async fn store_priorities(
        &self,
        snapshot: &PrioritySnapshot,
        expected_version: u64,
    ) -> Result<bool, SchedulerError> {
        let mut state = self.state.lock();
        if state.priorities.version != expected_version {
            return Ok(false);
        }
        state.priorities = Versioned {
            value: snapshot.clone(),
            version: expected_version + 1,
        };
        Ok(true)
    }
}

/// Materialised event read store held in memory.
#[derive(Default)]
pub struct InMemoryEventRepository {
    events: Mutex<MaterializedEvents>,
}

impl InMemoryEventRepository {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct events applied.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was applied yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn apply(&self, sequence: &EventSequence) -> Result<usize, SchedulerError> {
        self.events.lock().apply(sequence)
    }

    async fn read(
        &self,
        scope: &EventScope,
        from: EventPosition,
        limit: usize,
    ) -> Result<EventPage, SchedulerError> {
        Ok(self.events.lock().read(scope, from, limit))
    }
}
