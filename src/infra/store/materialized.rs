//! Idempotent event index shared by the in-memory and file-backed read stores.

use std::collections::{BTreeMap, HashMap};

use crate::core::{
    job_id_from_event, EventPage, EventPosition, EventScope, EventSequence, SchedulerError,
    StoredEvent,
};
use crate::util::JobId;

/// Per-job bookkeeping. Events become visible strictly in sequence order:
/// anything delivered above a gap is held until the gap fills.
#[derive(Debug, Default)]
struct JobEvents {
    /// Visible events by sequence number, all at or below `watermark`.
    visible: BTreeMap<u64, usize>,
    /// Highest sequence number with no gap below it.
    watermark: u64,
    /// Delivered ahead of a missing predecessor.
    held: BTreeMap<u64, StoredEvent>,
}

impl JobEvents {
    fn contains(&self, sequence: u64) -> bool {
        sequence <= self.watermark || self.held.contains_key(&sequence)
    }
}

/// Events keyed by `(job id, sequence)`, plus per-queue and per-job-set streams
/// in application order.
#[derive(Debug, Default)]
pub(crate) struct MaterializedEvents {
    events: Vec<StoredEvent>,
    by_job: HashMap<JobId, JobEvents>,
    by_queue: HashMap<String, Vec<usize>>,
    by_job_set: HashMap<(String, String), Vec<usize>>,
    held: usize,
}

impl MaterializedEvents {
    /// Apply a sequence, skipping events already present. The whole sequence
    /// is checked before anything is applied. Returns how many events were
    /// new, whether applied now or held behind a gap.
    pub fn apply(&mut self, sequence: &EventSequence) -> Result<usize, SchedulerError> {
        sequence.validate()?;
        let mut fresh = 0;
        for event in &sequence.events {
            let job_id = job_id_from_event(event)?;
            let job = self.by_job.entry(job_id).or_default();
            if job.contains(event.sequence) {
                continue;
            }
            fresh += 1;
            job.held.insert(
                event.sequence,
                StoredEvent {
                    queue: sequence.queue.clone(),
                    job_set_id: sequence.job_set_id.clone(),
                    job_id,
                    event: event.clone(),
                },
            );
            self.held += 1;
            self.release(job_id);
        }
        Ok(fresh)
    }

    /// Move held events of `job_id` that are now contiguous into the streams.
    fn release(&mut self, job_id: JobId) {
        loop {
            let Some(job) = self.by_job.get_mut(&job_id) else {
                return;
            };
            let Some(stored) = job.held.remove(&(job.watermark + 1)) else {
                if !job.held.is_empty() {
                    tracing::debug!(%job_id, watermark = job.watermark, held = job.held.len(), "holding events behind a sequence gap");
                }
                return;
            };
            let index = self.events.len();
            job.watermark += 1;
            job.visible.insert(job.watermark, index);
            self.held -= 1;
            self.by_queue
                .entry(stored.queue.clone())
                .or_default()
                .push(index);
            self.by_job_set
                .entry((stored.queue.clone(), stored.job_set_id.clone()))
                .or_default()
                .push(index);
            self.events.push(stored);
        }
    }

    /// Bounded read of one scope.
    pub fn read(&self, scope: &EventScope, from: EventPosition, limit: usize) -> EventPage {
        match scope {
            EventScope::Job(job_id) => {
                let Some(seqs) = self.by_job.get(job_id) else {
                    return EventPage {
                        events: Vec::new(),
                        next: from,
                    };
                };
                let events: Vec<StoredEvent> = seqs
                    .visible
                    .range(from.0..)
                    .take(limit)
                    .map(|(_, i)| self.events[*i].clone())
                    .collect();
                let next = events
                    .last()
                    .map_or(from, |e| EventPosition(e.event.sequence + 1));
                EventPage { events, next }
            }
            EventScope::Queue(queue) => self.read_stream(self.by_queue.get(queue), from, limit),
            EventScope::JobSet { queue, job_set_id } => self.read_stream(
                self.by_job_set.get(&(queue.clone(), job_set_id.clone())),
                from,
                limit,
            ),
        }
    }

    fn read_stream(&self, stream: Option<&Vec<usize>>, from: EventPosition, limit: usize) -> EventPage {
        let start = usize::try_from(from.0).unwrap_or(usize::MAX);
        let events: Vec<StoredEvent> = stream
            .map(|s| s.iter().skip(start).take(limit).map(|i| self.events[*i].clone()).collect())
            .unwrap_or_default();
        let next = EventPosition(from.0 + events.len() as u64);
        EventPage { events, next }
    }

    /// Whether `(job_id, sequence)` was already applied.
    pub fn contains(&self, job_id: JobId, sequence: u64) -> bool {
        self.by_job
            .get(&job_id)
            .is_some_and(|job| job.contains(sequence))
    }

    /// Number of distinct events accepted, including those held behind a gap.
    pub fn len(&self) -> usize {
        self.events.len() + self.held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Event, EventKind};

    fn submit(job_id: JobId, seq: u64) -> Event {
        Event::new(seq, 0, EventKind::CancelJob { job_id })
    }

    #[test]
    fn test_apply_skips_duplicates() {
        let job = JobId::new();
        let seq = EventSequence::new("q", "set", "u")
            .with_event(submit(job, 1))
            .with_event(submit(job, 2));
        let mut store = MaterializedEvents::default();
        assert_eq!(store.apply(&seq).unwrap(), 2);
        assert_eq!(store.apply(&seq).unwrap(), 0);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_job_reads_follow_sequence_numbers() {
        let job = JobId::new();
        let mut store = MaterializedEvents::default();
        store
            .apply(&EventSequence::new("q", "set", "u").with_event(submit(job, 2)))
            .unwrap();
        assert!(store.read(&EventScope::Job(job), EventPosition::START, 10).events.is_empty());
        assert_eq!(store.len(), 1);
        store
            .apply(&EventSequence::new("q", "set", "u").with_event(submit(job, 1)))
            .unwrap();

        let page = store.read(&EventScope::Job(job), EventPosition::START, 10);
        let seqs: Vec<u64> = page.events.iter().map(|e| e.event.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(page.next, EventPosition(3));

        let queue = store.read(&EventScope::Queue("q".into()), EventPosition::START, 10);
        let seqs: Vec<u64> = queue.events.iter().map(|e| e.event.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_cursor_reader_sees_late_lower_sequence() {
        let job = JobId::new();
        let mut store = MaterializedEvents::default();
        let one = |seq| EventSequence::new("q", "set", "u").with_event(submit(job, seq));
        store.apply(&one(1)).unwrap();
        store.apply(&one(3)).unwrap();

        let first = store.read(&EventScope::Job(job), EventPosition::START, 10);
        let seen: Vec<u64> = first.events.iter().map(|e| e.event.sequence).collect();
        assert_eq!(seen, vec![1]);
        assert_eq!(first.next, EventPosition(2));
        assert!(store.contains(job, 3));
        assert_eq!(store.apply(&one(3)).unwrap(), 0);

        store.apply(&one(2)).unwrap();
        let rest = store.read(&EventScope::Job(job), first.next, 10);
        let seen: Vec<u64> = rest.events.iter().map(|e| e.event.sequence).collect();
        assert_eq!(seen, vec![2, 3]);

        let queue = store.read(&EventScope::JobSet { queue: "q".into(), job_set_id: "set".into() }, EventPosition(1), 10);
        let seen: Vec<u64> = queue.events.iter().map(|e| e.event.sequence).collect();
        assert_eq!(seen, vec![2, 3]);
    }
}
